//! Federated averaging.
//!
//! Federated averaging is the simplest federated strategy. A single aggregation node
//! coordinates the train nodes:
//!
//! - **round 0**: every train node trains from scratch, without any shared state
//! - **round r > 0**: the aggregation node averages the parameter updates of the previous
//!   round, weighted by the number of samples of each node, and every train node trains
//!   again starting from its own previous local state and the averaged update
//!
//! Formally, with `n_k` the number of samples of node `k` and `n` the total number of
//! samples, the averaged update of a round is `Σ_k Δw_k * (n_k / n)`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    algo::AlgoHandle,
    common::{ParticipantId, RoundIdx},
    graph::OperationGraph,
    nodes::{AggregationNode, Node, TestNode, TrainNode},
    references::{LocalStateRef, SharedStatePayload, SharedStateRef},
    strategies::{AggregationFunction, RoundSnapshot, StrategyError, StrategyName},
};

/// Error returned when shared states cannot be averaged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("no shared state to average")]
    EmptyInput,
    #[error("shared state {index} has {found} parameters, expected {expected}")]
    ShapeMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },
    #[error("the shared states hold no samples")]
    NoSamples,
}

/// The shared state returned by the training of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FedAvgSharedState {
    pub parameters_update: Vec<f64>,
    pub n_samples: u64,
}

/// The weighted average of the [`FedAvgSharedState`]s of a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FedAvgAveragedState {
    pub avg_parameters_update: Vec<f64>,
}

/// Compute the average of the parameter updates, weighted by the proportion of samples
/// of each shared state.
///
/// Each update is scaled by its weight before the scaled updates are summed in input
/// order. The sample counts are not part of the result.
///
/// # Errors
/// Fails if `shared_states` is empty, if the updates differ in length or if there are no
/// samples at all.
pub fn avg_shared_states(
    shared_states: &[FedAvgSharedState],
) -> Result<FedAvgAveragedState, AggregationError> {
    let first = shared_states.first().ok_or(AggregationError::EmptyInput)?;
    let expected = first.parameters_update.len();
    if let Some((index, state)) = shared_states
        .iter()
        .enumerate()
        .find(|(_, state)| state.parameters_update.len() != expected)
    {
        return Err(AggregationError::ShapeMismatch {
            index,
            expected,
            found: state.parameters_update.len(),
        });
    }

    let n_all_samples: u64 = shared_states.iter().map(|state| state.n_samples).sum();
    if n_all_samples == 0 {
        return Err(AggregationError::NoSamples);
    }

    let weights = shared_states
        .iter()
        .map(|state| state.n_samples as f64 / n_all_samples as f64)
        .collect::<Vec<_>>();
    let avg_parameters_update = (0..expected)
        .map(|idx| {
            shared_states
                .iter()
                .zip(weights.iter())
                .map(|(state, weight)| state.parameters_update[idx] * weight)
                .fold(0.0, |sum, scaled| sum + scaled)
        })
        .collect();

    Ok(FedAvgAveragedState {
        avg_parameters_update,
    })
}

/// The federated averaging strategy.
#[derive(Debug)]
pub struct FedAvg {
    algo: AlgoHandle,
    history: Vec<RoundSnapshot>,
}

impl FedAvg {
    /// Create a strategy training `algo` on every train node.
    pub fn new(algo: AlgoHandle) -> Self {
        Self {
            algo,
            history: Vec::new(),
        }
    }

    pub fn name(&self) -> StrategyName {
        StrategyName::FederatedAveraging
    }

    pub fn algo(&self) -> &AlgoHandle {
        &self.algo
    }

    pub fn history(&self) -> &[RoundSnapshot] {
        &self.history
    }

    /// The snapshot of the last performed round.
    pub fn current(&self) -> Option<&RoundSnapshot> {
        self.history.last()
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Register the operations of `round`.
    ///
    /// Round `0` only trains the nodes. Any later round first aggregates the shared
    /// payloads of the previous round, then trains every node from the aggregated state
    /// and its own previous local state.
    ///
    /// # Errors
    /// Fails if there is no aggregation node, if the rounds are not performed in order,
    /// or if the train nodes differ from the ones of the previous round.
    pub fn perform_round(
        &mut self,
        graph: &mut OperationGraph,
        train_nodes: &mut [TrainNode],
        aggregation_node: Option<&mut AggregationNode>,
        round: RoundIdx,
    ) -> Result<(), StrategyError> {
        let aggregation_node =
            aggregation_node.ok_or(StrategyError::MissingAggregationNode(self.name()))?;
        let expected = self.history.len() as RoundIdx;
        if round != expected {
            return Err(StrategyError::RoundOutOfOrder {
                expected,
                found: round,
            });
        }

        info!("performing round {} of {}", round, self.name());
        let snapshot = match self.history.last() {
            None => {
                let (local_states, shared_payloads) =
                    self.perform_local_updates(graph, train_nodes, None, None, round)?;
                RoundSnapshot {
                    round,
                    local_states,
                    shared_payloads,
                    shared_state: None,
                }
            }
            Some(previous) => {
                if previous.local_states.len() != train_nodes.len() {
                    return Err(StrategyError::TrainNodesChanged {
                        expected: previous.local_states.len(),
                        found: train_nodes.len(),
                    });
                }
                let shared_state = aggregation_node.register_aggregate(
                    graph,
                    AggregationFunction::WeightedAverage,
                    &previous.shared_payloads,
                    round,
                )?;
                let (local_states, shared_payloads) = self.perform_local_updates(
                    graph,
                    train_nodes,
                    Some(shared_state),
                    Some(&previous.local_states),
                    round,
                )?;
                RoundSnapshot {
                    round,
                    local_states,
                    shared_payloads,
                    shared_state: Some(shared_state),
                }
            }
        };
        self.history.push(snapshot);

        Ok(())
    }

    /// Register a train operation on every node, in node order.
    fn perform_local_updates(
        &self,
        graph: &mut OperationGraph,
        train_nodes: &mut [TrainNode],
        shared_state: Option<SharedStateRef>,
        local_states: Option<&[LocalStateRef]>,
        round: RoundIdx,
    ) -> Result<(Vec<LocalStateRef>, Vec<SharedStatePayload>), StrategyError> {
        let mut next_local_states = Vec::with_capacity(train_nodes.len());
        let mut next_shared_payloads = Vec::with_capacity(train_nodes.len());

        for (idx, node) in train_nodes.iter_mut().enumerate() {
            let local_state = local_states.and_then(|states| states.get(idx));
            let (local_state, shared_payload) =
                node.register_train(graph, &self.algo, round, shared_state, local_state)?;
            next_local_states.push(local_state);
            next_shared_payloads.push(shared_payload);
        }

        Ok((next_local_states, next_shared_payloads))
    }

    /// Register a test operation on every test node.
    ///
    /// Each test node scores the latest local state of the one train node sharing its
    /// participant id.
    ///
    /// # Errors
    /// Fails if no round was performed, or if a test node does not match exactly one
    /// train node.
    pub fn predict(
        &self,
        graph: &mut OperationGraph,
        test_nodes: &mut [TestNode],
        train_nodes: &[TrainNode],
        round: RoundIdx,
    ) -> Result<(), StrategyError> {
        let current = self.current().ok_or(StrategyError::NotTrained)?;

        for test_node in test_nodes.iter_mut() {
            let participant_id = test_node.participant_id().clone();
            check_matching_train_node(&participant_id, train_nodes)?;
            let local_state = current
                .local_state(&participant_id)
                .ok_or_else(|| StrategyError::NoMatchingTrainNode(participant_id.clone()))?;
            debug!(
                "testing {} of round {} on {}",
                local_state, current.round, participant_id
            );
            test_node.register_test(graph, local_state, round)?;
        }

        Ok(())
    }
}

/// Check that exactly one train node runs on the given participant.
fn check_matching_train_node(
    participant_id: &ParticipantId,
    train_nodes: &[TrainNode],
) -> Result<(), StrategyError> {
    match train_nodes
        .iter()
        .filter(|node| node.participant_id() == participant_id)
        .count()
    {
        0 => Err(StrategyError::NoMatchingTrainNode(participant_id.clone())),
        1 => Ok(()),
        _ => Err(StrategyError::AmbiguousTrainNode(participant_id.clone())),
    }
}
