//! Strategies compose the operations of a round of federated learning.
//!
//! A [`Strategy`] is a closed set of algorithms. Each variant builds the operations of a
//! round on the nodes it is given ([`Strategy::perform_round`]) and registers the test
//! operations of an evaluation ([`Strategy::predict`]). Strategies never see concrete
//! states: they only pass around the references returned by the nodes.

pub mod fed_avg;

pub use self::fed_avg::FedAvg;

use derive_more::{Display, From};
use serde::Serialize;
use thiserror::Error;

use crate::{
    common::{ParticipantId, RoundIdx},
    graph::OperationGraph,
    nodes::{AggregationNode, NodeError, TestNode, TrainNode},
    references::{LocalStateRef, SharedStatePayload, SharedStateRef},
};

use self::fed_avg::{avg_shared_states, AggregationError, FedAvgAveragedState, FedAvgSharedState};

/// Error returned when a strategy fails to build the operations of a round.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("the {0} strategy requires an aggregation node")]
    MissingAggregationNode(StrategyName),
    #[error("round {found} cannot be performed, expected round {expected}")]
    RoundOutOfOrder { expected: RoundIdx, found: RoundIdx },
    #[error("{expected} train nodes were expected but {found} were given")]
    TrainNodesChanged { expected: usize, found: usize },
    #[error("cannot predict before any round has been performed")]
    NotTrained,
    #[error("no train node matches the test node {0}")]
    NoMatchingTrainNode(ParticipantId),
    #[error("several train nodes match the test node {0}")]
    AmbiguousTrainNode(ParticipantId),
    #[error(transparent)]
    Node(#[from] NodeError),
}

/// Name of a strategy.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyName {
    #[display(fmt = "federated averaging")]
    FederatedAveraging,
}

/// The function run by an aggregate operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationFunction {
    /// Average of the parameter updates, weighted by the number of samples of each node
    WeightedAverage,
}

impl AggregationFunction {
    pub fn apply(
        self,
        shared_states: &[FedAvgSharedState],
    ) -> Result<FedAvgAveragedState, AggregationError> {
        match self {
            Self::WeightedAverage => avg_shared_states(shared_states),
        }
    }
}

/// The states of a strategy at the end of a round.
///
/// Snapshots are never modified once recorded: each round records a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundSnapshot {
    pub round: RoundIdx,
    /// The local state of every train node, in node order
    pub local_states: Vec<LocalStateRef>,
    /// The shared payload of every train node, in node order
    pub shared_payloads: Vec<SharedStatePayload>,
    /// The aggregated state the train nodes started from, if any
    pub shared_state: Option<SharedStateRef>,
}

impl RoundSnapshot {
    /// The local state of the given participant.
    pub fn local_state(&self, node: &ParticipantId) -> Option<&LocalStateRef> {
        self.local_states.iter().find(|state| state.node() == node)
    }
}

/// A federated learning strategy.
#[derive(Debug, From)]
pub enum Strategy {
    FedAvg(FedAvg),
}

impl Strategy {
    pub fn name(&self) -> StrategyName {
        match self {
            Self::FedAvg(_) => StrategyName::FederatedAveraging,
        }
    }

    /// Whether the strategy needs an [`AggregationNode`] to perform rounds.
    pub fn requires_aggregation_node(&self) -> bool {
        match self {
            Self::FedAvg(_) => true,
        }
    }

    /// Register the operations of the given round.
    pub fn perform_round(
        &mut self,
        graph: &mut OperationGraph,
        train_nodes: &mut [TrainNode],
        aggregation_node: Option<&mut AggregationNode>,
        round: RoundIdx,
    ) -> Result<(), StrategyError> {
        match self {
            Self::FedAvg(strategy) => {
                strategy.perform_round(graph, train_nodes, aggregation_node, round)
            }
        }
    }

    /// Register a test operation on every test node, scoring the latest local state of
    /// the matching train node.
    pub fn predict(
        &self,
        graph: &mut OperationGraph,
        test_nodes: &mut [TestNode],
        train_nodes: &[TrainNode],
        round: RoundIdx,
    ) -> Result<(), StrategyError> {
        match self {
            Self::FedAvg(strategy) => strategy.predict(graph, test_nodes, train_nodes, round),
        }
    }

    /// The snapshots of all the rounds performed so far.
    pub fn history(&self) -> &[RoundSnapshot] {
        match self {
            Self::FedAvg(strategy) => strategy.history(),
        }
    }

    /// Forget all the performed rounds.
    pub fn reset(&mut self) {
        match self {
            Self::FedAvg(strategy) => strategy.reset(),
        }
    }
}
