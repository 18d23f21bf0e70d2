//! The static graph of operations of an experiment.
//!
//! The [`OperationGraph`] is an arena: operations are appended as the strategy registers
//! them on the nodes and are addressed by their [`OperationId`], which is also their
//! position in the graph. The state references handed out to the strategy are keys into
//! this arena. Since an operation can only consume references to operations that were
//! appended before it, the graph is a DAG by construction, and the order of the arena is
//! the deterministic submission order of the operations.

use derive_more::Display;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::{
    algo::AlgoHandle,
    common::{DataSampleKey, DatasetKey, MetricKey, ParticipantId, RoundIdx, TaskKey},
    references::{LocalStateRef, SharedStatePayload, SharedStateRef},
    strategies::AggregationFunction,
};

/// Error returned when an operation cannot be added to the graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("{input} is not produced by an operation preceding {operation}")]
    ForwardReference {
        operation: OperationId,
        input: OperationId,
    },
    #[error("{input} is a {found} operation but a {expected} operation was expected")]
    InputKindMismatch {
        input: OperationId,
        expected: OperationKind,
        found: OperationKind,
    },
}

/// The position of an operation in the [`OperationGraph`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[display(fmt = "operation #{}", _0)]
pub struct OperationId(usize);

impl OperationId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// The kind of an operation.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    #[display(fmt = "train")]
    Train,
    #[display(fmt = "aggregate")]
    Aggregate,
    #[display(fmt = "test")]
    Test,
}

/// A state consumed by an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationInput {
    /// The local state of the same node from a previous round
    LocalState(LocalStateRef),
    /// An aggregated state, broadcast by the aggregation node
    SharedState(SharedStateRef),
    /// The shared output of a train operation, to be aggregated
    SharedPayload(SharedStatePayload),
}

impl OperationInput {
    /// The operation producing this input.
    pub fn producer(&self) -> OperationId {
        match self {
            Self::LocalState(state) => state.producer,
            Self::SharedState(state) => state.producer,
            Self::SharedPayload(payload) => payload.producer,
        }
    }

    /// The kind of operation that must produce this input.
    fn producer_kind(&self) -> OperationKind {
        match self {
            Self::LocalState(_) | Self::SharedPayload(_) => OperationKind::Train,
            Self::SharedState(_) => OperationKind::Aggregate,
        }
    }
}

/// What an operation runs.
#[derive(Debug, Clone)]
pub enum OperationPayload {
    Train {
        algo: AlgoHandle,
        dataset: DatasetKey,
        data_samples: Vec<DataSampleKey>,
    },
    Aggregate {
        function: AggregationFunction,
    },
    Test {
        dataset: DatasetKey,
        data_samples: Vec<DataSampleKey>,
        metrics: Vec<MetricKey>,
    },
}

impl OperationPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Train { .. } => OperationKind::Train,
            Self::Aggregate { .. } => OperationKind::Aggregate,
            Self::Test { .. } => OperationKind::Test,
        }
    }
}

/// An operation of the graph.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Position of the operation in the graph
    pub id: OperationId,
    /// Key under which the operation is submitted to the backend
    pub key: TaskKey,
    /// The node the operation runs on
    pub node: ParticipantId,
    /// The round the operation belongs to
    pub round: RoundIdx,
    /// The states consumed by the operation, in order
    pub inputs: Vec<OperationInput>,
    pub payload: OperationPayload,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        self.payload.kind()
    }

    /// The operations this one depends on, in input order.
    pub fn parents(&self) -> impl Iterator<Item = OperationId> + '_ {
        self.inputs.iter().map(OperationInput::producer)
    }
}

/// The arena of all the operations of an experiment.
#[derive(Debug, Clone, Default)]
pub struct OperationGraph {
    operations: Vec<Operation>,
}

impl OperationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn get(&self, id: OperationId) -> Option<&Operation> {
        self.operations.get(id.0)
    }

    /// Iterate over the operations in submission order.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter()
    }

    /// Iterate over the operations of the given kind in submission order.
    pub fn operations_of(&self, kind: OperationKind) -> impl Iterator<Item = &Operation> {
        self.operations.iter().filter(move |op| op.kind() == kind)
    }

    /// Append an operation to the graph.
    ///
    /// # Errors
    /// Fails if an input is not produced by an operation of the expected kind already in
    /// the graph.
    pub(crate) fn push(
        &mut self,
        node: ParticipantId,
        round: RoundIdx,
        inputs: Vec<OperationInput>,
        payload: OperationPayload,
    ) -> Result<OperationId, GraphError> {
        let id = OperationId(self.operations.len());
        for input in inputs.iter() {
            self.check_input(id, input)?;
        }

        debug!(
            "registering {} {} of round {} on {}",
            payload.kind(),
            id,
            round,
            node
        );
        self.operations.push(Operation {
            id,
            key: TaskKey::new(),
            node,
            round,
            inputs,
            payload,
        });
        Ok(id)
    }

    /// Check that every operation only consumes the outputs of earlier operations of the
    /// right kind.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.operations.iter().try_for_each(|op| {
            op.inputs
                .iter()
                .try_for_each(|input| self.check_input(op.id, input))
        })
    }

    fn check_input(
        &self,
        operation: OperationId,
        input: &OperationInput,
    ) -> Result<(), GraphError> {
        let producer = input.producer();
        if producer >= operation {
            return Err(GraphError::ForwardReference {
                operation,
                input: producer,
            });
        }
        let found = self
            .get(producer)
            .ok_or(GraphError::ForwardReference {
                operation,
                input: producer,
            })?
            .kind();
        let expected = input.producer_kind();
        if found != expected {
            return Err(GraphError::InputKindMismatch {
                input: producer,
                expected,
                found,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::tests::constant_algo;

    fn train_payload() -> OperationPayload {
        OperationPayload::Train {
            algo: constant_algo(),
            dataset: DatasetKey::new(),
            data_samples: vec![DataSampleKey::new()],
        }
    }

    #[test]
    fn test_push_assigns_positions_in_order() {
        let mut graph = OperationGraph::new();
        let first = graph
            .push("a".into(), 0, Vec::new(), train_payload())
            .unwrap();
        let second = graph
            .push("b".into(), 0, Vec::new(), train_payload())
            .unwrap();
        assert_eq!(first.index(), 0);
        assert_eq!(second.index(), 1);
        assert_eq!(graph.len(), 2);
        assert_ne!(
            graph.get(first).unwrap().key,
            graph.get(second).unwrap().key
        );
    }

    #[test]
    fn test_push_rejects_forward_reference() {
        let mut graph = OperationGraph::new();
        let input = OperationInput::LocalState(LocalStateRef {
            producer: OperationId(3),
            node: "a".into(),
        });
        let err = graph
            .push("a".into(), 1, vec![input], train_payload())
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::ForwardReference {
                operation: OperationId(0),
                input: OperationId(3),
            }
        );
        assert!(graph.is_empty());
    }

    #[test]
    fn test_push_rejects_input_of_wrong_kind() {
        let mut graph = OperationGraph::new();
        let train = graph
            .push("a".into(), 0, Vec::new(), train_payload())
            .unwrap();
        let input = OperationInput::SharedState(SharedStateRef { producer: train });
        let err = graph
            .push("a".into(), 1, vec![input], train_payload())
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::InputKindMismatch {
                input: train,
                expected: OperationKind::Aggregate,
                found: OperationKind::Train,
            }
        );
    }

    #[test]
    fn test_validate_and_filter_by_kind() {
        let mut graph = OperationGraph::new();
        let train = graph
            .push("a".into(), 0, Vec::new(), train_payload())
            .unwrap();
        let payload = SharedStatePayload {
            producer: train,
            node: "a".into(),
        };
        graph
            .push(
                "agg".into(),
                1,
                vec![OperationInput::SharedPayload(payload)],
                OperationPayload::Aggregate {
                    function: AggregationFunction::WeightedAverage,
                },
            )
            .unwrap();

        assert!(graph.validate().is_ok());
        assert_eq!(graph.operations_of(OperationKind::Train).count(), 1);
        assert_eq!(graph.operations_of(OperationKind::Aggregate).count(), 1);
        assert_eq!(graph.operations_of(OperationKind::Test).count(), 0);
        let aggregate = graph.get(OperationId(1)).unwrap();
        assert_eq!(aggregate.parents().collect::<Vec<_>>(), vec![train]);
    }
}
