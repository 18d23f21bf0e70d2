use crate::{
    common::{ParticipantId, RoundIdx},
    graph::{OperationGraph, OperationId, OperationInput, OperationPayload},
    nodes::{Node, NodeError},
    references::{SharedStatePayload, SharedStateRef},
    strategies::AggregationFunction,
};

/// The coordinator of the federation. It holds no data and only aggregates the shared
/// payloads of the train nodes.
#[derive(Debug, Clone)]
pub struct AggregationNode {
    participant_id: ParticipantId,
    operations: Vec<OperationId>,
}

impl AggregationNode {
    pub fn new(participant_id: impl Into<ParticipantId>) -> Self {
        Self {
            participant_id: participant_id.into(),
            operations: Vec::new(),
        }
    }

    /// Register an aggregate operation over `payloads`, in the given order.
    ///
    /// # Errors
    /// Fails with [`NodeError::EmptyAggregationInput`] if `payloads` is empty.
    pub fn register_aggregate(
        &mut self,
        graph: &mut OperationGraph,
        function: AggregationFunction,
        payloads: &[SharedStatePayload],
        round: RoundIdx,
    ) -> Result<SharedStateRef, NodeError> {
        if payloads.is_empty() {
            return Err(NodeError::EmptyAggregationInput);
        }

        let inputs = payloads
            .iter()
            .cloned()
            .map(OperationInput::SharedPayload)
            .collect();
        let producer = graph.push(
            self.participant_id.clone(),
            round,
            inputs,
            OperationPayload::Aggregate { function },
        )?;
        self.operations.push(producer);
        Ok(SharedStateRef { producer })
    }
}

impl Node for AggregationNode {
    fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    fn operations(&self) -> &[OperationId] {
        &self.operations
    }

    fn clear(&mut self) {
        self.operations.clear();
    }
}
