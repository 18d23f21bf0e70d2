use crate::{
    common::{DataSampleKey, DatasetKey, MetricKey, ParticipantId, RoundIdx},
    graph::{OperationGraph, OperationId, OperationInput, OperationPayload},
    nodes::{check_scope, Node, NodeError},
    references::LocalStateRef,
};

/// A participant holding test data, scoring the models trained on it.
#[derive(Debug, Clone)]
pub struct TestNode {
    participant_id: ParticipantId,
    dataset: DatasetKey,
    data_samples: Vec<DataSampleKey>,
    metrics: Vec<MetricKey>,
    operations: Vec<OperationId>,
}

impl TestNode {
    pub fn new(
        participant_id: impl Into<ParticipantId>,
        dataset: DatasetKey,
        data_samples: Vec<DataSampleKey>,
        metrics: Vec<MetricKey>,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            dataset,
            data_samples,
            metrics,
            operations: Vec::new(),
        }
    }

    pub fn metrics(&self) -> &[MetricKey] {
        &self.metrics
    }

    /// Register a test operation scoring `local_state` on the node's data.
    ///
    /// # Errors
    /// Fails with [`NodeError::ScopeViolation`] if `local_state` was produced on another
    /// participant.
    pub fn register_test(
        &mut self,
        graph: &mut OperationGraph,
        local_state: &LocalStateRef,
        round: RoundIdx,
    ) -> Result<OperationId, NodeError> {
        check_scope(&self.participant_id, &local_state.node)?;

        let id = graph.push(
            self.participant_id.clone(),
            round,
            vec![OperationInput::LocalState(local_state.clone())],
            OperationPayload::Test {
                dataset: self.dataset,
                data_samples: self.data_samples.clone(),
                metrics: self.metrics.clone(),
            },
        )?;
        self.operations.push(id);
        Ok(id)
    }
}

impl Node for TestNode {
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
