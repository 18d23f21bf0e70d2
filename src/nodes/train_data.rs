use crate::{
    algo::AlgoHandle,
    common::{DataSampleKey, DatasetKey, ParticipantId, RoundIdx},
    graph::{OperationGraph, OperationId, OperationInput, OperationPayload},
    nodes::{check_scope, Node, NodeError},
    references::{LocalStateRef, SharedStatePayload, SharedStateRef},
};

/// A participant holding training data.
#[derive(Debug, Clone)]
pub struct TrainNode {
    participant_id: ParticipantId,
    dataset: DatasetKey,
    data_samples: Vec<DataSampleKey>,
    operations: Vec<OperationId>,
}

impl TrainNode {
    pub fn new(
        participant_id: impl Into<ParticipantId>,
        dataset: DatasetKey,
        data_samples: Vec<DataSampleKey>,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            dataset,
            data_samples,
            operations: Vec::new(),
        }
    }

    pub fn dataset(&self) -> DatasetKey {
        self.dataset
    }

    pub fn data_samples(&self) -> &[DataSampleKey] {
        &self.data_samples
    }

    /// Register a train operation.
    ///
    /// The operation trains `algo` on the node's data, starting from the node's own
    /// `local_state` of the previous round and the aggregated `shared_state`, if given.
    /// Returns the reference to the new local state and the shared payload to aggregate.
    ///
    /// # Errors
    /// Fails with [`NodeError::ScopeViolation`] if `local_state` belongs to another node.
    pub fn register_train(
        &mut self,
        graph: &mut OperationGraph,
        algo: &AlgoHandle,
        round: RoundIdx,
        shared_state: Option<SharedStateRef>,
        local_state: Option<&LocalStateRef>,
    ) -> Result<(LocalStateRef, SharedStatePayload), NodeError> {
        let mut inputs = Vec::with_capacity(2);
        if let Some(local_state) = local_state {
            check_scope(&self.participant_id, &local_state.node)?;
            inputs.push(OperationInput::LocalState(local_state.clone()));
        }
        if let Some(shared_state) = shared_state {
            inputs.push(OperationInput::SharedState(shared_state));
        }

        let producer = graph.push(
            self.participant_id.clone(),
            round,
            inputs,
            OperationPayload::Train {
                algo: algo.clone(),
                dataset: self.dataset,
                data_samples: self.data_samples.clone(),
            },
        )?;
        self.operations.push(producer);

        Ok((
            LocalStateRef {
                producer,
                node: self.participant_id.clone(),
            },
            SharedStatePayload {
                producer,
                node: self.participant_id.clone(),
            },
        ))
    }
}

impl Node for TrainNode {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{algo::tests::constant_algo, graph::OperationKind};

    fn train_node(id: &str) -> TrainNode {
        TrainNode::new(id, DatasetKey::new(), vec![DataSampleKey::new()])
    }

    #[test]
    fn test_cold_start_has_no_inputs() {
        let mut graph = OperationGraph::new();
        let mut node = train_node("a");
        let (local, payload) = node
            .register_train(&mut graph, &constant_algo(), 0, None, None)
            .unwrap();

        assert_eq!(local.node(), &ParticipantId::from("a"));
        assert_eq!(local.producer(), payload.producer());
        assert_eq!(node.operations(), &[local.producer()]);
        let op = graph.get(local.producer()).unwrap();
        assert_eq!(op.kind(), OperationKind::Train);
        assert!(op.inputs.is_empty());
        assert_eq!(op.round, 0);
    }

    #[test]
    fn test_consumes_own_local_state() {
        let mut graph = OperationGraph::new();
        let mut node = train_node("a");
        let algo = constant_algo();
        let (first, _) = node
            .register_train(&mut graph, &algo, 0, None, None)
            .unwrap();
        let (second, _) = node
            .register_train(&mut graph, &algo, 1, None, Some(&first))
            .unwrap();

        let op = graph.get(second.producer()).unwrap();
        assert_eq!(op.inputs, vec![OperationInput::LocalState(first)]);
        assert_eq!(node.operations().len(), 2);
    }

    #[test]
    fn test_rejects_local_state_of_other_node() {
        let mut graph = OperationGraph::new();
        let algo = constant_algo();
        let mut a = train_node("a");
        let mut b = train_node("b");
        let (local_a, _) = a.register_train(&mut graph, &algo, 0, None, None).unwrap();

        let err = b
            .register_train(&mut graph, &algo, 1, None, Some(&local_a))
            .unwrap_err();
        assert_eq!(
            err,
            NodeError::ScopeViolation {
                node: "b".into(),
                owner: "a".into(),
            }
        );
        assert!(b.operations().is_empty());
        assert_eq!(graph.len(), 1);
    }
}
