//! The federation members an experiment registers operations on.
//!
//! Registering an operation is pure bookkeeping: the operation is appended to the
//! [`OperationGraph`] and its position is queued on the node. Nothing is sent to the
//! execution backend before the whole graph has been built.
//!
//! [`OperationGraph`]: crate::graph::OperationGraph

mod aggregation;
mod test_data;
mod train_data;

pub use self::{aggregation::AggregationNode, test_data::TestNode, train_data::TrainNode};

use thiserror::Error;

use crate::{
    common::ParticipantId,
    graph::{GraphError, OperationId},
};

/// Error returned when an operation cannot be registered on a node.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("node {node} cannot consume a state of node {owner}")]
    ScopeViolation {
        node: ParticipantId,
        owner: ParticipantId,
    },
    #[error("cannot aggregate an empty sequence of shared states")]
    EmptyAggregationInput,
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Common behavior of the train, test and aggregation nodes.
pub trait Node {
    /// The participant this node runs on.
    fn participant_id(&self) -> &ParticipantId;

    /// The operations registered on this node, in registration order.
    fn operations(&self) -> &[OperationId];

    /// Forget all the registered operations.
    fn clear(&mut self);
}

/// Fail with a [`NodeError::ScopeViolation`] if `owner` is not `node`.
fn check_scope(node: &ParticipantId, owner: &ParticipantId) -> Result<(), NodeError> {
    if node == owner {
        Ok(())
    } else {
        Err(NodeError::ScopeViolation {
            node: node.clone(),
            owner: owner.clone(),
        })
    }
}
