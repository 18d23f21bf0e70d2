//! Opaque handles to states that only exist on the execution backend.
//!
//! A reference never carries the state itself. It is a key into the [`OperationGraph`]
//! which records the operation that produces the state, the node it was produced on and
//! the round it belongs to.
//!
//! [`OperationGraph`]: crate::graph::OperationGraph

use std::fmt;

use crate::{common::ParticipantId, graph::OperationId};

/// Reference to the local state of a node, produced by a train operation.
///
/// A local state is private to the node that produced it and may only be consumed by
/// operations registered on that same node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalStateRef {
    pub(crate) producer: OperationId,
    pub(crate) node: ParticipantId,
}

impl LocalStateRef {
    /// The train operation producing this state.
    pub fn producer(&self) -> OperationId {
        self.producer
    }

    /// The node owning this state.
    pub fn node(&self) -> &ParticipantId {
        &self.node
    }
}

impl fmt::Display for LocalStateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local state of {} from {}", self.node, self.producer)
    }
}

/// Reference to a shared state, computed once by the aggregation node and broadcast to
/// every train node of the next round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedStateRef {
    pub(crate) producer: OperationId,
}

impl SharedStateRef {
    /// The aggregate operation producing this state.
    pub fn producer(&self) -> OperationId {
        self.producer
    }
}

impl fmt::Display for SharedStateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shared state from {}", self.producer)
    }
}

/// The shared output of a train operation, waiting to be fed to an aggregation.
///
/// It is not a [`SharedStateRef`]: it has not been through the aggregation node yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SharedStatePayload {
    pub(crate) producer: OperationId,
    pub(crate) node: ParticipantId,
}

impl SharedStatePayload {
    /// The train operation producing this payload.
    pub fn producer(&self) -> OperationId {
        self.producer
    }

    /// The node that produced this payload.
    pub fn node(&self) -> &ParticipantId {
        &self.node
    }
}
