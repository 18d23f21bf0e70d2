//! The execution backend running the compute plans.
//!
//! The orchestration core only talks to a backend through the [`ComputeBackend`] trait:
//! it submits a whole [`ComputePlanSpec`] at once, polls its [`PlanStatus`] and fetches the
//! [`Performances`] of its test tasks once it is done.

pub mod local;
mod plan;

pub use self::{
    local::LocalBackend,
    plan::{
        AggregateTaskSpec, ComputePlanSpec, Permissions, TaskSpec, TestTaskSpec, TrainTaskSpec,
    },
};

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::common::{ParticipantId, PlanKey, RoundIdx, TaskKey};

/// Error returned by a [`ComputeBackend`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    #[error("compute plan rejected: {0}")]
    Rejected(String),
    #[error("unknown compute plan {0}")]
    UnknownPlan(PlanKey),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Status of a submitted compute plan.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[display(fmt = "waiting")]
    Waiting,
    #[display(fmt = "running")]
    Running,
    #[display(fmt = "done")]
    Done,
    #[display(fmt = "failed")]
    Failed,
    #[display(fmt = "canceled")]
    Canceled,
}

impl PlanStatus {
    /// Whether the plan will not make any more progress.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }
}

/// The score of a test task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub test_task: TaskKey,
    pub worker: ParticipantId,
    pub round: RoundIdx,
    pub value: f64,
}

/// The scores of all the test tasks of a compute plan, in task order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Performances(pub Vec<Performance>);

impl Performances {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Performance> {
        self.0.iter()
    }

    /// The scores of the given round.
    pub fn of_round(&self, round: RoundIdx) -> impl Iterator<Item = &Performance> {
        self.0.iter().filter(move |perf| perf.round == round)
    }
}

/// A backend executing compute plans on the participants' infrastructure.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ComputeBackend {
    /// Submit a compute plan as a single unit. Returns the key of the plan.
    async fn submit(&self, plan: ComputePlanSpec) -> Result<PlanKey, BackendError>;

    /// Retrieve the current status of a plan.
    async fn status(&self, plan: PlanKey) -> Result<PlanStatus, BackendError>;

    /// Retrieve the scores of the test tasks of a plan.
    async fn performances(&self, plan: PlanKey) -> Result<Performances, BackendError>;
}
