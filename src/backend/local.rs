//! An in-process execution backend.
//!
//! The [`LocalBackend`] runs every task of a compute plan on the local machine, in rank
//! order, on a blocking thread of the tokio runtime. It keeps the states produced by the
//! tasks in memory until they are not needed anymore.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    algo::{AlgoError, AlgoHandle, LocalState},
    backend::{
        plan::{AggregateTaskSpec, ComputePlanSpec, TaskSpec, TestTaskSpec, TrainTaskSpec},
        BackendError, ComputeBackend, Performance, Performances, PlanStatus,
    },
    common::{PlanKey, TaskKey},
    strategies::fed_avg::{AggregationError, FedAvgAveragedState, FedAvgSharedState},
};

/// Error raised while running the tasks of a plan.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("the output of task {0} is not available")]
    MissingInput(TaskKey),
    #[error("the plan was canceled")]
    Canceled,
    #[error(transparent)]
    Algo(#[from] AlgoError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

#[derive(Debug)]
struct PlanRecord {
    status: PlanStatus,
    performances: Performances,
    canceled: Arc<AtomicBool>,
}

/// A [`ComputeBackend`] running the compute plans in-process.
#[derive(Debug, Clone, Default)]
pub struct LocalBackend {
    plans: Arc<RwLock<HashMap<PlanKey, PlanRecord>>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the cancellation of a plan. The plan stops before its next task.
    ///
    /// Returns whether the plan was still running.
    pub async fn cancel(&self, plan: PlanKey) -> Result<bool, BackendError> {
        let mut plans = self.plans.write().await;
        let record = plans
            .get_mut(&plan)
            .ok_or(BackendError::UnknownPlan(plan))?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        record.canceled.store(true, Ordering::SeqCst);
        record.status = PlanStatus::Canceled;
        Ok(true)
    }

    async fn set_status(&self, plan: PlanKey, status: PlanStatus, performances: Performances) {
        let mut plans = self.plans.write().await;
        if let Some(record) = plans.get_mut(&plan) {
            if record.status.is_terminal() {
                return;
            }
            debug!("compute plan {} is {}", plan, status);
            record.status = status;
            record.performances = performances;
        }
    }

    async fn execute(self, key: PlanKey, plan: ComputePlanSpec, canceled: Arc<AtomicBool>) {
        self.set_status(key, PlanStatus::Running, Performances::default())
            .await;

        let result =
            tokio::task::spawn_blocking(move || Executor::new(&plan, canceled).run(&plan)).await;
        match result {
            Ok(Ok(performances)) => {
                info!("compute plan {} done", key);
                self.set_status(key, PlanStatus::Done, performances).await;
            }
            Ok(Err(ExecutionError::Canceled)) => {
                info!("compute plan {} canceled", key);
                self.set_status(key, PlanStatus::Canceled, Performances::default())
                    .await;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "compute plan {} failed", key);
                self.set_status(key, PlanStatus::Failed, Performances::default())
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "compute plan {} panicked", key);
                self.set_status(key, PlanStatus::Failed, Performances::default())
                    .await;
            }
        }
    }
}

#[async_trait]
impl ComputeBackend for LocalBackend {
    async fn submit(&self, plan: ComputePlanSpec) -> Result<PlanKey, BackendError> {
        check_plan(&plan)?;

        let key = PlanKey::new();
        let canceled = Arc::new(AtomicBool::new(false));
        self.plans.write().await.insert(
            key,
            PlanRecord {
                status: PlanStatus::Waiting,
                performances: Performances::default(),
                canceled: canceled.clone(),
            },
        );
        info!(
            "compute plan {} ({}) accepted with {} tasks",
            key,
            plan.tag,
            plan.len()
        );

        tokio::spawn(self.clone().execute(key, plan, canceled));
        Ok(key)
    }

    async fn status(&self, plan: PlanKey) -> Result<PlanStatus, BackendError> {
        self.plans
            .read()
            .await
            .get(&plan)
            .map(|record| record.status)
            .ok_or(BackendError::UnknownPlan(plan))
    }

    async fn performances(&self, plan: PlanKey) -> Result<Performances, BackendError> {
        self.plans
            .read()
            .await
            .get(&plan)
            .map(|record| record.performances.clone())
            .ok_or(BackendError::UnknownPlan(plan))
    }
}

/// Reject plans with unauthorized workers, or whose tasks consume tasks that do not
/// precede them.
fn check_plan(plan: &ComputePlanSpec) -> Result<(), BackendError> {
    let mut seen = HashSet::new();
    for task in plan.tasks() {
        if !plan.permissions.allows(task.worker()) {
            return Err(BackendError::Rejected(format!(
                "worker {} is not authorized",
                task.worker()
            )));
        }
        for input in inputs_of(&task) {
            if !seen.contains(&input) {
                return Err(BackendError::Rejected(format!(
                    "task {} is not an earlier task of the plan",
                    input
                )));
            }
        }
        let key = task.key();
        if !seen.insert(key) {
            return Err(BackendError::Rejected(format!("duplicate task {}", key)));
        }
    }
    Ok(())
}

fn inputs_of(task: &TaskSpec) -> Vec<TaskKey> {
    match task {
        TaskSpec::Train(task) => task
            .in_local
            .iter()
            .chain(task.in_shared.iter())
            .copied()
            .collect(),
        TaskSpec::Aggregate(task) => task.in_models.clone(),
        TaskSpec::Test(task) => vec![task.in_model],
    }
}

/// The outputs of a train task.
struct TrainOutput {
    algo: AlgoHandle,
    local: LocalState,
    shared: FedAvgSharedState,
}

/// Runs the tasks of a single plan.
struct Executor {
    clean_models: bool,
    canceled: Arc<AtomicBool>,
    /// Number of tasks still consuming the output of each task
    consumers: HashMap<TaskKey, usize>,
    trained: HashMap<TaskKey, TrainOutput>,
    aggregated: HashMap<TaskKey, FedAvgAveragedState>,
}

impl Executor {
    fn new(plan: &ComputePlanSpec, canceled: Arc<AtomicBool>) -> Self {
        let mut consumers = HashMap::new();
        for task in plan.tasks() {
            for input in inputs_of(&task) {
                *consumers.entry(input).or_insert(0) += 1;
            }
        }
        Self {
            clean_models: plan.clean_models,
            canceled,
            consumers,
            trained: HashMap::new(),
            aggregated: HashMap::new(),
        }
    }

    fn run(mut self, plan: &ComputePlanSpec) -> Result<Performances, ExecutionError> {
        let mut performances = Vec::with_capacity(plan.test_tasks.len());
        for task in plan.tasks() {
            if self.canceled.load(Ordering::SeqCst) {
                return Err(ExecutionError::Canceled);
            }
            match task {
                TaskSpec::Train(task) => self.train(task)?,
                TaskSpec::Aggregate(task) => self.aggregate(task)?,
                TaskSpec::Test(task) => performances.push(self.test(task)?),
            }
        }
        Ok(Performances(performances))
    }

    fn train(&mut self, task: TrainTaskSpec) -> Result<(), ExecutionError> {
        debug!("running train task {} on {}", task.key, task.worker);
        let local = task
            .in_local
            .map(|key| {
                self.trained
                    .get(&key)
                    .map(|output| &output.local)
                    .ok_or(ExecutionError::MissingInput(key))
            })
            .transpose()?;
        let shared = task
            .in_shared
            .map(|key| {
                self.aggregated
                    .get(&key)
                    .ok_or(ExecutionError::MissingInput(key))
            })
            .transpose()?;

        let (local, shared) = task.algo.train(&task.data_samples, local, shared)?;
        self.trained.insert(
            task.key,
            TrainOutput {
                algo: task.algo,
                local,
                shared,
            },
        );

        if let Some(key) = task.in_local {
            self.consumed(key);
        }
        if let Some(key) = task.in_shared {
            self.consumed(key);
        }
        Ok(())
    }

    fn aggregate(&mut self, task: AggregateTaskSpec) -> Result<(), ExecutionError> {
        debug!("running aggregate task {} on {}", task.key, task.worker);
        let shared_states = task
            .in_models
            .iter()
            .map(|key| {
                self.trained
                    .get(key)
                    .map(|output| output.shared.clone())
                    .ok_or(ExecutionError::MissingInput(*key))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let averaged = task.function.apply(&shared_states)?;
        self.aggregated.insert(task.key, averaged);

        for key in task.in_models.iter() {
            self.consumed(*key);
        }
        Ok(())
    }

    fn test(&mut self, task: TestTaskSpec) -> Result<Performance, ExecutionError> {
        debug!("running test task {} on {}", task.key, task.worker);
        let output = self
            .trained
            .get(&task.in_model)
            .ok_or(ExecutionError::MissingInput(task.in_model))?;
        let value = output.algo.score(&task.data_samples, &output.local)?;

        self.consumed(task.in_model);
        Ok(Performance {
            test_task: task.key,
            worker: task.worker,
            round: task.round,
            value,
        })
    }

    /// Record that an output was consumed, and drop it once it has no consumer left.
    fn consumed(&mut self, key: TaskKey) {
        if let Some(count) = self.consumers.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 && self.clean_models {
                self.consumers.remove(&key);
                self.trained.remove(&key);
                self.aggregated.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        algo::tests::constant_algo,
        backend::plan::Permissions,
        common::{DataSampleKey, DatasetKey, ParticipantId},
        strategies::AggregationFunction,
    };

    fn train_task(rank: usize, worker: &str, in_shared: Option<TaskKey>) -> TrainTaskSpec {
        TrainTaskSpec {
            key: TaskKey::new(),
            rank,
            round: 0,
            worker: worker.into(),
            algo: constant_algo(),
            dataset: DatasetKey::new(),
            data_samples: vec![DataSampleKey::new()],
            in_local: None,
            in_shared,
        }
    }

    fn plan(tasks: Vec<TaskSpec>, workers: &[&str]) -> ComputePlanSpec {
        ComputePlanSpec::new(
            "test".to_string(),
            true,
            Permissions::private(workers.iter().map(|id| ParticipantId::from(*id))),
            tasks,
        )
    }

    async fn wait_terminal(backend: &LocalBackend, key: PlanKey) -> PlanStatus {
        loop {
            let status = backend.status(key).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_runs_plan_to_completion() {
        let first = train_task(0, "a", None);
        let aggregate = AggregateTaskSpec {
            key: TaskKey::new(),
            rank: 1,
            round: 1,
            worker: "server".into(),
            function: AggregationFunction::WeightedAverage,
            in_models: vec![first.key],
        };
        let second = train_task(2, "a", Some(aggregate.key));
        let test = TestTaskSpec {
            key: TaskKey::new(),
            rank: 3,
            round: 1,
            worker: "a".into(),
            in_model: second.key,
            dataset: DatasetKey::new(),
            data_samples: Vec::new(),
            metrics: Vec::new(),
        };
        let test_key = test.key;

        let backend = LocalBackend::new();
        let key = backend
            .submit(plan(
                vec![
                    TaskSpec::Train(first),
                    TaskSpec::Aggregate(aggregate),
                    TaskSpec::Train(second),
                    TaskSpec::Test(test),
                ],
                &["a", "server"],
            ))
            .await
            .unwrap();

        assert_eq!(wait_terminal(&backend, key).await, PlanStatus::Done);
        let performances = backend.performances(key).await.unwrap();
        assert_eq!(performances.len(), 1);
        let performance = performances.iter().next().unwrap();
        assert_eq!(performance.test_task, test_key);
        assert_eq!(performance.round, 1);
        // the constant algorithm scores the sum of its parameters
        assert!((performance.value - 3.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_rejects_unauthorized_worker() {
        let backend = LocalBackend::new();
        let err = backend
            .submit(plan(
                vec![TaskSpec::Train(train_task(0, "a", None))],
                &["b"],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_rejects_dangling_input() {
        let backend = LocalBackend::new();
        let task = train_task(0, "a", Some(TaskKey::new()));
        let err = backend
            .submit(plan(vec![TaskSpec::Train(task)], &["a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_rejects_duplicate_task_key() {
        let backend = LocalBackend::new();
        let first = train_task(0, "a", None);
        let mut twin = train_task(1, "a", None);
        twin.key = first.key;
        let err = backend
            .submit(plan(
                vec![TaskSpec::Train(first), TaskSpec::Train(twin)],
                &["a"],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(reason) if reason.contains("duplicate")));
    }

    #[tokio::test]
    async fn test_rejects_input_of_later_rank() {
        let backend = LocalBackend::new();
        let later = train_task(1, "a", None);
        let earlier = train_task(0, "a", Some(later.key));
        let err = backend
            .submit(plan(
                vec![TaskSpec::Train(later), TaskSpec::Train(earlier)],
                &["a"],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(reason) if reason.contains("earlier")));
    }

    #[tokio::test]
    async fn test_cancel_submitted_plan() {
        let backend = LocalBackend::new();
        let task = train_task(0, "a", None);
        let key = backend
            .submit(plan(vec![TaskSpec::Train(task)], &["a"]))
            .await
            .unwrap();

        // the execution task has not been polled yet on the current thread runtime
        assert_eq!(backend.cancel(key).await, Ok(true));
        assert_eq!(backend.status(key).await, Ok(PlanStatus::Canceled));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.status(key).await, Ok(PlanStatus::Canceled));
        assert!(backend.performances(key).await.unwrap().is_empty());
        assert_eq!(backend.cancel(key).await, Ok(false));
    }

    #[tokio::test]
    async fn test_failing_aggregation_fails_plan() {
        let first = train_task(0, "a", None);
        let mut other = train_task(1, "b", None);
        other.algo = AlgoHandle::new(crate::algo::tests::ConstantAlgo {
            update: vec![1.0],
            n_samples: 1,
        });
        let aggregate = AggregateTaskSpec {
            key: TaskKey::new(),
            rank: 2,
            round: 1,
            worker: "server".into(),
            function: AggregationFunction::WeightedAverage,
            in_models: vec![first.key, other.key],
        };

        let backend = LocalBackend::new();
        let key = backend
            .submit(plan(
                vec![
                    TaskSpec::Train(first),
                    TaskSpec::Train(other),
                    TaskSpec::Aggregate(aggregate),
                ],
                &["a", "b", "server"],
            ))
            .await
            .unwrap();

        assert_eq!(wait_terminal(&backend, key).await, PlanStatus::Failed);
        assert!(backend.performances(key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_plan() {
        let backend = LocalBackend::new();
        let key = PlanKey::new();
        assert_eq!(
            backend.status(key).await,
            Err(BackendError::UnknownPlan(key))
        );
        assert_eq!(
            backend.performances(key).await,
            Err(BackendError::UnknownPlan(key))
        );
        assert_eq!(
            backend.cancel(key).await,
            Err(BackendError::UnknownPlan(key))
        );
    }

    #[test]
    fn test_executor_cleans_consumed_models() {
        let first = train_task(0, "a", None);
        let first_key = first.key;
        let aggregate = AggregateTaskSpec {
            key: TaskKey::new(),
            rank: 1,
            round: 1,
            worker: "server".into(),
            function: AggregationFunction::WeightedAverage,
            in_models: vec![first.key],
        };
        let plan = plan(
            vec![TaskSpec::Train(first), TaskSpec::Aggregate(aggregate)],
            &["a", "server"],
        );

        let mut executor = Executor::new(&plan, Arc::new(AtomicBool::new(false)));
        for task in plan.tasks() {
            match task {
                TaskSpec::Train(task) => executor.train(task).unwrap(),
                TaskSpec::Aggregate(task) => executor.aggregate(task).unwrap(),
                TaskSpec::Test(_) => unreachable!(),
            }
        }
        assert!(!executor.trained.contains_key(&first_key));
        assert_eq!(executor.aggregated.len(), 1);
    }

    #[test]
    fn test_executor_stops_when_canceled() {
        let plan = plan(vec![TaskSpec::Train(train_task(0, "a", None))], &["a"]);
        let executor = Executor::new(&plan, Arc::new(AtomicBool::new(true)));
        assert!(matches!(executor.run(&plan), Err(ExecutionError::Canceled)));
    }
}
