use serde::Serialize;

use crate::{
    algo::AlgoHandle,
    common::{DataSampleKey, DatasetKey, MetricKey, ParticipantId, RoundIdx, TaskKey},
    graph::{GraphError, Operation, OperationGraph, OperationId, OperationInput, OperationPayload},
    strategies::AggregationFunction,
};

/// The participants allowed to see the tasks of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Permissions {
    pub public: bool,
    pub authorized_ids: Vec<ParticipantId>,
}

impl Permissions {
    /// Private permissions for the given participants, sorted and deduplicated.
    pub fn private(ids: impl IntoIterator<Item = ParticipantId>) -> Self {
        let mut authorized_ids = ids.into_iter().collect::<Vec<_>>();
        authorized_ids.sort();
        authorized_ids.dedup();
        Self {
            public: false,
            authorized_ids,
        }
    }

    pub fn allows(&self, id: &ParticipantId) -> bool {
        self.public || self.authorized_ids.contains(id)
    }
}

/// A task training an algorithm on a train node.
#[derive(Debug, Clone, Serialize)]
pub struct TrainTaskSpec {
    pub key: TaskKey,
    /// Position of the task in the plan, used to order sibling tasks
    pub rank: usize,
    pub round: RoundIdx,
    pub worker: ParticipantId,
    pub algo: AlgoHandle,
    pub dataset: DatasetKey,
    pub data_samples: Vec<DataSampleKey>,
    /// The train task whose local state this task starts from
    pub in_local: Option<TaskKey>,
    /// The aggregate task whose shared state this task starts from
    pub in_shared: Option<TaskKey>,
}

/// A task aggregating the shared outputs of train tasks.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateTaskSpec {
    pub key: TaskKey,
    pub rank: usize,
    pub round: RoundIdx,
    pub worker: ParticipantId,
    pub function: AggregationFunction,
    /// The train tasks whose shared outputs are aggregated, in order
    pub in_models: Vec<TaskKey>,
}

/// A task scoring the local state of a train task on a test node.
#[derive(Debug, Clone, Serialize)]
pub struct TestTaskSpec {
    pub key: TaskKey,
    pub rank: usize,
    pub round: RoundIdx,
    pub worker: ParticipantId,
    /// The train task whose local state is scored
    pub in_model: TaskKey,
    pub dataset: DatasetKey,
    pub data_samples: Vec<DataSampleKey>,
    pub metrics: Vec<MetricKey>,
}

/// A task of any kind.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskSpec {
    Train(TrainTaskSpec),
    Aggregate(AggregateTaskSpec),
    Test(TestTaskSpec),
}

impl TaskSpec {
    /// Describe an operation of the graph as a task, referring to its inputs by their keys.
    ///
    /// # Errors
    /// Fails if an input of the operation is not in the graph.
    pub fn from_operation(op: &Operation, graph: &OperationGraph) -> Result<Self, GraphError> {
        let key_of = |input: OperationId| {
            graph
                .get(input)
                .map(|parent| parent.key)
                .ok_or(GraphError::ForwardReference {
                    operation: op.id,
                    input,
                })
        };

        Ok(match &op.payload {
            OperationPayload::Train {
                algo,
                dataset,
                data_samples,
            } => {
                let mut in_local = None;
                let mut in_shared = None;
                for input in op.inputs.iter() {
                    match input {
                        OperationInput::LocalState(state) => {
                            in_local = Some(key_of(state.producer())?)
                        }
                        OperationInput::SharedState(state) => {
                            in_shared = Some(key_of(state.producer())?)
                        }
                        OperationInput::SharedPayload(_) => {}
                    }
                }
                Self::Train(TrainTaskSpec {
                    key: op.key,
                    rank: op.id.index(),
                    round: op.round,
                    worker: op.node.clone(),
                    algo: algo.clone(),
                    dataset: *dataset,
                    data_samples: data_samples.clone(),
                    in_local,
                    in_shared,
                })
            }
            OperationPayload::Aggregate { function } => Self::Aggregate(AggregateTaskSpec {
                key: op.key,
                rank: op.id.index(),
                round: op.round,
                worker: op.node.clone(),
                function: *function,
                in_models: op.parents().map(key_of).collect::<Result<_, _>>()?,
            }),
            OperationPayload::Test {
                dataset,
                data_samples,
                metrics,
            } => {
                let in_model = op
                    .inputs
                    .iter()
                    .find_map(|input| match input {
                        OperationInput::LocalState(state) => Some(state.producer()),
                        _ => None,
                    })
                    .ok_or(GraphError::InputKindMismatch {
                        input: op.id,
                        expected: crate::graph::OperationKind::Train,
                        found: crate::graph::OperationKind::Test,
                    })
                    .and_then(key_of)?;
                Self::Test(TestTaskSpec {
                    key: op.key,
                    rank: op.id.index(),
                    round: op.round,
                    worker: op.node.clone(),
                    in_model,
                    dataset: *dataset,
                    data_samples: data_samples.clone(),
                    metrics: metrics.clone(),
                })
            }
        })
    }

    pub fn key(&self) -> TaskKey {
        match self {
            Self::Train(task) => task.key,
            Self::Aggregate(task) => task.key,
            Self::Test(task) => task.key,
        }
    }

    pub fn rank(&self) -> usize {
        match self {
            Self::Train(task) => task.rank,
            Self::Aggregate(task) => task.rank,
            Self::Test(task) => task.rank,
        }
    }

    pub fn worker(&self) -> &ParticipantId {
        match self {
            Self::Train(task) => &task.worker,
            Self::Aggregate(task) => &task.worker,
            Self::Test(task) => &task.worker,
        }
    }
}

/// The atomic unit of work submitted to the execution backend.
#[derive(Debug, Clone, Serialize)]
pub struct ComputePlanSpec {
    pub tag: String,
    /// Whether the backend may delete intermediate models once they are consumed
    pub clean_models: bool,
    pub permissions: Permissions,
    pub train_tasks: Vec<TrainTaskSpec>,
    pub aggregate_tasks: Vec<AggregateTaskSpec>,
    pub test_tasks: Vec<TestTaskSpec>,
}

impl ComputePlanSpec {
    /// Build a plan from tasks of any kind. Tasks are partitioned by kind and each
    /// partition is sorted by rank.
    pub fn new(
        tag: String,
        clean_models: bool,
        permissions: Permissions,
        tasks: impl IntoIterator<Item = TaskSpec>,
    ) -> Self {
        let mut plan = Self {
            tag,
            clean_models,
            permissions,
            train_tasks: Vec::new(),
            aggregate_tasks: Vec::new(),
            test_tasks: Vec::new(),
        };
        for task in tasks {
            match task {
                TaskSpec::Train(task) => plan.train_tasks.push(task),
                TaskSpec::Aggregate(task) => plan.aggregate_tasks.push(task),
                TaskSpec::Test(task) => plan.test_tasks.push(task),
            }
        }
        plan.train_tasks.sort_by_key(|task| task.rank);
        plan.aggregate_tasks.sort_by_key(|task| task.rank);
        plan.test_tasks.sort_by_key(|task| task.rank);
        plan
    }

    /// The total number of tasks.
    pub fn len(&self) -> usize {
        self.train_tasks.len() + self.aggregate_tasks.len() + self.test_tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All the tasks, in rank order.
    pub fn tasks(&self) -> Vec<TaskSpec> {
        let mut tasks = self
            .train_tasks
            .iter()
            .cloned()
            .map(TaskSpec::Train)
            .chain(
                self.aggregate_tasks
                    .iter()
                    .cloned()
                    .map(TaskSpec::Aggregate),
            )
            .chain(self.test_tasks.iter().cloned().map(TaskSpec::Test))
            .collect::<Vec<_>>();
        tasks.sort_by_key(TaskSpec::rank);
        tasks
    }
}
