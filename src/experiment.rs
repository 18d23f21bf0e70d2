//! The experiment driver.
//!
//! An [`Experiment`] runs its strategy for a fixed number of rounds, registering every
//! operation in a single [`OperationGraph`]. The graph is then compiled into one
//! [`ComputePlanSpec`] which is submitted to the backend as a whole, and the driver polls
//! the backend until the plan reaches a terminal status.
//!
//! Polling is the only step that suspends. It wakes up every [`PollSettings::interval`],
//! can be given up after [`PollSettings::timeout`] and can be aborted at any time by the
//! caller through an [`AbortHandle`].

use chrono::Local;
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{self, error::Elapsed},
};
use tracing::{debug, info, warn};

use crate::{
    backend::{
        BackendError, ComputeBackend, ComputePlanSpec, Performances, Permissions, PlanStatus,
        TaskSpec,
    },
    common::{PlanKey, RoundIdx},
    evaluation::EvaluationStrategy,
    graph::{GraphError, OperationGraph, OperationId},
    nodes::{AggregationNode, Node, TestNode, TrainNode},
    settings::{ExperimentSettings, PollSettings},
    strategies::{Strategy, StrategyError, StrategyName},
};

/// Format of the default tag of a compute plan.
const TAG_FORMAT: &str = "%Y_%m_%d_%H_%M_%S";

/// Error returned by an [`Experiment`].
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("the {0} strategy requires an aggregation node")]
    MissingAggregationNode(StrategyName),
    #[error("an experiment needs at least one round")]
    NoRounds,
    #[error("cannot evaluate round {round} of an experiment of {num_rounds} rounds")]
    EvaluationRoundOutOfRange {
        round: RoundIdx,
        num_rounds: RoundIdx,
    },
    #[error("the operation graph has not been built")]
    NotBuilt,
    #[error("{0} is recorded on a node but missing from the graph")]
    StaleOperation(OperationId),
    #[error("graph construction failed: {0}")]
    Strategy(#[from] StrategyError),
    #[error("invalid operation graph: {0}")]
    Graph(#[from] GraphError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("compute plan {0} failed")]
    ExecutionFailed(PlanKey),
    #[error("compute plan {0} was canceled")]
    Canceled(PlanKey),
    #[error("compute plan {0} did not complete in time")]
    PollTimeout(PlanKey),
    #[error("waiting for compute plan {0} was aborted")]
    Aborted(PlanKey),
}

/// Creates an abort channel.
///
/// The [`AbortHandle`] is used by the caller to stop waiting for a compute plan, and the
/// [`AbortSignal`] is handed to the poll loop.
pub fn abort_channel() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle(tx), AbortSignal(rx))
}

/// Abort the poll loops watching the paired [`AbortSignal`]s.
#[derive(Debug)]
pub struct AbortHandle(watch::Sender<bool>);

impl AbortHandle {
    pub fn abort(&self) {
        debug!("abort requested");
        // no receiver left means there is nothing to abort
        let _ = self.0.send(true);
    }
}

/// Watch for an abort request.
#[derive(Debug, Clone)]
pub struct AbortSignal(watch::Receiver<bool>);

impl AbortSignal {
    /// A signal that is never raised.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_aborted(&self) -> bool {
        *self.0.borrow()
    }

    /// Completes once an abort has been requested. Never completes if the [`AbortHandle`]
    /// was dropped without aborting.
    pub async fn aborted(&mut self) {
        loop {
            if self.is_aborted() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// A federated learning experiment.
#[derive(Debug)]
pub struct Experiment {
    strategy: Strategy,
    train_nodes: Vec<TrainNode>,
    test_nodes: Vec<TestNode>,
    aggregation_node: Option<AggregationNode>,
    num_rounds: RoundIdx,
    evaluation: EvaluationStrategy,
    clean_models: bool,
    tag: Option<String>,
    graph: OperationGraph,
    built: bool,
}

impl Experiment {
    /// Create an experiment running `strategy` on `train_nodes` for `num_rounds` rounds.
    pub fn new(
        strategy: impl Into<Strategy>,
        train_nodes: Vec<TrainNode>,
        num_rounds: RoundIdx,
    ) -> Self {
        Self {
            strategy: strategy.into(),
            train_nodes,
            test_nodes: Vec::new(),
            aggregation_node: None,
            num_rounds,
            evaluation: EvaluationStrategy::final_round(),
            clean_models: true,
            tag: None,
            graph: OperationGraph::new(),
            built: false,
        }
    }

    pub fn with_test_nodes(mut self, test_nodes: Vec<TestNode>) -> Self {
        self.test_nodes = test_nodes;
        self
    }

    pub fn with_aggregation_node(mut self, aggregation_node: AggregationNode) -> Self {
        self.aggregation_node = Some(aggregation_node);
        self
    }

    pub fn with_evaluation(mut self, evaluation: EvaluationStrategy) -> Self {
        self.evaluation = evaluation;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Apply the settings of an `[experiment]` section.
    pub fn with_settings(mut self, settings: &ExperimentSettings) -> Self {
        self.num_rounds = settings.num_rounds;
        self.clean_models = settings.clean_models;
        self.evaluation = settings.evaluation();
        self.tag = settings.tag.clone().or(self.tag);
        self
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn train_nodes(&self) -> &[TrainNode] {
        &self.train_nodes
    }

    pub fn test_nodes(&self) -> &[TestNode] {
        &self.test_nodes
    }

    pub fn aggregation_node(&self) -> Option<&AggregationNode> {
        self.aggregation_node.as_ref()
    }

    pub fn graph(&self) -> &OperationGraph {
        &self.graph
    }

    /// Build the operation graph of the experiment from scratch.
    ///
    /// Performs every round in order, registering the test operations after each round
    /// selected by the evaluation strategy, and checks the resulting graph.
    ///
    /// # Errors
    /// Fails before any round is performed if the experiment is misconfigured, and fails
    /// with the first construction error otherwise.
    pub fn build_graph(&mut self) -> Result<&OperationGraph, ExperimentError> {
        if self.strategy.requires_aggregation_node() && self.aggregation_node.is_none() {
            return Err(ExperimentError::MissingAggregationNode(
                self.strategy.name(),
            ));
        }
        if self.num_rounds == 0 {
            return Err(ExperimentError::NoRounds);
        }
        if let Some(round) = self.evaluation.out_of_range(self.num_rounds) {
            return Err(ExperimentError::EvaluationRoundOutOfRange {
                round,
                num_rounds: self.num_rounds,
            });
        }

        self.reset();
        for round in 0..self.num_rounds {
            self.strategy.perform_round(
                &mut self.graph,
                &mut self.train_nodes,
                self.aggregation_node.as_mut(),
                round,
            )?;
            if self.evaluation.should_evaluate(round, self.num_rounds) {
                info!("registering the evaluation of round {}", round);
                self.strategy.predict(
                    &mut self.graph,
                    &mut self.test_nodes,
                    &self.train_nodes,
                    round,
                )?;
            }
        }
        self.graph.validate()?;
        self.built = true;

        info!(
            "operation graph built with {} operations over {} rounds",
            self.graph.len(),
            self.num_rounds
        );
        Ok(&self.graph)
    }

    fn reset(&mut self) {
        self.built = false;
        self.graph = OperationGraph::new();
        self.strategy.reset();
        self.train_nodes.iter_mut().for_each(Node::clear);
        self.test_nodes.iter_mut().for_each(Node::clear);
        if let Some(node) = self.aggregation_node.as_mut() {
            node.clear();
        }
    }

    /// The participants allowed to see the compute plan: the aggregation node and every
    /// train node.
    pub fn permissions(&self) -> Permissions {
        Permissions::private(
            self.aggregation_node
                .iter()
                .map(|node| node.participant_id().clone())
                .chain(
                    self.train_nodes
                        .iter()
                        .map(|node| node.participant_id().clone()),
                ),
        )
    }

    /// Compile the operations recorded on every node into a compute plan.
    ///
    /// # Errors
    /// Fails if the graph has not been built.
    pub fn compile(&self) -> Result<ComputePlanSpec, ExperimentError> {
        if !self.built {
            return Err(ExperimentError::NotBuilt);
        }

        let recorded = self
            .train_nodes
            .iter()
            .flat_map(|node| node.operations().iter())
            .chain(
                self.test_nodes
                    .iter()
                    .flat_map(|node| node.operations().iter()),
            )
            .chain(
                self.aggregation_node
                    .iter()
                    .flat_map(|node| node.operations().iter()),
            );
        let mut tasks = Vec::with_capacity(self.graph.len());
        for id in recorded {
            let op = self
                .graph
                .get(*id)
                .ok_or(ExperimentError::StaleOperation(*id))?;
            tasks.push(TaskSpec::from_operation(op, &self.graph)?);
        }

        let tag = self
            .tag
            .clone()
            .unwrap_or_else(|| Local::now().format(TAG_FORMAT).to_string());
        Ok(ComputePlanSpec::new(
            tag,
            self.clean_models,
            self.permissions(),
            tasks,
        ))
    }

    /// Compile the experiment and submit it as a single compute plan.
    pub async fn submit<B>(&self, backend: &B) -> Result<ExperimentHandle, ExperimentError>
    where
        B: ComputeBackend + ?Sized,
    {
        let plan = self.compile()?;
        let tag = plan.tag.clone();
        let num_tasks = plan.len();
        let key = backend.submit(plan).await?;
        info!("compute plan {} submitted with {} tasks", key, num_tasks);

        Ok(ExperimentHandle {
            plan: key,
            tag,
            num_tasks,
        })
    }

    /// Build, compile and submit the experiment, then wait for its completion.
    ///
    /// # Errors
    /// Construction errors are returned before anything is submitted. Once submitted,
    /// fails if the backend does not complete the plan.
    pub async fn run<B>(
        &mut self,
        backend: &B,
        poll: &PollSettings,
        abort: &mut AbortSignal,
    ) -> Result<ExperimentSummary, ExperimentError>
    where
        B: ComputeBackend + ?Sized,
    {
        self.build_graph()?;
        let handle = self.submit(backend).await?;
        let performances = handle.wait(backend, poll, abort).await?;
        Ok(ExperimentSummary {
            handle,
            performances,
        })
    }
}

/// A submitted compute plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentHandle {
    pub plan: PlanKey,
    pub tag: String,
    pub num_tasks: usize,
}

impl ExperimentHandle {
    /// Poll the backend until the plan is done and return its performances.
    ///
    /// # Errors
    /// Fails if the plan failed or was canceled, if the timeout of `poll` elapsed or if
    /// `abort` was raised. The plan is left running in the last two cases.
    pub async fn wait<B>(
        &self,
        backend: &B,
        poll: &PollSettings,
        abort: &mut AbortSignal,
    ) -> Result<Performances, ExperimentError>
    where
        B: ComputeBackend + ?Sized,
    {
        match poll.timeout() {
            Some(timeout) => time::timeout(timeout, self.poll(backend, poll, abort))
                .await
                .map_err(|_: Elapsed| {
                    warn!(
                        "compute plan {} did not complete in {:?}",
                        self.plan, timeout
                    );
                    ExperimentError::PollTimeout(self.plan)
                })?,
            None => self.poll(backend, poll, abort).await,
        }
    }

    async fn poll<B>(
        &self,
        backend: &B,
        poll: &PollSettings,
        abort: &mut AbortSignal,
    ) -> Result<Performances, ExperimentError>
    where
        B: ComputeBackend + ?Sized,
    {
        loop {
            if abort.is_aborted() {
                return Err(ExperimentError::Aborted(self.plan));
            }
            match backend.status(self.plan).await? {
                PlanStatus::Done => {
                    info!("compute plan {} done", self.plan);
                    return Ok(backend.performances(self.plan).await?);
                }
                PlanStatus::Failed => return Err(ExperimentError::ExecutionFailed(self.plan)),
                PlanStatus::Canceled => return Err(ExperimentError::Canceled(self.plan)),
                status => debug!("compute plan {} is {}", self.plan, status),
            }

            tokio::select! {
                _ = time::sleep(poll.interval()) => {}
                _ = abort.aborted() => {
                    info!("stopped waiting for compute plan {}", self.plan);
                    return Err(ExperimentError::Aborted(self.plan));
                }
            }
        }
    }
}

/// The outcome of a completed experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentSummary {
    pub handle: ExperimentHandle,
    pub performances: Performances,
}
