//! `fedplan` builds federated learning experiments as static compute plans.
//!
//! An experiment never computes anything itself. Its [`Strategy`] registers the train,
//! aggregate and test operations of every round on the federation's nodes, which records
//! them in an [`OperationGraph`] of opaque state references. Once every round has been
//! registered, the whole graph is compiled into a single [`ComputePlanSpec`], submitted to
//! a [`ComputeBackend`] and polled until completion.
//!
//! ```ignore
//! let strategy = FedAvg::new(AlgoHandle::new(my_algo));
//! let mut experiment = Experiment::new(strategy, train_nodes, 10)
//!     .with_test_nodes(test_nodes)
//!     .with_aggregation_node(AggregationNode::new("aggregator"));
//! let summary = experiment
//!     .run(&backend, &settings.poll, &mut AbortSignal::never())
//!     .await?;
//! ```
//!
//! [`Strategy`]: strategies::Strategy
//! [`OperationGraph`]: graph::OperationGraph
//! [`ComputePlanSpec`]: backend::ComputePlanSpec
//! [`ComputeBackend`]: backend::ComputeBackend

pub mod algo;
pub mod backend;
pub mod common;
pub mod evaluation;
pub mod experiment;
pub mod graph;
pub mod nodes;
pub mod references;
pub mod settings;
pub mod strategies;

pub use self::{
    algo::{Algo, AlgoHandle, LocalState},
    experiment::{abort_channel, AbortHandle, AbortSignal, Experiment, ExperimentError},
    nodes::{AggregationNode, TestNode, TrainNode},
    strategies::{FedAvg, Strategy},
};
