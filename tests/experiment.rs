use std::{collections::HashMap, sync::Arc};

use fedplan::{
    algo::{Algo, AlgoError, AlgoHandle, LocalState},
    backend::{ComputeBackend, LocalBackend, PlanStatus},
    common::{DataSampleKey, DatasetKey, MetricKey},
    settings::{ExperimentSettings, PollSettings},
    strategies::fed_avg::{FedAvgAveragedState, FedAvgSharedState},
    AbortSignal, AggregationNode, Experiment, ExperimentError, FedAvg, TestNode, TrainNode,
};

/// Estimates the mean of the samples it is trained on.
struct MeanEstimator {
    samples: Arc<HashMap<DataSampleKey, Vec<f64>>>,
}

impl MeanEstimator {
    fn mean(&self, data_samples: &[DataSampleKey]) -> Result<Vec<f64>, AlgoError> {
        let mut sum = vec![0.0; 2];
        for key in data_samples {
            let sample = self.samples.get(key).ok_or(AlgoError::MissingData(*key))?;
            for (acc, value) in sum.iter_mut().zip(sample) {
                *acc += value;
            }
        }
        let n = data_samples.len().max(1) as f64;
        Ok(sum.into_iter().map(|value| value / n).collect())
    }
}

impl Algo for MeanEstimator {
    fn name(&self) -> &str {
        "mean-estimator"
    }

    fn train(
        &self,
        data_samples: &[DataSampleKey],
        local_state: Option<&LocalState>,
        shared_state: Option<&FedAvgAveragedState>,
    ) -> Result<(LocalState, FedAvgSharedState), AlgoError> {
        let start = shared_state
            .map(|state| state.avg_parameters_update.clone())
            .or_else(|| local_state.map(|state| state.parameters.clone()))
            .unwrap_or_else(|| vec![0.0; 2]);
        let target = self.mean(data_samples)?;
        let parameters = start
            .iter()
            .zip(target.iter())
            .map(|(start, target)| (start + target) / 2.0)
            .collect::<Vec<_>>();

        Ok((
            LocalState {
                parameters: parameters.clone(),
            },
            FedAvgSharedState {
                parameters_update: parameters,
                n_samples: data_samples.len() as u64,
            },
        ))
    }

    fn score(
        &self,
        data_samples: &[DataSampleKey],
        local_state: &LocalState,
    ) -> Result<f64, AlgoError> {
        let target = self.mean(data_samples)?;
        Ok(-local_state
            .parameters
            .iter()
            .zip(target.iter())
            .map(|(value, target)| (value - target).powi(2))
            .sum::<f64>())
    }
}

struct Federation {
    samples: HashMap<DataSampleKey, Vec<f64>>,
    train_nodes: Vec<TrainNode>,
    test_nodes: Vec<TestNode>,
}

fn federation() -> Federation {
    let mut samples = HashMap::new();
    let mut add = |values: &[[f64; 2]]| {
        values
            .iter()
            .map(|value| {
                let key = DataSampleKey::new();
                samples.insert(key, value.to_vec());
                key
            })
            .collect::<Vec<_>>()
    };

    let train_a = add(&[[1.0, 1.0], [3.0, 3.0]]);
    let train_b = add(&[[2.0, 2.0]]);
    let train_c = add(&[[0.0, 2.0], [2.0, 2.0], [4.0, 2.0]]);
    let test_a = add(&[[2.0, 2.0]]);

    Federation {
        train_nodes: vec![
            TrainNode::new("org-a", DatasetKey::new(), train_a),
            TrainNode::new("org-b", DatasetKey::new(), train_b),
            TrainNode::new("org-c", DatasetKey::new(), train_c),
        ],
        test_nodes: vec![TestNode::new(
            "org-a",
            DatasetKey::new(),
            test_a,
            vec![MetricKey::new()],
        )],
        samples,
    }
}

fn poll() -> PollSettings {
    PollSettings {
        interval: 1,
        timeout: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_fed_avg_experiment_runs_on_local_backend() {
    let Federation {
        samples,
        train_nodes,
        test_nodes,
    } = federation();
    let algo = AlgoHandle::new(MeanEstimator {
        samples: Arc::new(samples),
    });

    let mut experiment = Experiment::new(FedAvg::new(algo), train_nodes, 2)
        .with_test_nodes(test_nodes)
        .with_aggregation_node(AggregationNode::new("aggregator"))
        .with_tag("integration");
    let backend = LocalBackend::new();

    let summary = experiment
        .run(&backend, &poll(), &mut AbortSignal::never())
        .await
        .unwrap();

    assert_eq!(summary.handle.tag, "integration");
    assert_eq!(summary.handle.num_tasks, 8);
    assert_eq!(
        backend.status(summary.handle.plan).await.unwrap(),
        PlanStatus::Done
    );
    assert_eq!(summary.performances.len(), 1);

    // round 0: org-a trains from zero towards its mean [2, 2] and reaches [1, 1]
    // round 1: the average of the round 0 states is [1, 1], org-a moves to [1.5, 1.5]
    let performance = summary.performances.iter().next().unwrap();
    assert_eq!(performance.round, 1);
    assert_eq!(performance.worker.as_str(), "org-a");
    assert!((performance.value + 0.5).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_experiment_follows_settings() {
    let Federation {
        samples,
        train_nodes,
        test_nodes,
    } = federation();
    let algo = AlgoHandle::new(MeanEstimator {
        samples: Arc::new(samples),
    });
    let settings = ExperimentSettings {
        num_rounds: 3,
        clean_models: false,
        eval_rounds: vec![0],
        tag: None,
    };

    let mut experiment = Experiment::new(FedAvg::new(algo), train_nodes, 1)
        .with_test_nodes(test_nodes)
        .with_aggregation_node(AggregationNode::new("aggregator"))
        .with_settings(&settings);
    let backend = LocalBackend::new();

    let summary = experiment
        .run(&backend, &poll(), &mut AbortSignal::never())
        .await
        .unwrap();

    // 3 trainings per round, 2 aggregations and 2 evaluations
    assert_eq!(summary.handle.num_tasks, 13);
    let rounds = summary
        .performances
        .iter()
        .map(|performance| performance.round)
        .collect::<Vec<_>>();
    assert_eq!(rounds, vec![0, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_missing_data_fails_the_plan() {
    let Federation {
        train_nodes,
        test_nodes,
        ..
    } = federation();
    let algo = AlgoHandle::new(MeanEstimator {
        samples: Arc::new(HashMap::new()),
    });

    let mut experiment = Experiment::new(FedAvg::new(algo), train_nodes, 2)
        .with_test_nodes(test_nodes)
        .with_aggregation_node(AggregationNode::new("aggregator"));
    let backend = LocalBackend::new();

    let err = experiment
        .run(&backend, &poll(), &mut AbortSignal::never())
        .await
        .unwrap_err();
    match err {
        ExperimentError::ExecutionFailed(plan) => {
            assert_eq!(backend.status(plan).await.unwrap(), PlanStatus::Failed)
        }
        err => panic!("unexpected error: {}", err),
    }
}
