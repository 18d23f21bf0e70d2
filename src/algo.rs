//! The user-defined training algorithm.
//!
//! The orchestration core never runs an [`Algo`] itself: it only closes over it in the
//! train operations it registers. The execution backend is the one calling
//! [`Algo::train`] and [`Algo::score`] on the participants' infrastructure.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::{
    common::DataSampleKey,
    strategies::fed_avg::{FedAvgAveragedState, FedAvgSharedState},
};

/// Error returned by an [`Algo`] when it fails to train or score.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AlgoError {
    #[error("data sample {0} is not available")]
    MissingData(DataSampleKey),
    #[error("training failed: {0}")]
    Training(String),
    #[error("scoring failed: {0}")]
    Scoring(String),
}

/// A model snapshot private to the node that trained it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LocalState {
    pub parameters: Vec<f64>,
}

/// The training callable of an experiment.
///
/// An implementation is bound once per experiment and must behave the same for a given
/// node across rounds.
pub trait Algo: Send + Sync {
    /// Name of the algorithm, used to describe the operations using it.
    fn name(&self) -> &str;

    /// Configuration closed over by the algorithm, sent along with its description.
    fn config(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Train on the given data samples.
    ///
    /// `local_state` is the state this node produced in the previous round, if any, and
    /// `shared_state` the aggregated state broadcast by the aggregation node, if any.
    fn train(
        &self,
        data_samples: &[DataSampleKey],
        local_state: Option<&LocalState>,
        shared_state: Option<&FedAvgAveragedState>,
    ) -> Result<(LocalState, FedAvgSharedState), AlgoError>;

    /// Score a local state on the given data samples.
    fn score(
        &self,
        data_samples: &[DataSampleKey],
        local_state: &LocalState,
    ) -> Result<f64, AlgoError>;
}

/// A cheaply cloneable handle to an [`Algo`].
///
/// It serializes as an [`AlgoDescription`].
#[derive(Clone)]
pub struct AlgoHandle(Arc<dyn Algo>);

impl AlgoHandle {
    pub fn new<A>(algo: A) -> Self
    where
        A: Algo + 'static,
    {
        Self(Arc::new(algo))
    }

    pub fn describe(&self) -> AlgoDescription {
        AlgoDescription {
            name: self.0.name().to_string(),
            config: self.0.config(),
        }
    }
}

impl From<Arc<dyn Algo>> for AlgoHandle {
    fn from(algo: Arc<dyn Algo>) -> Self {
        Self(algo)
    }
}

impl std::ops::Deref for AlgoHandle {
    type Target = dyn Algo;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for AlgoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AlgoHandle").field(&self.0.name()).finish()
    }
}

impl Serialize for AlgoHandle {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.describe().serialize(serializer)
    }
}

/// The serializable description of an [`Algo`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgoDescription {
    pub name: String,
    pub config: serde_json::Value,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// An algorithm that always returns the same update, for graph construction tests.
    pub struct ConstantAlgo {
        pub update: Vec<f64>,
        pub n_samples: u64,
    }

    impl Algo for ConstantAlgo {
        fn name(&self) -> &str {
            "constant"
        }

        fn config(&self) -> serde_json::Value {
            serde_json::json!({ "n_samples": self.n_samples })
        }

        fn train(
            &self,
            _data_samples: &[DataSampleKey],
            _local_state: Option<&LocalState>,
            _shared_state: Option<&FedAvgAveragedState>,
        ) -> Result<(LocalState, FedAvgSharedState), AlgoError> {
            Ok((
                LocalState {
                    parameters: self.update.clone(),
                },
                FedAvgSharedState {
                    parameters_update: self.update.clone(),
                    n_samples: self.n_samples,
                },
            ))
        }

        fn score(
            &self,
            _data_samples: &[DataSampleKey],
            local_state: &LocalState,
        ) -> Result<f64, AlgoError> {
            Ok(local_state.parameters.iter().sum())
        }
    }

    pub fn constant_algo() -> AlgoHandle {
        AlgoHandle::new(ConstantAlgo {
            update: vec![1.0, 2.0],
            n_samples: 10,
        })
    }

    #[test]
    fn test_algo_handle_serializes_as_description() {
        let json = serde_json::to_value(constant_algo()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "name": "constant", "config": { "n_samples": 10 } })
        );
    }
}
