//! Identifiers shared by the whole crate.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Index of a round of federated learning. Rounds start at `0`.
pub type RoundIdx = u32;

#[derive(
    Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Clone, Display, From, Into, Serialize, Deserialize,
)]
/// The identity of a federation member, as known by the execution backend.
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

macro_rules! uuid_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Copy, Clone, Display, From, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Return a new random key
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

uuid_key!(
    /// Key of a dataset (the opener of the data samples) registered on a participant
    DatasetKey
);
uuid_key!(
    /// Key of a data sample registered on a participant
    DataSampleKey
);
uuid_key!(
    /// Key of a metric used to score test tasks
    MetricKey
);
uuid_key!(
    /// Key of a task of a compute plan
    TaskKey
);
uuid_key!(
    /// Key of a compute plan returned by the execution backend
    PlanKey
);
