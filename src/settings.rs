//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An
//! example configuration file can be found in the `configs/` directory located in the
//! repository root.

use std::{fmt, path::Path, time::Duration};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::{filter::EnvFilter, FmtSubscriber};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{common::RoundIdx, evaluation::EvaluationStrategy};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub experiment: ExperimentSettings,
    #[validate]
    pub poll: PollSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("fedplan").separator("__"))?;
        config.try_into()
    }
}

/// The experiment settings.
#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_eval_rounds"))]
pub struct ExperimentSettings {
    /// The number of rounds of federated learning. Must be at least `1`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [experiment]
    /// num_rounds = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPLAN_EXPERIMENT__NUM_ROUNDS=10
    /// ```
    #[validate(range(min = 1))]
    pub num_rounds: u32,
    /// Whether the backend may delete intermediate models once they have been consumed.
    #[serde(default = "default_clean_models")]
    pub clean_models: bool,
    /// The rounds after which the models are tested, in addition to the last round.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [experiment]
    /// eval_rounds = [0, 4]
    /// ```
    #[serde(default)]
    pub eval_rounds: Vec<RoundIdx>,
    /// The tag of the compute plan. Defaults to the submission time.
    #[serde(default)]
    pub tag: Option<String>,
}

impl ExperimentSettings {
    pub fn evaluation(&self) -> EvaluationStrategy {
        EvaluationStrategy::at_rounds(self.eval_rounds.iter().copied())
    }
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        Self {
            num_rounds: 1,
            clean_models: default_clean_models(),
            eval_rounds: Vec::new(),
            tag: None,
        }
    }
}

fn default_clean_models() -> bool {
    true
}

/// Checks that every evaluation round is a round of the experiment.
fn validate_eval_rounds(s: &ExperimentSettings) -> Result<(), ValidationError> {
    if s.evaluation().out_of_range(s.num_rounds).is_none() {
        Ok(())
    } else {
        Err(ValidationError::new("evaluation round out of range"))
    }
}

/// The settings of the poll loop waiting for a compute plan to complete.
#[derive(Debug, Validate, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// The number of seconds between two status queries. Must be at least `1`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [poll]
    /// interval = 5
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPLAN_POLL__INTERVAL=5
    /// ```
    #[validate(range(min = 1))]
    pub interval: u64,
    /// The number of seconds after which waiting is given up. The compute plan keeps
    /// running on the backend. Waits forever if absent.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl PollSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: 5,
            timeout: None,
        }
    }
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPLAN_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

impl LoggingSettings {
    /// Installs a global subscriber logging with the configured filter.
    ///
    /// Does nothing if a global subscriber is already installed.
    pub fn init(self) {
        let _ = FmtSubscriber::builder()
            .with_env_filter(self.filter)
            .with_ansi(true)
            .try_init();
    }
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
