//! Layered engine settings: built-in defaults, an optional TOML file, then
//! `DAGRUN__SECTION__KEY` environment variables.
//!
//! ```toml
//! [engine]
//! max_parallelism = 4
//! continue_on_failure = true
//!
//! [resources]
//! strategy = "performance"
//! on_exceeded = "reject"
//!
//! [resources.pool]
//! cpu = 8.0
//! memory_gb = 32.0
//! ```

use std::path::Path;
use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use tracing::debug;

use crate::executor::EngineConfig;
use crate::models::Resources;
use crate::optimizer::OptimizerWeights;
use crate::parser::{DuplicateProducerPolicy, ParserOptions};
use crate::resources::{AllocationStrategy, ExceededPolicy};
use crate::EngineError;

const ENV_PREFIX: &str = "DAGRUN";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSection,
    pub resources: ResourceSection,
    pub optimizer: OptimizerWeights,
    pub parser: ParserSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_parallelism: usize,
    pub default_timeout_seconds: f64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub continue_on_failure: bool,
    /// Whole-run deadline; unset means none.
    pub deadline_seconds: Option<f64>,
}

impl Default for EngineSection {
    fn default() -> Self {
        let d = EngineConfig::default();
        Self {
            max_parallelism: d.max_parallelism,
            default_timeout_seconds: d.default_timeout.as_secs_f64(),
            max_attempts: d.max_attempts,
            retry_base_delay_ms: d.retry_base_delay.as_millis() as u64,
            retry_max_delay_ms: d.retry_max_delay.as_millis() as u64,
            backoff_multiplier: d.backoff_multiplier,
            continue_on_failure: d.continue_on_failure,
            deadline_seconds: None,
        }
    }
}

/// Resource amounts with snake_case keys, as written in config files. Unset
/// dimensions fall back to the engine default for that table.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct ResourceAmounts {
    pub cpu: Option<f64>,
    pub memory_gb: Option<f64>,
    pub disk_gb: Option<f64>,
    pub network_mbps: Option<f64>,
}

impl ResourceAmounts {
    pub fn or_defaults(&self, defaults: Resources) -> Resources {
        Resources::new(
            self.cpu.unwrap_or(defaults.cpu),
            self.memory_gb.unwrap_or(defaults.memory_gb),
            self.disk_gb.unwrap_or(defaults.disk_gb),
            self.network_mbps.unwrap_or(defaults.network_mbps),
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResourceSection {
    pub strategy: AllocationStrategy,
    pub on_exceeded: ExceededPolicy,
    pub pool: ResourceAmounts,
    pub minimal_floor: ResourceAmounts,
}

impl ResourceSection {
    pub fn pool_capacity(&self) -> Resources {
        self.pool.or_defaults(EngineConfig::default().pool_capacity)
    }

    pub fn minimal_floor(&self) -> Resources {
        self.minimal_floor.or_defaults(EngineConfig::default().minimal_floor)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ParserSection {
    pub duplicate_producers: DuplicateProducerPolicy,
    /// Reject steps whose executor is not registered.
    pub strict_executors: bool,
}

impl Settings {
    /// Load settings from `path` (if given) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, EngineError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "loading settings file");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        let settings: Settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, EngineError> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let e = &self.engine;
        if e.max_parallelism == 0 {
            return Err(EngineError::InvalidConfig("engine.max_parallelism must be at least 1".into()));
        }
        if e.max_attempts == 0 {
            return Err(EngineError::InvalidConfig("engine.max_attempts must be at least 1".into()));
        }
        if !(e.default_timeout_seconds.is_finite() && e.default_timeout_seconds > 0.0) {
            return Err(EngineError::InvalidConfig(
                "engine.default_timeout_seconds must be positive".into(),
            ));
        }
        if !(e.backoff_multiplier.is_finite() && e.backoff_multiplier >= 1.0) {
            return Err(EngineError::InvalidConfig(
                "engine.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        if e.retry_base_delay_ms > e.retry_max_delay_ms {
            return Err(EngineError::InvalidConfig(
                "engine.retry_base_delay_ms exceeds engine.retry_max_delay_ms".into(),
            ));
        }
        if let Some(deadline) = e.deadline_seconds {
            if !(deadline.is_finite() && deadline > 0.0) {
                return Err(EngineError::InvalidConfig("engine.deadline_seconds must be positive".into()));
            }
        }
        let pool = self.resources.pool_capacity();
        let floor = self.resources.minimal_floor();
        if !pool.is_non_negative() || !floor.is_non_negative() {
            return Err(EngineError::InvalidConfig("resource amounts must be non-negative".into()));
        }
        self.optimizer.validate()
    }

    /// Runtime config. Out-of-range durations fall back to the defaults; call
    /// [`Self::validate`] to reject them instead.
    pub fn engine_config(&self) -> EngineConfig {
        let e = &self.engine;
        let defaults = EngineConfig::default();
        EngineConfig {
            max_parallelism: e.max_parallelism,
            default_timeout: Duration::try_from_secs_f64(e.default_timeout_seconds)
                .unwrap_or(defaults.default_timeout),
            max_attempts: e.max_attempts,
            retry_base_delay: Duration::from_millis(e.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(e.retry_max_delay_ms),
            backoff_multiplier: e.backoff_multiplier,
            continue_on_failure: e.continue_on_failure,
            workflow_deadline: e.deadline_seconds.and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
            allocation_strategy: self.resources.strategy,
            on_resource_exceeded: self.resources.on_exceeded,
            minimal_floor: self.resources.minimal_floor(),
            pool_capacity: self.resources.pool_capacity(),
            optimizer_weights: self.optimizer,
        }
    }

    /// Parser options; `known_executors` applies only when strict.
    pub fn parser_options(&self, known_executors: impl IntoIterator<Item = String>) -> ParserOptions {
        ParserOptions {
            known_executors: self
                .parser
                .strict_executors
                .then(|| known_executors.into_iter().collect()),
            duplicate_producers: self.parser.duplicate_producers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_engine_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        let config = settings.engine_config();
        let defaults = EngineConfig::default();

        assert_eq!(config.max_parallelism, defaults.max_parallelism);
        assert_eq!(config.default_timeout, defaults.default_timeout);
        assert_eq!(config.retry_base_delay, Duration::from_millis(100));
        assert_eq!(config.pool_capacity, defaults.pool_capacity);
        assert!(config.workflow_deadline.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [engine]
            max_parallelism = 4
            continue_on_failure = true
            deadline_seconds = 60

            [resources]
            strategy = "performance"
            on_exceeded = "reject"

            [resources.pool]
            cpu = 8.0
            memory_gb = 32.0

            [parser]
            duplicate_producers = "reject"
            strict_executors = true
            "#,
        )
        .unwrap();
        let config = settings.engine_config();

        assert_eq!(config.max_parallelism, 4);
        assert!(config.continue_on_failure);
        assert_eq!(config.workflow_deadline, Some(Duration::from_secs(60)));
        assert_eq!(config.allocation_strategy, AllocationStrategy::Performance);
        assert_eq!(config.on_resource_exceeded, ExceededPolicy::Reject);
        let defaults = EngineConfig::default();
        assert_eq!(
            config.pool_capacity,
            Resources::new(8.0, 32.0, defaults.pool_capacity.disk_gb, defaults.pool_capacity.network_mbps)
        );
        assert_eq!(config.minimal_floor, defaults.minimal_floor);

        let options = settings.parser_options(vec!["shell".to_string()]);
        assert_eq!(options.duplicate_producers, DuplicateProducerPolicy::Reject);
        assert!(options.known_executors.unwrap().contains("shell"));
    }

    #[test]
    fn rejects_nonsensical_values() {
        for toml in [
            "[engine]\nmax_parallelism = 0",
            "[engine]\nmax_attempts = 0",
            "[engine]\nbackoff_multiplier = 0.5",
            "[engine]\nretry_base_delay_ms = 5000\nretry_max_delay_ms = 10",
            "[optimizer]\nparallelism = 0.0\nresource = 0.0\nstep_count = 0.0",
            "[resources.minimal_floor]\ndisk_gb = -1.0",
        ] {
            let err = Settings::from_toml_str(toml).unwrap_err();
            assert!(matches!(err, EngineError::InvalidConfig(_)), "{toml}: {err:?}");
        }
    }

    #[test]
    fn lenient_parser_ignores_registry() {
        let options = Settings::default().parser_options(vec!["shell".to_string()]);
        assert!(options.known_executors.is_none());
        assert_eq!(options.duplicate_producers, DuplicateProducerPolicy::FirstWins);
    }
}
