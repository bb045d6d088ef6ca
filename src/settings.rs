// Simulation settings - defaults, config file and environment layering

//! Simulation configuration
//!
//! Settings come from three layers, later ones winning:
//! 1. the defaults in [`SimulationConfig::default`]
//! 2. an optional TOML/JSON/YAML file
//! 3. `FACTORY_*` environment variables, nested with `__`
//!    (e.g. `FACTORY_SINKS__NATS_URL=nats://localhost:4222`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::simulation::SaturationPolicy;
use crate::Result;

/// Which built-in production line to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineLayout {
    /// start, three cutting machines, three sensors, complete/reject
    Standard,
    /// the standard line followed by rework, assembly, storage and packaging
    Extended,
}

/// Telemetry backend settings. A backend is only registered when configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    /// Schema (namespace) every telemetry table lives in
    pub schema: String,
    /// Directory for delimited files
    pub csv_dir: Option<PathBuf>,
    /// Field delimiter for delimited files
    pub csv_delimiter: char,
    /// PostgreSQL connection string
    pub postgres_url: Option<String>,
    /// NATS server URL
    pub nats_url: Option<String>,
    /// Purge every telemetry table before a run starts
    pub purge_on_start: bool,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            schema: "test".to_string(),
            csv_dir: Some(PathBuf::from("test_data")),
            csv_delimiter: ',',
            postgres_url: None,
            nats_url: None,
            purge_on_start: false,
        }
    }
}

/// Everything the simulation driver needs to know
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Production line to build
    pub layout: LineLayout,
    /// Part arrival rate; higher means shorter gaps between parts
    pub arrival_rate: f64,
    /// Default bounded queue capacity per node
    pub queue_capacity: usize,
    /// How long the generator waits for room in the start queue
    pub enqueue_timeout_ms: u64,
    /// How long a worker waits for room in the next node's queue
    pub send_timeout_ms: u64,
    /// Pause between finishing a part and handing it on
    pub transfer_delay_ms: u64,
    /// How long draining may take before stragglers are aborted
    pub shutdown_grace_ms: u64,
    /// What to do with a part whose next queue stays full
    pub saturation_policy: SaturationPolicy,
    /// Seed for every random stream; unset means entropy
    pub seed: Option<u64>,
    /// Materials handed out to new parts, round robin
    pub materials: Vec<String>,
    /// Line-oriented event log, truncated at the start of every run
    pub event_log_path: Option<PathBuf>,
    /// Telemetry backends
    pub sinks: SinkSettings,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            layout: LineLayout::Standard,
            arrival_rate: 3.0,
            queue_capacity: 100,
            enqueue_timeout_ms: 500,
            send_timeout_ms: 500,
            transfer_delay_ms: 1000,
            shutdown_grace_ms: 5000,
            saturation_policy: SaturationPolicy::RerouteToFallback,
            seed: None,
            materials: vec!["steel".to_string(), "aluminium".to_string()],
            event_log_path: Some(PathBuf::from("log_data/events.log")),
            sinks: SinkSettings::default(),
        }
    }
}

impl SimulationConfig {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("FACTORY")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("materials")
                    .try_parsing(true),
            )
            .build()?;

        let config: SimulationConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the driver cannot work with
    pub fn validate(&self) -> Result<()> {
        if !(self.arrival_rate.is_finite() && self.arrival_rate >= 0.0) {
            return Err(crate::FactoryError::Config(format!(
                "arrival_rate must be a non-negative number, got {}",
                self.arrival_rate
            )));
        }
        if self.materials.is_empty() {
            return Err(crate::FactoryError::Config(
                "materials must name at least one material".to_string(),
            ));
        }
        Ok(())
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn transfer_delay(&self) -> Duration {
        Duration::from_millis(self.transfer_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_line() {
        let config = SimulationConfig::default();

        assert_eq!(config.layout, LineLayout::Standard);
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.enqueue_timeout(), Duration::from_millis(500));
        assert_eq!(config.saturation_policy, SaturationPolicy::RerouteToFallback);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("factory-sim-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sim.toml");
        std::fs::write(
            &path,
            r#"
layout = "extended"
arrival_rate = 6.5
queue_capacity = 10
saturation_policy = "drop"
seed = 42

[sinks]
schema = "line"
"#,
        )
        .unwrap();

        let config = SimulationConfig::load(Some(&path)).unwrap();

        assert_eq!(config.layout, LineLayout::Extended);
        assert_eq!(config.arrival_rate, 6.5);
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.saturation_policy, SaturationPolicy::Drop);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.sinks.schema, "line");
        // untouched fields keep their defaults
        assert_eq!(config.send_timeout_ms, 500);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_validate_rejects_empty_materials() {
        let config = SimulationConfig {
            materials: vec![],
            ..SimulationConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.is_configuration());
    }
}
