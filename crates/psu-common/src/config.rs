//! ---
//! psu_section: "01-core-functionality"
//! psu_subsection: "module"
//! psu_type: "source"
//! psu_scope: "code"
//! psu_description: "Shared primitives and utilities for the redundancy daemon."
//! psu_version: "v0.0.0-prealpha"
//! psu_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// PMBus command code of the cold-redundancy order register.
pub const DEFAULT_COLD_REDUNDANCY_REGISTER: u8 = 0xD0;

fn default_mode() -> Mode {
    Mode::Production
}

fn default_true() -> bool {
    true
}

fn default_rotation_period() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_warm_redundant_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_discovery_debounce() -> Duration {
    Duration::from_secs(1)
}

fn default_transport_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_register() -> u8 {
    DEFAULT_COLD_REDUNDANCY_REGISTER
}

fn default_inventory_path() -> PathBuf {
    PathBuf::from("configs/inventory.toml")
}

fn default_journal_capacity() -> usize {
    256
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9899))
}

/// Primary configuration object for the redundancy daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default)]
    pub redundancy: RedundancyConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "PSU_REDUNDANCY_CONFIG";

    /// Load configuration from disk together with the effective source path,
    /// respecting the `PSU_REDUNDANCY_CONFIG` override.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path.to_path_buf(),
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.redundancy.validate()
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Operating mode for the daemon.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Production,
    Simulation,
}

impl Mode {
    pub fn is_simulation(&self) -> bool {
        matches!(self, Mode::Simulation)
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" => Ok(Mode::Production),
            "simulation" => Ok(Mode::Simulation),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

/// How rank positions are chosen.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RankingMode {
    /// Ranks are written by an operator and left alone until a fault appears.
    OperatorAssigned,
    /// Ranks are recomputed from health in discovery order.
    #[default]
    PlatformManaged,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedundancyConfig {
    #[serde(default = "default_true")]
    pub supported: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub rotation_enabled: bool,
    #[serde(default = "default_rotation_period")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub rotation_period: Duration,
    #[serde(default)]
    pub ranking_mode: RankingMode,
    #[serde(default)]
    pub rank_order: Option<Vec<u8>>,
    #[serde(default = "default_warm_redundant_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub warm_redundant_delay: Duration,
    #[serde(default = "default_check_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub check_interval: Duration,
    #[serde(default = "default_discovery_debounce")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub discovery_debounce: Duration,
    #[serde(default = "default_register")]
    pub register: u8,
    #[serde(default = "default_transport_timeout", rename = "transport_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub transport_timeout: Duration,
}

impl Default for RedundancyConfig {
    fn default() -> Self {
        Self {
            supported: true,
            enabled: true,
            rotation_enabled: true,
            rotation_period: default_rotation_period(),
            ranking_mode: RankingMode::default(),
            rank_order: None,
            warm_redundant_delay: default_warm_redundant_delay(),
            check_interval: default_check_interval(),
            discovery_debounce: default_discovery_debounce(),
            register: default_register(),
            transport_timeout: default_transport_timeout(),
        }
    }
}

impl RedundancyConfig {
    pub fn validate(&self) -> Result<()> {
        let named = [
            ("rotation_period", self.rotation_period),
            ("warm_redundant_delay", self.warm_redundant_delay),
            ("check_interval", self.check_interval),
            ("discovery_debounce", self.discovery_debounce),
            ("transport_timeout_ms", self.transport_timeout),
        ];
        for (name, value) in named {
            if value.is_zero() {
                return Err(anyhow!("redundancy.{} must be greater than zero", name));
            }
        }
        if self.rotation_period <= self.warm_redundant_delay {
            return Err(anyhow!(
                "redundancy.rotation_period ({}s) must exceed warm_redundant_delay ({}s)",
                self.rotation_period.as_secs(),
                self.warm_redundant_delay.as_secs()
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryConfig {
    #[serde(default = "default_inventory_path")]
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub watch: bool,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            path: default_inventory_path(),
            watch: true,
        }
    }
}

/// Health feed document, separate from the inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// No health feed when unset; health then only arrives with discovery.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub watch: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: None,
            watch: true,
        }
    }
}

/// A PSU address the simulated bus treats as broken.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimulatedDeviceConfig {
    pub bus: u8,
    pub address: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub failing_writes: Vec<SimulatedDeviceConfig>,
    #[serde(default)]
    pub failing_reads: Vec<SimulatedDeviceConfig>,
    /// Bus writes and reads remembered for inspection; 0 keeps none.
    #[serde(default = "default_journal_capacity")]
    pub journal_capacity: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            failing_writes: Vec::new(),
            failing_reads: Vec::new(),
            journal_capacity: default_journal_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Also write a rolling JSON file under `directory`.
    #[serde(default = "default_true")]
    pub file: bool,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file: true,
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_metrics_listen(),
        }
    }
}
