//! ---
//! psu_section: "01-core-functionality"
//! psu_subsection: "module"
//! psu_type: "source"
//! psu_scope: "code"
//! psu_description: "Shared primitives and utilities for the redundancy daemon."
//! psu_version: "v0.0.0-prealpha"
//! psu_owner: "tbd"
//! ---
//! Shared primitives for the PSU cold-redundancy workspace.
//! This crate exposes configuration loading and logging setup consumed by the
//! engine and the daemon.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, InventoryConfig, LoggingConfig, MetricsConfig, Mode, RankingMode,
    RedundancyConfig, SimulatedDeviceConfig, SimulationConfig,
};
pub use logging::{init_tracing, LogFormat};
