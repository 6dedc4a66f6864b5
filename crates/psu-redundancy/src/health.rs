//! ---
//! psu_section: "07-resilience-fault-tolerance"
//! psu_subsection: "module"
//! psu_type: "source"
//! psu_scope: "code"
//! psu_description: "Cold-redundancy ranking and rotation for power supplies."
//! psu_version: "v0.0.0-prealpha"
//! psu_owner: "tbd"
//! ---
//! Health feed: current health per PSU name, delivered out of band from
//! discovery.
//!
//! The document is a single `[power_supply]` table mapping names to health:
//!
//! ```toml
//! [power_supply]
//! PSU1 = "normal"
//! PSU2 = "power-lost"
//! PSU3 = { fault = "fan" }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::power_supply::PsuHealth;

/// One entry of the health feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub name: String,
    pub health: PsuHealth,
}

#[derive(Debug, thiserror::Error)]
pub enum HealthFeedError {
    #[error("unable to read health feed {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed health document: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Default, Deserialize)]
struct HealthDocument {
    #[serde(default)]
    power_supply: BTreeMap<String, PsuHealth>,
}

/// Parse a health document. Reports come back ordered by name.
pub fn parse_health(content: &str) -> Result<Vec<HealthReport>, HealthFeedError> {
    let document: HealthDocument = toml::from_str(content)?;
    Ok(document
        .power_supply
        .into_iter()
        .map(|(name, health)| HealthReport { name, health })
        .collect())
}

/// Health feed read from a TOML file on demand.
#[derive(Debug, Clone)]
pub struct FileHealthFeed {
    path: PathBuf,
}

impl FileHealthFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<Vec<HealthReport>, HealthFeedError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| HealthFeedError::Io {
            path: self.path.clone(),
            source,
        })?;
        let reports = parse_health(&content)?;
        debug!(path = %self.path.display(), reports = reports.len(), "health feed read");
        Ok(reports)
    }
}
