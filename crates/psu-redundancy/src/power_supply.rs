//! ---
//! psu_section: "07-resilience-fault-tolerance"
//! psu_subsection: "module"
//! psu_type: "source"
//! psu_scope: "code"
//! psu_description: "Cold-redundancy ranking and rotation for power supplies."
//! psu_version: "v0.0.0-prealpha"
//! psu_owner: "tbd"
//! ---
use std::fmt;

use psu_transport::DeviceAddress;
use serde::{Deserialize, Serialize};

/// Operating condition reported by the health feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PsuHealth {
    #[default]
    Normal,
    /// Input (AC) power lost.
    PowerLost,
    /// Any other fault the feed reports, by name.
    Fault(String),
}

impl PsuHealth {
    pub fn is_normal(&self) -> bool {
        matches!(self, PsuHealth::Normal)
    }
}

impl fmt::Display for PsuHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PsuHealth::Normal => f.write_str("normal"),
            PsuHealth::PowerLost => f.write_str("power-lost"),
            PsuHealth::Fault(reason) => write!(f, "fault({})", reason),
        }
    }
}

/// Validated discovery entry used to build a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PsuDescriptor {
    pub name: String,
    pub address: DeviceAddress,
    pub health: PsuHealth,
}

impl PsuDescriptor {
    pub fn new(name: impl Into<String>, bus: u8, address: u8) -> Self {
        Self {
            name: name.into(),
            address: DeviceAddress::new(bus, address),
            health: PsuHealth::Normal,
        }
    }

    pub fn with_health(mut self, health: PsuHealth) -> Self {
        self.health = health;
        self
    }
}

/// One physical PSU as known to the current registry generation.
///
/// A rank of zero means the PSU takes no part in rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerSupply {
    name: String,
    address: DeviceAddress,
    pub(crate) health: PsuHealth,
    pub(crate) rank: u8,
}

impl PowerSupply {
    pub(crate) fn from_descriptor(descriptor: PsuDescriptor) -> Self {
        Self {
            name: descriptor.name,
            address: descriptor.address,
            health: descriptor.health,
            rank: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn health(&self) -> &PsuHealth {
        &self.health
    }

    pub fn rank(&self) -> u8 {
        self.rank
    }

    pub fn is_normal(&self) -> bool {
        self.health.is_normal()
    }
}
