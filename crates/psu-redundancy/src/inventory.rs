//! ---
//! psu_section: "07-resilience-fault-tolerance"
//! psu_subsection: "module"
//! psu_type: "source"
//! psu_scope: "code"
//! psu_description: "Cold-redundancy ranking and rotation for power supplies."
//! psu_version: "v0.0.0-prealpha"
//! psu_owner: "tbd"
//! ---
//! Discovery feed: raw inventory records and their validation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::power_supply::{PsuDescriptor, PsuHealth};

/// One PSU entry exactly as the inventory delivered it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bus: Option<u64>,
    #[serde(default)]
    pub address: Option<u64>,
    #[serde(default)]
    pub health: Option<PsuHealth>,
}

impl InventoryRecord {
    pub fn new(name: impl Into<String>, bus: u64, address: u64) -> Self {
        Self {
            name: Some(name.into()),
            bus: Some(bus),
            address: Some(address),
            health: None,
        }
    }

    pub fn with_health(mut self, health: PsuHealth) -> Self {
        self.health = Some(health);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("unable to read inventory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed inventory document: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Source of the current PSU inventory.
pub trait InventorySource: Send {
    fn discover(&mut self) -> Result<Vec<InventoryRecord>, InventoryError>;
}

#[derive(Debug, Default, Deserialize)]
struct InventoryDocument {
    #[serde(default, rename = "power_supply")]
    power_supplies: Vec<InventoryRecord>,
}

/// Parse a TOML inventory document of `[[power_supply]]` tables.
pub fn parse_inventory(content: &str) -> Result<Vec<InventoryRecord>, InventoryError> {
    let document: InventoryDocument = toml::from_str(content)?;
    Ok(document.power_supplies)
}

/// Inventory read from a TOML file on every discovery.
#[derive(Debug, Clone)]
pub struct FileInventory {
    path: PathBuf,
}

impl FileInventory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl InventorySource for FileInventory {
    fn discover(&mut self) -> Result<Vec<InventoryRecord>, InventoryError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| InventoryError::Io {
            path: self.path.clone(),
            source,
        })?;
        let records = parse_inventory(&content)?;
        debug!(path = %self.path.display(), records = records.len(), "inventory read");
        Ok(records)
    }
}

/// In-memory inventory whose contents can be swapped from another task.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    records: Arc<Mutex<Vec<InventoryRecord>>>,
}

impl StaticInventory {
    pub fn new(records: Vec<InventoryRecord>) -> Self {
        Self {
            records: Arc::new(Mutex::new(records)),
        }
    }

    pub fn replace(&self, records: Vec<InventoryRecord>) {
        *self.records.lock() = records;
    }
}

impl InventorySource for StaticInventory {
    fn discover(&mut self) -> Result<Vec<InventoryRecord>, InventoryError> {
        Ok(self.records.lock().clone())
    }
}

/// Turn raw records into registry descriptors, keeping discovery order.
///
/// Entries without a name, bus or address, with a bus or address wider than
/// one byte, or repeating an earlier name are dropped. Missing health is
/// taken as `Normal`.
pub fn validate_records(records: Vec<InventoryRecord>) -> Vec<PsuDescriptor> {
    let mut seen = HashSet::new();
    let mut descriptors = Vec::with_capacity(records.len());
    for (position, record) in records.into_iter().enumerate() {
        let (Some(name), Some(bus), Some(address)) = (record.name, record.bus, record.address)
        else {
            warn!(position, "inventory entry missing name, bus or address; dropped");
            continue;
        };
        let (Ok(bus), Ok(address)) = (u8::try_from(bus), u8::try_from(address)) else {
            warn!(psu = %name, bus, address, "inventory bus/address out of range; dropped");
            continue;
        };
        if !seen.insert(name.clone()) {
            warn!(psu = %name, "duplicate inventory entry; dropped");
            continue;
        }
        descriptors.push(
            PsuDescriptor::new(name, bus, address).with_health(record.health.unwrap_or_default()),
        );
    }
    descriptors
}
