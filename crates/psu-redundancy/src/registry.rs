//! ---
//! psu_section: "07-resilience-fault-tolerance"
//! psu_subsection: "module"
//! psu_type: "source"
//! psu_scope: "code"
//! psu_description: "Cold-redundancy ranking and rotation for power supplies."
//! psu_version: "v0.0.0-prealpha"
//! psu_owner: "tbd"
//! ---
//! Device registry: the owned PSU collection, replaced wholesale on discovery.

use psu_transport::DeviceAddress;
use serde::Serialize;
use tracing::debug;

use crate::power_supply::{PowerSupply, PsuDescriptor, PsuHealth};

/// Stable reference to a PSU within one registry generation.
///
/// Handles from an earlier generation never resolve after a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PsuHandle {
    generation: u64,
    index: usize,
}

impl PsuHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Result of applying a health report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthChange {
    /// The handle does not resolve in the current generation.
    Unknown,
    Unchanged,
    Changed {
        previous: PsuHealth,
        current: PsuHealth,
    },
}

/// Read-only view of one PSU for management tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PsuStatus {
    pub name: String,
    pub address: DeviceAddress,
    pub health: PsuHealth,
    pub rank: u8,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    generation: u64,
    psus: Vec<PowerSupply>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every PSU with the supplied set, in discovery order.
    ///
    /// Returns the new generation.
    pub fn rebuild(&mut self, descriptors: Vec<PsuDescriptor>) -> u64 {
        let psus = descriptors
            .into_iter()
            .map(PowerSupply::from_descriptor)
            .collect::<Vec<_>>();
        self.generation += 1;
        self.psus = psus;
        debug!(generation = self.generation, psus = self.psus.len(), "registry replaced");
        self.generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Live PSUs in discovery order.
    pub fn current(&self) -> &[PowerSupply] {
        &self.psus
    }

    pub(crate) fn psus_mut(&mut self) -> &mut [PowerSupply] {
        &mut self.psus
    }

    pub fn len(&self) -> usize {
        self.psus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.psus.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<PsuHandle> {
        self.psus
            .iter()
            .position(|psu| psu.name() == name)
            .map(|index| PsuHandle {
                generation: self.generation,
                index,
            })
    }

    pub fn get(&self, handle: PsuHandle) -> Option<&PowerSupply> {
        if handle.generation != self.generation {
            return None;
        }
        self.psus.get(handle.index)
    }

    fn get_mut(&mut self, handle: PsuHandle) -> Option<&mut PowerSupply> {
        if handle.generation != self.generation {
            return None;
        }
        self.psus.get_mut(handle.index)
    }

    /// Record a health report. A PSU that leaves `Normal` loses its rank here.
    ///
    /// A handle from an earlier generation reports [`HealthChange::Unknown`].
    pub fn set_health(&mut self, handle: PsuHandle, health: PsuHealth) -> HealthChange {
        let Some(psu) = self.get_mut(handle) else {
            return HealthChange::Unknown;
        };
        if psu.health == health {
            return HealthChange::Unchanged;
        }
        let previous = std::mem::replace(&mut psu.health, health.clone());
        if !health.is_normal() {
            psu.rank = 0;
        }
        HealthChange::Changed {
            previous,
            current: health,
        }
    }

    pub fn normal_count(&self) -> usize {
        self.psus.iter().filter(|psu| psu.is_normal()).count()
    }

    pub fn ranked_count(&self) -> usize {
        self.psus.iter().filter(|psu| psu.rank() != 0).count()
    }

    pub fn snapshot(&self) -> Vec<PsuStatus> {
        self.psus
            .iter()
            .map(|psu| PsuStatus {
                name: psu.name().to_owned(),
                address: psu.address(),
                health: psu.health().clone(),
                rank: psu.rank(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptors() -> Vec<PsuDescriptor> {
        vec![
            PsuDescriptor::new("PSU1", 7, 0x58),
            PsuDescriptor::new("PSU2", 7, 0x59),
        ]
    }

    #[test]
    fn rebuild_invalidates_previous_handles() {
        let mut registry = DeviceRegistry::new();
        registry.rebuild(descriptors());
        let handle = registry.find("PSU2").expect("PSU2 present");
        assert_eq!(registry.get(handle).map(|psu| psu.name()), Some("PSU2"));

        registry.rebuild(descriptors());
        assert!(registry.get(handle).is_none());
        assert_eq!(registry.generation(), 2);
    }

    #[test]
    fn rebuild_starts_every_psu_unranked() {
        let mut registry = DeviceRegistry::new();
        registry.rebuild(descriptors());
        registry.psus_mut()[0].rank = 1;
        registry.rebuild(descriptors());
        assert_eq!(registry.ranked_count(), 0);
    }

    #[test]
    fn fault_drops_rank_immediately() {
        let mut registry = DeviceRegistry::new();
        registry.rebuild(descriptors());
        registry.psus_mut()[1].rank = 2;

        let psu2 = registry.find("PSU2").expect("PSU2 present");
        let change = registry.set_health(psu2, PsuHealth::PowerLost);
        assert_eq!(
            change,
            HealthChange::Changed {
                previous: PsuHealth::Normal,
                current: PsuHealth::PowerLost,
            }
        );
        assert_eq!(registry.current()[1].rank(), 0);
        assert_eq!(registry.normal_count(), 1);
        assert_eq!(
            registry.set_health(psu2, PsuHealth::PowerLost),
            HealthChange::Unchanged
        );
        assert!(registry.find("PSU9").is_none());
    }

    #[test]
    fn stale_handle_cannot_change_health() {
        let mut registry = DeviceRegistry::new();
        registry.rebuild(descriptors());
        let stale = registry.find("PSU1").expect("PSU1 present");
        registry.rebuild(descriptors());

        assert_eq!(
            registry.set_health(stale, PsuHealth::PowerLost),
            HealthChange::Unknown
        );
        assert_eq!(registry.normal_count(), 2);
    }
}
