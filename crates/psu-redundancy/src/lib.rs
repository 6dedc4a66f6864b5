//! ---
//! psu_section: "07-resilience-fault-tolerance"
//! psu_subsection: "module"
//! psu_type: "source"
//! psu_scope: "code"
//! psu_description: "Cold-redundancy ranking and rotation for power supplies."
//! psu_version: "v0.0.0-prealpha"
//! psu_owner: "tbd"
//! ---
//! Cold-redundancy management for hot-swappable power supplies.
//!
//! The engine ranks healthy PSUs, writes ranks through a two-phase
//! warm-redundant staging protocol, rotates ranks periodically and re-checks
//! hardware ranks against its own view.

pub mod engine;
pub mod health;
pub mod inventory;
pub mod policy;
pub mod power_supply;
pub mod ranking;
pub mod registry;
pub mod staging;
pub mod timer;

pub use engine::{
    CheckOutcome, EngineCommand, EngineError, EngineSettings, RedundancyEngine, RedundancyHandle,
    RedundancySnapshot, RedundancyStatus, TimerKind,
};
pub use health::{parse_health, FileHealthFeed, HealthFeedError, HealthReport};
pub use inventory::{
    parse_inventory, validate_records, FileInventory, InventoryError, InventoryRecord,
    InventorySource, StaticInventory,
};
pub use policy::{PolicyError, RedundancyPolicy, SharedPolicy};
pub use power_supply::{PowerSupply, PsuDescriptor, PsuHealth};
pub use ranking::{RankOrderError, RankPass};
pub use registry::{DeviceRegistry, HealthChange, PsuHandle, PsuStatus};
pub use staging::{PendingApply, StagePhase, StagedOperation, StagingController};
pub use timer::{DeadlineTimer, TimerEvent};
