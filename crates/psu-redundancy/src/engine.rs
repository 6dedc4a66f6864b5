//! ---
//! psu_section: "07-resilience-fault-tolerance"
//! psu_subsection: "module"
//! psu_type: "source"
//! psu_scope: "code"
//! psu_description: "Cold-redundancy ranking and rotation for power supplies."
//! psu_version: "v0.0.0-prealpha"
//! psu_owner: "tbd"
//! ---
//! The redundancy engine and its control loop.
//!
//! One task owns the registry and every timer. Commands and timer expiries
//! are handled one at a time to completion, so PSU state needs no locking;
//! only the policy is shared with administrative callers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use psu_common::config::{RankingMode, RedundancyConfig};
use psu_metrics::RedundancyMetrics;
use psu_transport::PmbusTransport;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::inventory::{validate_records, InventorySource};
use crate::policy::{RedundancyPolicy, SharedPolicy};
use crate::power_supply::{PsuDescriptor, PsuHealth};
use crate::ranking::{self, RankOrderError, RankPass};
use crate::registry::{DeviceRegistry, HealthChange, PsuStatus};
use crate::staging::{PendingApply, StagedOperation, StagingController};
use crate::timer::{wait_until, DeadlineTimer};

const COMMAND_QUEUE_DEPTH: usize = 64;

/// Fixed timings and register selection for an engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub register: u8,
    pub warm_redundant_delay: Duration,
    pub check_interval: Duration,
    pub discovery_debounce: Duration,
    /// Operator rank list applied to each new registry under operator ranking.
    pub rank_order: Option<Vec<u8>>,
}

impl EngineSettings {
    pub fn from_config(config: &RedundancyConfig) -> Self {
        Self {
            register: config.register,
            warm_redundant_delay: config.warm_redundant_delay,
            check_interval: config.check_interval,
            discovery_debounce: config.discovery_debounce,
            rank_order: config.rank_order.clone(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&RedundancyConfig::default())
    }
}

/// Whether a staged rank change is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RedundancyStatus {
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Discovery,
    Staging,
    Rotation,
    Check,
}

/// Result of one consistency-check cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    NotSupported,
    /// Redundancy is disabled; hardware ranks were cleared.
    ForcedWarmRedundant,
    /// A staged operation is pending, hardware ranks are expected to read 0.
    Deferred,
    Consistent,
    /// `psu` read back 0; a re-ranking reconfiguration was staged.
    Mismatch { psu: String },
}

/// Read-only view of the engine for management tooling.
#[derive(Debug, Clone, Serialize)]
pub struct RedundancySnapshot {
    pub taken_at: DateTime<Utc>,
    pub generation: u64,
    pub status: RedundancyStatus,
    pub policy: RedundancyPolicy,
    pub psu_count: usize,
    pub normal_count: usize,
    pub power_supplies: Vec<PsuStatus>,
    pub operator_rank_order: Option<Vec<u8>>,
}

impl RedundancySnapshot {
    pub fn rank_of(&self, name: &str) -> Option<u8> {
        self.power_supplies
            .iter()
            .find(|psu| psu.name == name)
            .map(|psu| psu.rank)
    }

    pub fn ranks(&self) -> Vec<u8> {
        self.power_supplies.iter().map(|psu| psu.rank).collect()
    }
}

#[derive(Debug)]
pub enum EngineCommand {
    /// The inventory changed; rebuild after the debounce delay.
    InventoryChanged,
    HealthChanged {
        name: String,
        health: PsuHealth,
    },
    AssignRankOrder {
        order: Vec<u8>,
        reply: oneshot::Sender<Result<(), RankOrderError>>,
    },
    Snapshot(oneshot::Sender<RedundancySnapshot>),
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("redundancy engine is not running")]
    Stopped,
    #[error(transparent)]
    RankOrder(#[from] RankOrderError),
}

enum Wake {
    Command(EngineCommand),
    Timer(TimerKind),
    Closed,
}

/// Orchestrates discovery, ranking, staging, rotation and checking.
pub struct RedundancyEngine {
    settings: EngineSettings,
    policy: SharedPolicy,
    transport: Arc<dyn PmbusTransport>,
    inventory: Box<dyn InventorySource>,
    metrics: RedundancyMetrics,
    registry: DeviceRegistry,
    staging: StagingController,
    operator_order: Option<Vec<u8>>,
    debounce: DeadlineTimer,
    rotation: DeadlineTimer,
    check: DeadlineTimer,
}

impl RedundancyEngine {
    pub fn new(
        settings: EngineSettings,
        policy: SharedPolicy,
        transport: Arc<dyn PmbusTransport>,
        inventory: Box<dyn InventorySource>,
        metrics: RedundancyMetrics,
    ) -> Self {
        Self {
            staging: StagingController::new(settings.warm_redundant_delay),
            operator_order: settings.rank_order.clone(),
            settings,
            policy,
            transport,
            inventory,
            metrics,
            registry: DeviceRegistry::new(),
            debounce: DeadlineTimer::new("discovery-debounce"),
            rotation: DeadlineTimer::new("rotation"),
            check: DeadlineTimer::new("consistency-check"),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &SharedPolicy {
        &self.policy
    }

    pub fn status(&self) -> RedundancyStatus {
        if self.staging.is_pending() {
            RedundancyStatus::InProgress
        } else {
            RedundancyStatus::Completed
        }
    }

    /// Move the engine onto its own task.
    pub fn spawn(self) -> (RedundancyHandle, JoinHandle<()>) {
        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let handle = RedundancyHandle {
            commands,
            policy: self.policy.clone(),
        };
        let task = tokio::spawn(self.run(receiver));
        (handle, task)
    }

    /// Run the control loop until shutdown or until every handle is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<EngineCommand>) {
        self.start();
        loop {
            let discovery_at = self.debounce.deadline();
            let staging_at = self.staging.deadline();
            let rotation_at = self.rotation.deadline();
            let check_at = self.check.deadline();
            let wake = tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => Wake::Closed,
                },
                _ = wait_until(discovery_at) => Wake::Timer(TimerKind::Discovery),
                _ = wait_until(staging_at) => Wake::Timer(TimerKind::Staging),
                _ = wait_until(rotation_at) => Wake::Timer(TimerKind::Rotation),
                _ = wait_until(check_at) => Wake::Timer(TimerKind::Check),
            };
            match wake {
                Wake::Command(command) => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Wake::Timer(kind) => self.fire(kind),
                Wake::Closed => break,
            }
        }
        if let Some(abandoned) = self.staging.abandon() {
            debug!(
                operation = abandoned.operation.label(),
                "staged operation abandoned at shutdown"
            );
        }
        info!("redundancy engine stopped");
    }

    /// Initial discovery and timer arming.
    pub fn start(&mut self) {
        let policy = self.policy.snapshot();
        info!(
            supported = policy.redundancy_supported,
            enabled = policy.redundancy_enabled,
            rotation_enabled = policy.rotation_enabled,
            rotation_period_s = policy.rotation_period.as_secs(),
            mode = ?policy.ranking_mode,
            register = self.settings.register,
            "redundancy engine starting"
        );
        self.discover_and_rebuild();
        if !self.rotation.is_armed() {
            self.arm_rotation();
        }
        if !self.check.is_armed() {
            self.arm_check();
        }
    }

    fn handle_command(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::InventoryChanged => {
                self.debounce.arm(self.settings.discovery_debounce);
                trace!("inventory change noted; discovery debounced");
            }
            EngineCommand::HealthChanged { name, health } => self.report_health(&name, health),
            EngineCommand::AssignRankOrder { order, reply } => {
                let _ = reply.send(self.assign_rank_order(order));
            }
            EngineCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            EngineCommand::Shutdown => return false,
        }
        true
    }

    /// Handle the expiry of `kind`. Does nothing when that timer is not armed.
    pub fn fire(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Discovery => {
                if self.debounce.fire().is_some() {
                    self.discover_and_rebuild();
                }
            }
            TimerKind::Staging => {
                if let Some(pending) = self.staging.expire() {
                    self.apply_staged(pending);
                }
            }
            TimerKind::Rotation => {
                if self.rotation.fire().is_some() {
                    self.on_rotation_timer();
                    self.arm_rotation();
                }
            }
            TimerKind::Check => {
                if self.check.fire().is_some() {
                    self.on_check_timer();
                    self.arm_check();
                }
            }
        }
    }

    fn arm_rotation(&mut self) {
        let period = self.policy.snapshot().rotation_period;
        self.rotation.arm(period);
    }

    fn arm_check(&mut self) {
        self.check.arm(self.settings.check_interval);
    }

    fn discover_and_rebuild(&mut self) {
        match self.inventory.discover() {
            Ok(records) => {
                let descriptors = validate_records(records);
                self.rebuild(descriptors);
            }
            Err(err) => {
                warn!(error = %err, "inventory discovery failed; keeping current registry");
            }
        }
    }

    /// Replace the registry and run a re-ranking reconfiguration against it.
    pub fn rebuild(&mut self, descriptors: Vec<PsuDescriptor>) {
        let generation = self.registry.rebuild(descriptors);
        self.metrics.record_rebuild(generation);
        info!(
            generation,
            psus = self.registry.len(),
            normal = self.registry.normal_count(),
            "device registry rebuilt"
        );

        if self.policy.ranking_mode() == RankingMode::OperatorAssigned {
            if let Some(order) = self.operator_order.clone() {
                match ranking::validate_rank_order(&order, self.registry.len()) {
                    Ok(()) => ranking::apply_rank_order(self.registry.psus_mut(), &order),
                    Err(err) => {
                        warn!(error = %err, "operator rank order does not fit new registry; ignored")
                    }
                }
            }
        }

        self.arm_rotation();
        self.arm_check();
        self.stage(StagedOperation::Reconfigure { rerank: true }, "discovery");
    }

    /// Apply a health report from the health feed.
    ///
    /// Ranks are recomputed in memory right away so the live rank set stays
    /// `{1..=k}` even when staging is skipped; hardware follows on the next
    /// staged apply.
    pub fn report_health(&mut self, name: &str, health: PsuHealth) {
        let Some(handle) = self.registry.find(name) else {
            debug!(psu = name, "health report for unknown supply");
            return;
        };
        match self.registry.set_health(handle, health) {
            HealthChange::Unknown => debug!(psu = name, "health report for stale supply"),
            HealthChange::Unchanged => trace!(psu = name, "health unchanged"),
            HealthChange::Changed { previous, current } => {
                if let Some(psu) = self.registry.get(handle) {
                    info!(psu = name, device = %psu.address(), %previous, %current, "supply health changed");
                }
                self.re_rank();
                self.stage(StagedOperation::Reconfigure { rerank: true }, "health");
            }
        }
    }

    /// Accept an operator rank list and stage it for writing.
    pub fn assign_rank_order(&mut self, order: Vec<u8>) -> Result<(), RankOrderError> {
        if self.policy.ranking_mode() != RankingMode::OperatorAssigned {
            return Err(RankOrderError::NotOperatorAssigned);
        }
        ranking::validate_rank_order(&order, self.registry.len())?;
        ranking::apply_rank_order(self.registry.psus_mut(), &order);
        info!(?order, "operator rank order accepted");
        self.operator_order = Some(order);
        self.stage(StagedOperation::Reconfigure { rerank: false }, "operator");
        Ok(())
    }

    /// Recompute in-memory ranks. Never writes to hardware.
    pub fn re_rank(&mut self) -> RankPass {
        let pass = ranking::re_rank(self.registry.psus_mut(), &self.policy);
        if let RankPass::Assigned {
            ranked,
            switched_mode,
        } = pass
        {
            debug!(ranked, switched_mode, "ranks recomputed");
        }
        pass
    }

    /// Clear hardware ranks now and write the resulting ranks after the
    /// warm-redundant delay, re-ranking first when `rerank` is set.
    pub fn stage_and_apply(&mut self, rerank: bool) -> bool {
        self.stage(StagedOperation::Reconfigure { rerank }, "request")
    }

    fn stage(&mut self, operation: StagedOperation, trigger: &'static str) -> bool {
        let policy = self.policy.snapshot();
        if !policy.allows_staging() {
            debug!(
                operation = operation.label(),
                trigger, "redundancy disabled; staging skipped"
            );
            return false;
        }
        if let StagedOperation::Reconfigure { .. } = operation {
            self.metrics.record_reconfiguration(trigger);
        }
        let staged = self.staging.begin(operation, self.registry.generation());
        let cleared = self.put_warm_redundant();
        self.staging.warm_redundant_done();
        debug!(
            operation = staged.operation.label(),
            generation = staged.generation,
            trigger,
            cleared,
            delay_s = self.settings.warm_redundant_delay.as_secs(),
            "warm redundant written; apply pending"
        );
        true
    }

    /// Write rank 0 to every Normal PSU. Returns the number of successful
    /// writes.
    pub fn put_warm_redundant(&self) -> usize {
        if !self.policy.snapshot().redundancy_supported {
            return 0;
        }
        let mut written = 0;
        for psu in self.registry.current().iter().filter(|psu| psu.is_normal()) {
            if self.write_rank(psu.name(), psu.address(), 0, "warm-redundant") {
                written += 1;
            }
        }
        written
    }

    fn apply_staged(&mut self, pending: PendingApply) {
        if pending.generation != self.registry.generation() {
            warn!(
                operation = pending.operation.label(),
                staged_generation = pending.generation,
                generation = self.registry.generation(),
                "registry rebuilt while staged; apply dropped"
            );
            self.metrics.record_staged_dropped("generation");
            return;
        }
        if !self.policy.snapshot().allows_staging() {
            debug!(
                operation = pending.operation.label(),
                "redundancy disabled during warm-redundant delay; apply dropped"
            );
            self.metrics.record_staged_dropped("disabled");
            return;
        }

        match pending.operation {
            StagedOperation::Reconfigure { rerank } => {
                if rerank {
                    self.re_rank();
                }
                let written = self.write_ranks("apply");
                info!(
                    generation = pending.generation,
                    rerank,
                    written,
                    ranks = ?self.registry.current().iter().map(|psu| psu.rank()).collect::<Vec<_>>(),
                    "cold redundancy order applied"
                );
            }
            StagedOperation::Rotate => {
                if self.policy.ranking_mode() == RankingMode::PlatformManaged
                    && !ranking::ranks_contiguous(self.registry.current())
                {
                    warn!("live ranks are not contiguous; re-ranking before rotation");
                    self.re_rank();
                }
                let rotated = ranking::rotate_ranks(self.registry.psus_mut());
                let written = self.write_ranks("rotate");
                self.metrics.record_rotation();
                info!(
                    generation = pending.generation,
                    rotated,
                    written,
                    good = self.registry.normal_count(),
                    "cold redundancy order rotated"
                );
            }
        }
        self.metrics.set_ranked(self.registry.ranked_count());
    }

    fn write_ranks(&self, batch: &'static str) -> usize {
        let mut written = 0;
        for psu in self
            .registry
            .current()
            .iter()
            .filter(|psu| psu.is_normal() && psu.rank() != 0)
        {
            if self.write_rank(psu.name(), psu.address(), psu.rank(), batch) {
                written += 1;
            }
        }
        written
    }

    fn write_rank(
        &self,
        name: &str,
        device: psu_transport::DeviceAddress,
        rank: u8,
        batch: &'static str,
    ) -> bool {
        match self
            .transport
            .write_byte(device, self.settings.register, rank)
        {
            Ok(()) => {
                self.metrics.record_write(batch, true);
                true
            }
            Err(err) => {
                warn!(
                    psu = name,
                    %device,
                    register = self.settings.register,
                    rank,
                    batch,
                    error = %err,
                    "failed to write cold redundancy order"
                );
                self.metrics.record_write(batch, false);
                false
            }
        }
    }

    /// Rotation period elapsed.
    pub fn on_rotation_timer(&mut self) -> bool {
        let policy = self.policy.snapshot();
        if !(policy.redundancy_supported && policy.rotation_enabled) {
            trace!("rotation disabled; period skipped");
            return false;
        }
        self.stage(StagedOperation::Rotate, "rotation")
    }

    /// Consistency period elapsed: compare hardware ranks with intent.
    pub fn on_check_timer(&mut self) -> CheckOutcome {
        let policy = self.policy.snapshot();
        if !policy.redundancy_supported {
            return CheckOutcome::NotSupported;
        }
        if !policy.redundancy_enabled {
            let cleared = self.put_warm_redundant();
            debug!(cleared, "redundancy disabled; hardware held warm redundant");
            return CheckOutcome::ForcedWarmRedundant;
        }
        if self.staging.is_pending() {
            debug!("staged operation in flight; consistency check deferred");
            return CheckOutcome::Deferred;
        }

        let platform_managed = policy.ranking_mode == RankingMode::PlatformManaged;
        let mut mismatch = None;
        for psu in self.registry.current().iter().filter(|psu| psu.is_normal()) {
            let hardware = match self
                .transport
                .read_byte(psu.address(), self.settings.register)
            {
                Ok(value) => value,
                Err(err) => {
                    warn!(
                        psu = psu.name(),
                        device = %psu.address(),
                        register = self.settings.register,
                        error = %err,
                        "failed to read cold redundancy order"
                    );
                    self.metrics.record_read_failure();
                    continue;
                }
            };
            if hardware == 0 && (psu.rank() != 0 || platform_managed) {
                warn!(
                    psu = psu.name(),
                    intended = psu.rank(),
                    "hardware lost its cold redundancy order"
                );
                mismatch = Some(psu.name().to_owned());
                break;
            }
        }

        match mismatch {
            Some(psu) => {
                self.stage(StagedOperation::Reconfigure { rerank: true }, "check");
                CheckOutcome::Mismatch { psu }
            }
            None => CheckOutcome::Consistent,
        }
    }

    pub fn snapshot(&self) -> RedundancySnapshot {
        RedundancySnapshot {
            taken_at: Utc::now(),
            generation: self.registry.generation(),
            status: self.status(),
            policy: self.policy.snapshot(),
            psu_count: self.registry.len(),
            normal_count: self.registry.normal_count(),
            power_supplies: self.registry.snapshot(),
            operator_rank_order: self.operator_order.clone(),
        }
    }
}

/// Cloneable front door to a running engine.
#[derive(Debug, Clone)]
pub struct RedundancyHandle {
    commands: mpsc::Sender<EngineCommand>,
    policy: SharedPolicy,
}

impl RedundancyHandle {
    /// Policy shared with the engine, for administrative toggles.
    pub fn policy(&self) -> &SharedPolicy {
        &self.policy
    }

    async fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Stopped)
    }

    pub async fn notify_inventory_changed(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::InventoryChanged).await
    }

    /// Non-blocking variant for callbacks outside the runtime. A full queue
    /// is fine: the pending notification already triggers a rebuild.
    pub fn try_notify_inventory_changed(&self) -> Result<(), EngineError> {
        match self.commands.try_send(EngineCommand::InventoryChanged) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EngineError::Stopped),
        }
    }

    pub async fn report_health(
        &self,
        name: impl Into<String>,
        health: PsuHealth,
    ) -> Result<(), EngineError> {
        self.send(EngineCommand::HealthChanged {
            name: name.into(),
            health,
        })
        .await
    }

    /// Blocking variant for threads outside the runtime, such as file
    /// watcher callbacks. Health reports are never dropped on a full queue.
    pub fn report_health_blocking(
        &self,
        name: impl Into<String>,
        health: PsuHealth,
    ) -> Result<(), EngineError> {
        self.commands
            .blocking_send(EngineCommand::HealthChanged {
                name: name.into(),
                health,
            })
            .map_err(|_| EngineError::Stopped)
    }

    pub async fn assign_rank_order(&self, order: Vec<u8>) -> Result<(), EngineError> {
        let (reply, response) = oneshot::channel();
        self.send(EngineCommand::AssignRankOrder { order, reply })
            .await?;
        response.await.map_err(|_| EngineError::Stopped)??;
        Ok(())
    }

    pub async fn snapshot(&self) -> Result<RedundancySnapshot, EngineError> {
        let (reply, response) = oneshot::channel();
        self.send(EngineCommand::Snapshot(reply)).await?;
        response.await.map_err(|_| EngineError::Stopped)
    }

    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{InventoryRecord, StaticInventory};
    use psu_transport::{DeviceAddress, SimulatedPmbus};

    const REG: u8 = 0xD0;

    struct Rig {
        engine: RedundancyEngine,
        bus: Arc<SimulatedPmbus>,
        inventory: StaticInventory,
        metrics: RedundancyMetrics,
    }

    fn device(index: usize) -> DeviceAddress {
        DeviceAddress::new(1, 0x58 + index as u8)
    }

    fn records(names: &[&str]) -> Vec<InventoryRecord> {
        names
            .iter()
            .enumerate()
            .map(|(index, name)| InventoryRecord::new(*name, 1, 0x58 + index as u64))
            .collect()
    }

    fn rig(names: &[&str], config: RedundancyConfig) -> Rig {
        let bus = Arc::new(SimulatedPmbus::default());
        let inventory = StaticInventory::new(records(names));
        let metrics = RedundancyMetrics::detached().unwrap();
        let engine = RedundancyEngine::new(
            EngineSettings::from_config(&config),
            SharedPolicy::new(RedundancyPolicy::from_config(&config)),
            bus.clone(),
            Box::new(inventory.clone()),
            metrics.clone(),
        );
        Rig {
            engine,
            bus,
            inventory,
            metrics,
        }
    }

    fn written(bus: &SimulatedPmbus) -> Vec<(u8, u8)> {
        bus.journal()
            .iter()
            .map(|entry| (entry.device.address, entry.value))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn start_clears_then_applies_discovery_order() {
        let mut rig = rig(&["A", "B", "C"], RedundancyConfig::default());
        rig.engine.start();
        assert_eq!(rig.engine.status(), RedundancyStatus::InProgress);
        assert_eq!(written(&rig.bus), vec![(0x58, 0), (0x59, 0), (0x5a, 0)]);

        rig.bus.clear_journal();
        rig.engine.fire(TimerKind::Staging);
        assert_eq!(rig.engine.status(), RedundancyStatus::Completed);
        assert_eq!(written(&rig.bus), vec![(0x58, 1), (0x59, 2), (0x5a, 3)]);
        assert_eq!(rig.engine.snapshot().ranks(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_supply_is_skipped_by_both_batches() {
        let mut rig = rig(&["A", "B", "C"], RedundancyConfig::default());
        rig.engine.start();
        rig.engine.fire(TimerKind::Staging);
        rig.bus.clear_journal();

        rig.engine.report_health("B", PsuHealth::PowerLost);
        assert_eq!(rig.engine.snapshot().rank_of("B"), Some(0));
        assert_eq!(written(&rig.bus), vec![(0x58, 0), (0x5a, 0)]);

        rig.bus.clear_journal();
        rig.engine.fire(TimerKind::Staging);
        assert_eq!(written(&rig.bus), vec![(0x58, 1), (0x5a, 2)]);
        assert_eq!(rig.engine.snapshot().ranks(), vec![1, 0, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_or_repeated_health_stages_nothing() {
        let mut rig = rig(&["A", "B"], RedundancyConfig::default());
        rig.engine.start();
        rig.engine.fire(TimerKind::Staging);
        rig.bus.clear_journal();

        rig.engine.report_health("Z", PsuHealth::PowerLost);
        rig.engine.report_health("A", PsuHealth::Normal);
        assert!(rig.bus.journal().is_empty());
        assert_eq!(rig.engine.status(), RedundancyStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn check_stops_at_first_lost_rank() {
        let mut rig = rig(&["A", "B", "C"], RedundancyConfig::default());
        rig.engine.start();
        rig.engine.fire(TimerKind::Staging);
        rig.bus.clear_journal();

        assert_eq!(rig.engine.on_check_timer(), CheckOutcome::Consistent);
        assert_eq!(rig.bus.reads().len(), 3);

        rig.bus.clear_journal();
        rig.bus.set_register(device(1), REG, 0);
        assert_eq!(
            rig.engine.on_check_timer(),
            CheckOutcome::Mismatch { psu: "B".into() }
        );
        assert_eq!(rig.bus.reads(), vec![(device(0), REG), (device(1), REG)]);
        assert_eq!(rig.engine.status(), RedundancyStatus::InProgress);
        assert_eq!(written(&rig.bus), vec![(0x58, 0), (0x59, 0), (0x5a, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn check_defers_while_staged_and_skips_failed_reads() {
        let mut rig = rig(&["A", "B"], RedundancyConfig::default());
        rig.engine.start();
        assert_eq!(rig.engine.on_check_timer(), CheckOutcome::Deferred);
        assert!(rig.bus.reads().is_empty());

        rig.engine.fire(TimerKind::Staging);
        rig.bus.fail_reads(device(0), true);
        assert_eq!(rig.engine.on_check_timer(), CheckOutcome::Consistent);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_redundancy_holds_hardware_warm() {
        let mut rig = rig(&["A", "B"], RedundancyConfig::default());
        rig.engine.start();
        rig.engine.fire(TimerKind::Staging);
        rig.bus.clear_journal();

        rig.engine.policy().set_redundancy_enabled(false);
        assert_eq!(
            rig.engine.on_check_timer(),
            CheckOutcome::ForcedWarmRedundant
        );
        assert_eq!(written(&rig.bus), vec![(0x58, 0), (0x59, 0)]);
        assert!(!rig.engine.on_rotation_timer());
        assert!(!rig.engine.stage_and_apply(true));
    }

    #[tokio::test(start_paused = true)]
    async fn apply_dropped_after_rebuild() {
        let mut rig = rig(&["A", "B"], RedundancyConfig::default());
        rig.engine.start();
        rig.engine.policy().set_redundancy_enabled(false);
        rig.inventory.replace(records(&["A", "B", "C"]));
        rig.engine.discover_and_rebuild();
        rig.engine.policy().set_redundancy_enabled(true);
        rig.bus.clear_journal();

        rig.engine.fire(TimerKind::Staging);
        assert!(rig.bus.journal().is_empty());
        assert_eq!(rig.metrics.dropped("generation"), 1);
        assert_eq!(rig.engine.snapshot().ranks(), vec![0, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn apply_dropped_when_disabled_during_delay() {
        let mut rig = rig(&["A"], RedundancyConfig::default());
        rig.engine.start();
        rig.engine.policy().set_redundancy_enabled(false);
        rig.bus.clear_journal();
        rig.engine.fire(TimerKind::Staging);
        assert!(rig.bus.journal().is_empty());
        assert_eq!(rig.metrics.dropped("disabled"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_advances_and_wraps() {
        let mut rig = rig(&["A", "B", "C"], RedundancyConfig::default());
        rig.engine.start();
        rig.engine.fire(TimerKind::Staging);

        assert!(rig.engine.on_rotation_timer());
        rig.engine.fire(TimerKind::Staging);
        assert_eq!(rig.engine.snapshot().ranks(), vec![2, 3, 1]);

        rig.engine.report_health("A", PsuHealth::Fault("fan".into()));
        rig.engine.fire(TimerKind::Staging);
        assert_eq!(rig.engine.snapshot().ranks(), vec![0, 1, 2]);

        assert!(rig.engine.on_rotation_timer());
        rig.engine.fire(TimerKind::Staging);
        assert_eq!(rig.engine.snapshot().ranks(), vec![0, 2, 1]);
    }

    fn live_ranks(rig: &Rig) -> Vec<u8> {
        let mut live = rig
            .engine
            .snapshot()
            .ranks()
            .into_iter()
            .filter(|rank| *rank != 0)
            .collect::<Vec<_>>();
        live.sort_unstable();
        live
    }

    #[tokio::test(start_paused = true)]
    async fn health_change_while_disabled_keeps_ranks_distinct() {
        let mut rig = rig(&["A", "B", "C"], RedundancyConfig::default());
        rig.engine.start();
        rig.engine.fire(TimerKind::Staging);

        rig.engine.policy().set_redundancy_enabled(false);
        rig.engine.report_health("A", PsuHealth::PowerLost);
        assert_eq!(rig.engine.snapshot().ranks(), vec![0, 1, 2]);
        assert_eq!(rig.engine.status(), RedundancyStatus::Completed);

        rig.engine.policy().set_redundancy_enabled(true);
        assert_eq!(rig.engine.on_check_timer(), CheckOutcome::Consistent);
        assert!(rig.engine.on_rotation_timer());
        rig.engine.fire(TimerKind::Staging);

        assert_eq!(live_ranks(&rig), vec![1, 2]);
        let b = rig.bus.register(device(1), REG);
        let c = rig.bus.register(device(2), REG);
        assert_ne!(b, 0);
        assert_ne!(c, 0);
        assert_ne!(b, c);
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_repairs_gapped_ranks_first() {
        let mut rig = rig(&["A", "B", "C"], RedundancyConfig::default());
        rig.engine.start();
        rig.engine.fire(TimerKind::Staging);

        let psus = rig.engine.registry.psus_mut();
        psus[0].health = PsuHealth::PowerLost;
        psus[0].rank = 0;
        assert!(rig.engine.on_rotation_timer());
        rig.engine.fire(TimerKind::Staging);

        assert_eq!(rig.engine.snapshot().ranks(), vec![0, 2, 1]);
        assert_eq!(live_ranks(&rig), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_disabled_skips_period() {
        let mut rig = rig(
            &["A", "B"],
            RedundancyConfig {
                rotation_enabled: false,
                ..RedundancyConfig::default()
            },
        );
        rig.engine.start();
        rig.engine.fire(TimerKind::Staging);
        assert!(!rig.engine.on_rotation_timer());
        assert_eq!(rig.engine.status(), RedundancyStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn operator_order_requires_operator_mode() {
        let mut rig = rig(&["A", "B"], RedundancyConfig::default());
        rig.engine.start();
        assert_eq!(
            rig.engine.assign_rank_order(vec![2, 1]),
            Err(RankOrderError::NotOperatorAssigned)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn operator_order_is_written_without_rerank() {
        let mut rig = rig(
            &["A", "B", "C"],
            RedundancyConfig {
                ranking_mode: RankingMode::OperatorAssigned,
                ..RedundancyConfig::default()
            },
        );
        rig.engine.start();
        rig.engine.fire(TimerKind::Staging);
        assert_eq!(rig.engine.snapshot().ranks(), vec![0, 0, 0]);

        rig.engine.assign_rank_order(vec![3, 1, 2]).unwrap();
        rig.bus.clear_journal();
        rig.engine.fire(TimerKind::Staging);
        assert_eq!(written(&rig.bus), vec![(0x58, 3), (0x59, 1), (0x5a, 2)]);
        assert_eq!(
            rig.engine.snapshot().operator_rank_order,
            Some(vec![3, 1, 2])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn startup_with_empty_inventory_still_arms_timers() {
        let mut rig = rig(&[], RedundancyConfig::default());
        rig.engine.start();
        assert!(rig.engine.registry().is_empty());
        assert!(rig.engine.rotation.is_armed());
        assert!(rig.engine.check.is_armed());
        rig.engine.fire(TimerKind::Staging);
        assert!(rig.bus.journal().is_empty());
    }
}
