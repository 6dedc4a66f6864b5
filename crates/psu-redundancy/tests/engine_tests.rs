//! ---
//! psu_section: "07-resilience-fault-tolerance"
//! psu_subsection: "module"
//! psu_type: "source"
//! psu_scope: "code"
//! psu_description: "Cold-redundancy ranking and rotation for power supplies."
//! psu_version: "v0.0.0-prealpha"
//! psu_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use psu_common::config::{RankingMode, RedundancyConfig};
use psu_metrics::RedundancyMetrics;
use psu_redundancy::{
    EngineError, EngineSettings, FileHealthFeed, FileInventory, InventoryRecord, PsuHealth, RankOrderError,
    RedundancyEngine, RedundancyHandle, RedundancyPolicy, RedundancyStatus, SharedPolicy,
    StaticInventory,
};
use psu_transport::{DeviceAddress, SimulatedPmbus};
use tokio::task::JoinHandle;
use tokio::time::sleep;

const REG: u8 = 0xD0;

struct Running {
    handle: RedundancyHandle,
    task: JoinHandle<()>,
    bus: Arc<SimulatedPmbus>,
    inventory: StaticInventory,
}

fn device(index: usize) -> DeviceAddress {
    DeviceAddress::new(4, 0x40 + index as u8)
}

fn records(names: &[&str]) -> Vec<InventoryRecord> {
    names
        .iter()
        .enumerate()
        .map(|(index, name)| InventoryRecord::new(*name, 4, 0x40 + index as u64))
        .collect()
}

fn spawn_engine(names: &[&str], config: RedundancyConfig) -> Running {
    let bus = Arc::new(SimulatedPmbus::default());
    let inventory = StaticInventory::new(records(names));
    let engine = RedundancyEngine::new(
        EngineSettings::from_config(&config),
        SharedPolicy::new(RedundancyPolicy::from_config(&config)),
        bus.clone(),
        Box::new(inventory.clone()),
        RedundancyMetrics::detached().expect("metrics"),
    );
    let (handle, task) = engine.spawn();
    Running {
        handle,
        task,
        bus,
        inventory,
    }
}

#[tokio::test(start_paused = true)]
async fn ranks_land_after_warm_redundant_delay() {
    let running = spawn_engine(&["A", "B", "C"], RedundancyConfig::default());

    let staged = running.handle.snapshot().await.expect("snapshot");
    assert_eq!(staged.status, RedundancyStatus::InProgress);
    assert_eq!(staged.ranks(), vec![0, 0, 0]);

    sleep(Duration::from_secs(4)).await;
    let waiting = running.handle.snapshot().await.expect("snapshot");
    assert_eq!(waiting.status, RedundancyStatus::InProgress);
    assert!((0..3).all(|index| running.bus.register(device(index), REG) == 0));

    sleep(Duration::from_secs(2)).await;
    let applied = running.handle.snapshot().await.expect("snapshot");
    assert_eq!(applied.status, RedundancyStatus::Completed);
    assert_eq!(applied.ranks(), vec![1, 2, 3]);

    let journal = running.bus.journal();
    let values = journal.iter().map(|entry| entry.value).collect::<Vec<_>>();
    assert_eq!(values, vec![0, 0, 0, 1, 2, 3]);
    assert!(journal.windows(2).all(|pair| pair[0].sequence < pair[1].sequence));
}

#[tokio::test(start_paused = true)]
async fn power_loss_reranks_remaining_supplies() {
    let running = spawn_engine(&["A", "B", "C"], RedundancyConfig::default());
    sleep(Duration::from_secs(6)).await;

    running
        .handle
        .report_health("B", PsuHealth::PowerLost)
        .await
        .expect("report");
    let immediate = running.handle.snapshot().await.expect("snapshot");
    assert_eq!(immediate.rank_of("B"), Some(0));
    assert_eq!(immediate.normal_count, 2);

    sleep(Duration::from_secs(6)).await;
    let settled = running.handle.snapshot().await.expect("snapshot");
    assert_eq!(settled.ranks(), vec![1, 0, 2]);
    assert_eq!(running.bus.register(device(0), REG), 1);
    assert_eq!(running.bus.register(device(2), REG), 2);
}

#[tokio::test(start_paused = true)]
async fn inventory_bursts_collapse_into_one_rebuild() {
    let running = spawn_engine(&["A", "B"], RedundancyConfig::default());
    assert_eq!(running.handle.snapshot().await.expect("snapshot").generation, 1);

    running.inventory.replace(records(&["A", "B", "C", "D"]));
    for _ in 0..3 {
        running
            .handle
            .notify_inventory_changed()
            .await
            .expect("notify");
        sleep(Duration::from_millis(400)).await;
    }
    sleep(Duration::from_millis(100)).await;
    assert_eq!(running.handle.snapshot().await.expect("snapshot").generation, 1);

    sleep(Duration::from_millis(600)).await;
    let rebuilt = running.handle.snapshot().await.expect("snapshot");
    assert_eq!(rebuilt.generation, 2);
    assert_eq!(rebuilt.psu_count, 4);

    sleep(Duration::from_secs(6)).await;
    let applied = running.handle.snapshot().await.expect("snapshot");
    assert_eq!(applied.ranks(), vec![1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn rotation_cycles_through_every_position() {
    let running = spawn_engine(
        &["A", "B", "C"],
        RedundancyConfig {
            rotation_period: Duration::from_secs(120),
            ..RedundancyConfig::default()
        },
    );

    sleep(Duration::from_secs(130)).await;
    let first = running.handle.snapshot().await.expect("snapshot");
    assert_eq!(first.ranks(), vec![2, 3, 1]);

    sleep(Duration::from_secs(120)).await;
    let second = running.handle.snapshot().await.expect("snapshot");
    assert_eq!(second.ranks(), vec![3, 1, 2]);

    sleep(Duration::from_secs(120)).await;
    let third = running.handle.snapshot().await.expect("snapshot");
    assert_eq!(third.ranks(), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn checker_restores_rank_lost_by_hardware() {
    let running = spawn_engine(&["A", "B", "C"], RedundancyConfig::default());
    sleep(Duration::from_secs(6)).await;

    running.bus.set_register(device(1), REG, 0);
    sleep(Duration::from_secs(60)).await;

    assert_eq!(running.bus.register(device(1), REG), 2);
    let snapshot = running.handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.status, RedundancyStatus::Completed);
    assert_eq!(snapshot.ranks(), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn disabling_redundancy_clears_hardware_at_next_check() {
    let running = spawn_engine(&["A", "B"], RedundancyConfig::default());
    sleep(Duration::from_secs(6)).await;
    assert_eq!(running.bus.register(device(1), REG), 2);

    running.handle.policy().set_redundancy_enabled(false);
    sleep(Duration::from_secs(60)).await;
    assert_eq!(running.bus.register(device(0), REG), 0);
    assert_eq!(running.bus.register(device(1), REG), 0);
}

#[tokio::test(start_paused = true)]
async fn operator_ranking_gives_way_to_platform_after_fault() {
    let running = spawn_engine(
        &["A", "B", "C"],
        RedundancyConfig {
            ranking_mode: RankingMode::OperatorAssigned,
            rank_order: Some(vec![3, 1, 2]),
            ..RedundancyConfig::default()
        },
    );
    sleep(Duration::from_secs(6)).await;
    let operator = running.handle.snapshot().await.expect("snapshot");
    assert_eq!(operator.ranks(), vec![3, 1, 2]);

    running
        .handle
        .report_health("B", PsuHealth::PowerLost)
        .await
        .expect("report");
    sleep(Duration::from_secs(6)).await;
    let platform = running.handle.snapshot().await.expect("snapshot");
    assert_eq!(platform.policy.ranking_mode, RankingMode::PlatformManaged);
    assert_eq!(platform.ranks(), vec![1, 0, 2]);

    running
        .handle
        .report_health("B", PsuHealth::Normal)
        .await
        .expect("report");
    sleep(Duration::from_secs(6)).await;
    let recovered = running.handle.snapshot().await.expect("snapshot");
    assert_eq!(recovered.policy.ranking_mode, RankingMode::PlatformManaged);
    assert_eq!(recovered.ranks(), vec![1, 2, 3]);

    let rejected = running.handle.assign_rank_order(vec![1, 2, 3]).await;
    assert!(matches!(
        rejected,
        Err(EngineError::RankOrder(RankOrderError::NotOperatorAssigned))
    ));
}

#[tokio::test(start_paused = true)]
async fn invalid_operator_order_is_rejected() {
    let running = spawn_engine(
        &["A", "B"],
        RedundancyConfig {
            ranking_mode: RankingMode::OperatorAssigned,
            ..RedundancyConfig::default()
        },
    );
    let rejected = running.handle.assign_rank_order(vec![2, 2]).await;
    assert!(matches!(
        rejected,
        Err(EngineError::RankOrder(RankOrderError::Duplicate(2)))
    ));
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_loop() {
    let running = spawn_engine(&["A"], RedundancyConfig::default());
    running.handle.shutdown().await.expect("shutdown");
    running.task.await.expect("engine task");
    assert!(matches!(
        running.handle.snapshot().await,
        Err(EngineError::Stopped)
    ));
}

#[tokio::test(start_paused = true)]
async fn file_inventory_edits_reach_the_registry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("inventory.toml");
    std::fs::write(
        &path,
        "[[power_supply]]\nname = \"PSU1\"\nbus = 4\naddress = 0x40\n",
    )
    .expect("write inventory");

    let config = RedundancyConfig::default();
    let engine = RedundancyEngine::new(
        EngineSettings::from_config(&config),
        SharedPolicy::new(RedundancyPolicy::from_config(&config)),
        Arc::new(SimulatedPmbus::default()),
        Box::new(FileInventory::new(&path)),
        RedundancyMetrics::detached().expect("metrics"),
    );
    let (handle, _task) = engine.spawn();
    assert_eq!(handle.snapshot().await.expect("snapshot").psu_count, 1);

    std::fs::write(
        &path,
        "[[power_supply]]\nname = \"PSU1\"\nbus = 4\naddress = 0x40\n\n\
         [[power_supply]]\nname = \"PSU2\"\nbus = 4\naddress = 0x41\nhealth = \"power-lost\"\n\n\
         [[power_supply]]\nname = \"PSU3\"\nbus = 4\n",
    )
    .expect("rewrite inventory");
    handle.notify_inventory_changed().await.expect("notify");
    sleep(Duration::from_secs(7)).await;

    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.generation, 2);
    assert_eq!(snapshot.psu_count, 2);
    assert_eq!(snapshot.normal_count, 1);
    assert_eq!(snapshot.ranks(), vec![1, 0]);
}

#[tokio::test(start_paused = true)]
async fn health_feed_reranks_without_rebuild() {
    let running = spawn_engine(&["PSU1", "PSU2", "PSU3"], RedundancyConfig::default());
    sleep(Duration::from_secs(6)).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("health.toml");
    std::fs::write(
        &path,
        "[power_supply]\nPSU1 = \"normal\"\nPSU2 = \"power-lost\"\nPSU9 = \"normal\"\n",
    )
    .expect("write health");

    for report in FileHealthFeed::new(&path).read().expect("health feed") {
        running
            .handle
            .report_health(report.name, report.health)
            .await
            .expect("report");
    }
    let immediate = running.handle.snapshot().await.expect("snapshot");
    assert_eq!(immediate.generation, 1);
    assert_eq!(immediate.ranks(), vec![1, 0, 2]);
    assert_eq!(immediate.status, RedundancyStatus::InProgress);

    sleep(Duration::from_secs(6)).await;
    let settled = running.handle.snapshot().await.expect("snapshot");
    assert_eq!(settled.generation, 1);
    assert_eq!(settled.status, RedundancyStatus::Completed);
    assert_eq!(running.bus.register(device(0), REG), 1);
    assert_eq!(running.bus.register(device(2), REG), 2);
}

#[test]
fn blocking_health_reports_reach_the_engine() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let running = runtime.block_on(async {
        spawn_engine(&["A", "B"], RedundancyConfig::default())
    });

    let handle = running.handle.clone();
    std::thread::spawn(move || handle.report_health_blocking("B", PsuHealth::PowerLost))
        .join()
        .expect("reporter thread")
        .expect("report");

    let snapshot = runtime
        .block_on(running.handle.snapshot())
        .expect("snapshot");
    assert_eq!(snapshot.rank_of("B"), Some(0));
    assert_eq!(snapshot.normal_count, 1);
}
