// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::unreadable_literal)] // GUID constants

//! Sweep scheduling tests
//!
//! Timer-driven behaviour of the engine under paused time: debounced port
//! triggers, rescan bursts, interval sweeps and delayed removal.

use ioc_discovery::transport::{FabricDescription, SimController, SimUnit};
use ioc_discovery::{
    AttachmentPoint, CaGuid, ControllerGuid, ControllerProfile, DiscoveryEngine, DiscoveryEvent,
    EngineConfig, EngineHandle, EventContext, PortEvent, PortGuid, ServiceEntry, SimulatedFabric,
    SweepConfig, SweepMode, UnitGuid, UnitKey, Verdict,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const CA: CaGuid = CaGuid(0x0002_c903_0001);
const PORT: PortGuid = PortGuid(0x11);

fn lab() -> Arc<SimulatedFabric> {
    let sim = SimulatedFabric::new(FabricDescription::default()).expect("empty fabric");
    sim.add_port(AttachmentPoint {
        ca_guid: CA,
        port_guid: PORT,
        port_number: 1,
        lid: 1,
    });
    sim.add_unit(SimUnit {
        guid: UnitGuid(0x1000),
        lids: vec![32],
        description: "shelf".into(),
        controllers: vec![SimController {
            slot: 1,
            profile: ControllerProfile {
                guid: ControllerGuid(0x2000),
                service_entry_count: 1,
                ..Default::default()
            },
            service_entries: vec![ServiceEntry {
                name: "svc".into(),
                id: 1,
            }],
            ..Default::default()
        }],
        ..Default::default()
    });
    Arc::new(sim)
}

fn config(mode: SweepMode) -> EngineConfig {
    EngineConfig {
        sweep: SweepConfig {
            mode,
            interval_ms: 1000,
            debounce_ms: 100,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn start(
    config: EngineConfig,
    sim: &Arc<SimulatedFabric>,
) -> (DiscoveryEngine, EngineHandle) {
    let engine = DiscoveryEngine::start(config, sim.clone()).expect("engine start");
    let handle = engine.handle();
    for point in sim.ports() {
        handle.add_port(point).await.expect("add port");
    }
    (engine, handle)
}

async fn settle() {
    tokio::time::sleep(Duration::from_secs(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_port_trigger_is_debounced() {
    let sim = lab();
    let (engine, handle) = start(config(SweepMode::OnDemand), &sim).await;
    let generation = handle.sweep_generation();

    // add_port already armed the timer; more triggers coalesce into it
    handle.port_event(PORT, PortEvent::Up).expect("port event");
    handle.port_event(PORT, PortEvent::SmChange).expect("port event");
    assert_eq!(*generation.borrow(), 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(*generation.borrow(), 1);
    assert_eq!(handle.snapshot().len(), 1);

    settle().await;
    assert_eq!(*generation.borrow(), 1);

    engine.stop().await.expect("stop");
}

#[tokio::test(start_paused = true)]
async fn test_rescan_from_idle_sweeps_twice() {
    let sim = lab();
    let (engine, handle) = start(config(SweepMode::OnDemand), &sim).await;
    assert_eq!(handle.run_sweep().await.expect("sweep").generation, 1);

    let mut generation = handle.sweep_generation();
    handle.request_rescan().expect("rescan");
    generation.wait_for(|g| *g >= 3).await.expect("engine running");

    settle().await;
    assert_eq!(*generation.borrow(), 3);
    let stats = handle.stats().await.expect("stats");
    assert_eq!(stats.sweeps_completed, 3);
    assert_eq!(stats.last_report.map(|r| r.events), Some(0));

    engine.stop().await.expect("stop");
}

#[tokio::test(start_paused = true)]
async fn test_rescans_coalesce_up_to_burst() {
    let sim = lab();
    let mut cfg = config(SweepMode::OnDemand);
    cfg.sweep.max_rescan_burst = 2;
    let (engine, handle) = start(cfg, &sim).await;
    handle.run_sweep().await.expect("sweep");

    for _ in 0..10 {
        handle.request_rescan().expect("rescan");
    }
    settle().await;
    // One sweep for the request plus a burst capped at two
    assert_eq!(*handle.sweep_generation().borrow(), 1 + 3);

    engine.stop().await.expect("stop");
}

#[tokio::test(start_paused = true)]
async fn test_disabled_mode_ignores_port_triggers() {
    let sim = lab();
    let (engine, handle) = start(config(SweepMode::Disabled), &sim).await;
    handle.port_event(PORT, PortEvent::SmChange).expect("port event");
    settle().await;
    assert_eq!(*handle.sweep_generation().borrow(), 0);
    assert!(handle.snapshot().is_empty());

    // Explicit requests still work
    let report = handle.run_sweep().await.expect("sweep");
    assert_eq!(report.units, 1);

    engine.stop().await.expect("stop");
}

#[tokio::test(start_paused = true)]
async fn test_interval_mode_keeps_sweeping() {
    let sim = lab();
    let (engine, handle) = start(config(SweepMode::Interval), &sim).await;
    let mut generation = handle.sweep_generation();

    generation.wait_for(|g| *g >= 1).await.expect("engine running");
    assert_eq!(handle.snapshot().len(), 1);

    tokio::time::sleep(Duration::from_millis(3500)).await;
    let swept = *generation.borrow();
    assert!((3..=5).contains(&swept), "{} sweeps", swept);

    // A vanished unit is noticed on the next tick
    sim.remove_unit(UnitGuid(0x1000));
    generation.wait_for(|g| *g > swept).await.expect("engine running");
    assert!(handle.snapshot().is_empty());

    engine.stop().await.expect("stop");
}

#[tokio::test(start_paused = true)]
async fn test_removal_waits_for_missed_sweeps() {
    let sim = lab();
    let mut cfg = config(SweepMode::OnDemand);
    cfg.sweep.missed_sweeps_before_removal = 2;
    let (engine, handle) = start(cfg, &sim).await;

    let removed = Arc::new(Mutex::new(Vec::new()));
    let sink_removed = removed.clone();
    handle
        .register_for_unit_events(move |event: &DiscoveryEvent, _: &mut Option<EventContext>| {
            if let DiscoveryEvent::UnitRemoved(e) = event {
                sink_removed.lock().push(e.unit);
            }
            Verdict::Accept
        })
        .await
        .expect("register");
    handle.run_sweep().await.expect("sweep");

    sim.remove_unit(UnitGuid(0x1000));
    let report = handle.run_sweep().await.expect("sweep");
    assert_eq!(report.events, 0);
    assert_eq!(report.units, 1);
    assert!(removed.lock().is_empty());

    let report = handle.run_sweep().await.expect("sweep");
    assert_eq!(report.changes.units_removed, 1);
    assert_eq!(*removed.lock(), vec![UnitKey::new(CA, UnitGuid(0x1000))]);

    engine.stop().await.expect("stop");
}

#[tokio::test(start_paused = true)]
async fn test_reappearing_unit_resets_missed_count() {
    let sim = lab();
    let mut cfg = config(SweepMode::OnDemand);
    cfg.sweep.missed_sweeps_before_removal = 2;
    let (engine, handle) = start(cfg, &sim).await;
    handle.run_sweep().await.expect("sweep");

    assert!(sim.update_unit(UnitGuid(0x1000), |u| u.unresponsive = true));
    handle.run_sweep().await.expect("sweep");
    sim.update_unit(UnitGuid(0x1000), |u| u.unresponsive = false);
    let report = handle.run_sweep().await.expect("sweep");
    assert_eq!(report.events, 0);

    // One more miss is tolerated again
    sim.update_unit(UnitGuid(0x1000), |u| u.unresponsive = true);
    let report = handle.run_sweep().await.expect("sweep");
    assert_eq!(report.units, 1);
    assert_eq!(report.events, 0);

    engine.stop().await.expect("stop");
}

#[tokio::test(start_paused = true)]
async fn test_run_sweep_joins_running_sweep() {
    let sim = lab();
    sim.set_latency(Duration::from_millis(500));
    let (engine, handle) = start(config(SweepMode::OnDemand), &sim).await;

    let (a, b) = tokio::join!(handle.run_sweep(), handle.run_sweep());
    let (a, b) = (a.expect("sweep"), b.expect("sweep"));
    assert_eq!(a.generation, b.generation);
    assert_eq!(a, b);
    assert_eq!(sim.counters().unit_info, 1);

    engine.stop().await.expect("stop");
}
