// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-port stage pipeline.
//!
//! One [`PortSweep`] drives the candidates of one attachment point through
//! the three request stages:
//!
//! | Stage | Requests | Survivors |
//! |---|---|---|
//! | `UnitInfo` | one unit-info per unit, path failover | units with a unit profile |
//! | `ControllerProfile` | one profile per installed slot | units with a controller |
//! | `ServiceEntries` | blocks of up to four entries | complete controllers and their units |
//!
//! Every stage is a task group: all requests are spawned, then joined, and
//! the stage only ends when its outstanding count is back to zero.

use crate::candidate::CandidateBuilder;
use crate::config::EngineConfig;
use crate::error::TransportError;
use crate::model::{
    AttachmentPoint, Controller, ControllerProfile, PathRecord, PortGuid, Unit, UnitInfo, UnitKey,
};
use crate::pool::Pools;
use crate::query::QueryCoordinator;
use crate::topology::ProvisionalTopology;
use crate::transport::{entry_blocks, DeviceRequest, DeviceResponse, FabricTransport, QueryOptions};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

/// Pipeline stage. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SweepStage {
    UnitInfo,
    ControllerProfile,
    ServiceEntries,
    Complete,
}

impl fmt::Display for SweepStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnitInfo => "unit-info",
            Self::ControllerProfile => "controller-profile",
            Self::ServiceEntries => "service-entries",
            Self::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Shared collaborators of every port sweep.
#[derive(Clone)]
pub struct SweepContext {
    pub transport: Arc<dyn FabricTransport>,
    pub pools: Arc<Pools>,
    pub discovery_options: QueryOptions,
    pub request_options: QueryOptions,
}

impl SweepContext {
    pub fn new(
        config: &EngineConfig,
        transport: Arc<dyn FabricTransport>,
        pools: Arc<Pools>,
    ) -> Self {
        Self {
            transport,
            pools,
            discovery_options: config.query.discovery_options(),
            request_options: config.query.request_options(),
        }
    }
}

/// A controller shared between its unit and the block requests still
/// filling it. Each request holds one reference.
type SharedController = Arc<Mutex<Controller>>;

/// The sweep of one attachment point for one generation.
pub struct PortSweep {
    ctx: SweepContext,
    point: AttachmentPoint,
    generation: u64,
    stage: SweepStage,
    outstanding: usize,
    candidates: BTreeMap<UnitKey, Unit>,
    /// Controller records reserved for profile requests still outstanding
    reserved: Vec<Controller>,
    in_flight: Vec<(UnitKey, SharedController)>,
}

impl PortSweep {
    pub fn new(ctx: SweepContext, point: AttachmentPoint, generation: u64) -> Self {
        Self {
            ctx,
            point,
            generation,
            stage: SweepStage::UnitInfo,
            outstanding: 0,
            candidates: BTreeMap::new(),
            reserved: Vec::new(),
            in_flight: Vec::new(),
        }
    }

    pub fn stage(&self) -> SweepStage {
        self.stage
    }

    /// Requests issued and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Run discovery and all three stages. Never fails: anything that goes
    /// wrong shrinks the result.
    pub async fn run(mut self) -> ProvisionalTopology {
        let port = self.point.port_guid;
        let coordinator = QueryCoordinator::new(
            self.ctx.transport.clone(),
            self.point,
            self.ctx.discovery_options,
        );
        let Some(raw) = coordinator.discover().await else {
            return ProvisionalTopology::default();
        };

        match CandidateBuilder::new(&self.ctx.pools, self.point).build(raw) {
            Ok(candidates) => self.candidates = candidates,
            Err(e) => {
                warn!("Port {}: {}, sweep {} abandoned", port, e, self.generation);
                return ProvisionalTopology::default();
            }
        }

        self.unit_info_stage().await;
        self.advance(SweepStage::ControllerProfile);
        self.controller_profile_stage().await;
        self.advance(SweepStage::ServiceEntries);
        self.service_entry_stage().await;
        self.advance(SweepStage::Complete);

        debug!(
            "Port {}: sweep {} complete with {} units",
            port,
            self.generation,
            self.candidates.len()
        );
        ProvisionalTopology::new(std::mem::take(&mut self.candidates))
    }

    fn advance(&mut self, next: SweepStage) {
        debug_assert!(next > self.stage, "stage {} -> {}", self.stage, next);
        debug_assert_eq!(self.outstanding, 0, "stage {} left requests behind", self.stage);
        debug!(
            "Port {}: sweep {} {} -> {} ({} units)",
            self.point.port_guid,
            self.generation,
            self.stage,
            next,
            self.candidates.len()
        );
        self.stage = next;
    }

    /// Release every unit `keep` rejects.
    fn drop_units<F: FnMut(&Unit) -> bool>(&mut self, reason: &str, mut keep: F) {
        let pools = &self.ctx.pools;
        let port = self.point.port_guid;
        self.candidates.retain(|key, unit| {
            if keep(unit) {
                return true;
            }
            debug!("Port {}: unit {} dropped ({})", port, key, reason);
            pools.release_unit(std::mem::take(unit));
            false
        });
    }

    async fn unit_info_stage(&mut self) {
        let port = self.point.port_guid;
        let mut tasks = JoinSet::new();
        for (key, unit) in &self.candidates {
            let key = *key;
            let order = unit.failover_order();
            let transport = self.ctx.transport.clone();
            let options = self.ctx.request_options;
            tasks.spawn(async move {
                let result = request_unit_info(transport.as_ref(), port, &order, options).await;
                (key, result)
            });
            self.outstanding += 1;
        }

        while let Some(joined) = tasks.join_next().await {
            self.outstanding -= 1;
            let (key, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!("Port {}: unit-info task failed: {}", port, e);
                    continue;
                }
            };
            let Some(unit) = self.candidates.get_mut(&key) else {
                continue;
            };
            match result {
                Ok((info, path)) => {
                    trace!("Port {}: unit {} answered over {}", port, key, path);
                    unit.info = Some(info);
                    unit.preferred_path = Some(path);
                }
                Err(e) => warn!("Port {}: unit {} unit-info failed: {}", port, key, e),
            }
        }

        self.drop_units("no unit info", |unit| unit.info.is_some());
    }

    async fn controller_profile_stage(&mut self) {
        let port = self.point.port_guid;
        let mut tasks = JoinSet::new();
        let mut issued = 0usize;

        'units: for (key, unit) in &self.candidates {
            let (Some(info), Some(path)) = (&unit.info, unit.config_path()) else {
                continue;
            };
            for slot in info.installed_slots() {
                match self.ctx.pools.controllers.acquire() {
                    Ok(record) => self.reserved.push(record),
                    Err(e) if issued == 0 => {
                        warn!("Port {}: {}, controller stage abandoned", port, e);
                        break 'units;
                    }
                    Err(e) => {
                        warn!("Port {}: unit {} slot {}: {}", port, key, slot, e);
                        continue;
                    }
                }
                let key = *key;
                let transport = self.ctx.transport.clone();
                let options = self.ctx.request_options;
                tasks.spawn(async move {
                    let result =
                        request_profile(transport.as_ref(), port, &path, slot, options).await;
                    (key, slot, result)
                });
                issued += 1;
                self.outstanding += 1;
            }
        }

        while let Some(joined) = tasks.join_next().await {
            self.outstanding -= 1;
            let Some(mut record) = self.reserved.pop() else {
                warn!("Port {}: controller profile joined without a reserved record", port);
                continue;
            };
            let (key, slot, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!("Port {}: controller task failed: {}", port, e);
                    self.ctx.pools.controllers.release(record);
                    continue;
                }
            };
            let profile = match result {
                Ok(profile) => profile,
                Err(e) => {
                    warn!("Port {}: unit {} slot {} profile failed: {}", port, key, slot, e);
                    self.ctx.pools.controllers.release(record);
                    continue;
                }
            };
            let Some(unit) = self.candidates.get_mut(&key) else {
                self.ctx.pools.controllers.release(record);
                continue;
            };
            if profile.service_entry_count == 0 {
                debug!("Port {}: unit {} slot {} declares no services", port, key, slot);
                self.ctx.pools.controllers.release(record);
                continue;
            }
            if unit.controllers.contains_key(&profile.guid) {
                warn!("Port {}: unit {} reports controller {} twice", port, key, profile.guid);
                self.ctx.pools.controllers.release(record);
                continue;
            }
            record.attach(key, slot, profile);
            unit.controllers.insert(record.guid(), record);
        }

        self.drop_units("no controllers", |unit| !unit.controllers.is_empty());
    }

    async fn service_entry_stage(&mut self) {
        let port = self.point.port_guid;
        let mut tasks = JoinSet::new();

        for (key, unit) in self.candidates.iter_mut() {
            let Some(path) = unit.config_path() else {
                continue;
            };
            for (_, controller) in std::mem::take(&mut unit.controllers) {
                let slot = controller.slot;
                let declared = controller.profile.service_entry_count;
                let shared: SharedController = Arc::new(Mutex::new(controller));
                for (first, last) in entry_blocks(declared) {
                    let shared = shared.clone();
                    let transport = self.ctx.transport.clone();
                    let options = self.ctx.request_options;
                    let request = DeviceRequest::ServiceEntries { slot, first, last };
                    tasks.spawn(async move {
                        let result =
                            transport.request_response(port, &path, request, options).await;
                        let stored = match result {
                            Ok(DeviceResponse::ServiceEntries(block)) => {
                                Ok(shared.lock().store_block(first, last, block))
                            }
                            Ok(other) => Err(TransportError::Protocol(format!(
                                "expected service entries, got {}",
                                other.kind()
                            ))),
                            Err(e) => Err(e),
                        };
                        (request, stored)
                    });
                    self.outstanding += 1;
                }
                self.in_flight.push((*key, shared));
            }
        }

        while let Some(joined) = tasks.join_next().await {
            self.outstanding -= 1;
            match joined {
                Ok((request, Ok(stored))) => {
                    trace!("Port {}: {} stored {}", port, request, stored)
                }
                Ok((request, Err(e))) => warn!("Port {}: {} failed: {}", port, request, e),
                Err(e) => warn!("Port {}: service-entry task failed: {}", port, e),
            }
        }

        // Every request has released its reference
        for (key, shared) in std::mem::take(&mut self.in_flight) {
            let controller = match Arc::try_unwrap(shared) {
                Ok(controller) => controller.into_inner(),
                Err(_) => {
                    warn!("Port {}: unit {} controller still referenced, dropped", port, key);
                    self.ctx.pools.controllers.forget();
                    continue;
                }
            };
            let complete = controller.is_complete();
            match self.candidates.get_mut(&key) {
                Some(unit) if complete => {
                    unit.controllers.insert(controller.guid(), controller);
                }
                _ => {
                    if !complete {
                        warn!(
                            "Port {}: unit {} controller {} incomplete ({}/{} entries)",
                            port,
                            key,
                            controller.guid(),
                            controller.valid_entries(),
                            controller.declared_entries()
                        );
                    }
                    self.ctx.pools.controllers.release(controller);
                }
            }
        }

        self.drop_units("no complete controllers", |unit| !unit.controllers.is_empty());
    }
}

impl Drop for PortSweep {
    fn drop(&mut self) {
        // Only non-empty when the sweep was cancelled mid-stage
        let pools = &self.ctx.pools;
        for (_, unit) in std::mem::take(&mut self.candidates) {
            pools.release_unit(unit);
        }
        for record in self.reserved.drain(..) {
            pools.controllers.release(record);
        }
        for (_, shared) in std::mem::take(&mut self.in_flight) {
            match Arc::try_unwrap(shared) {
                Ok(controller) => pools.controllers.release(controller.into_inner()),
                Err(_) => pools.controllers.forget(),
            }
        }
    }
}

/// Unit-info request, trying each path in turn while requests time out.
async fn request_unit_info(
    transport: &dyn FabricTransport,
    port: PortGuid,
    paths: &[PathRecord],
    options: QueryOptions,
) -> Result<(UnitInfo, PathRecord), TransportError> {
    let mut last = TransportError::Unreachable("no path".into());
    for path in paths {
        match transport
            .request_response(port, path, DeviceRequest::UnitInfo, options)
            .await
        {
            Ok(DeviceResponse::UnitInfo(info)) => return Ok((info, *path)),
            Ok(other) => {
                return Err(TransportError::Protocol(format!(
                    "expected unit info, got {}",
                    other.kind()
                )))
            }
            Err(TransportError::Timeout) => {
                debug!("Port {}: unit-info timed out over {}, failing over", port, path);
                last = TransportError::Timeout;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last)
}

async fn request_profile(
    transport: &dyn FabricTransport,
    port: PortGuid,
    path: &PathRecord,
    slot: u8,
    options: QueryOptions,
) -> Result<ControllerProfile, TransportError> {
    match transport
        .request_response(port, path, DeviceRequest::ControllerProfile { slot }, options)
        .await?
    {
        DeviceResponse::ControllerProfile(profile) => Ok(profile),
        other => Err(TransportError::Protocol(format!(
            "expected controller profile, got {}",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::model::{CaGuid, ControllerGuid, ServiceEntry, UnitGuid};
    use crate::transport::{FabricDescription, SimController, SimUnit, SimulatedFabric};
    use crate::transport::sim::SimPort;

    fn point() -> AttachmentPoint {
        AttachmentPoint {
            ca_guid: CaGuid(1),
            port_guid: PortGuid(0x11),
            port_number: 1,
            lid: 1,
        }
    }

    fn controller(guid: u64, slot: u8, entries: u16) -> SimController {
        SimController {
            slot,
            profile: ControllerProfile {
                guid: ControllerGuid(guid),
                service_entry_count: entries as u8,
                ..Default::default()
            },
            service_entries: (0..entries)
                .map(|i| ServiceEntry {
                    name: format!("svc.{}", i),
                    id: u64::from(i),
                })
                .collect(),
            ..Default::default()
        }
    }

    fn sim(units: Vec<SimUnit>) -> Arc<SimulatedFabric> {
        Arc::new(
            SimulatedFabric::new(FabricDescription {
                ports: vec![SimPort {
                    point: point(),
                    fail_queries: false,
                }],
                units,
            })
            .expect("fabric"),
        )
    }

    fn context(fabric: Arc<SimulatedFabric>, pools: PoolConfig) -> SweepContext {
        let config = EngineConfig {
            pool: pools,
            ..Default::default()
        };
        let pools = Arc::new(Pools::new(&config.pool));
        SweepContext::new(&config, fabric, pools)
    }

    fn key(guid: u64) -> UnitKey {
        UnitKey::new(CaGuid(1), UnitGuid(guid))
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_pipeline() {
        let fabric = sim(vec![SimUnit {
            guid: UnitGuid(0x100),
            lids: vec![0x20],
            controllers: vec![controller(0x500, 1, 9), controller(0x501, 2, 1)],
            ..Default::default()
        }]);
        let ctx = context(fabric.clone(), PoolConfig::default());
        let pools = ctx.pools.clone();

        let provisional = PortSweep::new(ctx, point(), 1).run().await;
        let unit = &provisional.units[&key(0x100)];
        assert_eq!(unit.controllers.len(), 2);
        let big = &unit.controllers[&ControllerGuid(0x500)];
        assert!(big.is_complete());
        assert_eq!(big.valid_entries(), 9);

        // 9 entries take three blocks, 1 entry takes one
        assert_eq!(fabric.counters().service_entries, 4);
        assert_eq!(fabric.counters().controller_profile, 2);

        provisional.release(&pools);
        assert_eq!(pools.controllers.in_use(), 0);
        assert_eq!(pools.units.in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_info_fails_over_on_timeout() {
        let fabric = sim(vec![SimUnit {
            guid: UnitGuid(0x100),
            lids: vec![0x20, 0x21],
            timed_out_lids: vec![0x20],
            controllers: vec![controller(0x500, 1, 2)],
            ..Default::default()
        }]);
        let ctx = context(fabric.clone(), PoolConfig::default());

        let provisional = PortSweep::new(ctx, point(), 1).run().await;
        let unit = &provisional.units[&key(0x100)];
        assert_eq!(unit.preferred_path.map(|p| p.dlid), Some(0x21));
        assert_eq!(fabric.counters().unit_info, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_unit_dropped() {
        let fabric = sim(vec![
            SimUnit {
                guid: UnitGuid(0x100),
                lids: vec![0x20, 0x21],
                unresponsive: true,
                controllers: vec![controller(0x500, 1, 2)],
                ..Default::default()
            },
            SimUnit {
                guid: UnitGuid(0x101),
                lids: vec![0x30],
                controllers: vec![controller(0x510, 1, 2)],
                ..Default::default()
            },
        ]);
        let ctx = context(fabric.clone(), PoolConfig::default());
        let pools = ctx.pools.clone();

        let provisional = PortSweep::new(ctx, point(), 1).run().await;
        assert_eq!(provisional.units.keys().copied().collect::<Vec<_>>(), vec![key(0x101)]);
        // Both paths were tried before giving up
        assert_eq!(fabric.counters().unit_info, 3);
        provisional.release(&pools);
        assert_eq!(pools.paths.in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_controller_dropped() {
        let mut partial = controller(0x501, 2, 4);
        partial.missing_entries = vec![3];
        let fabric = sim(vec![SimUnit {
            guid: UnitGuid(0x100),
            lids: vec![0x20],
            controllers: vec![controller(0x500, 1, 4), partial],
            ..Default::default()
        }]);
        let ctx = context(fabric, PoolConfig::default());
        let pools = ctx.pools.clone();

        let provisional = PortSweep::new(ctx, point(), 1).run().await;
        let unit = &provisional.units[&key(0x100)];
        assert_eq!(
            unit.controllers.keys().copied().collect::<Vec<_>>(),
            vec![ControllerGuid(0x500)]
        );
        assert_eq!(pools.controllers.in_use(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_entry_controller_dropped_with_unit() {
        let fabric = sim(vec![SimUnit {
            guid: UnitGuid(0x100),
            lids: vec![0x20],
            controllers: vec![controller(0x500, 1, 0)],
            ..Default::default()
        }]);
        let ctx = context(fabric.clone(), PoolConfig::default());
        let pools = ctx.pools.clone();

        let provisional = PortSweep::new(ctx, point(), 1).run().await;
        assert!(provisional.is_empty());
        assert_eq!(fabric.counters().service_entries, 0);
        assert_eq!(pools.units.in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_pool_exhaustion_abandons_stage() {
        let fabric = sim(vec![SimUnit {
            guid: UnitGuid(0x100),
            lids: vec![0x20],
            controllers: vec![controller(0x500, 1, 2)],
            ..Default::default()
        }]);
        let ctx = context(
            fabric.clone(),
            PoolConfig {
                max_controllers: 1,
                ..Default::default()
            },
        );
        let pools = ctx.pools.clone();
        let held = pools.controllers.acquire().expect("hold");

        let provisional = PortSweep::new(ctx, point(), 1).run().await;
        assert!(provisional.is_empty());
        assert_eq!(fabric.counters().controller_profile, 0);
        assert_eq!(pools.units.in_use(), 0);
        pools.controllers.release(held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_sweep_returns_records() {
        let fabric = sim(vec![SimUnit {
            guid: UnitGuid(0x100),
            lids: vec![0x20],
            controllers: vec![controller(0x500, 1, 2)],
            ..Default::default()
        }]);
        fabric.set_latency(std::time::Duration::from_secs(5));
        let ctx = context(fabric, PoolConfig::default());
        let pools = ctx.pools.clone();

        let sweep = PortSweep::new(ctx, point(), 1);
        let result = tokio::time::timeout(std::time::Duration::from_secs(7), sweep.run()).await;
        assert!(result.is_err());
        assert_eq!(pools.units.in_use(), 0);
        assert_eq!(pools.paths.in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_during_profiles_returns_controllers() {
        let fabric = sim(vec![SimUnit {
            guid: UnitGuid(0x100),
            lids: vec![0x20],
            controllers: vec![controller(0x500, 1, 2), controller(0x501, 2, 2)],
            ..Default::default()
        }]);
        // Discovery ends at 10s, unit info at 20s, profiles would answer at 30s
        fabric.set_latency(std::time::Duration::from_secs(10));
        let ctx = context(fabric.clone(), PoolConfig::default());
        let pools = ctx.pools.clone();

        let sweep = PortSweep::new(ctx, point(), 1);
        let result = tokio::time::timeout(std::time::Duration::from_secs(25), sweep.run()).await;
        assert!(result.is_err());
        assert_eq!(fabric.counters().controller_profile, 2);
        assert_eq!(pools.units.in_use(), 0);
        assert_eq!(pools.paths.in_use(), 0);
        assert_eq!(pools.controllers.in_use(), 0);
    }
}
