// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory simulated fabric.
//!
//! Serves discovery queries and device requests from a [`FabricDescription`]
//! that can be loaded from JSON and mutated at runtime. Faults are injected
//! per port (failing fan-out queries), per destination lid (timeouts), per
//! controller slot (profile timeouts) and per service entry (entries that
//! never arrive).
//!
//! ```json
//! {
//!   "ports": [{ "ca_guid": 1, "port_guid": 17, "lid": 1 }],
//!   "units": [{
//!     "guid": 4096, "lids": [32], "description": "shelf-a",
//!     "controllers": [{
//!       "slot": 1,
//!       "profile": { "guid": 8192, "service_entry_count": 2 },
//!       "service_entries": [{ "name": "srp.0", "id": 1 }, { "name": "srp.1", "id": 2 }]
//!     }]
//!   }]
//! }
//! ```

use super::{
    DeviceRequest, DeviceResponse, DiscoveryQuery, DiscoveryResult, FabricTransport, QueryOptions,
};
use crate::config::ConfigError;
use crate::error::{DiscoveryError, TransportError};
use crate::model::{
    AttachmentPoint, ChassisGuid, ControllerProfile, Gid, PathRecord, PortGuid, ServiceEntry,
    SlotStatus, UnitGuid, UnitInfo, UnitRecord,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// Management status returned for a slot with no controller.
const STATUS_NO_CONTROLLER: u16 = 0x0300;
/// Management status returned by a port whose fan-out queries fail.
const STATUS_QUERY_FAILED: u16 = 0x0c00;

/// A local port of the simulated host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimPort {
    #[serde(flatten)]
    pub point: AttachmentPoint,

    /// Fan-out discovery queries from this port fail
    #[serde(default)]
    pub fail_queries: bool,
}

/// A controller hosted by a simulated unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimController {
    /// Slot number (1-based)
    pub slot: u8,

    pub profile: ControllerProfile,

    #[serde(default)]
    pub service_entries: Vec<ServiceEntry>,

    /// Profile requests for this slot time out
    #[serde(default)]
    pub profile_timeout: bool,

    /// Entry indices that never arrive; a block response is cut short at
    /// the first missing index
    #[serde(default)]
    pub missing_entries: Vec<u16>,
}

/// A remote unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimUnit {
    pub guid: UnitGuid,

    /// Destination lids the unit answers on, one units-query record each
    pub lids: Vec<u16>,

    /// Local ports that can reach the unit (empty = every port)
    #[serde(default)]
    pub reachable_from: Vec<PortGuid>,

    /// Service levels offered per lid, one path each (empty = `[0]`)
    #[serde(default)]
    pub service_levels: Vec<u8>,

    #[serde(default)]
    pub chassis_guid: ChassisGuid,

    #[serde(default)]
    pub chassis_slot: u8,

    #[serde(default)]
    pub vendor_id: u32,

    #[serde(default)]
    pub device_id: u16,

    #[serde(default)]
    pub revision: u32,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub change_id: u16,

    /// Advertised slot count; raised to the highest controller slot
    #[serde(default)]
    pub max_controllers: u8,

    /// Every request sent to one of these lids times out
    #[serde(default)]
    pub timed_out_lids: Vec<u16>,

    /// Every request to the unit times out
    #[serde(default)]
    pub unresponsive: bool,

    #[serde(default)]
    pub controllers: Vec<SimController>,
}

impl SimUnit {
    fn reachable(&self, port: PortGuid) -> bool {
        self.reachable_from.is_empty() || self.reachable_from.contains(&port)
    }

    fn service_levels(&self) -> &[u8] {
        if self.service_levels.is_empty() {
            &[0]
        } else {
            &self.service_levels
        }
    }

    fn unit_info(&self) -> UnitInfo {
        let highest = self.controllers.iter().map(|c| c.slot).max().unwrap_or(0);
        let max_controllers = self.max_controllers.max(highest);
        let mut slots = vec![SlotStatus::Empty; max_controllers as usize];
        for controller in &self.controllers {
            if let Some(status) = controller
                .slot
                .checked_sub(1)
                .and_then(|index| slots.get_mut(index as usize))
            {
                *status = SlotStatus::Installed;
            }
        }
        UnitInfo {
            change_id: self.change_id,
            max_controllers,
            diag_device_id: false,
            option_rom: false,
            slots,
        }
    }

    fn record(&self, lid: u16) -> UnitRecord {
        UnitRecord {
            guid: self.guid,
            lid,
            chassis_guid: self.chassis_guid,
            chassis_slot: self.chassis_slot,
            vendor_id: self.vendor_id,
            device_id: self.device_id,
            revision: self.revision,
            description: self.description.clone(),
        }
    }

    /// Every path record from `port` to this unit, in report order.
    pub fn paths_from(&self, port: &AttachmentPoint) -> Vec<PathRecord> {
        if !self.reachable(port.port_guid) {
            return Vec::new();
        }
        let mut paths = Vec::new();
        for &lid in &self.lids {
            for &sl in self.service_levels() {
                paths.push(path_record(port, self.guid, lid, sl));
            }
        }
        paths
    }
}

/// Path record the simulated subnet reports from `port` to `lid`.
pub fn path_record(
    port: &AttachmentPoint,
    unit: UnitGuid,
    lid: u16,
    service_level: u8,
) -> PathRecord {
    PathRecord {
        dlid: lid,
        slid: port.lid,
        dgid: Gid::link_local(unit.0),
        sgid: port.gid(),
        service_level,
        pkey: 0xffff,
        mtu: 4,
        rate: 7,
        packet_lifetime: 18,
        hop_limit: 0,
        traffic_class: 0,
        flow_label: 0,
    }
}

/// Serializable fabric description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FabricDescription {
    #[serde(default)]
    pub ports: Vec<SimPort>,

    #[serde(default)]
    pub units: Vec<SimUnit>,
}

impl FabricDescription {
    /// Reject descriptions the simulator cannot serve consistently.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        for (i, unit) in self.units.iter().enumerate() {
            if unit.lids.is_empty() {
                return Err(DiscoveryError::Fabric(format!(
                    "unit {} has no lids",
                    unit.guid
                )));
            }
            if self.units[..i].iter().any(|other| other.guid == unit.guid) {
                return Err(DiscoveryError::Fabric(format!(
                    "duplicate unit {}",
                    unit.guid
                )));
            }
            if unit.controllers.iter().any(|c| c.slot == 0) {
                return Err(DiscoveryError::Fabric(format!(
                    "unit {} has a controller in slot 0",
                    unit.guid
                )));
            }
        }
        for (i, port) in self.ports.iter().enumerate() {
            if self.ports[..i]
                .iter()
                .any(|other| other.point.port_guid == port.point.port_guid)
            {
                return Err(DiscoveryError::Fabric(format!(
                    "duplicate port {}",
                    port.point.port_guid
                )));
            }
        }
        Ok(())
    }
}

/// Request counters, by request kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestCounters {
    pub discovery_queries: u64,
    pub unit_info: u64,
    pub controller_profile: u64,
    pub service_entries: u64,
    pub timeouts: u64,
}

#[derive(Default)]
struct Counters {
    discovery_queries: AtomicU64,
    unit_info: AtomicU64,
    controller_profile: AtomicU64,
    service_entries: AtomicU64,
    timeouts: AtomicU64,
}

/// Outcome computed under the lock, acted on after it is released.
enum Outcome<T> {
    Ready(Result<T, TransportError>),
    TimedOut,
}

/// Simulated fabric transport.
pub struct SimulatedFabric {
    fabric: Mutex<FabricDescription>,
    latency: Mutex<Duration>,
    counters: Counters,
}

impl SimulatedFabric {
    pub fn new(fabric: FabricDescription) -> Result<Self, DiscoveryError> {
        fabric.validate()?;
        Ok(Self {
            fabric: Mutex::new(fabric),
            latency: Mutex::new(Duration::ZERO),
            counters: Counters::default(),
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self, DiscoveryError> {
        let fabric: FabricDescription = serde_json::from_str(json).map_err(ConfigError::from)?;
        Self::new(fabric)
    }

    /// Load a JSON fabric description.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, DiscoveryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| DiscoveryError::Fabric(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&content)
    }

    /// Local attachment points of the simulated host.
    pub fn ports(&self) -> Vec<AttachmentPoint> {
        self.fabric.lock().ports.iter().map(|p| p.point).collect()
    }

    pub fn add_port(&self, point: AttachmentPoint) {
        self.fabric.lock().ports.push(SimPort {
            point,
            fail_queries: false,
        });
    }

    /// Add a unit, replacing any unit with the same GUID.
    pub fn add_unit(&self, unit: SimUnit) {
        let mut fabric = self.fabric.lock();
        fabric.units.retain(|u| u.guid != unit.guid);
        fabric.units.push(unit);
    }

    pub fn remove_unit(&self, guid: UnitGuid) -> bool {
        let mut fabric = self.fabric.lock();
        let before = fabric.units.len();
        fabric.units.retain(|u| u.guid != guid);
        fabric.units.len() != before
    }

    /// Mutate a unit in place. Returns false if it does not exist.
    pub fn update_unit<F: FnOnce(&mut SimUnit)>(&self, guid: UnitGuid, f: F) -> bool {
        let mut fabric = self.fabric.lock();
        match fabric.units.iter_mut().find(|u| u.guid == guid) {
            Some(unit) => {
                f(unit);
                true
            }
            None => false,
        }
    }

    /// Make every fan-out query from `port` fail (or succeed again).
    pub fn set_query_failure(&self, port: PortGuid, fail: bool) {
        let mut fabric = self.fabric.lock();
        for sim_port in fabric.ports.iter_mut().filter(|p| p.point.port_guid == port) {
            sim_port.fail_queries = fail;
        }
    }

    /// Delay added to every successful answer.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn counters(&self) -> RequestCounters {
        RequestCounters {
            discovery_queries: self.counters.discovery_queries.load(Ordering::Relaxed),
            unit_info: self.counters.unit_info.load(Ordering::Relaxed),
            controller_profile: self.counters.controller_profile.load(Ordering::Relaxed),
            service_entries: self.counters.service_entries.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }

    fn answer_query(
        &self,
        port: PortGuid,
        query: DiscoveryQuery,
    ) -> Result<DiscoveryResult, TransportError> {
        let fabric = self.fabric.lock();
        let sim_port = fabric
            .ports
            .iter()
            .find(|p| p.point.port_guid == port)
            .ok_or_else(|| TransportError::Unreachable(format!("no local port {}", port)))?;
        if sim_port.fail_queries {
            return Err(TransportError::Status(STATUS_QUERY_FAILED));
        }

        let reachable = fabric.units.iter().filter(|u| u.reachable(port));
        Ok(match query {
            DiscoveryQuery::Units { .. } => DiscoveryResult::Units(
                reachable
                    .flat_map(|unit| unit.lids.iter().map(move |&lid| unit.record(lid)))
                    .collect(),
            ),
            DiscoveryQuery::Paths => DiscoveryResult::Paths(
                reachable
                    .flat_map(|unit| unit.paths_from(&sim_port.point))
                    .collect(),
            ),
        })
    }

    fn answer_request(
        &self,
        port: PortGuid,
        path: &PathRecord,
        request: DeviceRequest,
    ) -> Outcome<DeviceResponse> {
        let fabric = self.fabric.lock();
        if !fabric.ports.iter().any(|p| p.point.port_guid == port) {
            return Outcome::Ready(Err(TransportError::Unreachable(format!(
                "no local port {}",
                port
            ))));
        }
        let Some(unit) = fabric
            .units
            .iter()
            .find(|u| u.reachable(port) && u.lids.contains(&path.dlid))
        else {
            return Outcome::Ready(Err(TransportError::Unreachable(format!(
                "no unit at lid {:#06x}",
                path.dlid
            ))));
        };
        if unit.unresponsive || unit.timed_out_lids.contains(&path.dlid) {
            return Outcome::TimedOut;
        }

        match request {
            DeviceRequest::UnitInfo => {
                Outcome::Ready(Ok(DeviceResponse::UnitInfo(unit.unit_info())))
            }
            DeviceRequest::ControllerProfile { slot } => {
                match unit.controllers.iter().find(|c| c.slot == slot) {
                    Some(controller) if controller.profile_timeout => Outcome::TimedOut,
                    Some(controller) => Outcome::Ready(Ok(DeviceResponse::ControllerProfile(
                        controller.profile.clone(),
                    ))),
                    None => Outcome::Ready(Err(TransportError::Status(STATUS_NO_CONTROLLER))),
                }
            }
            DeviceRequest::ServiceEntries { slot, first, last } => {
                let Some(controller) = unit.controllers.iter().find(|c| c.slot == slot) else {
                    return Outcome::Ready(Err(TransportError::Status(STATUS_NO_CONTROLLER)));
                };
                let block = (first..=last)
                    .take_while(|index| !controller.missing_entries.contains(index))
                    .map_while(|index| controller.service_entries.get(index as usize).cloned())
                    .collect();
                Outcome::Ready(Ok(DeviceResponse::ServiceEntries(block)))
            }
        }
    }

    async fn settle<T>(
        &self,
        outcome: Outcome<T>,
        options: QueryOptions,
    ) -> Result<T, TransportError> {
        match outcome {
            Outcome::Ready(result) => {
                let latency = *self.latency.lock();
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                result
            }
            Outcome::TimedOut => {
                // Every retry expires in turn
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(options.timeout * (options.retries + 1)).await;
                Err(TransportError::Timeout)
            }
        }
    }
}

#[async_trait]
impl FabricTransport for SimulatedFabric {
    async fn discovery_query(
        &self,
        port: PortGuid,
        query: DiscoveryQuery,
        options: QueryOptions,
    ) -> Result<DiscoveryResult, TransportError> {
        self.counters.discovery_queries.fetch_add(1, Ordering::Relaxed);
        trace!("sim: {:?} from port {}", query, port);
        let outcome = Outcome::Ready(self.answer_query(port, query));
        self.settle(outcome, options).await
    }

    async fn request_response(
        &self,
        port: PortGuid,
        path: &PathRecord,
        request: DeviceRequest,
        options: QueryOptions,
    ) -> Result<DeviceResponse, TransportError> {
        let counter = match request {
            DeviceRequest::UnitInfo => &self.counters.unit_info,
            DeviceRequest::ControllerProfile { .. } => &self.counters.controller_profile,
            DeviceRequest::ServiceEntries { .. } => &self.counters.service_entries,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        trace!("sim: {} to lid {:#06x} from port {}", request, path.dlid, port);
        let outcome = self.answer_request(port, path, request);
        self.settle(outcome, options).await
    }
}
