// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery data model.
//!
//! Identifiers, the wire-level path descriptor, and the records a sweep
//! builds: units (IOUs), the controllers (IOCs) they host, and the paths
//! through which a local attachment point reaches them.
//!
//! All map keys are plain ordered value types, so every topology map is a
//! `BTreeMap` with a conventional comparator and iteration order is stable
//! across sweeps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

macro_rules! guid_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Default,
            Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#018x}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

guid_type!(
    /// Local channel adapter GUID. Units are keyed per adapter, so a unit
    /// reached through two ports of the same adapter is one unit.
    CaGuid
);
guid_type!(
    /// Local port GUID (one attachment point).
    PortGuid
);
guid_type!(
    /// Remote I/O unit GUID.
    UnitGuid
);
guid_type!(
    /// Chassis GUID reported by the unit.
    ChassisGuid
);
guid_type!(
    /// I/O controller GUID from the controller profile.
    ControllerGuid
);

/// Link-local subnet prefix used when a GID is derived from a port GUID.
pub const DEFAULT_SUBNET_PREFIX: u64 = 0xfe80_0000_0000_0000;

/// 128-bit global identifier (subnet prefix + interface id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    /// Build a GID from a subnet prefix and an interface GUID.
    pub fn new(prefix: u64, interface_id: u64) -> Self {
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&prefix.to_be_bytes());
        raw[8..].copy_from_slice(&interface_id.to_be_bytes());
        Self(raw)
    }

    /// Link-local GID for an interface GUID.
    pub fn link_local(interface_id: u64) -> Self {
        Self::new(DEFAULT_SUBNET_PREFIX, interface_id)
    }

    pub fn interface_id(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.0[8..]);
        u64::from_be_bytes(raw)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pair) in self.0.chunks(2).enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}{:02x}", pair[0], pair[1])?;
        }
        Ok(())
    }
}

/// A local point of presence on the fabric (one local port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPoint {
    /// Owning channel adapter
    pub ca_guid: CaGuid,
    /// Port GUID
    pub port_guid: PortGuid,
    /// Port number on the adapter (1-based)
    #[serde(default = "default_port_number")]
    pub port_number: u8,
    /// Port LID assigned by the subnet manager
    pub lid: u16,
}

fn default_port_number() -> u8 {
    1
}

impl AttachmentPoint {
    pub fn gid(&self) -> Gid {
        Gid::link_local(self.port_guid.0)
    }
}

impl fmt::Display for AttachmentPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port_guid, self.port_number)
    }
}

/// Unit identity: (local adapter, unit GUID). Sole key of every unit map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct UnitKey {
    pub ca_guid: CaGuid,
    pub unit_guid: UnitGuid,
}

impl UnitKey {
    pub fn new(ca_guid: CaGuid, unit_guid: UnitGuid) -> Self {
        Self { ca_guid, unit_guid }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.unit_guid, self.ca_guid)
    }
}

/// Wire-level path descriptor.
///
/// The whole descriptor is the path identity. Field order defines the map
/// order, which is also the failover order for unit-info requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PathRecord {
    pub dlid: u16,
    pub slid: u16,
    pub dgid: Gid,
    pub sgid: Gid,
    pub service_level: u8,
    pub pkey: u16,
    pub mtu: u8,
    pub rate: u8,
    pub packet_lifetime: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
    pub flow_label: u32,
}

impl fmt::Display for PathRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lid {:#06x} -> {:#06x} sl {} pkey {:#06x}",
            self.slid, self.dlid, self.service_level, self.pkey
        )
    }
}

/// One entry of a "units on fabric" discovery result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UnitRecord {
    pub guid: UnitGuid,
    /// Destination address the unit answered on (used to associate paths)
    pub lid: u16,
    pub chassis_guid: ChassisGuid,
    pub chassis_slot: u8,
    pub vendor_id: u32,
    pub device_id: u16,
    pub revision: u32,
    pub description: String,
}

/// Per-slot state advertised in the unit profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    #[default]
    Empty,
    Installed,
    Unavailable,
}

/// Unit profile (stage 1 response).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UnitInfo {
    pub change_id: u16,
    pub max_controllers: u8,
    pub diag_device_id: bool,
    pub option_rom: bool,
    /// Slot states, index 0 is slot 1
    pub slots: Vec<SlotStatus>,
}

impl UnitInfo {
    /// Slot numbers (1-based) marked installed, bounded by `max_controllers`.
    pub fn installed_slots(&self) -> impl Iterator<Item = u8> + '_ {
        self.slots
            .iter()
            .take(self.max_controllers as usize)
            .enumerate()
            .filter(|(_, status)| **status == SlotStatus::Installed)
            .map(|(index, _)| (index + 1) as u8)
    }
}

/// Controller profile (stage 2 response).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerProfile {
    pub guid: ControllerGuid,
    pub vendor_id: u32,
    pub device_id: u32,
    pub device_version: u16,
    pub subsystem_vendor_id: u32,
    pub subsystem_id: u32,
    pub io_class: u16,
    pub io_subclass: u16,
    pub protocol: u16,
    pub protocol_version: u16,
    pub send_queue_depth: u16,
    pub rdma_read_depth: u8,
    pub send_message_size: u32,
    pub rdma_transfer_size: u32,
    pub controller_ops: u8,
    /// Number of service entries the controller declares
    pub service_entry_count: u8,
    pub id_string: String,
}

/// One upper-layer service offered by a controller.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub id: u64,
}

/// A path to a unit, tagged with the local port that discovered it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Path {
    pub record: PathRecord,
    pub port_guid: PortGuid,
}

impl Path {
    pub fn new(record: PathRecord, port_guid: PortGuid) -> Self {
        Self { record, port_guid }
    }
}

/// A discovered I/O controller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Controller {
    /// Owning unit; always equals the key of the unit map holding this record
    pub unit: UnitKey,
    pub slot: u8,
    pub profile: ControllerProfile,
    /// Entry buffer sized to the declared count, filled block by block
    entries: Vec<Option<ServiceEntry>>,
    valid_entries: usize,
}

impl Controller {
    /// Attach a stage 2 profile and size the entry buffer.
    pub fn attach(&mut self, unit: UnitKey, slot: u8, profile: ControllerProfile) {
        self.unit = unit;
        self.slot = slot;
        self.entries = vec![None; profile.service_entry_count as usize];
        self.valid_entries = 0;
        self.profile = profile;
    }

    pub fn guid(&self) -> ControllerGuid {
        self.profile.guid
    }

    pub fn declared_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn valid_entries(&self) -> usize {
        self.valid_entries
    }

    /// Store one block response starting at `first`. Returns how many
    /// previously empty slots were filled. Entries past `last` or past the
    /// declared count are ignored.
    pub fn store_block(&mut self, first: u16, last: u16, block: Vec<ServiceEntry>) -> usize {
        let span = usize::from(last.saturating_sub(first)) + 1;
        let mut stored = 0;
        for (offset, entry) in block.into_iter().take(span).enumerate() {
            let index = usize::from(first) + offset;
            if let Some(slot @ None) = self.entries.get_mut(index) {
                *slot = Some(entry);
                stored += 1;
            }
        }
        self.valid_entries += stored;
        stored
    }

    /// All declared entries arrived.
    pub fn is_complete(&self) -> bool {
        self.valid_entries > 0 && self.valid_entries == self.entries.len()
    }

    pub fn service_entries(&self) -> Vec<ServiceEntry> {
        self.entries.iter().flatten().cloned().collect()
    }
}

/// A discovered I/O unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Unit {
    pub key: UnitKey,
    pub lid: u16,
    pub chassis_guid: ChassisGuid,
    pub chassis_slot: u8,
    pub vendor_id: u32,
    pub device_id: u16,
    pub revision: u32,
    pub description: String,
    /// Unit profile, populated by stage 1
    pub info: Option<UnitInfo>,
    pub controllers: BTreeMap<ControllerGuid, Controller>,
    pub paths: BTreeMap<PathRecord, Path>,
    /// Path used for every configuration request to this unit
    pub preferred_path: Option<PathRecord>,
    /// Consecutive sweeps that did not report this unit
    pub missed_sweeps: u32,
}

impl Unit {
    /// Fill a recycled record from a discovery result.
    pub fn populate(&mut self, ca_guid: CaGuid, record: &UnitRecord) {
        self.key = UnitKey::new(ca_guid, record.guid);
        self.lid = record.lid;
        self.chassis_guid = record.chassis_guid;
        self.chassis_slot = record.chassis_slot;
        self.vendor_id = record.vendor_id;
        self.device_id = record.device_id;
        self.revision = record.revision;
        self.description.clone_from(&record.description);
    }

    /// Copy descriptive attributes (not maps) from a fresher record.
    pub fn refresh_from(&mut self, fresh: &Unit) {
        self.lid = fresh.lid;
        self.chassis_guid = fresh.chassis_guid;
        self.chassis_slot = fresh.chassis_slot;
        self.vendor_id = fresh.vendor_id;
        self.device_id = fresh.device_id;
        self.revision = fresh.revision;
        self.description.clone_from(&fresh.description);
        self.info.clone_from(&fresh.info);
        if fresh.preferred_path.is_some() {
            self.preferred_path = fresh.preferred_path;
        }
    }

    /// Preferred path, falling back to the first known path.
    pub fn config_path(&self) -> Option<PathRecord> {
        self.preferred_path
            .filter(|record| self.paths.contains_key(record))
            .or_else(|| self.paths.keys().next().copied())
    }

    /// Paths in the order unit-info requests try them: the preferred path
    /// first, then the following ones in map order, wrapping around.
    pub fn failover_order(&self) -> Vec<PathRecord> {
        let Some(start) = self.config_path() else {
            return Vec::new();
        };
        self.paths
            .range(start..)
            .chain(self.paths.range(..start))
            .map(|(record, _)| *record)
            .collect()
    }
}
