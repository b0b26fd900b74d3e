// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event payloads delivered to subscribers.

use crate::model::{
    ChassisGuid, Controller, ControllerGuid, ControllerProfile, PathRecord, PortGuid,
    ServiceEntry, Unit, UnitKey,
};
use std::fmt;

/// Unit added/removed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitEvent {
    pub unit: UnitKey,
    pub chassis_guid: ChassisGuid,
    pub chassis_slot: u8,
    pub vendor_id: u32,
    pub device_id: u16,
    pub revision: u32,
    pub description: String,
}

impl From<&Unit> for UnitEvent {
    fn from(unit: &Unit) -> Self {
        Self {
            unit: unit.key,
            chassis_guid: unit.chassis_guid,
            chassis_slot: unit.chassis_slot,
            vendor_id: unit.vendor_id,
            device_id: unit.device_id,
            revision: unit.revision,
            description: unit.description.clone(),
        }
    }
}

/// Controller added/removed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerEvent {
    pub unit: UnitKey,
    pub slot: u8,
    pub profile: ControllerProfile,
    pub service_entries: Vec<ServiceEntry>,
}

impl ControllerEvent {
    pub fn guid(&self) -> ControllerGuid {
        self.profile.guid
    }
}

impl From<&Controller> for ControllerEvent {
    fn from(controller: &Controller) -> Self {
        Self {
            unit: controller.unit,
            slot: controller.slot,
            profile: controller.profile.clone(),
            service_entries: controller.service_entries(),
        }
    }
}

/// Path added/removed payload.
///
/// `controller` is `None` for unit-scoped path events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathEvent {
    pub unit: UnitKey,
    pub controller: Option<ControllerGuid>,
    pub port_guid: PortGuid,
    pub path: PathRecord,
}

/// One topology change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    UnitAdded(UnitEvent),
    UnitRemoved(UnitEvent),
    ControllerAdded(ControllerEvent),
    ControllerRemoved(ControllerEvent),
    PathAdded(PathEvent),
    PathRemoved(PathEvent),
}

impl DiscoveryEvent {
    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            Self::UnitRemoved(_) | Self::ControllerRemoved(_) | Self::PathRemoved(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnitAdded(_) => "unit-added",
            Self::UnitRemoved(_) => "unit-removed",
            Self::ControllerAdded(_) => "controller-added",
            Self::ControllerRemoved(_) => "controller-removed",
            Self::PathAdded(_) => "path-added",
            Self::PathRemoved(_) => "path-removed",
        }
    }

    /// Unit the event belongs to.
    pub fn unit(&self) -> UnitKey {
        match self {
            Self::UnitAdded(e) | Self::UnitRemoved(e) => e.unit,
            Self::ControllerAdded(e) | Self::ControllerRemoved(e) => e.unit,
            Self::PathAdded(e) | Self::PathRemoved(e) => e.unit,
        }
    }
}

impl fmt::Display for DiscoveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnitAdded(e) | Self::UnitRemoved(e) => {
                write!(f, "{} {} \"{}\"", self.kind(), e.unit, e.description)
            }
            Self::ControllerAdded(e) | Self::ControllerRemoved(e) => write!(
                f,
                "{} {} slot {} ioc {} ({} entries)",
                self.kind(),
                e.unit,
                e.slot,
                e.profile.guid,
                e.service_entries.len()
            ),
            Self::PathAdded(e) | Self::PathRemoved(e) => {
                write!(f, "{} {}", self.kind(), e.unit)?;
                if let Some(controller) = e.controller {
                    write!(f, " ioc {}", controller)?;
                }
                write!(f, " via {} [{}]", e.port_guid, e.path)
            }
        }
    }
}
