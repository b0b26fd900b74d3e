// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Authoritative and provisional topologies, and the merger.
//!
//! [`Topology::merge`] applies a [`TopologyDiff`] and returns the events it
//! implies, in delivery order. Within one unit the order is fixed:
//!
//! - new unit: unit, its paths, then each controller followed by its paths;
//! - retained unit: new paths, removed controllers, stale paths, new
//!   controllers (so a controller never exists without a path and a new
//!   controller is reported with the current path set);
//! - removed unit: its controllers, its paths, then the unit.

use crate::candidate::merge_paths;
use crate::diff::{TopologyDiff, UnitDelta};
use crate::event::{ControllerEvent, DiscoveryEvent, PathEvent, UnitEvent};
use crate::model::{Controller, ControllerGuid, Path, Unit, UnitKey};
use crate::pool::Pools;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Result of one sweep generation, built across attachment points.
#[derive(Debug, Default)]
pub struct ProvisionalTopology {
    pub units: BTreeMap<UnitKey, Unit>,
}

impl ProvisionalTopology {
    pub fn new(units: BTreeMap<UnitKey, Unit>) -> Self {
        Self { units }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Fold another port's result in. A unit seen through two ports keeps
    /// one record with the union of both path sets.
    pub fn absorb(&mut self, pools: &Pools, other: ProvisionalTopology) {
        for (key, mut unit) in other.units {
            match self.units.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(unit);
                }
                Entry::Occupied(mut slot) => {
                    let kept = slot.get_mut();
                    for (guid, controller) in std::mem::take(&mut unit.controllers) {
                        match kept.controllers.entry(guid) {
                            Entry::Vacant(slot) => {
                                slot.insert(controller);
                            }
                            Entry::Occupied(_) => pools.controllers.release(controller),
                        }
                    }
                    merge_paths(pools, kept, unit);
                }
            }
        }
    }

    /// Return every record to the pools.
    pub fn release(self, pools: &Pools) {
        for (_, unit) in self.units {
            pools.release_unit(unit);
        }
    }
}

/// Per-kind event counts of one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCounts {
    pub units_added: usize,
    pub units_removed: usize,
    pub controllers_added: usize,
    pub controllers_removed: usize,
    pub paths_added: usize,
    pub paths_removed: usize,
}

impl ChangeCounts {
    pub fn tally(events: &[DiscoveryEvent]) -> Self {
        let mut counts = Self::default();
        for event in events {
            match event {
                DiscoveryEvent::UnitAdded(_) => counts.units_added += 1,
                DiscoveryEvent::UnitRemoved(_) => counts.units_removed += 1,
                DiscoveryEvent::ControllerAdded(_) => counts.controllers_added += 1,
                DiscoveryEvent::ControllerRemoved(_) => counts.controllers_removed += 1,
                DiscoveryEvent::PathAdded(_) => counts.paths_added += 1,
                DiscoveryEvent::PathRemoved(_) => counts.paths_removed += 1,
            }
        }
        counts
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// What a merge changed.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Events in delivery order
    pub events: Vec<DiscoveryEvent>,
    pub counts: ChangeCounts,
}

/// The authoritative topology.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    units: BTreeMap<UnitKey, Unit>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn units(&self) -> &BTreeMap<UnitKey, Unit> {
        &self.units
    }

    pub fn unit(&self, key: &UnitKey) -> Option<&Unit> {
        self.units.get(key)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn controller_count(&self) -> usize {
        self.units.values().map(|u| u.controllers.len()).sum()
    }

    pub fn path_count(&self) -> usize {
        self.units.values().map(|u| u.paths.len()).sum()
    }

    /// Merge a completed provisional topology.
    ///
    /// A unit missing from `provisional` is removed once it has been missing
    /// for `missed_limit` consecutive merges.
    pub fn merge(
        &mut self,
        provisional: ProvisionalTopology,
        pools: &Pools,
        missed_limit: u32,
    ) -> MergeOutcome {
        let diff = TopologyDiff::compute(&self.units, &provisional.units);
        let mut fresh = provisional.units;
        let mut events = Vec::new();

        for key in &diff.removed_units {
            self.merge_missing(key, pools, missed_limit, &mut events);
        }

        for delta in &diff.retained {
            match fresh.remove(&delta.key) {
                Some(unit) => self.merge_retained(delta, unit, pools, &mut events),
                None => debug_assert!(false, "retained unit {} not in provisional", delta.key),
            }
        }

        for key in &diff.added_units {
            let Some(unit) = fresh.remove(key) else {
                continue;
            };
            info!(
                "Unit {} added: \"{}\", {} controllers, {} paths",
                key,
                unit.description,
                unit.controllers.len(),
                unit.paths.len()
            );
            push_unit_added(&unit, &mut events);
            self.units.insert(*key, unit);
        }

        for (_, unit) in fresh {
            pools.release_unit(unit);
        }

        let counts = ChangeCounts::tally(&events);
        MergeOutcome { events, counts }
    }

    fn merge_missing(
        &mut self,
        key: &UnitKey,
        pools: &Pools,
        missed_limit: u32,
        events: &mut Vec<DiscoveryEvent>,
    ) {
        let Some(unit) = self.units.get_mut(key) else {
            return;
        };
        unit.missed_sweeps += 1;
        if unit.missed_sweeps < missed_limit {
            debug!(
                "Unit {} missing ({} of {} sweeps)",
                key, unit.missed_sweeps, missed_limit
            );
            return;
        }
        let Some(unit) = self.units.remove(key) else {
            return;
        };
        info!("Unit {} removed: \"{}\"", key, unit.description);

        for controller in unit.controllers.values() {
            events.push(DiscoveryEvent::ControllerRemoved(ControllerEvent::from(
                controller,
            )));
        }
        for path in unit.paths.values() {
            events.push(DiscoveryEvent::PathRemoved(path_event(&unit, None, path)));
        }
        events.push(DiscoveryEvent::UnitRemoved(UnitEvent::from(&unit)));
        pools.release_unit(unit);
    }

    fn merge_retained(
        &mut self,
        delta: &UnitDelta,
        mut fresh: Unit,
        pools: &Pools,
        events: &mut Vec<DiscoveryEvent>,
    ) {
        let Some(unit) = self.units.get_mut(&delta.key) else {
            pools.release_unit(fresh);
            return;
        };
        unit.missed_sweeps = 0;
        unit.refresh_from(&fresh);

        if !delta.is_empty() {
            debug!(
                "Unit {}: +{} -{} paths, +{} -{} controllers",
                delta.key,
                delta.added_paths.len(),
                delta.removed_paths.len(),
                delta.added_controllers.len(),
                delta.removed_controllers.len()
            );
        }

        // New paths first, for the unit and every controller that stays
        for record in &delta.added_paths {
            let Some(path) = fresh.paths.remove(record) else {
                continue;
            };
            events.push(DiscoveryEvent::PathAdded(path_event(unit, None, &path)));
            for guid in &delta.retained_controllers {
                events.push(DiscoveryEvent::PathAdded(path_event(unit, Some(*guid), &path)));
            }
            unit.paths.insert(*record, path);
        }

        for guid in &delta.removed_controllers {
            if let Some(controller) = unit.controllers.remove(guid) {
                info!("Unit {}: controller {} removed", delta.key, guid);
                events.push(DiscoveryEvent::ControllerRemoved(ControllerEvent::from(
                    &controller,
                )));
                pools.controllers.release(controller);
            }
        }

        for record in &delta.removed_paths {
            let Some(path) = unit.paths.remove(record) else {
                continue;
            };
            for guid in &delta.retained_controllers {
                events.push(DiscoveryEvent::PathRemoved(path_event(unit, Some(*guid), &path)));
            }
            events.push(DiscoveryEvent::PathRemoved(path_event(unit, None, &path)));
            pools.paths.release(path);
        }

        for guid in &delta.added_controllers {
            let Some(controller) = fresh.controllers.remove(guid) else {
                continue;
            };
            info!(
                "Unit {}: controller {} added in slot {}",
                delta.key, guid, controller.slot
            );
            push_controller_added(unit, &controller, events);
            unit.controllers.insert(*guid, controller);
        }

        // Retained controllers pick up the fresh profile without an event
        for guid in &delta.retained_controllers {
            if let (Some(current), Some(latest)) =
                (unit.controllers.get_mut(guid), fresh.controllers.remove(guid))
            {
                let stale = std::mem::replace(current, latest);
                pools.controllers.release(stale);
            }
        }

        pools.release_unit(fresh);
    }

    /// The whole topology as additions, in the order a merge would report
    /// every unit as new.
    pub fn snapshot_events(&self) -> Vec<DiscoveryEvent> {
        let mut events = Vec::new();
        for unit in self.units.values() {
            push_unit_added(unit, &mut events);
        }
        events
    }

    /// Drop everything back into the pools.
    pub fn clear(&mut self, pools: &Pools) {
        for (_, unit) in std::mem::take(&mut self.units) {
            pools.release_unit(unit);
        }
    }
}

fn path_event(unit: &Unit, controller: Option<ControllerGuid>, path: &Path) -> PathEvent {
    PathEvent {
        unit: unit.key,
        controller,
        port_guid: path.port_guid,
        path: path.record,
    }
}

fn push_controller_added(unit: &Unit, controller: &Controller, events: &mut Vec<DiscoveryEvent>) {
    events.push(DiscoveryEvent::ControllerAdded(ControllerEvent::from(
        controller,
    )));
    for path in unit.paths.values() {
        events.push(DiscoveryEvent::PathAdded(path_event(
            unit,
            Some(controller.guid()),
            path,
        )));
    }
}

fn push_unit_added(unit: &Unit, events: &mut Vec<DiscoveryEvent>) {
    events.push(DiscoveryEvent::UnitAdded(UnitEvent::from(unit)));
    for path in unit.paths.values() {
        events.push(DiscoveryEvent::PathAdded(path_event(unit, None, path)));
    }
    for controller in unit.controllers.values() {
        push_controller_added(unit, controller, events);
    }
}
