// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topology differ.
//!
//! Pure symmetric-difference computation over ordered maps, at unit,
//! controller and path granularity. Nothing here mutates a topology; the
//! merger in [`crate::topology`] applies the result.

use crate::model::{ControllerGuid, PathRecord, Unit, UnitKey};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Keys of two ordered maps split three ways.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDelta<K> {
    /// Only in the fresh map
    pub added: Vec<K>,
    /// Only in the current map
    pub removed: Vec<K>,
    /// In both
    pub common: Vec<K>,
}

impl<K> Default for KeyDelta<K> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
            common: Vec::new(),
        }
    }
}

/// Walk both maps in key order once and classify every key.
pub fn key_delta<K: Ord + Copy, A, B>(
    current: &BTreeMap<K, A>,
    fresh: &BTreeMap<K, B>,
) -> KeyDelta<K> {
    let mut delta = KeyDelta::default();
    let mut old = current.keys().peekable();
    let mut new = fresh.keys().peekable();

    loop {
        match (old.peek(), new.peek()) {
            (Some(&&a), Some(&&b)) => match a.cmp(&b) {
                Ordering::Less => {
                    delta.removed.push(a);
                    old.next();
                }
                Ordering::Greater => {
                    delta.added.push(b);
                    new.next();
                }
                Ordering::Equal => {
                    delta.common.push(a);
                    old.next();
                    new.next();
                }
            },
            (Some(&&a), None) => {
                delta.removed.push(a);
                old.next();
            }
            (None, Some(&&b)) => {
                delta.added.push(b);
                new.next();
            }
            (None, None) => break,
        }
    }
    delta
}

/// Difference inside one unit present in both topologies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitDelta {
    pub key: UnitKey,
    pub added_paths: Vec<PathRecord>,
    pub removed_paths: Vec<PathRecord>,
    pub added_controllers: Vec<ControllerGuid>,
    pub removed_controllers: Vec<ControllerGuid>,
    pub retained_controllers: Vec<ControllerGuid>,
}

impl UnitDelta {
    pub fn compute(current: &Unit, fresh: &Unit) -> Self {
        let paths = key_delta(&current.paths, &fresh.paths);
        let controllers = key_delta(&current.controllers, &fresh.controllers);
        Self {
            key: current.key,
            added_paths: paths.added,
            removed_paths: paths.removed,
            added_controllers: controllers.added,
            removed_controllers: controllers.removed,
            retained_controllers: controllers.common,
        }
    }

    /// No path or controller changed.
    pub fn is_empty(&self) -> bool {
        self.added_paths.is_empty()
            && self.removed_paths.is_empty()
            && self.added_controllers.is_empty()
            && self.removed_controllers.is_empty()
    }
}

/// Difference between the authoritative and a provisional topology.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyDiff {
    pub added_units: Vec<UnitKey>,
    pub removed_units: Vec<UnitKey>,
    /// One entry per unit present on both sides, changed or not
    pub retained: Vec<UnitDelta>,
}

impl TopologyDiff {
    pub fn compute(current: &BTreeMap<UnitKey, Unit>, fresh: &BTreeMap<UnitKey, Unit>) -> Self {
        let units = key_delta(current, fresh);
        let retained = units
            .common
            .iter()
            .filter_map(|key| Some(UnitDelta::compute(current.get(key)?, fresh.get(key)?)))
            .collect();
        Self {
            added_units: units.added,
            removed_units: units.removed,
            retained,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added_units.is_empty()
            && self.removed_units.is_empty()
            && self.retained.iter().all(UnitDelta::is_empty)
    }
}
