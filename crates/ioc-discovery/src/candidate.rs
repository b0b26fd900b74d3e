// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Candidate builder.
//!
//! Turns one attachment point's raw discovery lists into candidate units:
//! units are first keyed by the address they answered on so paths can be
//! associated by destination, then collapsed to [`UnitKey`].

use crate::diff::key_delta;
use crate::error::PoolExhausted;
use crate::model::{AttachmentPoint, Unit, UnitKey};
use crate::pool::Pools;
use crate::query::RawDiscovery;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Builds the candidate map for one attachment point.
pub struct CandidateBuilder<'a> {
    pools: &'a Pools,
    point: AttachmentPoint,
}

impl<'a> CandidateBuilder<'a> {
    pub fn new(pools: &'a Pools, point: AttachmentPoint) -> Self {
        Self { pools, point }
    }

    /// Build candidates from raw lists.
    ///
    /// Fails only when the unit pool is exhausted before the first unit
    /// could be created; the port then takes no part in this sweep.
    pub fn build(&self, raw: RawDiscovery) -> Result<BTreeMap<UnitKey, Unit>, PoolExhausted> {
        let port = self.point.port_guid;

        // Keyed by advertised address
        let mut scratch: BTreeMap<u16, Unit> = BTreeMap::new();
        for record in &raw.units {
            if scratch.contains_key(&record.lid) {
                debug!("Port {}: duplicate unit record at lid {:#06x}", port, record.lid);
                continue;
            }
            let mut unit = match self.pools.units.acquire() {
                Ok(unit) => unit,
                Err(e) if scratch.is_empty() => return Err(e),
                Err(e) => {
                    warn!("Port {}: {}, ignoring remaining unit records", port, e);
                    break;
                }
            };
            unit.populate(self.point.ca_guid, record);
            scratch.insert(record.lid, unit);
        }

        for record in &raw.paths {
            let Some(unit) = scratch.get_mut(&record.dlid) else {
                continue;
            };
            if unit.paths.contains_key(record) {
                continue;
            }
            match self.pools.paths.acquire() {
                Ok(mut path) => {
                    path.record = *record;
                    path.port_guid = port;
                    unit.paths.insert(*record, path);
                }
                Err(e) => warn!("Port {}: {}, dropping path to {:#06x}", port, e, record.dlid),
            }
        }

        let mut candidates: BTreeMap<UnitKey, Unit> = BTreeMap::new();
        for (_, unit) in scratch {
            match candidates.entry(unit.key) {
                Entry::Vacant(slot) => {
                    slot.insert(unit);
                }
                Entry::Occupied(mut slot) => merge_paths(self.pools, slot.get_mut(), unit),
            }
        }

        candidates.retain(|key, unit| {
            if unit.paths.is_empty() {
                debug!("Port {}: unit {} has no path, dropped", port, key);
                self.pools.release_unit(std::mem::take(unit));
                false
            } else {
                unit.preferred_path = unit.paths.keys().next().copied();
                true
            }
        });

        debug!("Port {}: {} candidate units", port, candidates.len());
        Ok(candidates)
    }
}

/// Fold `other`'s paths into `kept`: paths only `other` knows move over,
/// paths both know stay with `kept`. `other` goes back to the pool.
pub(crate) fn merge_paths(pools: &Pools, kept: &mut Unit, mut other: Unit) {
    let delta = key_delta(&kept.paths, &other.paths);
    for record in delta.added {
        if let Some(path) = other.paths.remove(&record) {
            kept.paths.insert(record, path);
        }
    }
    if kept.preferred_path.is_none() {
        kept.preferred_path = other.preferred_path;
    }
    pools.release_unit(other);
}
