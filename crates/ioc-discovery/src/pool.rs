// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Record pools for units, paths and controllers.
//!
//! Each pool is a free list of recycled records behind its own lock, with a
//! hard limit on records handed out. Records live in ordinary keyed maps
//! while in use; the pool only owns them while they sit on the free list.
//!
//! Hitting the limit is the "resource exhaustion" case of the error
//! taxonomy: callers treat it like a transport failure for the entity they
//! were about to create.

use crate::config::PoolConfig;
use crate::error::PoolExhausted;
use crate::model::{Controller, Path, Unit};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// A record that can be wiped and handed out again.
pub trait Recycle: Default {
    /// Reset to the default state, keeping allocations where possible.
    fn recycle(&mut self);
}

impl Recycle for Unit {
    fn recycle(&mut self) {
        let mut description = std::mem::take(&mut self.description);
        description.clear();
        *self = Unit {
            description,
            ..Default::default()
        };
    }
}

impl Recycle for Path {
    fn recycle(&mut self) {
        *self = Path::default();
    }
}

impl Recycle for Controller {
    fn recycle(&mut self) {
        *self = Controller::default();
    }
}

/// Pool statistics snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub name: &'static str,
    pub limit: usize,
    pub in_use: usize,
    pub free: usize,
    pub exhausted: u64,
}

struct PoolInner<T> {
    free: Vec<T>,
    in_use: usize,
}

/// Bounded free-list pool.
pub struct RecordPool<T> {
    name: &'static str,
    limit: usize,
    inner: Mutex<PoolInner<T>>,
    exhausted_count: AtomicU64,
}

impl<T: Recycle> RecordPool<T> {
    /// Create an empty pool that hands out at most `limit` records at once.
    pub fn new(name: &'static str, limit: usize) -> Self {
        Self {
            name,
            limit,
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                in_use: 0,
            }),
            exhausted_count: AtomicU64::new(0),
        }
    }

    /// Take a record from the free list, or allocate one below the limit.
    pub fn acquire(&self) -> Result<T, PoolExhausted> {
        let mut inner = self.inner.lock();
        if inner.in_use >= self.limit {
            self.exhausted_count.fetch_add(1, Ordering::Relaxed);
            return Err(PoolExhausted {
                pool: self.name,
                limit: self.limit,
            });
        }
        inner.in_use += 1;
        Ok(inner.free.pop().unwrap_or_default())
    }

    /// Return a record to the free list.
    pub fn release(&self, mut record: T) {
        record.recycle();
        let mut inner = self.inner.lock();
        debug_assert!(inner.in_use > 0, "{} pool: release without acquire", self.name);
        inner.in_use = inner.in_use.saturating_sub(1);
        inner.free.push(record);
    }

    /// Account for a record that was lost without being returned (its
    /// owner was cancelled while another task still referenced it).
    pub fn forget(&self) {
        let mut inner = self.inner.lock();
        inner.in_use = inner.in_use.saturating_sub(1);
    }

    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use
    }

    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.in_use())
    }

    pub fn exhausted_count(&self) -> u64 {
        self.exhausted_count.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            name: self.name,
            limit: self.limit,
            in_use: inner.in_use,
            free: inner.free.len(),
            exhausted: self.exhausted_count(),
        }
    }
}

/// The three pools shared by every attachment point.
pub struct Pools {
    pub units: RecordPool<Unit>,
    pub paths: RecordPool<Path>,
    pub controllers: RecordPool<Controller>,
}

impl Pools {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            units: RecordPool::new("unit", config.max_units),
            paths: RecordPool::new("path", config.max_paths),
            controllers: RecordPool::new("controller", config.max_controllers),
        }
    }

    /// Release a unit together with every path and controller it holds.
    pub fn release_unit(&self, mut unit: Unit) {
        for (_, path) in std::mem::take(&mut unit.paths) {
            self.paths.release(path);
        }
        for (_, controller) in std::mem::take(&mut unit.controllers) {
            self.controllers.release(controller);
        }
        self.units.release(unit);
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        vec![
            self.units.stats(),
            self.paths.stats(),
            self.controllers.stats(),
        ]
    }
}

impl Default for Pools {
    fn default() -> Self {
        Self::new(&PoolConfig::default())
    }
}
