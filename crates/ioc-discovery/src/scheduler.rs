// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sweep scheduler.
//!
//! A plain state machine over `Idle`, `SweepPending` and `SweepRunning`.
//! The engine owns the timer: it sleeps until [`SweepScheduler::deadline`]
//! and calls [`SweepScheduler::begin_sweep`] once [`SweepScheduler::is_due`].
//!
//! On completion the next sweep is chosen in this order:
//!
//! 1. a positive rescan burst is decremented and re-arms the debounce timer;
//! 2. a trigger received while running re-arms the debounce timer;
//! 3. interval mode re-arms the interval timer;
//! 4. otherwise the scheduler goes idle.

use crate::config::{SweepConfig, SweepMode};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    /// Timer armed
    SweepPending,
    /// At least one attachment point sweep outstanding
    SweepRunning,
}

#[derive(Debug)]
pub struct SweepScheduler {
    mode: SweepMode,
    interval: Duration,
    debounce: Duration,
    max_burst: u32,
    state: SchedulerState,
    deadline: Option<Instant>,
    burst: u32,
    retrigger: bool,
}

impl SweepScheduler {
    /// In interval mode the first sweep is armed one debounce after start.
    pub fn new(config: &SweepConfig, now: Instant) -> Self {
        let mut scheduler = Self {
            mode: config.mode,
            interval: config.interval(),
            debounce: config.debounce(),
            max_burst: config.max_rescan_burst,
            state: SchedulerState::Idle,
            deadline: None,
            burst: 0,
            retrigger: false,
        };
        if scheduler.mode == SweepMode::Interval {
            scheduler.arm(now + scheduler.debounce);
        }
        scheduler
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Port-up or subnet-manager change.
    pub fn on_trigger(&mut self, now: Instant) {
        if self.mode == SweepMode::Disabled {
            trace!("Sweeps disabled, trigger ignored");
            return;
        }
        self.schedule_soon(now);
    }

    /// Explicit rescan. Works in every mode.
    pub fn on_rescan_request(&mut self, now: Instant) {
        self.burst = (self.burst + 1).min(self.max_burst);
        debug!("Rescan requested (burst {})", self.burst);
        if self.state != SchedulerState::SweepRunning {
            self.schedule_soon(now);
        }
    }

    /// Sweep as soon as possible, bypassing the debounce.
    pub fn force(&mut self, now: Instant) {
        match self.state {
            SchedulerState::SweepRunning => self.retrigger = true,
            _ => self.arm(now),
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.state == SchedulerState::SweepPending && self.deadline.is_some_and(|d| d <= now)
    }

    pub fn begin_sweep(&mut self) {
        debug_assert_ne!(self.state, SchedulerState::SweepRunning, "sweep already running");
        self.state = SchedulerState::SweepRunning;
        self.deadline = None;
    }

    pub fn on_sweep_complete(&mut self, now: Instant) {
        debug_assert_eq!(self.state, SchedulerState::SweepRunning);
        let retrigger = std::mem::take(&mut self.retrigger);
        if self.burst > 0 {
            self.burst -= 1;
            debug!("Rescan burst: {} left", self.burst);
            self.arm(now + self.debounce);
        } else if retrigger {
            self.arm(now + self.debounce);
        } else if self.mode == SweepMode::Interval {
            self.arm(now + self.interval);
        } else {
            self.state = SchedulerState::Idle;
        }
    }

    /// Disarm the timer.
    pub fn cancel(&mut self) {
        if self.state == SchedulerState::SweepPending {
            self.state = SchedulerState::Idle;
        }
        self.deadline = None;
        self.retrigger = false;
    }

    fn schedule_soon(&mut self, now: Instant) {
        match self.state {
            SchedulerState::SweepRunning => self.retrigger = true,
            SchedulerState::Idle | SchedulerState::SweepPending => self.arm(now + self.debounce),
        }
    }

    /// Arm the timer, keeping an earlier deadline.
    fn arm(&mut self, at: Instant) {
        let at = match (self.state, self.deadline) {
            (SchedulerState::SweepPending, Some(current)) => current.min(at),
            _ => at,
        };
        self.state = SchedulerState::SweepPending;
        self.deadline = Some(at);
    }
}
