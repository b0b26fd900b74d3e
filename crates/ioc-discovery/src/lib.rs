// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! I/O unit and controller discovery over a switched fabric.
//!
//! The engine sweeps every local attachment point, drives each discovered
//! unit through three request stages (unit profile, controller profiles,
//! service entries), merges the result into an authoritative topology and
//! tells subscribers what changed.
//!
//! # Architecture
//!
//! ```text
//!  port A ─┐  QueryCoordinator -> CandidateBuilder -> PortSweep (3 stages)
//!  port B ─┤          (one task per attachment point and sweep)
//!          ▼
//!   EngineCore (single actor) ── ProvisionalTopology::absorb
//!          │                  ── Topology::merge -> ordered events
//!          ▼
//!      Notifier ── subscriber sinks (contexts, replay, reverse removal)
//! ```
//!
//! The transport that actually talks to the fabric is a trait
//! ([`FabricTransport`]); [`SimulatedFabric`] serves an in-memory fabric
//! for tests and the CLI.
//!
//! # Example
//!
//! ```ignore
//! use ioc_discovery::{DiscoveryEngine, EngineConfig, SimulatedFabric};
//! use std::sync::Arc;
//!
//! let fabric = Arc::new(SimulatedFabric::from_file("fabric.json")?);
//! let engine = DiscoveryEngine::start(EngineConfig::default(), fabric.clone())?;
//! let handle = engine.handle();
//! for point in fabric.ports() {
//!     handle.add_port(point).await?;
//! }
//! let report = handle.run_sweep().await?;
//! println!("{} units", report.units);
//! ```

pub mod candidate;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod pool;
pub mod query;
pub mod scheduler;
pub mod topology;
pub mod transport;

pub use config::{ConfigError, EngineConfig, PoolConfig, QueryConfig, SweepConfig, SweepMode};
pub use engine::{DiscoveryEngine, EngineHandle, EngineStats, PortEvent, SweepReport};
pub use error::{DiscoveryError, PoolExhausted, TransportError};
pub use event::{ControllerEvent, DiscoveryEvent, PathEvent, UnitEvent};
pub use model::{
    AttachmentPoint, CaGuid, Controller, ControllerGuid, ControllerProfile, Path, PathRecord,
    PortGuid, ServiceEntry, Unit, UnitGuid, UnitKey,
};
pub use notify::{EventClasses, EventContext, EventSink, RegistrationHandle, Verdict};
pub use topology::Topology;
pub use transport::{FabricTransport, SimulatedFabric};
