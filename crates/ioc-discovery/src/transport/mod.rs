// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fabric transport abstraction.
//!
//! The engine never touches the wire. It consumes two asynchronous
//! services from the transport collaborator:
//!
//! - a fan-out discovery query per local port (units on the fabric, and
//!   paths from the port to every unicast destination), and
//! - a request/response exchange with one unit over one path.
//!
//! Timeouts and retries below the engine are the transport's job; the
//! engine only passes a budget in [`QueryOptions`] and interprets the
//! final outcome.
//!
//! # Integration
//!
//! ```ignore
//! #[async_trait]
//! impl FabricTransport for MadTransport {
//!     async fn discovery_query(&self, port, query, options)
//!         -> Result<DiscoveryResult, TransportError>
//!     {
//!         // Build and send the subnet administration query...
//!     }
//!     // ...
//! }
//! ```

pub mod sim;

use crate::error::TransportError;
use crate::model::{ControllerProfile, PathRecord, PortGuid, ServiceEntry, UnitInfo, UnitRecord};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

pub use sim::{FabricDescription, RequestCounters, SimController, SimUnit, SimulatedFabric};

/// Service entries carried by one block request at most.
pub const MAX_ENTRIES_PER_BLOCK: u16 = 4;

/// Timeout and retry budget for one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    pub timeout: Duration,
    pub retries: u32,
}

/// Node class filter for the units query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    /// Nodes exposing the device management agent (I/O units)
    IoUnit,
}

/// Fan-out query issued once per attachment point and sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryQuery {
    /// Every unit of a class reachable from the port
    Units { class: NodeClass },
    /// Paths from the port to every unicast destination, default class
    Paths,
}

/// Result list of a [`DiscoveryQuery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryResult {
    Units(Vec<UnitRecord>),
    Paths(Vec<PathRecord>),
}

/// Configuration request sent to one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    UnitInfo,
    ControllerProfile { slot: u8 },
    /// Entries `first..=last` of the controller in `slot`
    ServiceEntries { slot: u8, first: u16, last: u16 },
}

impl fmt::Display for DeviceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnitInfo => f.write_str("unit info"),
            Self::ControllerProfile { slot } => write!(f, "controller profile (slot {})", slot),
            Self::ServiceEntries { slot, first, last } => {
                write!(f, "service entries {}..={} (slot {})", first, last, slot)
            }
        }
    }
}

/// Response to a [`DeviceRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceResponse {
    UnitInfo(UnitInfo),
    ControllerProfile(ControllerProfile),
    ServiceEntries(Vec<ServiceEntry>),
}

impl DeviceResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnitInfo(_) => "unit info",
            Self::ControllerProfile(_) => "controller profile",
            Self::ServiceEntries(_) => "service entries",
        }
    }
}

/// The query/transport collaborator.
#[async_trait]
pub trait FabricTransport: Send + Sync {
    /// Issue a fan-out discovery query from a local port.
    async fn discovery_query(
        &self,
        port: PortGuid,
        query: DiscoveryQuery,
        options: QueryOptions,
    ) -> Result<DiscoveryResult, TransportError>;

    /// Exchange one request/response with the unit at the end of `path`.
    async fn request_response(
        &self,
        port: PortGuid,
        path: &PathRecord,
        request: DeviceRequest,
        options: QueryOptions,
    ) -> Result<DeviceResponse, TransportError>;
}

/// Block ranges `(first, last)` covering `count` service entries.
pub fn entry_blocks(count: u8) -> impl Iterator<Item = (u16, u16)> {
    let count = u16::from(count);
    (0..count)
        .step_by(MAX_ENTRIES_PER_BLOCK as usize)
        .map(move |first| (first, (first + MAX_ENTRIES_PER_BLOCK - 1).min(count - 1)))
}
