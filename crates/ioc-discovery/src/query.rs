// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Query coordinator.
//!
//! One per attachment point and sweep: issues the units query and the paths
//! query back-to-back and hands both raw lists on only when both succeeded.

use crate::model::{AttachmentPoint, PathRecord, UnitRecord};
use crate::transport::{DiscoveryQuery, DiscoveryResult, FabricTransport, NodeClass, QueryOptions};
use std::sync::Arc;
use tracing::{debug, warn};

/// Raw result lists of one attachment point's fan-out queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawDiscovery {
    pub units: Vec<UnitRecord>,
    pub paths: Vec<PathRecord>,
}

/// Issues the two fan-out queries for one attachment point.
pub struct QueryCoordinator {
    transport: Arc<dyn FabricTransport>,
    point: AttachmentPoint,
    options: QueryOptions,
}

impl QueryCoordinator {
    pub fn new(
        transport: Arc<dyn FabricTransport>,
        point: AttachmentPoint,
        options: QueryOptions,
    ) -> Self {
        Self {
            transport,
            point,
            options,
        }
    }

    /// Run both queries concurrently.
    ///
    /// Returns `None` if either fails or comes back empty; the port then
    /// contributes no candidates to this sweep.
    pub async fn discover(&self) -> Option<RawDiscovery> {
        let port = self.point.port_guid;
        let units = self.transport.discovery_query(
            port,
            DiscoveryQuery::Units {
                class: NodeClass::IoUnit,
            },
            self.options,
        );
        let paths = self
            .transport
            .discovery_query(port, DiscoveryQuery::Paths, self.options);
        let (units, paths) = tokio::join!(units, paths);

        let units = match units {
            Ok(DiscoveryResult::Units(units)) => units,
            Ok(other) => {
                warn!("Port {}: units query answered with {:?}", port, other);
                return None;
            }
            Err(e) => {
                warn!("Port {}: units query failed: {}", port, e);
                return None;
            }
        };
        let paths = match paths {
            Ok(DiscoveryResult::Paths(paths)) => paths,
            Ok(other) => {
                warn!("Port {}: paths query answered with {:?}", port, other);
                return None;
            }
            Err(e) => {
                warn!("Port {}: paths query failed: {}", port, e);
                return None;
            }
        };

        if units.is_empty() || paths.is_empty() {
            debug!(
                "Port {}: nothing reachable ({} units, {} paths)",
                port,
                units.len(),
                paths.len()
            );
            return None;
        }

        debug!(
            "Port {}: {} unit records, {} path records",
            port,
            units.len(),
            paths.len()
        );
        Some(RawDiscovery { units, paths })
    }
}
