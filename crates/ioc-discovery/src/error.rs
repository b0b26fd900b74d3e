// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types.
//!
//! Transport and pool errors never leave the engine: the stage pipeline
//! turns them into the absence of the affected entity. Only the public
//! API surface returns [`DiscoveryError`].

use crate::config::ConfigError;
use crate::model::PortGuid;
use crate::notify::RegistrationHandle;
use thiserror::Error;

/// Failure reported by the fabric transport for one query or request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out after all retries")]
    Timeout,

    #[error("management status {0:#06x}")]
    Status(u16),

    #[error("destination unreachable: {0}")]
    Unreachable(String),

    #[error("transport resources exhausted")]
    ResourceExhausted,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request cancelled")]
    Cancelled,
}

/// A record pool reached its configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{pool} pool exhausted ({limit} records in use)")]
pub struct PoolExhausted {
    pub pool: &'static str,
    pub limit: usize,
}

/// Errors returned by the public engine API.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Discovery engine not running")]
    NotRunning,

    #[error("Unknown attachment point {0}")]
    UnknownPort(PortGuid),

    #[error("Unknown registration {0}")]
    UnknownRegistration(RegistrationHandle),

    #[error("Fabric description error: {0}")]
    Fabric(String),

    #[error("Engine task failed: {0}")]
    Task(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            TransportError::Status(0x1c).to_string(),
            "management status 0x001c"
        );
        let exhausted = PoolExhausted {
            pool: "unit",
            limit: 8,
        };
        assert_eq!(exhausted.to_string(), "unit pool exhausted (8 records in use)");
        assert_eq!(
            DiscoveryError::UnknownPort(PortGuid(0x10)).to_string(),
            "Unknown attachment point 0x0000000000000010"
        );
    }
}
