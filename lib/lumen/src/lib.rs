//! Shared infrastructure for the `graviton` networking runtime: logging
//! bootstrap, the process-relative clock and common identifier types.

pub mod logging;
pub mod time;

/// Identifier of a connected client, unique within a server instance.
/// Client ids range from 1 inclusive to the maximum client count inclusive;
/// 0 means "no client".
pub type ClientId = usize;

/// Sub-channel identifier within a UDP connection.
pub type OperationId = usize;

/// Identifier of a runtime instance (client, server or broadcast).
pub type InstanceId = usize;
