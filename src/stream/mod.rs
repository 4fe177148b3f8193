//! Streaming generation modules.
//!
//! - `client`: endpoint configuration and the single active-session slot.
//! - `proto`: request payloads and server messages.
//! - `session`: session lifecycle, observer callbacks, and the driver task.
//! - `transport`: websocket connector and the transport seam used by sessions.

/// Stream client and start/cancel entry points.
pub mod client;
/// Stream protocol messages.
pub mod proto;
/// Session state machine and observer types.
pub mod session;
/// Connection transport abstraction.
pub mod transport;
