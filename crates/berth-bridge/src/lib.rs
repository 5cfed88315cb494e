//! Live-status distribution for berth.
//!
//! - [`protocol`]: event envelope and payload types shared by server and clients
//! - [`event_bus`]: in-process fan-out with bounded per-client buffers
//! - [`sse`]: `data:` frame encoding and an incremental decoder
//! - [`server`]: axum route streaming the bus as server-sent events
//! - [`subscriber`]: reconnecting client with heartbeat liveness

pub mod event_bus;
pub mod protocol;
pub mod server;
pub mod sse;
pub mod subscriber;
