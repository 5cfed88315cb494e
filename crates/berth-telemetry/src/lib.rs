//! Logging setup shared by the berth binary and its background services.
//!
//! Everything in berth logs through `tracing`; this crate only decides where
//! the events go and in which shape (human-readable or JSON lines). Output is
//! written to stderr so stdout stays free for command output.

pub mod logging;
