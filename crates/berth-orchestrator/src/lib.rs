//! Container bootstrap for a berth workspace.
//!
//! [`orchestrator::Orchestrator`] drives one session through the
//! [`phase::Phase`] lifecycle, spawning subprocess readers
//! ([`stream`]) and health probes ([`health`]) that report back through its
//! inbox. Once the container is ready, [`monitor::Monitor`] takes over.

pub mod container;
pub mod health;
pub mod image;
pub mod monitor;
pub mod orchestrator;
pub mod phase;
pub mod session;
pub mod stream;
