//! Core building blocks shared by every berth crate: runtime path
//! virtualization, the TTL/LRU cache engine, the conflict-check cache layered
//! on top of it, and on-disk configuration.

pub mod cache;
pub mod config;
pub mod conflict;
pub mod runtime;
pub mod types;
