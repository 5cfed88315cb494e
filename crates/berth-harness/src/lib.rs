//! Process-lifetime plumbing: cooperative shutdown and panic-isolated
//! background tasks.

pub mod recovery;
pub mod shutdown;

pub use recovery::spawn_guarded;
pub use shutdown::{DrainResult, ShutdownGuard, ShutdownSignal};
