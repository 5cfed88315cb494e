//! Panic isolation for background tasks.
//!
//! A panicking reader or heartbeat task must not take the orchestrator or the
//! server down with it. [`spawn_guarded`] catches the unwind inside the task,
//! logs it with the task name and resolves to `None` instead.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tracing::error;

pub fn spawn_guarded<F>(name: impl Into<String>, fut: F) -> JoinHandle<Option<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let name = name.into();
    tokio::spawn(async move {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(output) => Some(output),
            Err(payload) => {
                error!(
                    task = %name,
                    panic = %panic_message(payload.as_ref()),
                    "background task panicked; recovered"
                );
                None
            }
        }
    })
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
