//! Task supervision: panic-to-error conversion for spawned tasks and
//! aggregation of shutdown error batches.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use eyre::{Result, eyre};
use futures_util::FutureExt;
use tokio::task::JoinHandle;

/// Spawn a future whose panic surfaces as an `Err` on the join handle
/// instead of a join error, so one misbehaving task can be reported
/// without disturbing its siblings. The label names the task in logs
/// and error messages.
pub fn spawn_supervised<F>(label: String, future: F) -> JoinHandle<Result<()>>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(&panic);
                tracing::error!(task = %label, payload = %message, "supervised task panicked");
                Err(eyre!("task '{label}' panicked: {message}"))
            }
        }
    })
}

/// Best-effort extraction of a panic payload's message.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Collapse a batch of failures into a single report. No failures is
/// `Ok`, a single failure is returned with the context prepended, and
/// several failures become one numbered listing.
pub fn combine_errors(context: &str, mut errors: Vec<eyre::Report>) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0).wrap_err(context.to_string())),
        count => {
            let listing = errors
                .iter()
                .enumerate()
                .map(|(index, error)| format!("  {}: {error:#}", index + 1))
                .collect::<Vec<_>>()
                .join("\n");
            Err(eyre!("{context}: {count} failures\n{listing}"))
        }
    }
}
