//! Failure policy for individual harness steps.
//!
//! Every step is wrapped in exactly one of these at its call site:
//! [`required`] propagates failure and aborts the run, [`best_effort`] logs
//! it and carries on. There are no retries.

use std::future::Future;

use anyhow::Context;
use tracing::warn;

/// Attempt `step`; a failure aborts the caller with `what` as context.
pub async fn required<T, E, F>(what: &str, step: F) -> anyhow::Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<anyhow::Error>,
{
    step.await.map_err(Into::into).with_context(|| what.to_string())
}

/// Attempt `step`; a failure is logged and discarded.
pub async fn best_effort<T, E, F>(what: &str, step: F) -> Option<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<anyhow::Error>,
{
    match step.await {
        Ok(value) => Some(value),
        Err(e) => {
            let e: anyhow::Error = e.into();
            warn!(step = what, error = %format!("{e:#}"), "best-effort step failed; continuing");
            None
        }
    }
}
