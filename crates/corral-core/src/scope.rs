//! Structured teardown for a harness run.
//!
//! [`run_scoped`] races the run body against cancellation and then, on every
//! exit path (success, error, cancellation, or panic), runs the cleanup
//! coordinator exactly once before returning.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::context::RunContext;

/// The run was cancelled before its body finished.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("run interrupted")]
pub struct Interrupted;

enum Outcome<T> {
    Finished(anyhow::Result<T>),
    Cancelled,
    Panicked(Box<dyn std::any::Any + Send>),
}

/// Drive `body` to completion or cancellation, then clean up `ctx`.
///
/// The body is dropped before cleanup starts, so any wait it was blocked in
/// is abandoned and the process it was waiting on is terminated with the
/// rest. Cancellation yields an [`Interrupted`] error; a panic in the body
/// is resumed after cleanup.
pub async fn run_scoped<T, F>(
    ctx: &RunContext,
    cancel: &CancellationToken,
    body: F,
) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let span = info_span!("run", run_id = %ctx.run_id());

    let outcome = async {
        let body = AssertUnwindSafe(body).catch_unwind();
        tokio::select! {
            result = body => match result {
                Ok(result) => Outcome::Finished(result),
                Err(panic) => Outcome::Panicked(panic),
            },
            () = cancel.cancelled() => Outcome::Cancelled,
        }
    }
    .instrument(span.clone())
    .await;

    span.in_scope(|| match &outcome {
        Outcome::Finished(Ok(_)) => info!("run finished; cleaning up"),
        Outcome::Finished(Err(e)) => warn!(error = %format!("{e:#}"), "run failed; cleaning up"),
        Outcome::Cancelled => warn!("run interrupted; cleaning up"),
        Outcome::Panicked(_) => warn!("run panicked; cleaning up"),
    });
    ctx.cleanup_all().instrument(span).await;

    match outcome {
        Outcome::Finished(result) => result,
        Outcome::Cancelled => Err(Interrupted.into()),
        Outcome::Panicked(panic) => std::panic::resume_unwind(panic),
    }
}
