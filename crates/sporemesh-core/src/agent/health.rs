//! HTTP health probing of freshly spawned workloads.

use std::time::{Duration, Instant};

use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::AgentError;

/// Probe timings for [`await_healthy`].
#[derive(Debug, Clone, Copy)]
pub struct ProbeTimings {
    /// Overall deadline for the workload to become healthy.
    pub deadline: Duration,
    /// Pause between consecutive probes.
    pub interval: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

/// Polls `GET <base_url>/health` until a `200 OK` is observed or the
/// deadline elapses.
///
/// # Errors
///
/// Returns [`AgentError::HealthTimeout`] when the deadline passes without a
/// `200`, or [`AgentError::Cancelled`] if the token fires first.
pub(super) async fn await_healthy(
    client: &reqwest::Client,
    base_url: &str,
    timings: ProbeTimings,
    cancel: &CancellationToken,
) -> Result<(), AgentError> {
    let url = format!("{base_url}/health");
    let deadline = Instant::now() + timings.deadline;

    loop {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        match client
            .get(&url)
            .timeout(timings.request_timeout)
            .send()
            .await
        {
            Ok(response) if response.status() == StatusCode::OK => return Ok(()),
            Ok(response) => {
                debug!(%url, status = %response.status(), "health probe not ready");
            }
            Err(error) => debug!(%url, %error, "health probe failed"),
        }

        if Instant::now() >= deadline {
            return Err(AgentError::HealthTimeout {
                url,
                deadline: timings.deadline,
            });
        }

        tokio::select! {
            () = tokio::time::sleep(timings.interval) => {}
            () = cancel.cancelled() => return Err(AgentError::Cancelled),
        }
    }
}
