//! Fixed-interval reconnect supervisor.
//!
//! The host link, the cloud bridge and the bot adapter all run one
//! "connection lifetime" closure at a time and restart it after a fixed
//! delay. Attempts are strictly sequential, so two sessions of the same
//! supervisor never overlap.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Run `session` until `shutdown` fires, waiting `interval` between attempts.
///
/// `session` receives the 1-based attempt number and should return when its
/// connection ends. Errors are logged and never stop the loop. Returns the
/// number of attempts made.
pub async fn supervise<F, Fut>(
    name: &str,
    interval: Duration,
    shutdown: CancellationToken,
    mut session: F,
) -> u64
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut attempt: u64 = 0;
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        attempt += 1;
        debug!(supervisor = name, attempt, "Starting session");

        tokio::select! {
            _ = shutdown.cancelled() => break,
            outcome = session(attempt) => match outcome {
                Ok(()) => info!(supervisor = name, attempt, "Session ended"),
                Err(e) => warn!(supervisor = name, attempt, error = %e, "Session failed"),
            },
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!(supervisor = name, attempts = attempt, "Supervisor stopped");
    attempt
}
