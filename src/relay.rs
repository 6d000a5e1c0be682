//! Relay mode: a secondary master federating its workers into a primary run.
//!
//! A relay never owns a queue or a listener. It announces its worker count
//! to the primary, spawns workers that talk to the primary directly, and
//! forwards each finalized worker record back as it reaps it.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::protocol::{MasterClient, ProtocolError};
use crate::supervisor::WorkerPool;

/// Errors that end a relay run before any worker starts.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("could not reach primary master at {endpoint} within {timeout_secs}s: {last_error}")]
    ConnectTimeout {
        endpoint: String,
        timeout_secs: u64,
        last_error: String,
    },

    #[error("primary master belongs to a different run")]
    WrongRun,

    #[error("primary master rejected handshake: {0:?}")]
    Rejected(String),
}

/// Retry the `SLAVE` handshake until the primary accepts or the window
/// closes. Connection failures retry on a 500 ms backoff; a rejection of any
/// kind is immediately fatal.
pub async fn announce_with_retry(
    client: &MasterClient,
    workers: usize,
    hostname: &str,
    message: Option<&str>,
    timeout: Duration,
) -> Result<(), RelayError> {
    let deadline = Instant::now() + timeout;
    loop {
        match client.announce_relay(workers, hostname, message).await {
            Ok(()) => return Ok(()),
            Err(ProtocolError::WrongRun) => return Err(RelayError::WrongRun),
            Err(ProtocolError::UnexpectedReply(reply)) => return Err(RelayError::Rejected(reply)),
            Err(e) => {
                let last_error = e.to_string();
                if Instant::now() >= deadline {
                    return Err(RelayError::ConnectTimeout {
                        endpoint: client.endpoint().to_string(),
                        timeout_secs: timeout.as_secs(),
                        last_error,
                    });
                }
                debug!("Primary not ready ({}); retrying", last_error);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

/// Reap local workers until none remain, forwarding each finalized record to
/// the primary. Returns true when the wait was cut short by an abort signal.
pub async fn forward_completions(
    pool: &mut WorkerPool,
    client: &MasterClient,
    shutdown: &watch::Receiver<bool>,
) -> bool {
    while pool.live_count() > 0 {
        if *shutdown.borrow() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        for record in pool.reap_finished().await {
            info!(
                "Worker {} finished with status {}; forwarding to primary",
                record.num, record.exit_status
            );
            if let Err(e) = client.forward_worker(&record).await {
                // The primary will never see this record; nothing to do but
                // keep draining our own workers.
                warn!("Failed to forward worker record: {}", e);
            }
        }
    }
    false
}
