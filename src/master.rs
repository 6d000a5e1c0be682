//! The master dispatch loop.
//!
//! A single task owns the queue, the worker table, and the listener; workers,
//! relays, and discovery reach it only through wire messages, so none of that
//! state needs locking. The loop's one suspension point is a 100 ms
//! readiness wait on the listener, which doubles as the reap tick for local
//! workers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::discovery::DiscoveryChild;
use crate::hooks::{QueueSnapshot, RunHooks};
use crate::protocol::{
    read_command_line, read_request, split_token, write_pop_reply, Connection, Listener, PopReply,
    ProtocolResult, Request, RunToken, WorkerRecord,
};
use crate::queue::SuiteQueue;
use crate::supervisor::WorkerPool;

/// How the dispatch loop ended, short of an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every suite was dispatched and every remote worker reported back.
    Drained,
    /// A worker escalated with `KABOOM`.
    Kaboom,
}

/// Abort conditions. The dispatch loop never returns an error otherwise.
#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error("suite discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("discovery completed without finding forced suites: {0}")]
    MissingForcedSuites(String),

    #[error("run aborted by signal")]
    Aborted,
}

/// What a finished master hands back to the driver.
pub struct MasterReport {
    pub outcome: Result<DispatchOutcome, MasterError>,
    /// Finalized records of local workers plus any forwarded by relays.
    pub completed: Vec<WorkerRecord>,
}

/// Owner of the queue, the listener, and every subprocess of the run.
pub struct Master {
    listener: Listener,
    token: RunToken,
    queue: SuiteQueue,
    pool: WorkerPool,
    discovery: Option<DiscoveryChild>,
    remote_workers: usize,
    remote_completed: Vec<WorkerRecord>,
    start_time: DateTime<Utc>,
    diagnostics_path: PathBuf,
}

impl Master {
    pub fn new(
        listener: Listener,
        token: RunToken,
        queue: SuiteQueue,
        pool: WorkerPool,
        discovery: Option<DiscoveryChild>,
        scratch_dir: &Path,
    ) -> Self {
        Self {
            listener,
            token,
            queue,
            pool,
            discovery,
            remote_workers: 0,
            remote_completed: Vec::new(),
            start_time: Utc::now(),
            diagnostics_path: scratch_dir
                .join(format!("test_queue_{}_diagnostics.log", std::process::id())),
        }
    }

    /// Serve suites until the run is over, then tear everything down.
    ///
    /// Teardown happens on every path: the listener closes (and its socket
    /// file is removed), discovery is killed if still running, and local
    /// workers are reaped. On graceful paths the reap waits for in-flight
    /// suites to finish; on abort paths workers are hard-killed and their
    /// completions discarded.
    pub async fn run(mut self, hooks: &dyn RunHooks, shutdown: watch::Receiver<bool>) -> MasterReport {
        let outcome = self.dispatch(hooks, &shutdown).await;
        let aborted = outcome.is_err();

        let Master {
            listener,
            mut pool,
            discovery,
            mut remote_completed,
            ..
        } = self;

        // Closing the listener first makes the next POP of every worker fail,
        // which is how workers learn the run is over.
        listener.remove_socket_file();
        drop(listener);

        if let Some(discovery) = discovery {
            discovery.shutdown().await;
        }

        if aborted {
            pool.set_aborting();
            pool.kill_all();
        }
        pool.reap_all().await;

        let mut completed = pool.take_completed();
        completed.append(&mut remote_completed);
        MasterReport { outcome, completed }
    }

    async fn dispatch(
        &mut self,
        hooks: &dyn RunHooks,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<DispatchOutcome, MasterError> {
        info!("Dispatching {} suites", self.queue.len());
        loop {
            if *shutdown.borrow() {
                return Err(MasterError::Aborted);
            }

            hooks.queue_status(&QueueSnapshot {
                start_time: self.start_time,
                queue_size: self.queue.len(),
                local_workers: self.pool.live_count(),
                remote_workers: self.remote_workers,
            });

            self.poll_discovery()?;

            let accepted =
                tokio::time::timeout(Duration::from_millis(100), self.listener.accept()).await;
            match accepted {
                Err(_) => {
                    self.pool.reap_finished().await;
                }
                Ok(Ok(conn)) => {
                    if self.handle_connection(conn).await {
                        return Ok(DispatchOutcome::Kaboom);
                    }
                }
                Ok(Err(e)) => warn!("Failed to accept connection: {}", e),
            }

            if !self.awaiting_suites() && self.queue.is_empty() && self.remote_workers == 0 {
                return Ok(DispatchOutcome::Drained);
            }
        }
    }

    /// True while `POP` must answer `WAIT` instead of draining the queue:
    /// forced suites have not all arrived yet, or the queue ran dry while
    /// discovery is still walking files.
    fn awaiting_suites(&self) -> bool {
        !self.queue.awaited().is_empty() || (self.queue.is_empty() && self.discovery.is_some())
    }

    fn poll_discovery(&mut self) -> Result<(), MasterError> {
        if let Some(discovery) = self.discovery.as_mut() {
            match discovery.poll() {
                Ok(Some(status)) => {
                    self.discovery = None;
                    if !status.success() {
                        return Err(MasterError::DiscoveryFailed(format!(
                            "exit status {}",
                            status.code().unwrap_or(-1)
                        )));
                    }
                    debug!("Discovery completed");
                    if !self.queue.awaited().is_empty() {
                        return Err(MasterError::MissingForcedSuites(
                            self.queue.awaited().join(", "),
                        ));
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to poll discovery: {}", e),
            }
        }
        Ok(())
    }

    /// Returns true when the connection carried `KABOOM`.
    async fn handle_connection(&mut self, conn: Connection) -> bool {
        match self.serve(conn).await {
            Ok(kaboom) => kaboom,
            Err(e) => {
                self.log_diagnostic(&format!("dropped connection: {e}")).await;
                false
            }
        }
    }

    async fn serve(&mut self, conn: Connection) -> ProtocolResult<bool> {
        let mut reader = BufReader::new(conn);
        let line = read_command_line(&mut reader).await?;
        let (token, command) = split_token(&line)?;

        if token != self.token.as_str() {
            let mut conn = reader.into_inner();
            write_pop_reply(&mut conn, &PopReply::WrongRun).await?;
            self.log_diagnostic(&format!("rejected foreign token {token:?}")).await;
            return Ok(false);
        }

        let request = read_request(command, &mut reader).await?;
        let mut conn = reader.into_inner();
        match request {
            Request::Pop => {
                let reply = if self.awaiting_suites() {
                    PopReply::Wait
                } else {
                    match self.queue.pop() {
                        Some(suite) => {
                            debug!("Dispatching {}", suite);
                            PopReply::Suite(suite)
                        }
                        None => PopReply::Done,
                    }
                };
                write_pop_reply(&mut conn, &reply).await?;
            }
            Request::Slave {
                workers,
                hostname,
                message,
            } => {
                self.remote_workers += workers;
                conn.write_all(b"OK\n").await?;
                conn.flush().await?;
                info!(
                    "Relay on {} announced {} workers{}",
                    hostname,
                    workers,
                    message.map(|m| format!(" ({m})")).unwrap_or_default()
                );
            }
            Request::Worker { record } => {
                self.remote_workers = self.remote_workers.saturating_sub(1);
                debug!(
                    "Remote worker {} on {} finished with status {}",
                    record.num, record.host, record.exit_status
                );
                self.remote_completed.push(record);
            }
            Request::NewSuite { suite } => {
                if self.queue.offer(suite) && self.queue.whitelist_satisfied() {
                    // Everything the whitelist forces has arrived; discovery
                    // has nothing left to contribute.
                    if let Some(discovery) = &self.discovery {
                        discovery.interrupt();
                    }
                }
            }
            Request::Kaboom => {
                warn!("A worker escalated early failures; stopping dispatch");
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn log_diagnostic(&self, message: &str) {
        warn!("{}", message);
        let line = format!("{} {}\n", Utc::now().to_rfc3339(), message);
        let result = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.diagnostics_path)
            .await;
        if let Ok(mut file) = result {
            file.write_all(line.as_bytes()).await.ok();
        }
    }
}
