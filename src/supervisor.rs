//! Worker process supervision.
//!
//! The pool spawns workers by re-executing the current binary, remembers
//! `pid -> WorkerRecord`, and reaps exits either non-blockingly (between
//! dispatch ticks) or blockingly (at shutdown). Workers hand their results
//! back through two PID-named files in the scratch directory; both are read
//! and deleted here at reap time.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::protocol::WorkerRecord;
use crate::worker::WorkerReport;

/// Where a worker's stdout/stderr ends up while it runs.
pub fn worker_output_path(scratch_dir: &Path, pid: u32) -> PathBuf {
    scratch_dir.join(format!("test_queue_worker_{pid}_output"))
}

/// Where a worker serializes its suite results before exiting.
pub fn worker_report_path(scratch_dir: &Path, pid: u32) -> PathBuf {
    scratch_dir.join(format!("test_queue_worker_{pid}_suites"))
}

struct LiveWorker {
    child: Child,
    record: WorkerRecord,
    output_task: tokio::task::JoinHandle<()>,
}

/// The set of worker processes owned by one master.
pub struct WorkerPool {
    scratch_dir: PathBuf,
    host: String,
    live: Vec<LiveWorker>,
    completed: Vec<WorkerRecord>,
    aborting: bool,
}

impl WorkerPool {
    pub fn new(scratch_dir: PathBuf, host: String) -> Self {
        Self {
            scratch_dir,
            host,
            live: Vec::new(),
            completed: Vec::new(),
            aborting: false,
        }
    }

    /// Spawn one worker. The command's stdout/stderr are piped and streamed
    /// into the PID-named capture file.
    pub fn spawn(&mut self, num: usize, mut cmd: Command) -> std::io::Result<u32> {
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or_default();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let capture = worker_output_path(&self.scratch_dir, pid);
        let output_task = tokio::spawn(capture_output(stdout, stderr, capture));

        debug!("Spawned worker {} (pid {})", num, pid);
        self.live.push(LiveWorker {
            child,
            record: WorkerRecord::new(num, pid, &self.host),
            output_task,
        });
        Ok(pid)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn completed(&self) -> &[WorkerRecord] {
        &self.completed
    }

    pub fn take_completed(&mut self) -> Vec<WorkerRecord> {
        std::mem::take(&mut self.completed)
    }

    /// Stop recording completions. Workers reaped after this point are
    /// discarded.
    pub fn set_aborting(&mut self) {
        self.aborting = true;
    }

    /// Reap any workers that have already exited. Never blocks.
    pub async fn reap_finished(&mut self) -> Vec<WorkerRecord> {
        let mut reaped = Vec::new();
        let mut idx = 0;
        while idx < self.live.len() {
            match self.live[idx].child.try_wait() {
                Ok(Some(status)) => {
                    let worker = self.live.swap_remove(idx);
                    if let Some(record) = self.finalize(worker, status.code()).await {
                        reaped.push(record);
                    }
                }
                Ok(None) => idx += 1,
                Err(e) => {
                    warn!("Failed to poll worker: {}", e);
                    idx += 1;
                }
            }
        }
        reaped
    }

    /// Wait for every remaining worker and reap it.
    pub async fn reap_all(&mut self) -> Vec<WorkerRecord> {
        let live: Vec<LiveWorker> = self.live.drain(..).collect();
        let exits = join_all(live.into_iter().map(|mut worker| async move {
            let status = worker.child.wait().await;
            (worker, status)
        }))
        .await;

        let mut reaped = Vec::new();
        for (worker, status) in exits {
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Failed to wait for worker {}: {}", worker.record.pid, e);
                    None
                }
            };
            if let Some(record) = self.finalize(worker, code).await {
                reaped.push(record);
            }
        }
        reaped
    }

    /// Hard-kill every live worker. Follow with [`reap_all`].
    ///
    /// [`reap_all`]: WorkerPool::reap_all
    pub fn kill_all(&self) {
        for worker in &self.live {
            if let Some(pid) = worker.child.id() {
                debug!("Killing worker pid {}", pid);
                unsafe {
                    libc::kill(pid as i32, libc::SIGKILL);
                }
            }
        }
    }

    async fn finalize(&mut self, worker: LiveWorker, code: Option<i32>) -> Option<WorkerRecord> {
        let LiveWorker {
            mut record,
            output_task,
            ..
        } = worker;

        // The capture task ends when the child's pipes hit EOF.
        output_task.await.ok();

        let output_path = worker_output_path(&self.scratch_dir, record.pid);
        record.captured_output = std::fs::read_to_string(&output_path).unwrap_or_default();
        std::fs::remove_file(&output_path).ok();

        let report_path = worker_report_path(&self.scratch_dir, record.pid);
        match std::fs::read(&report_path) {
            Ok(bytes) => match serde_json::from_slice::<WorkerReport>(&bytes) {
                Ok(report) => {
                    record.suites_run = report.suites;
                    record.summary = report.summary;
                    record.failure_output = report.failure_output;
                }
                Err(e) => {
                    record.failure_output = Some(format!("unreadable worker report: {e}"));
                }
            },
            Err(e) => {
                record.failure_output = Some(format!("missing worker report: {e}"));
            }
        }
        std::fs::remove_file(&report_path).ok();

        record.end_time = Some(Utc::now());
        record.exit_status = code.unwrap_or(1);
        debug!(
            "Reaped worker {} (pid {}) with status {}",
            record.num, record.pid, record.exit_status
        );

        if self.aborting {
            return None;
        }
        self.completed.push(record.clone());
        Some(record)
    }
}

async fn capture_output(
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    path: PathBuf,
) {
    let file = match tokio::fs::File::create(&path).await {
        Ok(file) => Arc::new(Mutex::new(file)),
        Err(e) => {
            warn!("Failed to create capture file {}: {}", path.display(), e);
            return;
        }
    };
    tokio::join!(pump(stdout, file.clone()), pump(stderr, file));
}

async fn pump<R>(reader: Option<R>, file: Arc<Mutex<tokio::fs::File>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = match reader {
        Some(reader) => reader,
        None => return,
    };
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut file = file.lock().await;
                if file.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}
