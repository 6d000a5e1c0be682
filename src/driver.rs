//! The run driver: lifecycle orchestration from listener start to exit
//! status.
//!
//! The driver owns the linear lifecycle — bind, prepare, handshake, spawn,
//! dispatch, cleanup, summarize — and guarantees cleanup on every exit path.
//! All per-run state (token, endpoints, scratch paths) is fixed in an
//! immutable [`RunContext`] before anything is spawned.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::discovery::DiscoveryChild;
use crate::framework::TestFramework;
use crate::hooks::RunHooks;
use crate::master::{DispatchOutcome, Master};
use crate::protocol::{Endpoint, MasterClient, RunToken, SuiteId, WorkerRecord};
use crate::queue::SuiteQueue;
use crate::relay;
use crate::stats::SuiteStats;
use crate::supervisor::WorkerPool;
use crate::worker;

/// Immutable per-run state, fixed at construction.
pub struct RunContext {
    pub config: Config,
    pub config_path: PathBuf,
    pub token: RunToken,
    pub run_id: String,
    pub scratch_dir: PathBuf,
    pub hostname: String,
    pub listen_endpoint: Endpoint,
    /// Present only when this process runs as a relay for a primary master.
    pub relay_endpoint: Option<Endpoint>,
    pub exec_path: PathBuf,
}

impl RunContext {
    pub fn new(config: Config, config_path: PathBuf) -> anyhow::Result<Self> {
        let scratch_dir = config
            .queue
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let run_id = format!("{:08x}", rand::random::<u32>());
        let token = match &config.queue.relay_token {
            Some(hex) => RunToken::from_hex(hex.clone()),
            None => RunToken::generate(),
        };

        let listen_endpoint = match &config.queue.listen_endpoint {
            Some(spec) => Endpoint::parse(spec).context("invalid listen_endpoint")?,
            None => Endpoint::Unix(scratch_dir.join(format!(
                "test_queue_{}_{}.sock",
                std::process::id(),
                run_id
            ))),
        };
        let relay_endpoint = match &config.queue.relay_endpoint {
            Some(spec) => {
                let endpoint = Endpoint::parse(spec).context("invalid relay_endpoint")?;
                if endpoint == listen_endpoint {
                    warn!("relay_endpoint equals the local endpoint; relay mode disabled");
                    None
                } else {
                    Some(endpoint)
                }
            }
            None => None,
        };

        Ok(Self {
            hostname: hostname(),
            exec_path: std::env::current_exe().context("cannot locate own executable")?,
            config,
            config_path,
            token,
            run_id,
            scratch_dir,
            listen_endpoint,
            relay_endpoint,
        })
    }
}

/// Orchestrates one run to completion and yields the process exit code.
pub struct Driver {
    ctx: RunContext,
    framework: Arc<dyn TestFramework>,
    hooks: Arc<dyn RunHooks>,
}

impl Driver {
    pub fn new(
        ctx: RunContext,
        framework: Arc<dyn TestFramework>,
        hooks: Arc<dyn RunHooks>,
    ) -> Self {
        Self {
            ctx,
            framework,
            hooks,
        }
    }

    /// Run to completion. The returned code is the saturating sum of worker
    /// exit statuses clamped to 255; abort paths are always non-zero.
    pub async fn run(self) -> anyhow::Result<i32> {
        let shutdown = spawn_signal_watch();
        match self.ctx.relay_endpoint.clone() {
            Some(primary) => self.run_relay(primary, shutdown).await,
            None => self.run_primary(shutdown).await,
        }
    }

    async fn run_primary(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<i32> {
        let queue_config = &self.ctx.config.queue;
        let whitelist = self.ctx.config.whitelist_names();

        let mut stats = SuiteStats::load(&queue_config.stats_file_path);
        let files: HashSet<PathBuf> = self
            .framework
            .suite_files()
            .await
            .context("failed to enumerate suite files")?
            .into_iter()
            .collect();
        // History entries only count when their file still exists.
        let known: Vec<(SuiteId, f64)> = stats
            .known_suites()
            .filter(|(id, _)| files.contains(&id.path))
            .map(|(id, duration)| (id.clone(), duration))
            .collect();
        let queue = SuiteQueue::build(known, &whitelist);

        let listener = self
            .ctx
            .listen_endpoint
            .bind()
            .await
            .with_context(|| format!("failed to bind {}", self.ctx.listen_endpoint))?;
        info!(
            "Run {} listening on {}, {} suites from history",
            self.ctx.run_id,
            self.ctx.listen_endpoint,
            queue.len()
        );

        self.hooks
            .prepare(queue_config.concurrency)
            .await
            .context("prepare hook failed")?;

        let discovery = if whitelist.is_empty() || !queue.awaited().is_empty() {
            let child = self.spawn_discovery().context("failed to spawn discovery")?;
            Some(DiscoveryChild::new(child))
        } else {
            info!("Whitelist already satisfied by recorded history; skipping discovery");
            None
        };

        let mut pool = WorkerPool::new(self.ctx.scratch_dir.clone(), self.ctx.hostname.clone());
        for num in 0..queue_config.concurrency {
            let cmd = self.worker_command(num, &self.ctx.listen_endpoint);
            pool.spawn(num, cmd)
                .with_context(|| format!("failed to spawn worker {num}"))?;
        }

        let master = Master::new(
            listener,
            self.ctx.token.clone(),
            queue,
            pool,
            discovery,
            &self.ctx.scratch_dir,
        );
        let report = master.run(&*self.hooks, shutdown).await;

        for record in &report.completed {
            for suite in &record.suites_run {
                stats.record(&suite.id, suite.duration_seconds);
            }
        }
        if let Err(e) = stats.save(&queue_config.stats_file_path) {
            warn!("Failed to save stats file: {}", e);
        }

        self.hooks.summarize(&report.completed).await;
        print_summary(&report.completed);

        let exit = exit_status(&report.completed);
        match report.outcome {
            Ok(DispatchOutcome::Drained) => Ok(exit),
            Ok(DispatchOutcome::Kaboom) => {
                error!("Run stopped early after failure escalation");
                Ok(exit.max(1))
            }
            Err(e) => {
                error!("Run aborted: {}", e);
                Ok(exit.max(1))
            }
        }
    }

    async fn run_relay(
        self,
        primary: Endpoint,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<i32> {
        let queue_config = &self.ctx.config.queue;

        self.hooks
            .prepare(queue_config.concurrency)
            .await
            .context("prepare hook failed")?;

        let client = MasterClient::new(primary.clone(), self.ctx.token.clone());
        relay::announce_with_retry(
            &client,
            queue_config.concurrency,
            &self.ctx.hostname,
            queue_config.slave_message.as_deref(),
            Duration::from_secs(queue_config.relay_connect_timeout_seconds),
        )
        .await?;
        info!(
            "Announced {} workers to primary at {}",
            queue_config.concurrency, primary
        );

        let mut pool = WorkerPool::new(self.ctx.scratch_dir.clone(), self.ctx.hostname.clone());
        for num in 0..queue_config.concurrency {
            // Remote workers talk to the primary directly; this relay only
            // forwards their completion records.
            let cmd = self.worker_command(num, &primary);
            pool.spawn(num, cmd)
                .with_context(|| format!("failed to spawn worker {num}"))?;
        }

        let aborted = relay::forward_completions(&mut pool, &client, &shutdown).await;
        if aborted {
            error!("Run aborted by signal");
            pool.set_aborting();
            pool.kill_all();
            pool.reap_all().await;
            let completed = pool.take_completed();
            return Ok(exit_status(&completed).max(1));
        }

        let completed = pool.take_completed();
        self.hooks.summarize(&completed).await;
        print_summary(&completed);
        Ok(exit_status(&completed))
    }

    fn worker_command(&self, num: usize, endpoint: &Endpoint) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.ctx.exec_path);
        cmd.arg("worker");
        cmd.env(worker::env::ENDPOINT, endpoint.to_string());
        cmd.env(worker::env::TOKEN, self.ctx.token.as_str());
        cmd.env(worker::env::WORKER_NUM, num.to_string());
        cmd.env(worker::env::SCRATCH_DIR, &self.ctx.scratch_dir);
        cmd.env(worker::env::CONFIG, &self.ctx.config_path);
        if let Some(limit) = self.ctx.config.queue.early_failure_limit {
            cmd.env(worker::env::EARLY_FAILURE_LIMIT, limit.to_string());
        }
        cmd
    }

    fn spawn_discovery(&self) -> std::io::Result<tokio::process::Child> {
        let mut cmd = tokio::process::Command::new(&self.ctx.exec_path);
        cmd.arg("discover");
        cmd.env(worker::env::ENDPOINT, self.ctx.listen_endpoint.to_string());
        cmd.env(worker::env::TOKEN, self.ctx.token.as_str());
        cmd.env(worker::env::CONFIG, &self.ctx.config_path);
        cmd.kill_on_drop(true);
        cmd.spawn()
    }
}

/// Saturating sum of worker exit statuses, clamped to 255.
fn exit_status(completed: &[WorkerRecord]) -> i32 {
    completed
        .iter()
        .fold(0u32, |acc, record| {
            acc.saturating_add(record.exit_status.max(0) as u32)
        })
        .min(255) as i32
}

fn print_summary(completed: &[WorkerRecord]) {
    let mut suites = 0usize;
    let mut failures = 0usize;
    for record in completed {
        let elapsed = record
            .end_time
            .map(|end| (end - record.start_time).num_seconds())
            .unwrap_or(0);
        println!(
            "worker {:>2} on {} exited {} after {}s: {}",
            record.num,
            record.host,
            record.exit_status,
            elapsed,
            record.summary.as_deref().unwrap_or("no report")
        );
        for result in &record.suites_run {
            suites += 1;
            if !result.outcome.is_success() {
                failures += 1;
                println!("  FAILED {} ({:.2}s)", result.id, result.duration_seconds);
                if let Some(detail) = &result.detail {
                    for line in detail.lines().take(40) {
                        println!("    {line}");
                    }
                }
            }
        }
    }
    println!(
        "{} workers ran {} suites, {} failures",
        completed.len(),
        suites,
        failures
    );
}

/// Install INT/TERM handlers that flip the shared abort flag. The dispatch
/// and relay loops check it once per tick.
fn spawn_signal_watch() -> watch::Receiver<bool> {
    use tokio::signal::unix::{signal, SignalKind};

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let interrupt = signal(SignalKind::interrupt());
        let terminate = signal(SignalKind::terminate());
        match (interrupt, terminate) {
            (Ok(mut interrupt), Ok(mut terminate)) => {
                tokio::select! {
                    _ = interrupt.recv() => {}
                    _ = terminate.recv() => {}
                }
                warn!("Received shutdown signal; aborting run");
                tx.send(true).ok();
            }
            _ => warn!("Failed to install signal handlers"),
        }
    });
    rx
}

/// This machine's name, as announced to the primary and stamped into worker
/// records.
pub(crate) fn hostname() -> String {
    let mut buf = [0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).to_string()
}
