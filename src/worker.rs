//! The worker process: requests one suite at a time and executes it.
//!
//! A worker is a child of its master, spawned through the hidden `worker`
//! subcommand with its context carried in environment variables. It talks to
//! the master (local or, for remote workers, the primary across the network)
//! purely through `POP` requests and reports its results through the
//! PID-named report file its supervising master consumes at reap time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ConfigResult};
use crate::framework::TestFramework;
use crate::hooks::RunHooks;
use crate::protocol::{
    Endpoint, MasterClient, PopReply, RunToken, SuiteId, SuiteOutcome, SuiteResult, WIRE_VERSION,
};
use crate::supervisor;

/// Environment variables carrying the subprocess context across the re-exec
/// boundary.
pub mod env {
    pub const ENDPOINT: &str = "VOLLEY_MASTER_ENDPOINT";
    pub const TOKEN: &str = "VOLLEY_RUN_TOKEN";
    pub const WORKER_NUM: &str = "VOLLEY_WORKER_NUM";
    pub const EARLY_FAILURE_LIMIT: &str = "VOLLEY_EARLY_FAILURE_LIMIT";
    pub const SCRATCH_DIR: &str = "VOLLEY_SCRATCH_DIR";
    pub const CONFIG: &str = "VOLLEY_CONFIG";
}

/// Everything a worker process needs to know, fixed at spawn.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub num: usize,
    pub endpoint: Endpoint,
    pub token: RunToken,
    pub early_failure_limit: Option<usize>,
    pub scratch_dir: PathBuf,
}

impl WorkerContext {
    /// Rebuild the context inside a spawned worker.
    pub fn from_env() -> ConfigResult<Self> {
        let endpoint_spec = require_env(env::ENDPOINT)?;
        let endpoint =
            Endpoint::parse(&endpoint_spec).map_err(|e| ConfigError::InvalidEndpoint {
                value: endpoint_spec,
                reason: e.to_string(),
            })?;
        let num = parse_env_usize(env::WORKER_NUM, &require_env(env::WORKER_NUM)?)?;
        let early_failure_limit = match std::env::var(env::EARLY_FAILURE_LIMIT) {
            Ok(value) => Some(parse_env_usize(env::EARLY_FAILURE_LIMIT, &value)?),
            Err(_) => None,
        };
        Ok(Self {
            num,
            endpoint,
            token: RunToken::from_hex(require_env(env::TOKEN)?),
            early_failure_limit,
            scratch_dir: PathBuf::from(require_env(env::SCRATCH_DIR)?),
        })
    }
}

fn require_env(key: &'static str) -> ConfigResult<String> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnv(key))
}

fn parse_env_usize(name: &str, value: &str) -> ConfigResult<usize> {
    value.parse().map_err(|_| ConfigError::InvalidInteger {
        name: name.to_string(),
        value: value.to_string(),
    })
}

/// Handoff file a worker writes for its supervising master before exiting.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerReport {
    pub schema_version: u32,
    pub suites: Vec<SuiteResult>,
    pub summary: Option<String>,
    pub failure_output: Option<String>,
}

/// Worker process entry point. Returns the process exit code: the number of
/// failed suites, clamped to 255.
pub async fn worker_main(
    ctx: WorkerContext,
    framework: Arc<dyn TestFramework>,
    hooks: Arc<dyn RunHooks>,
) -> i32 {
    hooks.after_fork(ctx.num).await;
    if let Some(code) = hooks.run_worker(&ctx).await {
        return code;
    }

    let client = MasterClient::new(ctx.endpoint.clone(), ctx.token.clone());
    let mut suites_run: Vec<SuiteResult> = Vec::new();
    let mut failures = 0usize;
    let mut kaboomed = false;

    loop {
        let reply = match client.pop().await {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Master connection lost, treating run as over: {}", e);
                break;
            }
        };
        match reply {
            PopReply::Done => break,
            PopReply::WrongRun => {
                warn!("Master belongs to a different run");
                break;
            }
            PopReply::Wait => tokio::time::sleep(Duration::from_millis(100)).await,
            PopReply::Suite(id) => {
                info!("Running suite {}", id);
                let result = run_one(&*framework, &*hooks, &id).await;
                if !result.outcome.is_success() {
                    failures += 1;
                }
                suites_run.push(result);

                if let Some(limit) = ctx.early_failure_limit {
                    if failures >= limit {
                        warn!("Hit early failure limit ({}); sending KABOOM", limit);
                        client.kaboom().await.ok();
                        kaboomed = true;
                        break;
                    }
                }
            }
        }
    }

    let report = WorkerReport {
        schema_version: WIRE_VERSION,
        summary: Some(format!("{} suites, {} failures", suites_run.len(), failures)),
        failure_output: if kaboomed {
            Some("early failure limit reached".to_string())
        } else {
            None
        },
        suites: suites_run,
    };
    if let Err(e) = write_report(&ctx, &report) {
        error!("Failed to write worker report: {}", e);
    }

    failures.min(255) as i32
}

async fn run_one(framework: &dyn TestFramework, hooks: &dyn RunHooks, id: &SuiteId) -> SuiteResult {
    let suite = match framework.resolve(id).await {
        Ok(suite) => suite,
        Err(e) => {
            return SuiteResult {
                id: id.clone(),
                outcome: SuiteOutcome::Error,
                duration_seconds: 0.0,
                detail: Some(e.to_string()),
            };
        }
    };

    if let Some(result) = hooks.around_filter(&suite).await {
        return result;
    }

    match framework.run_suite(&suite).await {
        Ok(result) => result,
        Err(e) => SuiteResult {
            id: id.clone(),
            outcome: SuiteOutcome::Error,
            duration_seconds: 0.0,
            detail: Some(e.to_string()),
        },
    }
}

fn write_report(ctx: &WorkerContext, report: &WorkerReport) -> std::io::Result<()> {
    let path = supervisor::worker_report_path(&ctx.scratch_dir, std::process::id());
    let json = serde_json::to_vec(report)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    std::fs::write(path, json)
}
