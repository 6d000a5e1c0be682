//! Framework adapters: the only components that understand test semantics.
//!
//! An adapter enumerates the candidate suite files, enumerates the suites a
//! file contains, and knows how to execute one suite. Everything else in the
//! crate handles suites purely by [`SuiteId`]; the master in particular never
//! sees how a suite runs.

pub mod scripts;
pub mod shell;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::protocol::{SuiteId, SuiteOutcome, SuiteResult};

pub use scripts::ScriptFramework;
pub use shell::ShellFramework;

pub type FrameworkResult<T> = Result<T, FrameworkError>;

/// Errors that can occur while discovering or executing suites.
#[derive(Debug, thiserror::Error)]
pub enum FrameworkError {
    #[error("failed to enumerate suites: {0}")]
    DiscoveryFailed(String),

    #[error("failed to execute command: {0}")]
    ExecFailed(String),

    #[error("suite {name:?} not found in {path}")]
    SuiteNotFound { name: String, path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framework error: {0}")]
    Other(#[from] anyhow::Error),
}

/// A runnable suite: its identity plus the shell command that executes it.
///
/// The command is the framework-specific half; adapters encode whatever they
/// need into it when enumerating a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suite {
    pub id: SuiteId,
    pub command: String,
}

/// Capability set every framework adapter provides.
#[async_trait]
pub trait TestFramework: Send + Sync {
    /// Ordered enumeration of candidate suite files.
    async fn suite_files(&self) -> FrameworkResult<Vec<PathBuf>>;

    /// The suites defined in one file.
    async fn suites_in_file(&self, path: &Path) -> FrameworkResult<Vec<Suite>>;

    /// Execute a suite to completion.
    async fn run_suite(&self, suite: &Suite) -> FrameworkResult<SuiteResult>;

    /// Find a dispatched suite by identity. Workers call this to turn the
    /// `(name, path)` pair they were handed back into something runnable.
    async fn resolve(&self, id: &SuiteId) -> FrameworkResult<Suite> {
        let suites = self.suites_in_file(&id.path).await?;
        suites
            .into_iter()
            .find(|s| s.id.name == id.name)
            .ok_or_else(|| FrameworkError::SuiteNotFound {
                name: id.name.clone(),
                path: id.path.clone(),
            })
    }
}

/// Run a shell command via `sh -c` and fold the outcome into a
/// [`SuiteResult`]. Shared by the command-driven adapters.
pub(crate) async fn run_suite_command(
    id: &SuiteId,
    command: &str,
    working_dir: Option<&Path>,
    timeout: Duration,
) -> FrameworkResult<SuiteResult> {
    debug!("Running suite {}: {}", id, command);
    let start = Instant::now();

    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Ok(SuiteResult {
                id: id.clone(),
                outcome: SuiteOutcome::Error,
                duration_seconds: start.elapsed().as_secs_f64(),
                detail: Some(format!("failed to spawn: {e}")),
            });
        }
        Err(_) => {
            return Ok(SuiteResult {
                id: id.clone(),
                outcome: SuiteOutcome::Error,
                duration_seconds: start.elapsed().as_secs_f64(),
                detail: Some(format!("timed out after {}s", timeout.as_secs())),
            });
        }
    };

    let outcome = if output.status.success() {
        SuiteOutcome::Passed
    } else {
        SuiteOutcome::Failed
    };
    let detail = if outcome.is_success() {
        None
    } else {
        let mut detail = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !detail.is_empty() {
                detail.push('\n');
            }
            detail.push_str(&stderr);
        }
        Some(detail)
    };

    Ok(SuiteResult {
        id: id.clone(),
        outcome,
        duration_seconds: start.elapsed().as_secs_f64(),
        detail,
    })
}

/// Run a command and return its stdout lines, dropping blanks and `#`
/// comments. Shared by the command-driven discovery paths.
pub(crate) async fn capture_lines(
    command: &str,
    working_dir: Option<&Path>,
) -> FrameworkResult<Vec<String>> {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .await
        .map_err(|e| FrameworkError::ExecFailed(format!("{command}: {e}")))?;
    if !output.status.success() {
        return Err(FrameworkError::DiscoveryFailed(format!(
            "{command}: exit {} ({})",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect())
}

/// Escape a string for use in a shell command.
pub(crate) fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}
