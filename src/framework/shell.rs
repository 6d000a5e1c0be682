//! Shell-command framework adapter.
//!
//! Integrates any test framework through three user-supplied commands, all
//! run via `sh -c`:
//!
//! - `files_command` prints candidate suite files, one path per line.
//! - `suites_command` (optional) prints the suite names a file contains,
//!   one per line; `{file}` is replaced with the shell-escaped path. Without
//!   it a file holds exactly one suite named after its stem.
//! - `run_command` executes one suite; `{name}` and `{file}` are replaced
//!   with the shell-escaped suite name and path. Exit 0 is a pass, anything
//!   else a failure, with stdout/stderr carried as the failure detail.
//!
//! # Example
//!
//! ```toml
//! [framework]
//! type = "shell"
//! files_command = "ls test/*_test.rb"
//! suites_command = "grep -oE 'class [A-Z][A-Za-z]+' {file} | cut -d' ' -f2"
//! run_command = "ruby {file} -n {name}"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    capture_lines, run_suite_command, shell_escape, FrameworkResult, Suite, TestFramework,
};
use crate::config::ShellFrameworkConfig;
use crate::protocol::{SuiteId, SuiteResult};

/// Framework adapter driven entirely by configured shell commands.
pub struct ShellFramework {
    config: ShellFrameworkConfig,
}

impl ShellFramework {
    pub fn new(config: ShellFrameworkConfig) -> Self {
        Self { config }
    }

    fn working_dir(&self) -> Option<&Path> {
        self.config.working_dir.as_deref()
    }

    fn suite_for(&self, name: &str, path: &Path) -> Suite {
        let command = self
            .config
            .run_command
            .replace("{name}", &shell_escape(name))
            .replace("{file}", &shell_escape(&path.to_string_lossy()));
        Suite {
            id: SuiteId::new(name, path),
            command,
        }
    }
}

#[async_trait]
impl TestFramework for ShellFramework {
    async fn suite_files(&self) -> FrameworkResult<Vec<PathBuf>> {
        let lines = capture_lines(&self.config.files_command, self.working_dir()).await?;
        Ok(lines.into_iter().map(PathBuf::from).collect())
    }

    async fn suites_in_file(&self, path: &Path) -> FrameworkResult<Vec<Suite>> {
        let names = match &self.config.suites_command {
            Some(template) => {
                let command =
                    template.replace("{file}", &shell_escape(&path.to_string_lossy()));
                capture_lines(&command, self.working_dir()).await?
            }
            None => vec![file_stem(path)],
        };
        Ok(names
            .into_iter()
            .map(|name| self.suite_for(&name, path))
            .collect())
    }

    async fn run_suite(&self, suite: &Suite) -> FrameworkResult<SuiteResult> {
        run_suite_command(
            &suite.id,
            &suite.command,
            self.working_dir(),
            Duration::from_secs(self.config.timeout_secs),
        )
        .await
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}
