//! Directory-of-scripts framework adapter.
//!
//! Each file under the configured root is one suite: the suite name is the
//! file stem and running the suite executes the file. The simplest possible
//! adapter, and the one the integration tests lean on.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::{run_suite_command, shell_escape, FrameworkResult, Suite, TestFramework};
use crate::config::ScriptFrameworkConfig;
use crate::protocol::{SuiteId, SuiteResult};

/// Framework adapter over a flat directory of executable test scripts.
pub struct ScriptFramework {
    config: ScriptFrameworkConfig,
}

impl ScriptFramework {
    pub fn new(config: ScriptFrameworkConfig) -> Self {
        Self { config }
    }

    fn matches(&self, path: &Path) -> bool {
        match &self.config.extension {
            Some(ext) => path.extension().map(|e| e.to_string_lossy() == *ext).unwrap_or(false),
            None => true,
        }
    }
}

#[async_trait]
impl TestFramework for ScriptFramework {
    async fn suite_files(&self) -> FrameworkResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.config.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file() && self.matches(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn suites_in_file(&self, path: &Path) -> FrameworkResult<Vec<Suite>> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        Ok(vec![Suite {
            id: SuiteId::new(name, path),
            command: shell_escape(&path.to_string_lossy()),
        }])
    }

    async fn run_suite(&self, suite: &Suite) -> FrameworkResult<SuiteResult> {
        run_suite_command(
            &suite.id,
            &suite.command,
            None,
            Duration::from_secs(self.config.timeout_secs),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScriptFrameworkConfig;
    use crate::protocol::SuiteOutcome;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_each_script_is_one_suite() {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "b_test.sh", "exit 0");
        write_script(dir.path(), "a_test.sh", "exit 0");

        let fw = ScriptFramework::new(ScriptFrameworkConfig {
            root: dir.path().to_path_buf(),
            extension: Some("sh".to_string()),
            timeout_secs: 30,
        });

        let files = fw.suite_files().await.unwrap();
        assert_eq!(files.len(), 2);
        // Sorted enumeration.
        assert!(files[0].ends_with("a_test.sh"));

        let suites = fw.suites_in_file(&files[0]).await.unwrap();
        assert_eq!(suites.len(), 1);
        assert_eq!(suites[0].id.name, "a_test");
    }

    #[tokio::test]
    async fn test_run_script_suite() {
        let dir = TempDir::new().unwrap();
        let path = write_script(dir.path(), "fail_test.sh", "echo nope >&2; exit 1");

        let fw = ScriptFramework::new(ScriptFrameworkConfig {
            root: dir.path().to_path_buf(),
            extension: None,
            timeout_secs: 30,
        });

        let suites = fw.suites_in_file(&path).await.unwrap();
        let result = fw.run_suite(&suites[0]).await.unwrap();
        assert_eq!(result.outcome, SuiteOutcome::Failed);
        assert!(result.detail.unwrap().contains("nope"));
    }
}
