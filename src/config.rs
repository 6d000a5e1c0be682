//! Configuration loading and schema definitions.
//!
//! A run is configured by a TOML file plus a handful of environment
//! overrides. All validation happens before any subprocess is spawned.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("{name} must be a positive integer, got {value:?}")]
    InvalidInteger { name: String, value: String },

    #[error("concurrency must be greater than zero")]
    ZeroConcurrency,

    #[error("invalid endpoint {value:?}: {reason}")]
    InvalidEndpoint { value: String, reason: String },

    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
}

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core queue settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Framework adapter configuration.
    pub framework: FrameworkConfig,
}

/// Core queue settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Number of local workers to fork.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Listener endpoint: a socket path or `[host:]port`. Defaults to a
    /// per-run socket file in the scratch directory.
    pub listen_endpoint: Option<String>,

    /// `host:port` of a primary master to relay for. Setting this to the
    /// local listen endpoint disables relay mode with a warning.
    pub relay_endpoint: Option<String>,

    /// How long to keep retrying the relay handshake.
    #[serde(default = "default_relay_timeout")]
    pub relay_connect_timeout_seconds: u64,

    /// Comma-separated suite names that restrict and order the run.
    pub whitelist: Option<String>,

    /// Where suite durations are persisted between runs.
    #[serde(default = "default_stats_file")]
    pub stats_file_path: PathBuf,

    /// Force a known run token, for coordinated multi-host runs.
    pub relay_token: Option<String>,

    /// Free-form string forwarded in the relay handshake for logging.
    pub slave_message: Option<String>,

    /// Workers send `KABOOM` after this many failed suites.
    pub early_failure_limit: Option<usize>,

    /// Debug-level logging.
    #[serde(default)]
    pub verbose: bool,

    /// Directory for per-worker handoff files and the default socket.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            listen_endpoint: None,
            relay_endpoint: None,
            relay_connect_timeout_seconds: default_relay_timeout(),
            whitelist: None,
            stats_file_path: default_stats_file(),
            relay_token: None,
            slave_message: None,
            early_failure_limit: None,
            verbose: false,
            scratch_dir: None,
        }
    }
}

fn default_concurrency() -> usize {
    match num_cpus::get() {
        0 => 2,
        n => n,
    }
}

fn default_relay_timeout() -> u64 {
    30
}

fn default_stats_file() -> PathBuf {
    PathBuf::from(".test_queue_stats")
}

/// Framework adapter configuration (tagged union).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FrameworkConfig {
    /// Command-driven adapter for arbitrary frameworks.
    Shell(ShellFrameworkConfig),

    /// A directory of executable test scripts.
    Scripts(ScriptFrameworkConfig),
}

/// Configuration for the shell framework.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShellFrameworkConfig {
    /// Command printing candidate suite files, one per line.
    pub files_command: String,

    /// Command printing the suite names in `{file}`, one per line.
    /// Without it, each file is one suite named after its stem.
    pub suites_command: Option<String>,

    /// Command template running one suite; `{name}` and `{file}` are
    /// replaced with shell-escaped values.
    pub run_command: String,

    /// Working directory for all commands.
    pub working_dir: Option<PathBuf>,

    /// Per-suite timeout.
    #[serde(default = "default_suite_timeout")]
    pub timeout_secs: u64,
}

/// Configuration for the scripts framework.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScriptFrameworkConfig {
    /// Directory holding the test scripts.
    pub root: PathBuf,

    /// Only treat files with this extension as suites.
    pub extension: Option<String>,

    /// Per-suite timeout.
    #[serde(default = "default_suite_timeout")]
    pub timeout_secs: u64,
}

fn default_suite_timeout() -> u64 {
    3600
}

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> ConfigResult<Config> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    load_config_str(&content).map_err(|e| match e {
        ConfigError::Parse { source, .. } => ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })
}

/// Load configuration from a string.
pub fn load_config_str(content: &str) -> ConfigResult<Config> {
    toml::from_str(content).map_err(|source| ConfigError::Parse {
        path: PathBuf::new(),
        source,
    })
}

impl Config {
    /// Fold environment overrides into the file-loaded settings.
    /// Unparseable integers fail fast.
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        if let Some(value) = env_usize("VOLLEY_CONCURRENCY")? {
            self.queue.concurrency = value;
        }
        if let Some(value) = env_usize("VOLLEY_RELAY_TIMEOUT")? {
            self.queue.relay_connect_timeout_seconds = value as u64;
        }
        if let Some(value) = env_usize("VOLLEY_EARLY_FAILURE_LIMIT")? {
            self.queue.early_failure_limit = Some(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.queue.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(())
    }

    /// The whitelist as an ordered list of names.
    pub fn whitelist_names(&self) -> Vec<String> {
        self.queue
            .whitelist
            .as_deref()
            .map(|list| {
                list.split(',')
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn env_usize(name: &'static str) -> ConfigResult<Option<usize>> {
    match std::env::var(name) {
        Ok(value) => value
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidInteger {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[framework]
type = "scripts"
root = "t/suites"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = load_config_str(MINIMAL).unwrap();
        assert!(config.queue.concurrency > 0);
        assert_eq!(config.queue.relay_connect_timeout_seconds, 30);
        assert_eq!(config.queue.stats_file_path, PathBuf::from(".test_queue_stats"));
        assert!(config.whitelist_names().is_empty());
    }

    #[test]
    fn test_whitelist_parsing() {
        let toml = r#"
[queue]
whitelist = "C, A ,B,"

[framework]
type = "scripts"
root = "t/suites"
"#;
        let config = load_config_str(toml).unwrap();
        assert_eq!(config.whitelist_names(), ["C", "A", "B"]);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let toml = r#"
[queue]
concurrency = 0

[framework]
type = "scripts"
root = "t/suites"
"#;
        let config = load_config_str(toml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroConcurrency)
        ));
    }

    #[test]
    fn test_shell_framework_config() {
        let toml = r#"
[framework]
type = "shell"
files_command = "ls test/*_test.rb"
run_command = "ruby {file}"
"#;
        let config = load_config_str(toml).unwrap();
        match config.framework {
            FrameworkConfig::Shell(shell) => {
                assert_eq!(shell.timeout_secs, 3600);
                assert!(shell.suites_command.is_none());
            }
            other => panic!("unexpected framework: {other:?}"),
        }
    }
}
