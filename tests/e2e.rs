//! End-to-end runs of the real binary over the scripts framework.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn write_config(dir: &Path, suites: &Path, extra_queue: &str) -> PathBuf {
    let config_path = dir.join("volley.toml");
    let content = format!(
        r#"
[queue]
concurrency = 2
listen_endpoint = "{sock}"
stats_file_path = "{stats}"
scratch_dir = "{scratch}"
{extra_queue}

[framework]
type = "scripts"
root = "{root}"
extension = "sh"
"#,
        sock = dir.join("run.sock").display(),
        stats = dir.join("stats.json").display(),
        scratch = dir.display(),
        root = suites.display(),
    );
    std::fs::write(&config_path, content).unwrap();
    config_path
}

fn run_volley(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_volley"))
        .arg("-c")
        .arg(config)
        .args(args)
        .output()
        .unwrap()
}

fn assert_exit_code(output: &Output, expected: i32) {
    assert_eq!(
        output.status.code(),
        Some(expected),
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn test_passing_run_exits_zero_and_records_stats() {
    let dir = TempDir::new().unwrap();
    let suites = dir.path().join("suites");
    std::fs::create_dir(&suites).unwrap();
    write_script(&suites, "alpha_test.sh", "exit 0");
    write_script(&suites, "beta_test.sh", "exit 0");

    let config = write_config(dir.path(), &suites, "");
    let output = run_volley(&config, &["run"]);
    assert_exit_code(&output, 0);

    let stats = std::fs::read_to_string(dir.path().join("stats.json")).unwrap();
    assert!(stats.contains("alpha_test"), "stats: {stats}");
    assert!(stats.contains("beta_test"), "stats: {stats}");
}

#[test]
fn test_failures_sum_into_exit_status() {
    let dir = TempDir::new().unwrap();
    let suites = dir.path().join("suites");
    std::fs::create_dir(&suites).unwrap();
    write_script(&suites, "good_test.sh", "exit 0");
    write_script(&suites, "bad_test.sh", "echo broken >&2; exit 1");

    let config = write_config(dir.path(), &suites, "");
    let output = run_volley(&config, &["run"]);
    // One failed suite -> one worker exits 1 -> driver exits 1.
    assert_exit_code(&output, 1);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("bad_test"), "stdout: {stdout}");
}

#[test]
fn test_whitelist_restricts_the_run() {
    let dir = TempDir::new().unwrap();
    let suites = dir.path().join("suites");
    std::fs::create_dir(&suites).unwrap();
    write_script(&suites, "alpha_test.sh", "exit 1");
    write_script(&suites, "beta_test.sh", "exit 0");

    let config = write_config(dir.path(), &suites, "");
    // alpha_test fails, but the whitelist keeps it out of the run.
    let output = run_volley(&config, &["run", "--whitelist", "beta_test"]);
    assert_exit_code(&output, 0);

    let stats = std::fs::read_to_string(dir.path().join("stats.json")).unwrap();
    assert!(stats.contains("beta_test"), "stats: {stats}");
    assert!(!stats.contains("alpha_test"), "stats: {stats}");
}

#[test]
fn test_missing_forced_suite_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let suites = dir.path().join("suites");
    std::fs::create_dir(&suites).unwrap();
    write_script(&suites, "alpha_test.sh", "exit 0");

    let config = write_config(dir.path(), &suites, "");
    let output = run_volley(&config, &["run", "--whitelist", "missing_test"]);
    assert!(
        output.status.code().unwrap_or(0) != 0,
        "expected a non-zero exit"
    );

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("missing_test"), "stderr: {stderr}");
}

#[test]
fn test_second_run_reorders_by_recorded_durations() {
    let dir = TempDir::new().unwrap();
    let suites = dir.path().join("suites");
    std::fs::create_dir(&suites).unwrap();
    write_script(&suites, "fast_test.sh", "exit 0");
    write_script(&suites, "slow_test.sh", "sleep 1; exit 0");

    let config = write_config(dir.path(), &suites, "");
    assert_exit_code(&run_volley(&config, &["run"]), 0);

    // The recorded durations now seed the next run's queue.
    let stats = std::fs::read_to_string(dir.path().join("stats.json")).unwrap();
    assert!(stats.contains("fast_test") && stats.contains("slow_test"));

    assert_exit_code(&run_volley(&config, &["run"]), 0);
}

#[test]
fn test_collect_lists_suites() {
    let dir = TempDir::new().unwrap();
    let suites = dir.path().join("suites");
    std::fs::create_dir(&suites).unwrap();
    write_script(&suites, "alpha_test.sh", "exit 0");
    write_script(&suites, "beta_test.sh", "exit 0");

    let config = write_config(dir.path(), &suites, "");
    let output = run_volley(&config, &["collect"]);
    assert_exit_code(&output, 0);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("alpha_test"));
    assert!(stdout.contains("beta_test"));
    assert!(stdout.contains("2 suites"));
}
