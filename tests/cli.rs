//! Smoke tests for the `crawl` binary.
//!
//! Each test gets its own temp directory with a config file and database.
//! Crawls target a closed local port so no network access is needed.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn crawl_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_crawl"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    fs::create_dir_all(root.join("config")).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let config_content = format!(
        r#"
[db]
path = "{}"

[crawler]
concurrency = 2
fetch_timeout_secs = 2
retry_ceiling = 1
default_crawl_delay_secs = 0.0
respect_robots = false
"#,
        root.join("data/crawl.sqlite").display()
    );

    let config_path = root.join("config/crawl.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_crawl(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(crawl_binary())
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .expect("failed to run crawl binary");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config) = setup_test_env();

    let (stdout, stderr, ok) = run_crawl(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized"));

    let (_, stderr, ok) = run_crawl(&config, &["init"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn test_empty_database_queries() {
    let (_tmp, config) = setup_test_env();
    run_crawl(&config, &["init"]);

    let (stdout, _, ok) = run_crawl(&config, &["sessions"]);
    assert!(ok);
    assert!(stdout.contains("No sessions."));

    let (stdout, _, ok) = run_crawl(&config, &["bits", "--json"]);
    assert!(ok);
    let bits: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(bits, serde_json::json!([]));

    let (_, stderr, ok) = run_crawl(&config, &["page", "https://example.com/"]);
    assert!(!ok);
    assert!(stderr.contains("page not found"));
}

#[test]
fn test_start_records_failed_fetch() {
    let (_tmp, config) = setup_test_env();
    run_crawl(&config, &["init"]);

    let (stdout, stderr, ok) = run_crawl(
        &config,
        &["start", "--name", "smoke", "http://127.0.0.1:1/"],
    );
    assert!(ok, "start failed: {}", stderr);
    assert!(stdout.contains("status:        completed"));
    assert!(stdout.contains("errors:        1"));
    assert!(stdout.contains("crawled:       0"));

    let (stdout, _, ok) = run_crawl(&config, &["sessions"]);
    assert!(ok);
    assert!(stdout.contains("smoke"));
    let id = stdout
        .lines()
        .nth(1)
        .and_then(|line| line.split_whitespace().next())
        .unwrap()
        .to_string();

    let (stdout, _, ok) = run_crawl(&config, &["status", &id, "--json"]);
    assert!(ok);
    let session: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(session["status"], "completed");
    assert_eq!(session["counters"]["discovered"], 1);
    assert_eq!(session["counters"]["errors"], 1);
    assert!(!session["ended_at"].is_null());

    let (stdout, _, ok) = run_crawl(&config, &["frontier", "--status", "failed"]);
    assert!(ok);
    assert!(stdout.contains("failed 1"));
    assert!(stdout.contains("http://127.0.0.1:1/"));
}

#[test]
fn test_invalid_importance_filter_is_rejected() {
    let (_tmp, config) = setup_test_env();
    run_crawl(&config, &["init"]);

    let (_, stderr, ok) = run_crawl(&config, &["bits", "--min-importance", "1.5"]);
    assert!(!ok);
    assert!(stderr.contains("min-importance"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, _, ok) = run_crawl(&tmp.path().join("nope.toml"), &["sessions"]);
    assert!(!ok);
}
