use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::{sleep, timeout};

/// Write a config rooted in `dir` and return its path
fn write_config(dir: &Path, extra: &str) -> PathBuf {
    let content = format!(
        r#"
[database]
path = "{db}"

[storage]
models_dir = "{models}"

[generator]
endpoint = "http://127.0.0.1:9/generate"
{extra}
"#,
        db = dir.join("data").join("sdhost.db").display(),
        models = dir.join("models").display(),
        extra = extra,
    );
    let path = dir.join("config.toml");
    std::fs::write(&path, content).unwrap();
    path
}

/// Spawn the daemon and return a handle
fn spawn_daemon(config_path: &Path) -> tokio::process::Child {
    tokio::process::Command::new(env!("CARGO_BIN_EXE_sdhost"))
        .env("SDHOST_CONFIG", config_path)
        .env("RUST_LOG", "error") // Quiet logs during tests
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to spawn daemon")
}

/// Wait until `path` exists
async fn wait_for_path(path: &Path, max_attempts: u32) -> bool {
    for _ in 0..max_attempts {
        if path.exists() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn run_to_exit(config_path: &Path) -> std::process::Output {
    timeout(
        Duration::from_secs(5),
        tokio::process::Command::new(env!("CARGO_BIN_EXE_sdhost"))
            .env("SDHOST_CONFIG", config_path)
            .env("RUST_LOG", "error")
            .output(),
    )
    .await
    .expect("Command timed out")
    .expect("Failed to execute command")
}

#[tokio::test]
async fn test_daemon_starts_and_keeps_running() {
    let dir = TempDir::new().unwrap();
    let config_path = write_config(dir.path(), "");

    let mut daemon = spawn_daemon(&config_path);

    assert!(
        wait_for_path(&dir.path().join("data").join("sdhost.db"), 40).await,
        "Database was not created in time"
    );
    assert!(wait_for_path(&dir.path().join("models"), 40).await);

    sleep(Duration::from_millis(200)).await;
    assert!(
        daemon.try_wait().unwrap().is_none(),
        "Daemon exited during startup"
    );

    // Cleanup
    daemon.kill().await.ok();
}

#[tokio::test]
async fn test_missing_config_file_exits_with_error() {
    let result = run_to_exit(Path::new("/nonexistent/config.toml")).await;
    assert!(!result.status.success());
}

#[tokio::test]
async fn test_invalid_config_exits_with_error() {
    let dir = TempDir::new().unwrap();
    let config_path = write_config(
        dir.path(),
        r#"
[downloads]
max_concurrent = 0
"#,
    );

    let result = run_to_exit(&config_path).await;
    assert!(!result.status.success());
    // Validation runs before anything touches the disk
    assert!(!dir.path().join("data").exists());
}

#[tokio::test]
async fn test_malformed_config_exits_with_error() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("config.toml");
    std::fs::write(&config_path, "[downloads\nmax_concurrent = ").unwrap();

    let result = run_to_exit(&config_path).await;
    assert!(!result.status.success());
}
