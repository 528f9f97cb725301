use super::*;
use std::collections::HashMap;
use tempfile::TempDir;

#[test]
fn test_defaults() {
    let config = ServerConfig::default();
    assert_eq!(config.workspace_root, PathBuf::from(".repos"));
    assert_eq!(config.bind_addr(), "127.0.0.1:8000");
    assert_eq!(config.api_url(), "http://127.0.0.1:8000");
    assert_eq!(config.heartbeat_timeout, Duration::from_secs(120));
    assert_eq!(config.sweep_interval, Duration::from_secs(30));
    assert!(config.validate().is_ok());
}

#[test]
fn test_toml_with_humantime_durations() {
    let config = ServerConfig::from_toml(
        r#"
workspace_root = "/srv/repos"
port = 9000
heartbeat_timeout = "2m"
sweep_interval = "10s"
clone_timeout = "1m 30s"
api_base_url = "https://repo2md.example.com"
"#,
    )
    .unwrap();

    assert_eq!(config.workspace_root, PathBuf::from("/srv/repos"));
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.port, 9000);
    assert_eq!(config.heartbeat_timeout, Duration::from_secs(120));
    assert_eq!(config.sweep_interval, Duration::from_secs(10));
    assert_eq!(config.clone_timeout, Duration::from_secs(90));
    assert_eq!(config.api_url(), "https://repo2md.example.com");
}

#[test]
fn test_invalid_toml_rejected() {
    assert!(ServerConfig::from_toml("port = \"eighty\"").is_err());
    assert!(ServerConfig::from_toml("heartbeat_timeout = \"soon\"").is_err());
}

#[test]
fn test_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("repo2md.toml");
    std::fs::write(&path, "host = \"0.0.0.0\"\n").unwrap();

    let config = ServerConfig::from_file(&path).unwrap();
    assert_eq!(config.host, "0.0.0.0");
    assert!(ServerConfig::from_file(&dir.path().join("missing.toml")).is_err());
}

#[test]
fn test_env_overrides() {
    let env: HashMap<&str, &str> = [
        (ENV_ROOT, "/tmp/ws"),
        (ENV_PORT, "8123"),
        (ENV_HEARTBEAT_TIMEOUT, "60"),
        (ENV_SWEEP_INTERVAL, "not-a-number"),
        (ENV_MAX_ARCHIVE_BYTES, "1024"),
    ]
    .into_iter()
    .collect();

    let mut config = ServerConfig::default();
    config.merge_env_from(|key| env.get(key).map(|v| v.to_string()));

    assert_eq!(config.workspace_root, PathBuf::from("/tmp/ws"));
    assert_eq!(config.port, 8123);
    assert_eq!(config.heartbeat_timeout, Duration::from_secs(60));
    assert_eq!(config.sweep_interval, Duration::from_secs(30));
    assert_eq!(config.max_archive_bytes, 1024);
}

#[test]
fn test_cli_overrides_win() {
    let mut config = ServerConfig::default();
    config.merge_env_from(|key| (key == ENV_PORT).then(|| "7000".to_string()));
    config.apply_overrides(Some(PathBuf::from("ws")), None, Some(7001));

    assert_eq!(config.workspace_root, PathBuf::from("ws"));
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.port, 7001);
}

#[test]
fn test_validate_rejects_bad_intervals() {
    let mut config = ServerConfig {
        sweep_interval: Duration::ZERO,
        ..ServerConfig::default()
    };
    assert!(config.validate().is_err());

    config.sweep_interval = Duration::from_secs(300);
    assert!(config.validate().is_err());

    config.sweep_interval = Duration::from_secs(30);
    config.max_archive_bytes = 0;
    assert!(config.validate().is_err());
}
