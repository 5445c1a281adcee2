//! Integration tests for configuration loading

use clipshift::config::{BackendConfig, Config, ConfigError};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_example_config_loads() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");

    Config::write_example(&path, false).unwrap();
    let config = Config::load_config(Some(path.clone())).unwrap();
    assert!(matches!(config.backend, BackendConfig::PushRelay(_)));

    // Existing file is kept unless forced
    assert!(matches!(
        Config::write_example(&path, false),
        Err(ConfigError::Validation(_))
    ));
    Config::write_example(&path, true).unwrap();
}

#[test]
fn test_env_var_points_at_config() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("custom.toml");
    fs::write(
        &path,
        r#"
log_level = "debug"

[backend]
type = "push-relay"
client_id = "desk"
host = "https://ntfy.sh"
topic = "clips"
"#,
    )
    .unwrap();

    std::env::set_var("CLIPSHIFT_CONFIG", &path);
    let config = Config::load().unwrap();
    std::env::remove_var("CLIPSHIFT_CONFIG");

    assert_eq!(config.log_level, "debug");
    assert_eq!(config.backend.client_id(), Some("desk"));
}

#[test]
fn test_invalid_file_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("broken.toml");
    fs::write(&path, "[backend\ntype = ").unwrap();

    assert!(matches!(
        Config::load_config(Some(path)),
        Err(ConfigError::Toml(_))
    ));
}

#[test]
fn test_missing_file_is_io_error() {
    let temp_dir = TempDir::new().unwrap();
    assert!(matches!(
        Config::load_config(Some(temp_dir.path().join("absent.toml"))),
        Err(ConfigError::Io(_))
    ));
}
