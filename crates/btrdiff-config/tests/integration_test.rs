//! Integration tests for btrdiff-config
//!
//! These tests verify the full config loading pipeline with real file system operations.

use std::path::PathBuf;

use btrdiff_config::testing::TestEnvironment;
use btrdiff_config::Config;
use tempfile::tempdir;

/// Test config loading from a real global config file
#[test]
fn test_load_global_config_from_file() {
    let temp = tempdir().unwrap();
    let global = temp.path().join("config.toml");
    std::fs::write(
        &global,
        r#"
[storage]
engine = "cas"
base_dir = "/custom/blobs"

[decode]
max_command_len = 65536

[filters]
drop_selinux_xattrs = true
selinux_xattr_values = ["system_u:object_r:etc_t:s0"]
"#,
    )
    .unwrap();

    let config = Config::load_from(Some(global.as_path()), None).unwrap();
    assert_eq!(config.storage.engine, "cas");
    assert_eq!(config.storage.base_dir, PathBuf::from("/custom/blobs"));
    assert_eq!(config.decode.max_command_len, 65536);
    assert_eq!(
        config.filters.selinux_values(),
        Some(vec![b"system_u:object_r:etc_t:s0".to_vec()])
    );
    assert_eq!(config.log.level, "info");
}

/// Project config overrides global key by key
#[test]
fn test_config_hierarchy_project_overrides_global() {
    let env = TestEnvironment::new().unwrap();
    let global = env.create_file(
        "global.toml",
        br#"
[storage]
engine = "cas"
base_dir = "/global/blobs"

[log]
level = "debug"
"#,
    )
    .unwrap();
    let project = env
        .write_project_config(
            r#"
[storage]
base_dir = "/project/blobs"
"#,
        )
        .unwrap();

    let config = Config::load_from(Some(global.as_path()), Some(project.as_path())).unwrap();
    assert_eq!(config.storage.engine, "cas");
    assert_eq!(config.storage.base_dir, PathBuf::from("/project/blobs"));
    assert_eq!(config.log.level, "debug");
}

/// Missing files fall back to defaults
#[test]
fn test_missing_files_use_defaults() {
    let temp = tempdir().unwrap();
    let global = temp.path().join("nope.toml");
    let project = temp.path().join("also-nope.toml");
    let config = Config::load_from(Some(global.as_path()), Some(project.as_path())).unwrap();
    assert_eq!(config, Config::default());
}

/// A malformed file is reported, not ignored
#[test]
fn test_malformed_config_is_an_error() {
    let temp = tempdir().unwrap();
    let bad = temp.path().join("config.toml");
    std::fs::write(&bad, "[storage\nengine = ").unwrap();
    assert!(Config::load_from(Some(bad.as_path()), None).is_err());
}

/// The rendered defaults parse back to the defaults
#[test]
fn test_default_toml_parses() {
    let rendered = Config::default_toml().unwrap();
    let parsed: Config = toml::from_str(&rendered).unwrap();
    assert_eq!(parsed, Config::default());
}
