//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Temporary blob store roots
//! - Send-stream fixture files
//! - Project-local config files
//!
//! # Usage
//!
//! ```ignore
//! use btrdiff_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let stream = env.create_stream("base.send", &bytes).unwrap();
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Isolated blob store root
    pub store_root: PathBuf,
    /// Directory holding stream fixtures
    pub stream_dir: PathBuf,
    /// Project root for the test
    pub project_root: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let project_root = root.join("project");
        let store_root = root.join("store");
        let stream_dir = root.join("streams");

        std::fs::create_dir_all(project_root.join(".btrdiff"))?;
        std::fs::create_dir_all(&store_root)?;
        std::fs::create_dir_all(&stream_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            store_root,
            stream_dir,
            project_root,
            test_id,
        })
    }

    /// Write a send-stream fixture and return its path
    pub fn create_stream(&self, name: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.stream_dir.join(name);
        std::fs::write(&path, bytes)?;
        Ok(path)
    }

    /// Create a test file under the project root
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.project_root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Path of the project-local config file
    pub fn project_config_path(&self) -> PathBuf {
        self.project_root.join(".btrdiff/config.toml")
    }

    /// Write the project-local config file
    pub fn write_project_config(&self, toml: &str) -> anyhow::Result<PathBuf> {
        let path = self.project_config_path();
        std::fs::write(&path, toml)?;
        Ok(path)
    }

    /// Default config pointed at this environment's store root
    pub fn config(&self, engine: &str) -> Config {
        let mut cfg = Config::default();
        cfg.storage.engine = engine.to_string();
        cfg.storage.base_dir = self.store_root.join(engine);
        cfg
    }

    /// Environment variables that point a spawned `btrdiff` at this store.
    pub fn env_vars(&self, engine: &str) -> Vec<(String, String)> {
        let cfg = self.config(engine);
        vec![
            (
                crate::ENV_STORAGE_DIR.to_string(),
                cfg.storage.base_dir.to_string_lossy().into_owned(),
            ),
            (crate::ENV_STORAGE_ENGINE.to_string(), cfg.storage.engine),
        ]
    }
}
