//! Engine lookup by name.

use std::collections::BTreeMap;
use std::path::PathBuf;

use btrdiff_config::StorageConfig;
use serde::Deserialize;

use crate::{CasStorage, FilesystemStorage, Result, Storage, StoreError};

/// Which engine to build and where it keeps its blobs.
///
/// ```json
/// {"name": "cas", "base_dir": "/var/lib/btrdiff/blobs"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageSpec {
    pub name: String,
    pub base_dir: PathBuf,
}

impl From<&StorageConfig> for StorageSpec {
    fn from(config: &StorageConfig) -> Self {
        Self {
            name: config.engine.clone(),
            base_dir: config.base_dir.clone(),
        }
    }
}

pub type EngineCtor = fn(&StorageSpec) -> Result<Box<dyn Storage>>;

fn make_filesystem(spec: &StorageSpec) -> Result<Box<dyn Storage>> {
    Ok(Box::new(FilesystemStorage::new(&spec.base_dir)?))
}

fn make_cas(spec: &StorageSpec) -> Result<Box<dyn Storage>> {
    Ok(Box::new(CasStorage::new(&spec.base_dir)?))
}

#[derive(Debug, Clone)]
pub struct StorageRegistry {
    engines: BTreeMap<String, EngineCtor>,
}

impl Default for StorageRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(FilesystemStorage::NAME, make_filesystem);
        registry.register(CasStorage::NAME, make_cas);
        registry
    }
}

impl StorageRegistry {
    /// Registry with the built-in engines.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with no engines at all.
    pub fn empty() -> Self {
        Self {
            engines: BTreeMap::new(),
        }
    }

    /// Add or replace an engine.
    pub fn register(&mut self, name: &str, ctor: EngineCtor) {
        self.engines.insert(name.to_string(), ctor);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.engines.keys().map(String::as_str)
    }

    pub fn make(&self, spec: &StorageSpec) -> Result<Box<dyn Storage>> {
        let ctor = self
            .engines
            .get(&spec.name)
            .ok_or_else(|| StoreError::UnknownEngine {
                name: spec.name.clone(),
            })?;
        ctor(spec)
    }

    /// Build from a JSON [`StorageSpec`].
    pub fn from_json(&self, json: &str) -> Result<Box<dyn Storage>> {
        let spec: StorageSpec = serde_json::from_str(json)?;
        self.make(&spec)
    }

    pub fn from_config(&self, config: &StorageConfig) -> Result<Box<dyn Storage>> {
        self.make(&StorageSpec::from(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_engines() {
        let registry = StorageRegistry::new();
        assert_eq!(registry.names().collect::<Vec<_>>(), ["cas", "filesystem"]);
    }

    #[test]
    fn test_from_json() {
        let temp = TempDir::new().unwrap();
        let json = serde_json::json!({
            "name": "cas",
            "base_dir": temp.path(),
        })
        .to_string();

        let storage = StorageRegistry::new().from_json(&json).unwrap();
        assert_eq!(storage.name(), "cas");
    }

    #[test]
    fn test_unknown_engine() {
        let spec = StorageSpec {
            name: "s3".to_string(),
            base_dir: PathBuf::from("/nowhere"),
        };
        assert!(matches!(
            StorageRegistry::new().make(&spec),
            Err(StoreError::UnknownEngine { name }) if name == "s3"
        ));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            StorageRegistry::new().from_json("{\"name\": 3}"),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn test_from_config() {
        let temp = TempDir::new().unwrap();
        let config = StorageConfig {
            engine: "filesystem".to_string(),
            base_dir: temp.path().join("blobs"),
        };
        let storage = StorageRegistry::new().from_config(&config).unwrap();
        assert_eq!(storage.name(), "filesystem");
        assert!(temp.path().join("blobs").is_dir());
    }
}
