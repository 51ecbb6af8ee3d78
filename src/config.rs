use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{env, fs};

use anyhow::{Context, bail};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::logger::LogConfig;

/// Runtime tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Upper bound on messages a node may hold pending (0 = unlimited).
    pub node_message_buffer_max_length: usize,
    /// Default wall-clock limit for a single function run, overridden per node.
    pub function_timeout_ms: Option<u64>,
    /// Operation budget for a single function run (0 = unlimited).
    pub function_max_operations: u64,
    /// Warn when an input has not completed after this long (0 = never).
    pub done_watchdog_ms: u64,
    pub reconnect_interval_ms: u64,
    /// Named context stores. `default` may name another store.
    pub context_storage: BTreeMap<String, StoreConfig>,
    /// Seed values for the global context.
    pub global_context: Map<String, Value>,
    pub log: LogConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node_message_buffer_max_length: 0,
            function_timeout_ms: None,
            function_max_operations: 0,
            done_watchdog_ms: 30_000,
            reconnect_interval_ms: 5_000,
            context_storage: BTreeMap::new(),
            global_context: Map::new(),
            log: LogConfig::default(),
        }
    }
}

/// A context store entry: either a backend or an alias naming another store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum StoreConfig {
    Alias(String),
    Backend { module: StoreModule },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreModule {
    Memory,
}

impl Settings {
    /// Load settings from a `.json`, `.yaml` or `.yml` file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("could not read settings {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let settings = match ext.as_str() {
            "json" => serde_json::from_str(&text)
                .with_context(|| format!("invalid JSON settings {}", path.display()))?,
            "yaml" | "yml" => serde_yaml_bw::from_str(&text)
                .with_context(|| format!("invalid YAML settings {}", path.display()))?,
            other => bail!("unsupported settings extension `{other}`"),
        };
        Ok(settings)
    }
}

/// Source of configuration values looked up by name (`env.get`).
pub trait ConfigManagerType: Send + Sync {
    fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys() {
            if let Some(value) = self.get(&key) {
                config.push((key, value));
            }
        }
        config
    }
    fn keys(&self) -> Vec<String>;
    fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn get(&self, key: &str) -> Option<String> {
        self.0.get(key)
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        ConfigManager(Box::new(EnvConfigManager::process()))
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, optionally primed from a `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: Option<PathBuf>,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(e) => warn!("could not parse {}: {}", env_file.display(), e),
            }
        } else {
            warn!("could not load .env from {}", env_file.display())
        }
        Box::new(Self {
            env_file: Some(env_file),
        })
    }

    /// Plain process environment, no file.
    pub fn process() -> Self {
        Self { env_file: None }
    }
}

impl ConfigManagerType for EnvConfigManager {
    fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        match &self.env_file {
            Some(path) => format!("EnvConfigManager({})", path.display()),
            None => "EnvConfigManager".to_string(),
        }
    }
}

/// In-memory values; clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: Arc<DashMap<String, String>>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }

    pub fn del(&self, key: &str) {
        self.map.remove(key);
    }
}

impl ConfigManagerType for MapConfigManager {
    fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs::write;
    use tempfile::tempdir;

    #[test]
    fn test_map_config_manager_basic() {
        let mgr = MapConfigManager::new();
        mgr.set("foo", "bar");
        assert_eq!(mgr.get("foo"), Some("bar".to_string()));

        mgr.set("foo", "baz");
        assert_eq!(mgr.get("foo"), Some("baz".to_string()));
        assert_eq!(mgr.keys(), vec!["foo".to_string()]);

        mgr.del("foo");
        assert_eq!(mgr.get("foo"), None);
    }

    #[test]
    fn test_map_config_manager_clones_share_values() {
        let mgr = MapConfigManager::new();
        let wrapped = ConfigManager(mgr.clone_box());
        mgr.set("a", "1");
        mgr.set("b", "2");
        assert_eq!(wrapped.get("a"), Some("1".to_string()));

        let mut config = wrapped.0.as_vec();
        config.sort();
        assert_eq!(
            config,
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );
    }

    #[test]
    fn test_env_config_manager_with_temp_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "REDFLOW_TEST_API_KEY=abc123\n").unwrap();

        let mgr = EnvConfigManager::new(env_path);
        assert_eq!(mgr.get("REDFLOW_TEST_API_KEY"), Some("abc123".to_string()));
        assert!(mgr.keys().contains(&"REDFLOW_TEST_API_KEY".to_string()));
    }

    #[test]
    fn test_settings_defaults() {
        let settings: Settings = serde_json::from_value(json!({})).unwrap();
        assert_eq!(settings.reconnect_interval_ms, 5_000);
        assert_eq!(settings.node_message_buffer_max_length, 0);
        assert!(settings.context_storage.is_empty());
    }

    #[test]
    fn test_settings_load_yaml_and_json() {
        let dir = tempdir().unwrap();
        let yaml = dir.path().join("settings.yaml");
        write(
            &yaml,
            "node_message_buffer_max_length: 10\ncontext_storage:\n  default: mem\n  mem:\n    module: memory\n",
        )
        .unwrap();
        let settings = Settings::load(&yaml).unwrap();
        assert_eq!(settings.node_message_buffer_max_length, 10);
        assert_eq!(
            settings.context_storage.get("default"),
            Some(&StoreConfig::Alias("mem".to_string()))
        );
        assert_eq!(
            settings.context_storage.get("mem"),
            Some(&StoreConfig::Backend { module: StoreModule::Memory })
        );

        let json_path = dir.path().join("settings.json");
        write(&json_path, r#"{"global_context": {"site": "lab"}}"#).unwrap();
        let settings = Settings::load(&json_path).unwrap();
        assert_eq!(settings.global_context.get("site"), Some(&json!("lab")));

        let bad = dir.path().join("settings.toml");
        write(&bad, "").unwrap();
        assert!(Settings::load(&bad).is_err());
    }
}
