//! # stockade-config
//!
//! Configuration management for Stockade workers.
//!
//! Loads configuration from:
//! 1. `~/.stockade/config.toml` (global)
//! 2. `.stockade/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| {
    RwLock::new(Config::load().unwrap_or_else(|e| {
        eprintln!(
            "[stockade-config] WARNING: Failed to load config: {}. Using defaults.",
            e
        );
        Config::default()
    }))
});

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap() = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Current config schema version
pub const CONFIG_VERSION: u32 = 1;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Config schema version (for forward compatibility)
    pub config_version: u32,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            cache: CacheConfig::default(),
        }
    }
}

/// Local blob-cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory holding the blob files and materialized trees
    pub root: PathBuf,
    /// Total on-disk budget in bytes
    pub max_size_bytes: i64,
    /// Largest single blob admitted, in bytes
    pub max_entry_size_bytes: i64,
    /// Directory-index backend: "memory", "file", or "sqlite"
    pub index_backend: String,
    /// Filename of the sqlite index under the cache root, or ":memory:"
    pub index_db_name: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/tmp/stockade/cache"),
            max_size_bytes: 10 * 1024 * 1024 * 1024,
            max_entry_size_bytes: 2 * 1024 * 1024 * 1024,
            index_backend: "sqlite".to_string(),
            index_db_name: "directories.sqlite".to_string(),
        }
    }
}

impl Config {
    /// Load config from standard locations (CWD-relative project config)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_for_project(Path::new("."))
    }

    /// Load config for a specific project root directory.
    /// Resolution order: global → project → env vars.
    pub fn load_for_project(project_root: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.stockade/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        // 2. Load project config (<project_root>/.stockade/config.toml)
        let project_config_path = project_root.join(".stockade/config.toml");
        if project_config_path.exists() {
            debug!("Loading project config from {:?}", project_config_path);
            let contents = std::fs::read_to_string(&project_config_path)?;
            let project_config: Config = toml::from_str(&contents)?;
            config.merge(project_config);
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Global config path: ~/.stockade/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".stockade/config.toml"))
    }

    /// Merge another config (project overrides global).
    /// Non-default values from `other` replace values in `self`.
    fn merge(&mut self, other: Config) {
        let default_cache = CacheConfig::default();
        if other.cache.root != default_cache.root {
            self.cache.root = other.cache.root;
        }
        if other.cache.max_size_bytes != default_cache.max_size_bytes {
            self.cache.max_size_bytes = other.cache.max_size_bytes;
        }
        if other.cache.max_entry_size_bytes != default_cache.max_entry_size_bytes {
            self.cache.max_entry_size_bytes = other.cache.max_entry_size_bytes;
        }
        if other.cache.index_backend != default_cache.index_backend {
            self.cache.index_backend = other.cache.index_backend;
        }
        if other.cache.index_db_name != default_cache.index_db_name {
            self.cache.index_db_name = other.cache.index_db_name;
        }
    }

    /// Apply environment variable overrides (highest priority)
    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("STOCKADE_CACHE_ROOT") {
            self.cache.root = PathBuf::from(root);
        }
        if let Ok(max) = std::env::var("STOCKADE_CACHE_MAX_SIZE") {
            if let Ok(n) = max.parse() {
                self.cache.max_size_bytes = n;
            }
        }
        if let Ok(max) = std::env::var("STOCKADE_CACHE_MAX_ENTRY_SIZE") {
            if let Ok(n) = max.parse() {
                self.cache.max_entry_size_bytes = n;
            }
        }
        if let Ok(backend) = std::env::var("STOCKADE_INDEX_BACKEND") {
            self.cache.index_backend = backend;
        }
        if let Ok(name) = std::env::var("STOCKADE_INDEX_DB") {
            self.cache.index_db_name = name;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.config_version, CONFIG_VERSION);
        assert_eq!(config.cache.index_backend, "sqlite");
        assert!(config.cache.max_entry_size_bytes <= config.cache.max_size_bytes);
    }

    #[test]
    fn test_merge_project_overrides() {
        let mut base = Config::default();
        let mut project = Config::default();
        project.cache.root = PathBuf::from("/srv/worker/cache");
        project.cache.index_backend = "memory".to_string();

        base.merge(project);
        assert_eq!(base.cache.root, PathBuf::from("/srv/worker/cache"));
        assert_eq!(base.cache.index_backend, "memory");
        // untouched fields keep their defaults
        assert_eq!(
            base.cache.index_db_name,
            CacheConfig::default().index_db_name
        );
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml_str = r#"
            [cache]
            root = "/data/cache"
            max_size_bytes = 1024
            index_backend = "file"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.cache.root, PathBuf::from("/data/cache"));
        assert_eq!(config.cache.max_size_bytes, 1024);
        assert_eq!(config.cache.index_backend, "file");
        // defaulted field
        assert_eq!(
            config.cache.index_db_name,
            CacheConfig::default().index_db_name
        );
    }
}
