//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage temporary cache roots with
//! unique ids, so concurrent tests never share on-disk state.
//!
//! # Usage
//!
//! ```ignore
//! use stockade_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     // env.cache_root is isolated; dropped with the environment
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::{CacheConfig, Config};

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Isolated cache root directory
    pub cache_root: PathBuf,
    /// Scratch directory for test inputs
    pub scratch: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let cache_root = root.join("cache");
        let scratch = root.join("scratch");
        std::fs::create_dir_all(&cache_root)?;
        std::fs::create_dir_all(&scratch)?;

        Ok(Self {
            _temp_dir: temp_dir,
            cache_root,
            scratch,
            test_id,
        })
    }

    /// Build a `Config` whose cache section points into this environment.
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.cache = CacheConfig {
            root: self.cache_root.clone(),
            ..CacheConfig::default()
        };
        config
    }

    /// Create a scratch file with content, returning its path.
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.scratch.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.cache_root.exists());
        assert!(env.scratch.exists());
    }

    #[test]
    fn test_environment_has_unique_roots() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.cache_root, env2.cache_root);
        assert_ne!(env1.test_id, env2.test_id);
    }

    #[test]
    fn test_create_file() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_file("inputs/a.txt", b"payload").unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
    }

    #[test]
    fn test_config_points_at_environment() {
        let env = TestEnvironment::new().unwrap();
        let config = env.config();
        assert_eq!(config.cache.root, env.cache_root);
    }
}
