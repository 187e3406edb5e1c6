//! Configuration structures.
//!
//! Options that travel with individual operations ([`OpenOptions`],
//! [`ReadOptions`], [`WriteOptions`]) plus the component settings the CLI
//! loads from a toml file ([`LodeConfig`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::constants::{DEFAULT_BLOCK_SIZE, DEFAULT_CACHE_CAPACITY, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::error::{LodeError, LodeResult};

// =============================================================================
// Per-operation options
// =============================================================================

/// Options used when a store is opened.
///
/// These options are part of a store's [`StoreIdentity`]: two opens of the
/// same path with different options are distinct identities.
///
/// # Example
///
/// ```rust
/// use lode_common::OpenOptions;
///
/// let opts = OpenOptions::default().with_error_if_exists(true);
/// assert!(opts.create_if_missing);
/// assert!(opts.error_if_exists);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Block size in bytes used for buffered log I/O.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Create the store if it does not exist.
    #[serde(default = "default_true")]
    pub create_if_missing: bool,

    /// Fail if the store already exists.
    #[serde(default)]
    pub error_if_exists: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            create_if_missing: true,
            error_if_exists: false,
        }
    }
}

impl OpenOptions {
    /// Sets the block size.
    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Sets whether a missing store is created.
    #[must_use]
    pub fn with_create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Sets whether an existing store is an error.
    #[must_use]
    pub fn with_error_if_exists(mut self, error: bool) -> Self {
        self.error_if_exists = error;
        self
    }

    /// Validates the options.
    pub fn validate(&self) -> LodeResult<()> {
        if !self.block_size.is_power_of_two()
            || self.block_size < MIN_BLOCK_SIZE
            || self.block_size > MAX_BLOCK_SIZE
        {
            return Err(LodeError::invalid_argument(format!(
                "block_size must be a power of two in [{}, {}], got {}",
                MIN_BLOCK_SIZE, MAX_BLOCK_SIZE, self.block_size
            )));
        }
        Ok(())
    }
}

/// Options for reads and cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOptions {
    /// Populate the engine's value cache with what is read.
    #[serde(default = "default_true")]
    pub fill_cache: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self { fill_cache: true }
    }
}

impl ReadOptions {
    /// Sets whether reads populate the cache.
    #[must_use]
    pub fn with_fill_cache(mut self, fill: bool) -> Self {
        self.fill_cache = fill;
        self
    }
}

/// Options for writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    /// Flush the write to stable storage before returning.
    #[serde(default)]
    pub sync: bool,
}

impl WriteOptions {
    /// Returns options for a durable (synced) write.
    #[must_use]
    pub fn durable() -> Self {
        Self { sync: true }
    }
}

// =============================================================================
// Store identity
// =============================================================================

/// The deduplication key for shared opens: a path plus the options used to
/// open it.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct StoreIdentity {
    path: PathBuf,
    options: OpenOptions,
}

impl StoreIdentity {
    /// Creates an identity.
    pub fn new(path: impl Into<PathBuf>, options: OpenOptions) -> Self {
        Self {
            path: path.into(),
            options,
        }
    }

    /// Returns the store path.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the open options.
    #[inline]
    pub fn options(&self) -> &OpenOptions {
        &self.options
    }
}

impl fmt::Debug for StoreIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreIdentity")
            .field("path", &self.path)
            .field("block_size", &self.options.block_size)
            .finish()
    }
}

impl fmt::Display for StoreIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

// =============================================================================
// Component configuration
// =============================================================================

/// Where a registry performs engine opens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenMode {
    /// Open on the thread that first acquires the identity.
    Inline,
    /// Open on a dedicated thread; acquirers are queued until it completes.
    #[default]
    Background,
}

/// Handle registry configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Where engine opens run.
    #[serde(default)]
    pub open_mode: OpenMode,
}

impl RegistryConfig {
    /// Sets the open mode.
    #[must_use]
    pub fn with_open_mode(mut self, mode: OpenMode) -> Self {
        self.open_mode = mode;
        self
    }

    /// Configuration for tests: opens run inline so failures surface on the
    /// calling thread.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            open_mode: OpenMode::Inline,
        }
    }
}

/// Storage engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of values kept in the read cache. Zero disables the cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Sets the cache capacity.
    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Small cache for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self { cache_capacity: 16 }
    }
}

/// Top-level configuration, loadable from a toml file.
///
/// Every field has a serde default, so an empty file is a valid config.
///
/// ```toml
/// [open]
/// block_size = 8192
/// create_if_missing = true
///
/// [registry]
/// open_mode = "inline"
///
/// [engine]
/// cache_capacity = 4096
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LodeConfig {
    /// Options used when opening stores.
    #[serde(default)]
    pub open: OpenOptions,

    /// Read options applied to gets and scans.
    #[serde(default)]
    pub read: ReadOptions,

    /// Handle registry settings.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Engine settings.
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_true() -> bool {
    true
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

impl LodeConfig {
    /// Loads configuration from a toml file.
    pub fn from_file(path: &Path) -> LodeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a toml string.
    pub fn from_toml(content: &str) -> LodeResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| LodeError::invalid_argument(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Converts configuration to a toml string.
    pub fn to_toml(&self) -> LodeResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| LodeError::invalid_argument(format!("cannot encode config: {}", e)))
    }

    /// Saves configuration to a file.
    pub fn save(&self, path: &Path) -> LodeResult<()> {
        let content = self.to_toml()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> LodeResult<()> {
        self.open.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_options_defaults() {
        let opts = OpenOptions::default();
        assert_eq!(opts.block_size, 4096);
        assert!(opts.create_if_missing);
        assert!(!opts.error_if_exists);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_open_options_validate() {
        assert!(OpenOptions::default().with_block_size(1000).validate().is_err());
        assert!(OpenOptions::default().with_block_size(256).validate().is_err());
        assert!(OpenOptions::default()
            .with_block_size(2 * 1024 * 1024)
            .validate()
            .is_err());
        assert!(OpenOptions::default().with_block_size(512).validate().is_ok());
    }

    #[test]
    fn test_identity_includes_options() {
        let a = StoreIdentity::new("/data/a", OpenOptions::default());
        let b = StoreIdentity::new("/data/a", OpenOptions::default());
        let c = StoreIdentity::new("/data/a", OpenOptions::default().with_block_size(8192));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "/data/a");
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = LodeConfig::from_toml("").unwrap();
        assert_eq!(config, LodeConfig::default());
        assert_eq!(config.registry.open_mode, OpenMode::Background);
    }

    #[test]
    fn test_partial_toml() {
        let config = LodeConfig::from_toml(
            r#"
            [open]
            block_size = 8192

            [registry]
            open_mode = "inline"
            "#,
        )
        .unwrap();
        assert_eq!(config.open.block_size, 8192);
        assert!(config.open.create_if_missing);
        assert_eq!(config.registry.open_mode, OpenMode::Inline);
        assert_eq!(config.engine.cache_capacity, DEFAULT_CACHE_CAPACITY);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        let err = LodeConfig::from_toml("[open]\nblock_size = 3").unwrap_err();
        assert!(matches!(err, LodeError::InvalidArgument(_)));
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("conf").join("lode.toml");

        let config = LodeConfig {
            engine: EngineConfig::default().with_cache_capacity(7),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = LodeConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
