//! Defaults and limits used across lode.

// =============================================================================
// Engine Constants
// =============================================================================

/// Default block size in bytes (4 KB).
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;

/// Smallest accepted block size in bytes.
pub const MIN_BLOCK_SIZE: usize = 512;

/// Largest accepted block size in bytes (1 MB).
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// Default number of values held by the engine's read cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Name of the append-only data file inside a store directory.
pub const DATA_FILE_NAME: &str = "data.log";

/// Maximum key size in bytes (64 KB).
pub const MAX_KEY_SIZE: usize = 64 * 1024;

/// Maximum value size in bytes (64 MB).
pub const MAX_VALUE_SIZE: usize = 64 * 1024 * 1024;

// =============================================================================
// Cursor Constants
// =============================================================================

/// Row limit meaning "no limit".
pub const UNBOUNDED_LIMIT: i64 = -1;

/// Default number of rows requested per pull by the CLI.
pub const DEFAULT_PULL_BATCH: u32 = 128;
