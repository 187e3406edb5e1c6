//! The interface the handle and cursor layer needs from a storage engine.

use std::path::Path;

use bytes::Bytes;
use lode_common::{LodeResult, OpenOptions, ReadOptions, WriteOptions};

/// Opens engines. The registry holds one opener and calls it at most once
/// per in-flight identity.
pub trait EngineOpener: Send + Sync {
    /// Opens (or creates) the store at `path`.
    fn open(&self, path: &Path, options: &OpenOptions) -> LodeResult<Box<dyn StorageEngine>>;
}

/// An open ordered key-value store.
///
/// Keys are ordered byte-wise lexicographically.
pub trait StorageEngine: Send + Sync {
    /// Reads a key. A miss is `Ok(None)`.
    fn get(&self, options: &ReadOptions, key: &[u8]) -> LodeResult<Option<Bytes>>;

    /// Writes a key.
    fn put(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> LodeResult<()>;

    /// Deletes a key. Deleting a missing key succeeds.
    fn delete(&self, options: &WriteOptions, key: &[u8]) -> LodeResult<()>;

    /// Creates an unpositioned forward iterator.
    fn iter(&self, options: &ReadOptions) -> LodeResult<Box<dyn RawIterator>>;

    /// Number of live keys.
    fn key_count(&self) -> LodeResult<usize>;

    /// Flushes and releases the store. Every later call fails with
    /// `ResourceClosed`.
    fn close(&self) -> LodeResult<()>;
}

/// A raw forward iterator over an engine.
///
/// A fresh iterator is not positioned: `valid()` is false until one of the
/// seek methods is called.
pub trait RawIterator: Send {
    /// Positions at the first key.
    fn seek_to_first(&mut self);

    /// Positions at the first key `>= target`.
    fn seek(&mut self, target: &[u8]);

    /// Advances one key. No-op when not valid.
    fn next(&mut self);

    /// Returns true when positioned at an entry.
    fn valid(&self) -> bool;

    /// Current key, when valid.
    fn key(&self) -> Option<&[u8]>;

    /// Current value, when valid.
    fn value(&self) -> Option<&[u8]>;

    /// Error that made the iterator invalid, if any.
    fn status(&self) -> LodeResult<()>;
}
