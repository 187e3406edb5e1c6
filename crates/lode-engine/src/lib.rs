//! # lode-engine
//!
//! The ordered key-value storage engine underneath lode handles.
//!
//! The handle and cursor layer only depends on the traits in this crate:
//!
//! - [`EngineOpener`]: opens a store at a path with [`OpenOptions`](lode_common::OpenOptions)
//! - [`StorageEngine`]: point get/put/delete, iterator creation, close
//! - [`RawIterator`]: blocking forward iteration with seek
//!
//! [`LogEngine`] is the bundled implementation: an append-only data log
//! with an ordered in-memory index, CRC-checked records, torn-tail
//! recovery, and a clock-replacement value cache.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cache;
mod error;
mod log_engine;
mod record;
mod traits;

pub use cache::ValueCache;
pub use error::{EngineError, EngineResult};
pub use log_engine::{EngineStats, LogEngine, LogEngineOpener, LogIterator};
pub use record::{RecordHeader, TOMBSTONE};
pub use traits::{EngineOpener, RawIterator, StorageEngine};
