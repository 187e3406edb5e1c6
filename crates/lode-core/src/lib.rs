//! # lode-core
//!
//! Concurrency-safe handle and cursor lifecycle for an embedded ordered
//! key-value store.
//!
//! Store handles and cursors may be opened, used, and dropped from many
//! threads at once, some of them without explicit cleanup. This crate makes
//! that safe:
//!
//! - [`HandleRegistry`] opens each store identity exactly once, shares it
//!   between callers, and closes it exactly once when the last caller and
//!   the last cursor are done.
//! - [`Handle`] is one caller's interest in a store: point reads and writes,
//!   cursor creation, and an idempotent close that cancels the caller's
//!   cursors before releasing the store.
//! - [`Cursor`] is a pausable, pull-based range scan with quotas and
//!   backpressure, safe to cancel at any time.
//!
//! # Architecture
//!
//! ```text
//!   callers ──► HandleRegistry ──(identity → SharedStore)──► StorageEngine
//!                    │                     ▲      ▲
//!                    ▼                     │      │ OpenRef + StoreRef
//!                 Handle ──── cursor() ──► Cursor ──► worker thread ──► RawIterator
//!                                              │
//!                                              └──► RowSink ──► RowStream
//! ```
//!
//! ## Locking
//!
//! Lock order is registry maps, then store state. A handle's locks and a
//! cursor's lock are never held while a registry or store lock is taken
//! for a release, and no lock is held across engine I/O.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lode_common::{EngineConfig, OpenOptions, RegistryConfig, StoreIdentity};
//! use lode_core::{HandleRegistry, RangeBounds, ScanEnd};
//! use lode_engine::LogEngineOpener;
//!
//! let registry = HandleRegistry::new(
//!     Arc::new(LogEngineOpener::new(EngineConfig::default())),
//!     RegistryConfig::default(),
//! );
//! let handle = registry.acquire(StoreIdentity::new("/tmp/lode", OpenOptions::default()), true);
//! handle.put(b"a", b"1", false).unwrap();
//!
//! let cursor = handle.cursor(RangeBounds::all()).unwrap();
//! let (rows, end) = cursor.pull(100).collect_blocking();
//! assert_eq!(rows.len(), 1);
//! assert_eq!(end, ScanEnd::ExhaustedRange);
//!
//! handle.close().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Scan range bounds.
pub mod bounds;

/// Cursor engine.
pub mod cursor;

/// Client handles.
pub mod handle;

/// Shared-open registry.
pub mod registry;

/// Reply channels and row streams.
pub mod reply;

mod store;

pub use bounds::RangeBounds;
pub use cursor::{Cursor, RunState};
pub use handle::Handle;
pub use registry::{HandleRegistry, RegistryStats};
pub use reply::{ReplyChannel, RowEvent, RowSink, RowStream, ScanEnd};
pub use store::StoreStatus;
