//! # lode-dispatch
//!
//! Thin request router in front of [`lode_core`].
//!
//! Callers address handles and cursors by [`HandleId`](lode_common::HandleId)
//! and [`CursorId`](lode_common::CursorId). The [`Dispatcher`] resolves the
//! ids, calls into the registry, handles, and cursors, and posts each result
//! to the request's reply channel exactly once.
//!
//! ```text
//!   Request ──► Dispatcher ──┬── handles: HandleId → Handle ──► HandleRegistry
//!                            └── cursors: CursorId → Cursor ──► RowSink
//! ```
//!
//! Errors cross this boundary as [`ErrorKind`](lode_common::ErrorKind)
//! codes. Ids that were never issued, or were forgotten, report
//! `ResourceClosed`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dispatcher;
pub mod request;

pub use dispatcher::{DispatchStats, Dispatcher};
pub use request::{DispatchResult, Request};
