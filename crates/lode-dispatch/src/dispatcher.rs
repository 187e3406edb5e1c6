//! Routes id-addressed requests to handles and cursors.
//!
//! The dispatcher keeps two id tables. An entry stays in its table after
//! the handle is closed or the cursor cancelled, so repeated closes and
//! cancels report `AlreadyClosed`/`ResourceClosed` rather than an unknown
//! id; the entry goes away when the caller forgets the id. Forgetting an id
//! that was never closed closes it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use lode_common::{
    CursorId, ErrorKind, HandleId, LodeConfig, LodeError, OpenOptions, RegistryConfig,
    StoreIdentity,
};
use lode_core::{Cursor, Handle, HandleRegistry, RangeBounds, ReplyChannel, RowSink, ScanEnd};
use lode_engine::{EngineOpener, LogEngineOpener};

use crate::request::{DispatchResult, Request};

/// Dispatcher counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Requests dispatched.
    pub requests: AtomicU64,
    /// Requests that replied with an error.
    pub errors: AtomicU64,
    /// Rows requested through `PullRows`.
    pub rows_requested: AtomicU64,
}

struct DispatchShared {
    registry: HandleRegistry,
    default_options: OpenOptions,
    handles: DashMap<HandleId, Handle>,
    cursors: DashMap<CursorId, Arc<Cursor>>,
    next_handle: AtomicU64,
    stats: DispatchStats,
}

impl DispatchShared {
    fn handle(&self, id: HandleId) -> DispatchResult<Handle> {
        self.handles
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(ErrorKind::ResourceClosed)
    }

    /// Clones the cursor out so no table shard stays locked while it runs.
    fn cursor(&self, id: CursorId) -> Option<Arc<Cursor>> {
        self.cursors.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    fn record<T>(&self, op: &'static str, result: DispatchResult<T>) -> DispatchResult<T> {
        if let Err(kind) = &result {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            debug!(op, error = %kind, "request failed");
        }
        result
    }
}

/// Front door for id-addressed requests.
///
/// Cloning is cheap; clones share tables.
///
/// # Example
///
/// ```rust,no_run
/// use lode_common::{LodeConfig, StoreIdentity};
/// use lode_core::ReplyChannel;
/// use lode_dispatch::Dispatcher;
///
/// let dispatcher = Dispatcher::from_config(&LodeConfig::default());
/// let (reply, rx) = ReplyChannel::oneshot();
/// dispatcher.open(dispatcher.identity("/tmp/lode"), true, reply);
/// let handle = rx.blocking_recv().unwrap().unwrap();
/// dispatcher.put(handle, b"k", b"v", false).unwrap();
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<DispatchShared>,
}

impl Dispatcher {
    /// Creates a dispatcher over a registry that opens engines with `opener`.
    pub fn new(opener: Arc<dyn EngineOpener>, config: RegistryConfig) -> Self {
        Self::with_registry(HandleRegistry::new(opener, config), OpenOptions::default())
    }

    /// Creates a dispatcher backed by the log engine, configured from `config`.
    pub fn from_config(config: &LodeConfig) -> Self {
        let opener = Arc::new(LogEngineOpener::new(config.engine.clone()));
        Self::with_registry(HandleRegistry::new(opener, config.registry.clone()), config.open)
    }

    /// Creates a dispatcher over an existing registry.
    pub fn with_registry(registry: HandleRegistry, default_options: OpenOptions) -> Self {
        Self {
            shared: Arc::new(DispatchShared {
                registry,
                default_options,
                handles: DashMap::new(),
                cursors: DashMap::new(),
                next_handle: AtomicU64::new(1),
                stats: DispatchStats::default(),
            }),
        }
    }

    /// Builds an identity for `path` with the dispatcher's default options.
    pub fn identity(&self, path: impl Into<std::path::PathBuf>) -> StoreIdentity {
        StoreIdentity::new(path, self.shared.default_options)
    }

    /// The registry requests are routed to.
    pub fn registry(&self) -> &HandleRegistry {
        &self.shared.registry
    }

    /// Dispatcher counters.
    pub fn stats(&self) -> &DispatchStats {
        &self.shared.stats
    }

    /// Number of handle ids currently known, closed or not.
    pub fn handle_count(&self) -> usize {
        self.shared.handles.len()
    }

    /// Number of cursor ids currently known, cancelled or not.
    pub fn cursor_count(&self) -> usize {
        self.shared.cursors.len()
    }

    // =========================================================================
    // Message entry point
    // =========================================================================

    /// Executes one request and posts its reply.
    ///
    /// Everything but `Open` replies before this returns. `Open` replies
    /// once the store's open completes, possibly on another thread.
    pub fn dispatch(&self, request: Request) {
        self.shared.stats.requests.fetch_add(1, Ordering::Relaxed);
        trace!(?request, "dispatch");
        match request {
            Request::Open {
                identity,
                shared,
                reply,
            } => self.open(identity, shared, reply),
            Request::Close { handle, reply } => reply.post(self.close(handle)),
            Request::Get { handle, key, reply } => reply.post(self.get(handle, &key)),
            Request::Put {
                handle,
                key,
                value,
                durable,
                reply,
            } => reply.post(self.put(handle, &key, &value, durable)),
            Request::Delete { handle, key, reply } => reply.post(self.delete(handle, &key)),
            Request::NewCursor {
                handle,
                bounds,
                reply,
            } => reply.post(self.new_cursor(handle, bounds)),
            Request::PullRows {
                cursor,
                max_rows,
                sink,
            } => self.pull_rows(cursor, max_rows, sink),
            Request::CancelCursor { cursor, reply } => reply.post(self.cancel_cursor(cursor)),
            Request::ForgetHandle { handle } => self.forget_handle(handle),
            Request::ForgetCursor { cursor } => self.forget_cursor(cursor),
        }
    }

    // =========================================================================
    // Handles
    // =========================================================================

    /// Opens (or joins) a store and posts the new handle id once it is ready.
    ///
    /// A failed open is reported on `reply` and its id is never usable.
    pub fn open(
        &self,
        identity: StoreIdentity,
        shared: bool,
        reply: ReplyChannel<DispatchResult<HandleId>>,
    ) {
        let id = HandleId::new(self.shared.next_handle.fetch_add(1, Ordering::Relaxed));
        let handle = self.shared.registry.acquire(identity, shared);
        self.shared.handles.insert(id, handle.clone());
        debug!(handle = %id, path = %handle.identity(), shared, "handle opening");

        let tables: Weak<DispatchShared> = Arc::downgrade(&self.shared);
        handle.on_ready(ReplyChannel::new(move |result: Result<(), LodeError>| {
            match result {
                Ok(()) => reply.post(Ok(id)),
                Err(err) => {
                    if let Some(tables) = tables.upgrade() {
                        if let Some((_, failed)) = tables.handles.remove(&id) {
                            let _ = failed.close();
                        }
                        tables.stats.errors.fetch_add(1, Ordering::Relaxed);
                    }
                    warn!(handle = %id, error = %err, "open failed");
                    reply.post(Err(err.kind()));
                }
            }
        }));
    }

    /// Closes a handle, cancelling its cursors first.
    pub fn close(&self, handle: HandleId) -> DispatchResult<()> {
        let result = self
            .shared
            .handle(handle)
            .and_then(|h| h.close().map_err(ErrorKind::from));
        if result.is_ok() {
            debug!(handle = %handle, "handle closed");
        }
        self.shared.record("close", result)
    }

    /// Reads a key.
    pub fn get(&self, handle: HandleId, key: &[u8]) -> DispatchResult<Option<Bytes>> {
        let result = self
            .shared
            .handle(handle)
            .and_then(|h| h.get(key).map_err(ErrorKind::from));
        self.shared.record("get", result)
    }

    /// Writes a key; with `durable` the write is synced before replying.
    pub fn put(
        &self,
        handle: HandleId,
        key: &[u8],
        value: &[u8],
        durable: bool,
    ) -> DispatchResult<()> {
        let result = self
            .shared
            .handle(handle)
            .and_then(|h| h.put(key, value, durable).map_err(ErrorKind::from));
        self.shared.record("put", result)
    }

    /// Deletes a key.
    pub fn delete(&self, handle: HandleId, key: &[u8]) -> DispatchResult<()> {
        let result = self
            .shared
            .handle(handle)
            .and_then(|h| h.delete(key).map_err(ErrorKind::from));
        self.shared.record("delete", result)
    }

    /// Number of live keys in the handle's store.
    pub fn key_count(&self, handle: HandleId) -> DispatchResult<usize> {
        let result = self
            .shared
            .handle(handle)
            .and_then(|h| h.key_count().map_err(ErrorKind::from));
        self.shared.record("key_count", result)
    }

    /// Drops the id. A handle that was never closed is closed now.
    pub fn forget_handle(&self, handle: HandleId) {
        if let Some((_, h)) = self.shared.handles.remove(&handle) {
            if !h.is_closed() {
                debug!(handle = %handle, "handle forgotten while open");
            }
            // Dropping the last clone closes it.
            drop(h);
        }
    }

    // =========================================================================
    // Cursors
    // =========================================================================

    /// Creates a cursor on a handle.
    pub fn new_cursor(&self, handle: HandleId, bounds: RangeBounds) -> DispatchResult<CursorId> {
        let result = self.shared.handle(handle).and_then(|h| {
            let cursor = h.cursor(bounds).map_err(ErrorKind::from)?;
            let id = CursorId::new(cursor.id());
            self.shared.cursors.insert(id, Arc::new(cursor));
            debug!(handle = %handle, cursor = %id, "cursor registered");
            Ok(id)
        });
        self.shared.record("new_cursor", result)
    }

    /// Queues a pull on a cursor. An unknown cursor ends the pull with
    /// `Closed`.
    pub fn pull_rows(&self, cursor: CursorId, max_rows: u32, sink: RowSink) {
        self.shared
            .stats
            .rows_requested
            .fetch_add(u64::from(max_rows), Ordering::Relaxed);
        match self.shared.cursor(cursor) {
            Some(c) => c.request_rows(max_rows, sink),
            None => sink.end(ScanEnd::Closed),
        }
    }

    /// Cancels a cursor, blocking until its worker has stopped. A second
    /// cancel reports `ResourceClosed`.
    pub fn cancel_cursor(&self, cursor: CursorId) -> DispatchResult<()> {
        let result = match self.shared.cursor(cursor) {
            Some(c) => c.cancel().map_err(ErrorKind::from),
            None => Err(ErrorKind::ResourceClosed),
        };
        self.shared.record("cancel_cursor", result)
    }

    /// Drops the id. A cursor that was never cancelled is cancelled now.
    pub fn forget_cursor(&self, cursor: CursorId) {
        if let Some((_, c)) = self.shared.cursors.remove(&cursor) {
            trace!(cursor = %cursor, state = ?c.state(), "cursor forgotten");
            drop(c);
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handles", &self.shared.handles.len())
            .field("cursors", &self.shared.cursors.len())
            .field("registry", &self.shared.registry)
            .finish()
    }
}
