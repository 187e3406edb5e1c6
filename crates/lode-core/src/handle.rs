//! Client handles on shared stores.
//!
//! A [`Handle`] is one caller's interest in a store. Several handles may
//! share one engine; each holds its own structural and keep-open reference
//! and tracks the cursors created through it. Closing a handle cancels
//! those cursors first and then gives up its keep-open reference, so the
//! engine is closed only when the last handle and the last cursor are done.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use lode_common::{LodeError, LodeResult, ReadOptions, StoreIdentity, WriteOptions};
use lode_engine::StorageEngine;

use crate::bounds::RangeBounds;
use crate::cursor::{Cursor, CursorInner};
use crate::reply::ReplyChannel;
use crate::store::{OpenRef, StoreRef, StoreStatus};

/// Cursors created through one handle.
#[derive(Default)]
pub(crate) struct CursorSet {
    /// Set once the handle is closed; no cursor may join afterwards.
    pub(crate) closed: bool,
    pub(crate) live: HashMap<u64, Weak<CursorInner>>,
}

struct HandleInner {
    store: StoreRef,
    open: Mutex<Option<OpenRef>>,
    cursors: Arc<Mutex<CursorSet>>,
}

impl HandleInner {
    fn close(&self) -> LodeResult<()> {
        let Some(open) = self.open.lock().take() else {
            return Err(LodeError::AlreadyClosed);
        };

        let cursors: Vec<Arc<CursorInner>> = {
            let mut set = self.cursors.lock();
            set.closed = true;
            set.live.drain().filter_map(|(_, c)| c.upgrade()).collect()
        };
        let cancelled = cursors.len();
        for cursor in cursors {
            // A cursor cancelled on its own reports ResourceClosed; either way
            // it no longer holds the store.
            let _ = cursor.cancel();
        }

        drop(open);
        debug!(
            store = self.store.store().id(),
            path = %self.store.store().identity(),
            cancelled,
            "handle closed"
        );
        Ok(())
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if self.open.get_mut().is_some() {
            debug!(
                store = self.store.store().id(),
                path = %self.store.store().identity(),
                "handle dropped without close"
            );
            let _ = self.close();
        }
    }
}

/// A caller's handle on a (possibly shared) store.
///
/// Cloning a `Handle` yields another view of the same handle: closing
/// through any clone closes it for all of them. When the last clone is
/// dropped without [`close`](Self::close) the handle is closed then.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl Handle {
    pub(crate) fn new(store: StoreRef, open: OpenRef) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                store,
                open: Mutex::new(Some(open)),
                cursors: Arc::new(Mutex::new(CursorSet::default())),
            }),
        }
    }

    /// The identity this handle was acquired for.
    pub fn identity(&self) -> &StoreIdentity {
        self.inner.store.store().identity()
    }

    /// Current lifecycle status of the underlying store.
    pub fn status(&self) -> StoreStatus {
        self.inner.store.store().status()
    }

    /// Returns true once this handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.open.lock().is_none()
    }

    /// Returns true if both handles refer to the same store instance.
    pub fn same_store(&self, other: &Handle) -> bool {
        Arc::ptr_eq(self.inner.store.store(), other.inner.store.store())
    }

    /// Returns the store's (structural, keep-open) reference counts.
    pub fn ref_counts(&self) -> (usize, usize) {
        self.inner.store.store().ref_counts()
    }

    /// Number of cursors created through this handle that are still active.
    pub fn active_cursors(&self) -> usize {
        self.inner.cursors.lock().live.len()
    }

    /// Takes a temporary keep-open reference.
    fn lease(&self) -> LodeResult<OpenRef> {
        self.inner
            .open
            .lock()
            .as_ref()
            .map(OpenRef::clone)
            .ok_or(LodeError::ResourceClosed)
    }

    fn with_engine<T>(
        &self,
        op: impl FnOnce(&dyn StorageEngine) -> LodeResult<T>,
    ) -> LodeResult<T> {
        let lease = self.lease()?;
        let engine = lease.engine()?;
        let result = op(engine.as_ref());
        drop(engine);
        drop(lease);
        result
    }

    /// Blocks until the store's open completes and returns its result.
    pub fn wait_ready(&self) -> LodeResult<()> {
        self.lease()?.engine().map(|_| ())
    }

    /// Posts the open result to `reply` once the open completes (at once if
    /// it already has).
    pub fn on_ready(&self, reply: ReplyChannel<LodeResult<()>>) {
        if self.is_closed() {
            reply.post(Err(LodeError::ResourceClosed));
            return;
        }
        self.inner.store.store().on_ready(reply);
    }

    /// Reads a key. A miss is `Ok(None)`.
    pub fn get(&self, key: &[u8]) -> LodeResult<Option<Bytes>> {
        self.get_with(&ReadOptions::default(), key)
    }

    /// Reads a key with explicit read options.
    pub fn get_with(&self, options: &ReadOptions, key: &[u8]) -> LodeResult<Option<Bytes>> {
        self.with_engine(|engine| engine.get(options, key))
    }

    /// Writes a key. With `sync`, the write is flushed to stable storage
    /// before returning.
    pub fn put(&self, key: &[u8], value: &[u8], sync: bool) -> LodeResult<()> {
        self.put_with(&WriteOptions { sync }, key, value)
    }

    /// Writes a key with explicit write options.
    pub fn put_with(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> LodeResult<()> {
        self.with_engine(|engine| engine.put(options, key, value))
    }

    /// Deletes a key.
    pub fn delete(&self, key: &[u8]) -> LodeResult<()> {
        self.delete_with(&WriteOptions::default(), key)
    }

    /// Deletes a key with explicit write options.
    pub fn delete_with(&self, options: &WriteOptions, key: &[u8]) -> LodeResult<()> {
        self.with_engine(|engine| engine.delete(options, key))
    }

    /// Number of live keys in the store.
    pub fn key_count(&self) -> LodeResult<usize> {
        self.with_engine(|engine| engine.key_count())
    }

    /// Creates a cursor over `bounds`.
    pub fn cursor(&self, bounds: RangeBounds) -> LodeResult<Cursor> {
        self.cursor_with(bounds, ReadOptions::default())
    }

    /// Creates a cursor over `bounds` with explicit read options.
    ///
    /// The cursor takes its own structural and keep-open references, so it
    /// keeps the engine open even if every handle on the store closes while
    /// it is still scanning.
    pub fn cursor_with(&self, bounds: RangeBounds, options: ReadOptions) -> LodeResult<Cursor> {
        let lease = self.lease()?;
        Cursor::create(
            self.inner.store.clone(),
            lease,
            bounds,
            options,
            &self.inner.cursors,
        )
    }

    /// Closes this handle.
    ///
    /// Cursors created through it are cancelled first. The engine itself is
    /// closed once no other handle or cursor holds it open. A second close
    /// reports [`LodeError::AlreadyClosed`].
    pub fn close(&self) -> LodeResult<()> {
        self.inner.close()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("identity", self.identity())
            .field("closed", &self.is_closed())
            .field("active_cursors", &self.active_cursors())
            .finish()
    }
}
