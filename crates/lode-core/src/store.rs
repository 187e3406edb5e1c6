//! Shared store state and the two reference kinds that keep it alive.
//!
//! A [`SharedStore`] is one opened (or opening) engine instance. Interest in
//! it is counted twice:
//!
//! - [`StoreRef`] (structural): the store value is still referenced.
//! - [`OpenRef`] (keep-open): the engine must stay open.
//!
//! Both are RAII guards: clone to take a reference, drop to release it. The
//! drop that takes the open count to zero unregisters the store and closes
//! the engine, exactly once. The structural count only reaches zero after
//! the open count has, since every keep-open holder also holds a structural
//! reference.
//!
//! ```text
//!            acquire                 last OpenRef dropped
//!   Opening ─────────► Ready ───────────────────────────► Closing ──► Closed
//!      │                                                  ▲
//!      └──► Failed ───────────────────────────────────────┘
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use lode_common::{LodeError, LodeResult, StoreIdentity};
use lode_engine::{EngineOpener, StorageEngine};

use crate::registry::RegistryShared;
use crate::reply::ReplyChannel;

/// Lifecycle of a shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreStatus {
    /// The engine open is in flight.
    Opening,
    /// The engine is open.
    Ready,
    /// The engine open failed; the store will never become ready.
    Failed(LodeError),
    /// The last keep-open reference is gone and the engine is being closed.
    Closing,
    /// The engine is closed.
    Closed,
}

pub(crate) struct StoreState {
    status: StoreStatus,
    engine: Option<Arc<dyn StorageEngine>>,
    struct_refs: usize,
    open_refs: usize,
    waiters: VecDeque<ReplyChannel<LodeResult<()>>>,
    open_thread: Option<JoinHandle<()>>,
}

impl StoreState {
    /// Result of the open, or `None` while it is still in flight.
    fn outcome(&self) -> Option<LodeResult<()>> {
        match &self.status {
            StoreStatus::Opening => None,
            StoreStatus::Ready => Some(Ok(())),
            StoreStatus::Failed(err) => Some(Err(err.clone())),
            StoreStatus::Closing | StoreStatus::Closed => Some(Err(LodeError::ResourceClosed)),
        }
    }

    /// Returns true if a shared acquire may join this store.
    pub(crate) fn is_joinable(&self) -> bool {
        self.open_refs > 0 && matches!(self.status, StoreStatus::Opening | StoreStatus::Ready)
    }

    /// Takes one structural and one keep-open reference for a joining
    /// acquirer, queueing its reply if the open is still in flight.
    pub(crate) fn join(
        &mut self,
        reply: Option<ReplyChannel<LodeResult<()>>>,
    ) -> Option<(ReplyChannel<LodeResult<()>>, LodeResult<()>)> {
        self.struct_refs += 1;
        self.open_refs += 1;
        let reply = reply?;
        match self.outcome() {
            None => {
                self.waiters.push_back(reply);
                None
            }
            Some(outcome) => Some((reply, outcome)),
        }
    }
}

/// One engine instance and its reference counts.
pub(crate) struct SharedStore {
    id: u64,
    identity: StoreIdentity,
    shared: bool,
    registry: Weak<RegistryShared>,
    /// Earlier instances on the same path that are still closing.
    predecessors: Mutex<Vec<Arc<SharedStore>>>,
    state: Mutex<StoreState>,
    changed: Condvar,
}

impl SharedStore {
    pub(crate) fn new(
        id: u64,
        identity: StoreIdentity,
        shared: bool,
        registry: Weak<RegistryShared>,
        predecessors: Vec<Arc<SharedStore>>,
        reply: Option<ReplyChannel<LodeResult<()>>>,
    ) -> Self {
        Self {
            id,
            identity,
            shared,
            registry,
            predecessors: Mutex::new(predecessors),
            state: Mutex::new(StoreState {
                status: StoreStatus::Opening,
                engine: None,
                struct_refs: 1,
                open_refs: 1,
                waiters: reply.into_iter().collect(),
                open_thread: None,
            }),
            changed: Condvar::new(),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn identity(&self) -> &StoreIdentity {
        &self.identity
    }

    pub(crate) fn lock_state(&self) -> parking_lot::MutexGuard<'_, StoreState> {
        self.state.lock()
    }

    pub(crate) fn status(&self) -> StoreStatus {
        self.state.lock().status.clone()
    }

    /// Returns (structural, keep-open) reference counts.
    pub(crate) fn ref_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.struct_refs, state.open_refs)
    }

    pub(crate) fn set_open_thread(&self, handle: JoinHandle<()>) {
        self.state.lock().open_thread = Some(handle);
    }

    // =========================================================================
    // Opening
    // =========================================================================

    /// Opens the engine and publishes the result. Runs on the acquiring
    /// thread or on a dedicated open thread.
    pub(crate) fn run_open(self: &Arc<Self>, opener: &dyn EngineOpener) {
        let predecessors = mem::take(&mut *self.predecessors.lock());
        for previous in predecessors {
            debug!(
                store = self.id,
                previous = previous.id,
                path = %self.identity,
                "waiting for previous instance to close"
            );
            previous.wait_closed();
        }

        let result = opener.open(self.identity.path(), self.identity.options());
        self.finish_open(result);
    }

    /// Publishes an open result and notifies queued waiters in arrival order.
    pub(crate) fn finish_open(self: &Arc<Self>, result: LodeResult<Box<dyn StorageEngine>>) {
        let mut state = self.state.lock();
        let closing = matches!(state.status, StoreStatus::Closing);
        let outcome = match result {
            Ok(engine) => {
                state.engine = Some(Arc::from(engine));
                if !closing {
                    state.status = StoreStatus::Ready;
                }
                Ok(())
            }
            Err(err) => {
                if !closing {
                    state.status = StoreStatus::Failed(err.clone());
                }
                Err(err)
            }
        };
        let waiters = mem::take(&mut state.waiters);
        drop(state);
        self.changed.notify_all();

        let registry = self.registry.upgrade();
        match &outcome {
            Ok(()) => {
                if let Some(registry) = &registry {
                    registry.stats.opens.fetch_add(1, Ordering::Relaxed);
                }
                debug!(store = self.id, path = %self.identity, "store opened");
            }
            Err(err) => {
                warn!(store = self.id, path = %self.identity, error = %err, "store open failed");
                if let Some(registry) = &registry {
                    registry.stats.open_failures.fetch_add(1, Ordering::Relaxed);
                    if self.shared {
                        registry.maps.lock().unregister(&self.identity, self);
                    }
                }
            }
        }

        let reply = if closing {
            Err(LodeError::ResourceClosed)
        } else {
            outcome
        };
        for waiter in waiters {
            waiter.post(reply.clone());
        }
    }

    /// Posts the open result to `reply` now, or when the open completes.
    pub(crate) fn on_ready(&self, reply: ReplyChannel<LodeResult<()>>) {
        let mut state = self.state.lock();
        match state.outcome() {
            None => state.waiters.push_back(reply),
            Some(outcome) => {
                drop(state);
                reply.post(outcome);
            }
        }
    }

    /// Blocks until the open completes and returns the engine.
    pub(crate) fn wait_ready(&self) -> LodeResult<Arc<dyn StorageEngine>> {
        let mut state = self.state.lock();
        loop {
            match &state.status {
                StoreStatus::Opening => self.changed.wait(&mut state),
                StoreStatus::Ready => {
                    return state.engine.clone().ok_or(LodeError::ResourceClosed);
                }
                StoreStatus::Failed(err) => return Err(err.clone()),
                StoreStatus::Closing | StoreStatus::Closed => {
                    return Err(LodeError::ResourceClosed);
                }
            }
        }
    }

    /// Blocks until the engine is closed.
    pub(crate) fn wait_closed(&self) {
        let mut state = self.state.lock();
        while state.status != StoreStatus::Closed {
            self.changed.wait(&mut state);
        }
    }

    // =========================================================================
    // Reference counting
    // =========================================================================

    fn retain_struct(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.struct_refs > 0, "structural ref resurrected");
        state.struct_refs += 1;
    }

    fn retain_open(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.open_refs > 0, "keep-open ref resurrected");
        state.open_refs += 1;
    }

    fn release_struct(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.struct_refs > 0, "structural ref underflow");
        state.struct_refs = state.struct_refs.saturating_sub(1);
        if state.struct_refs == 0 {
            debug_assert_eq!(state.open_refs, 0);
            debug!(store = self.id, path = %self.identity, "store released");
        }
    }

    fn release_open(self: &Arc<Self>) {
        // Lock order: registry maps, then store.
        let registry = self.registry.upgrade();
        let mut maps = registry.as_ref().map(|r| r.maps.lock());
        let mut state = self.state.lock();
        debug_assert!(state.open_refs > 0, "keep-open ref underflow");
        state.open_refs = state.open_refs.saturating_sub(1);
        if state.open_refs > 0 {
            return;
        }

        let engine = state.engine.take();
        let open_thread = state.open_thread.take();
        let needs_close = engine.is_some() || state.status == StoreStatus::Opening;
        state.status = StoreStatus::Closing;

        // Unregister before closing so a racing acquire of the same identity
        // starts a fresh instance instead of joining this one.
        if let Some(maps) = maps.as_mut() {
            if self.shared {
                maps.unregister(&self.identity, self);
            }
            if needs_close {
                maps.retiring
                    .entry(self.identity.path().to_path_buf())
                    .or_default()
                    .push(Arc::clone(self));
            }
        }
        drop(state);
        drop(maps);

        self.close(engine, open_thread);
    }

    /// Closes the engine with no locks held.
    fn close(
        self: &Arc<Self>,
        engine: Option<Arc<dyn StorageEngine>>,
        open_thread: Option<JoinHandle<()>>,
    ) {
        if let Some(handle) = open_thread {
            // The open thread itself may drop the last reference from inside a
            // waiter callback; the engine is already published by then.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        let engine = engine.or_else(|| self.state.lock().engine.take());
        let closed_engine = engine.is_some();

        if let Some(engine) = engine {
            match engine.close() {
                Ok(()) => debug!(store = self.id, path = %self.identity, "store closed"),
                Err(err) => {
                    warn!(store = self.id, path = %self.identity, error = %err, "store close failed")
                }
            }
        }

        self.state.lock().status = StoreStatus::Closed;
        self.changed.notify_all();

        if let Some(registry) = self.registry.upgrade() {
            if closed_engine {
                registry.stats.closes.fetch_add(1, Ordering::Relaxed);
            }
            registry.maps.lock().retire_done(self.identity.path(), self);
        }
    }
}

impl fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SharedStore")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("shared", &self.shared)
            .field("status", &state.status)
            .field("struct_refs", &state.struct_refs)
            .field("open_refs", &state.open_refs)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// Structural reference to a [`SharedStore`].
pub(crate) struct StoreRef {
    store: Arc<SharedStore>,
}

impl StoreRef {
    /// Wraps a reference already counted in the store.
    pub(crate) fn adopt(store: Arc<SharedStore>) -> Self {
        Self { store }
    }

    pub(crate) fn store(&self) -> &Arc<SharedStore> {
        &self.store
    }
}

impl Clone for StoreRef {
    fn clone(&self) -> Self {
        self.store.retain_struct();
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl Drop for StoreRef {
    fn drop(&mut self) {
        self.store.release_struct();
    }
}

/// Keep-open reference to a [`SharedStore`].
///
/// While any exists, the engine is not closed.
pub(crate) struct OpenRef {
    store: Arc<SharedStore>,
}

impl OpenRef {
    /// Wraps a reference already counted in the store.
    pub(crate) fn adopt(store: Arc<SharedStore>) -> Self {
        Self { store }
    }

    /// Waits for the open to complete and returns the engine.
    pub(crate) fn engine(&self) -> LodeResult<Arc<dyn StorageEngine>> {
        self.store.wait_ready()
    }
}

impl Clone for OpenRef {
    fn clone(&self) -> Self {
        self.store.retain_open();
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl Drop for OpenRef {
    fn drop(&mut self) {
        self.store.release_open();
    }
}
