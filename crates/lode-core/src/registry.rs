//! Shared-open deduplication and exactly-once close.
//!
//! The registry maps each [`StoreIdentity`] to the one [`SharedStore`]
//! currently serving it. The map lock guards membership only: engine opens
//! and closes always run with it released, and per-store counters live
//! behind each store's own lock.
//!
//! ```text
//!   acquire(A) ──┐
//!   acquire(A) ──┼──► maps[A] ──► SharedStore ──► one engine open
//!   acquire(A) ──┘                    │
//!                                     └── waiters notified in arrival order
//! ```
//!
//! When a store's last keep-open reference goes away it is moved from the
//! live map to the retiring map before its engine is closed. A new open of
//! the same path waits for that close to finish before opening again.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::debug;

use lode_common::{LodeError, LodeResult, OpenMode, RegistryConfig, StoreIdentity};
use lode_engine::EngineOpener;

use crate::handle::Handle;
use crate::reply::ReplyChannel;
use crate::store::{OpenRef, SharedStore, StoreRef};

/// Registry counters.
#[derive(Debug, Default)]
pub struct RegistryStats {
    /// Engine opens that succeeded.
    pub opens: AtomicU64,
    /// Engine opens that failed.
    pub open_failures: AtomicU64,
    /// Engines closed.
    pub closes: AtomicU64,
}

/// Membership maps, guarded together by one lock.
#[derive(Default)]
pub(crate) struct Maps {
    /// Live shared stores by identity.
    pub(crate) stores: HashMap<StoreIdentity, Arc<SharedStore>>,
    /// Stores whose engine is being closed, by path.
    pub(crate) retiring: HashMap<PathBuf, Vec<Arc<SharedStore>>>,
}

impl Maps {
    /// Removes `store` from the live map if it is still the registered entry.
    pub(crate) fn unregister(&mut self, identity: &StoreIdentity, store: &Arc<SharedStore>) {
        if self
            .stores
            .get(identity)
            .is_some_and(|current| Arc::ptr_eq(current, store))
        {
            self.stores.remove(identity);
        }
    }

    /// Drops `store` from the retiring set once its engine is closed.
    pub(crate) fn retire_done(&mut self, path: &Path, store: &Arc<SharedStore>) {
        if let Some(closing) = self.retiring.get_mut(path) {
            closing.retain(|s| !Arc::ptr_eq(s, store));
            if closing.is_empty() {
                self.retiring.remove(path);
            }
        }
    }
}

pub(crate) struct RegistryShared {
    opener: Arc<dyn EngineOpener>,
    config: RegistryConfig,
    pub(crate) maps: Mutex<Maps>,
    pub(crate) stats: RegistryStats,
    next_store_id: AtomicU64,
}

/// Opens stores once per identity and closes them once per lifetime.
///
/// Cloning a registry is cheap and yields another view of the same maps.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use lode_common::{EngineConfig, OpenOptions, RegistryConfig, StoreIdentity};
/// use lode_core::HandleRegistry;
/// use lode_engine::LogEngineOpener;
///
/// let registry = HandleRegistry::new(
///     Arc::new(LogEngineOpener::new(EngineConfig::default())),
///     RegistryConfig::default(),
/// );
/// let identity = StoreIdentity::new("/tmp/lode-example", OpenOptions::default());
/// let a = registry.acquire(identity.clone(), true);
/// let b = registry.acquire(identity, true);
/// assert!(a.same_store(&b));
/// ```
#[derive(Clone)]
pub struct HandleRegistry {
    shared: Arc<RegistryShared>,
}

impl HandleRegistry {
    /// Creates a registry that opens engines with `opener`.
    pub fn new(opener: Arc<dyn EngineOpener>, config: RegistryConfig) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                opener,
                config,
                maps: Mutex::new(Maps::default()),
                stats: RegistryStats::default(),
                next_store_id: AtomicU64::new(1),
            }),
        }
    }

    /// Returns a handle on the store for `identity`.
    ///
    /// With `shared`, an existing open or opening store for the identity is
    /// joined without touching storage; otherwise a new store is created and
    /// its engine open is started. The open may still be in flight when this
    /// returns: operations on the handle wait for it.
    pub fn acquire(&self, identity: StoreIdentity, shared: bool) -> Handle {
        self.acquire_inner(identity, shared, None)
    }

    /// Like [`acquire`](Self::acquire), also posting the open result to
    /// `reply`. Replies for one store are posted in acquire order; if the
    /// open already finished the reply is posted before this returns.
    pub fn acquire_with(
        &self,
        identity: StoreIdentity,
        shared: bool,
        reply: ReplyChannel<LodeResult<()>>,
    ) -> Handle {
        self.acquire_inner(identity, shared, Some(reply))
    }

    fn acquire_inner(
        &self,
        identity: StoreIdentity,
        shared: bool,
        reply: Option<ReplyChannel<LodeResult<()>>>,
    ) -> Handle {
        let mut maps = self.shared.maps.lock();

        if shared {
            if let Some(store) = maps.stores.get(&identity).cloned() {
                let mut state = store.lock_state();
                if state.is_joinable() {
                    let immediate = state.join(reply);
                    drop(state);
                    drop(maps);

                    debug!(store = store.id(), path = %identity, "joined shared store");
                    if let Some((reply, outcome)) = immediate {
                        reply.post(outcome);
                    }
                    return Handle::new(StoreRef::adopt(Arc::clone(&store)), OpenRef::adopt(store));
                }
                // A failed open is never reused; fall through and replace it.
                drop(state);
                maps.unregister(&identity, &store);
                return self.create(maps, identity, shared, reply);
            }
        }

        self.create(maps, identity, shared, reply)
    }

    fn create(
        &self,
        mut maps: parking_lot::MutexGuard<'_, Maps>,
        identity: StoreIdentity,
        shared: bool,
        reply: Option<ReplyChannel<LodeResult<()>>>,
    ) -> Handle {
        let id = self.shared.next_store_id.fetch_add(1, Ordering::Relaxed);
        let predecessors = maps
            .retiring
            .get(identity.path())
            .cloned()
            .unwrap_or_default();
        let store = Arc::new(SharedStore::new(
            id,
            identity.clone(),
            shared,
            Arc::downgrade(&self.shared),
            predecessors,
            reply,
        ));
        if shared {
            maps.stores.insert(identity, Arc::clone(&store));
        }
        drop(maps);

        debug!(store = id, path = %store.identity(), shared, "opening store");
        self.start_open(&store);
        Handle::new(StoreRef::adopt(Arc::clone(&store)), OpenRef::adopt(store))
    }

    fn start_open(&self, store: &Arc<SharedStore>) {
        let opener = Arc::clone(&self.shared.opener);
        match self.shared.config.open_mode {
            OpenMode::Inline => store.run_open(opener.as_ref()),
            OpenMode::Background => {
                let task = Arc::clone(store);
                let spawned = thread::Builder::new()
                    .name(format!("lode-open-{}", store.id()))
                    .spawn(move || task.run_open(opener.as_ref()));
                match spawned {
                    Ok(handle) => store.set_open_thread(handle),
                    Err(err) => store.finish_open(Err(LodeError::io(format!(
                        "cannot spawn open thread: {}",
                        err
                    )))),
                }
            }
        }
    }

    /// Number of identities currently in the shared map.
    pub fn live_handles(&self) -> usize {
        self.shared.maps.lock().stores.len()
    }

    /// Returns true if a shared store for `identity` is registered.
    pub fn contains(&self, identity: &StoreIdentity) -> bool {
        self.shared.maps.lock().stores.contains_key(identity)
    }

    /// Returns the registry counters.
    pub fn stats(&self) -> &RegistryStats {
        &self.shared.stats
    }

    /// Returns the registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }
}

impl fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let maps = self.shared.maps.lock();
        f.debug_struct("HandleRegistry")
            .field("open_mode", &self.shared.config.open_mode)
            .field("live", &maps.stores.len())
            .field("retiring", &maps.retiring.values().map(Vec::len).sum::<usize>())
            .field("opens", &self.shared.stats.opens.load(Ordering::Relaxed))
            .field("closes", &self.shared.stats.closes.load(Ordering::Relaxed))
            .finish()
    }
}
