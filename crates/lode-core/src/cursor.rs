//! Pausable, pull-based streaming cursors.
//!
//! A [`Cursor`] turns the engine's blocking forward iterator into a
//! pull protocol. Callers queue pull requests, each with a row quota and a
//! [`RowSink`]; a worker thread started on demand walks the iterator and
//! streams matching rows into the request at the head of the queue.
//!
//! ```text
//!             request_rows                  queue drained / pause
//!   Idle ─────────────────► Running ◄──────────────────────────► Paused
//!     │                        │          request_rows / resume      │
//!     │                        │ range end, limit, engine error      │
//!     │                        ▼                                     │
//!     └───── cancel ──────► Finalized ◄──────── cancel ──────────────┘
//! ```
//!
//! The worker holds the raw iterator outside the cursor lock while it
//! steps, and hands it back when it stops. [`Cursor::pause`] waits for that
//! hand-back and joins the thread, so once it returns nothing touches the
//! iterator. Cancellation pauses first and only then releases the iterator
//! and the cursor's store references.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use lode_common::{ErrorKind, LodeError, LodeResult, ReadOptions};
use lode_engine::RawIterator;

use crate::bounds::RangeBounds;
use crate::handle::CursorSet;
use crate::reply::{RowSink, RowStream, ScanEnd};
use crate::store::{OpenRef, SharedStore, StoreRef};

static NEXT_CURSOR: AtomicU64 = AtomicU64::new(1);

/// Cursor run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    /// Created, never pulled.
    Idle,
    /// A worker is streaming rows.
    Running,
    /// No worker; resumes on the next pull.
    Paused,
    /// Terminal. The iterator and store references are released.
    Finalized,
}

/// A queued pull.
struct PullRequest {
    remaining: u32,
    sink: RowSink,
}

impl PullRequest {
    fn finish(self, end: ScanEnd) {
        self.sink.end(end);
    }
}

/// References the cursor holds on its store. Field order is drop order.
struct Leases {
    _open: OpenRef,
    _store: StoreRef,
}

struct CursorState {
    run: RunState,
    /// Why the cursor finalized.
    end: Option<ScanEnd>,
    cancelled: bool,
    /// `None` before first use and while a worker holds it.
    iter: Option<Box<dyn RawIterator>>,
    positioned: bool,
    emitted: u64,
    queue: VecDeque<PullRequest>,
    /// Partially served request, handed back by a paused worker.
    current: Option<PullRequest>,
    worker: Option<JoinHandle<()>>,
    leases: Option<Leases>,
}

impl CursorState {
    /// Terminal reply for a pull that arrives after the cursor stopped
    /// accepting work.
    fn late_reply(&self) -> ScanEnd {
        if self.cancelled {
            ScanEnd::Closed
        } else {
            self.end.unwrap_or(ScanEnd::Closed)
        }
    }
}

/// How a worker run ended.
enum Halt {
    Park,
    Finish(ScanEnd),
}

pub(crate) struct CursorInner {
    serial: u64,
    bounds: RangeBounds,
    read_options: ReadOptions,
    /// Used to wait for the engine; the keep-open count lives in `leases`.
    store: Arc<SharedStore>,
    set: Weak<Mutex<CursorSet>>,
    state: Mutex<CursorState>,
    stopped: Condvar,
    pause_requested: AtomicBool,
}

impl CursorInner {
    // =========================================================================
    // Caller side
    // =========================================================================

    fn request_rows(self: &Arc<Self>, max_rows: u32, sink: RowSink) {
        let mut state = self.state.lock();
        if state.cancelled || state.run == RunState::Finalized {
            let end = state.late_reply();
            drop(state);
            sink.end(end);
            return;
        }
        state.queue.push_back(PullRequest {
            remaining: max_rows,
            sink,
        });
        self.ensure_running(state);
    }

    fn resume(self: &Arc<Self>) {
        let state = self.state.lock();
        if state.cancelled || state.run == RunState::Finalized {
            return;
        }
        self.ensure_running(state);
    }

    /// Starts a worker unless one is running or there is nothing to serve.
    fn ensure_running(self: &Arc<Self>, mut state: MutexGuard<'_, CursorState>) {
        if state.run == RunState::Running || (state.queue.is_empty() && state.current.is_none())
        {
            return;
        }

        let previous = state.worker.take();
        let worker = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("lode-cursor-{}", self.serial))
            .spawn(move || {
                if let Some(previous) = previous {
                    let _ = previous.join();
                }
                worker.work();
            });

        match spawned {
            Ok(handle) => {
                state.run = RunState::Running;
                state.worker = Some(handle);
            }
            Err(err) => {
                warn!(cursor = self.serial, error = %err, "cannot spawn cursor worker");
                self.finalize(state, ScanEnd::Failed(ErrorKind::IoError));
            }
        }
    }

    /// Stops the worker, if any, and waits until it has handed the iterator
    /// back and exited.
    pub(crate) fn pause(&self) {
        let mut state = self.state.lock();
        if state.run == RunState::Running {
            while state.run == RunState::Running {
                self.pause_requested.store(true, Ordering::Release);
                self.stopped.wait(&mut state);
            }
            self.pause_requested.store(false, Ordering::Release);
        }
        let worker = state.worker.take();
        drop(state);

        if let Some(handle) = worker {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Pauses and finalizes. A second cancel reports `ResourceClosed`.
    pub(crate) fn cancel(&self) -> LodeResult<()> {
        {
            let mut state = self.state.lock();
            if state.cancelled {
                return Err(LodeError::ResourceClosed);
            }
            state.cancelled = true;
        }

        self.pause();

        let state = self.state.lock();
        if state.run != RunState::Finalized {
            self.finalize(state, ScanEnd::Closed);
        }
        Ok(())
    }

    // =========================================================================
    // Worker side
    // =========================================================================

    fn open_iterator(&self) -> LodeResult<Box<dyn RawIterator>> {
        let engine = self.store.wait_ready()?;
        engine.iter(&self.read_options)
    }

    /// Returns how the scan ends at the iterator's current position, if it
    /// does.
    fn scan_end(&self, iter: &dyn RawIterator, emitted: u64) -> Option<ScanEnd> {
        if !iter.valid() {
            return Some(match iter.status() {
                Ok(()) => ScanEnd::ExhaustedRange,
                Err(err) => ScanEnd::Failed(err.kind()),
            });
        }
        if self.bounds.limit_reached(emitted) {
            return Some(ScanEnd::ExhaustedRange);
        }
        match iter.key() {
            Some(key) if self.bounds.is_beyond_upper(key) => Some(ScanEnd::ExhaustedRange),
            _ => None,
        }
    }

    fn work(&self) {
        let (mut iter, mut positioned, mut emitted, mut current) = {
            let mut state = self.state.lock();
            (
                state.iter.take(),
                state.positioned,
                state.emitted,
                state.current.take(),
            )
        };

        let halt = loop {
            if self.pause_requested.load(Ordering::Acquire) {
                break Halt::Park;
            }

            if current.is_none() {
                let mut state = self.state.lock();
                match state.queue.pop_front() {
                    Some(request) => current = Some(request),
                    None => {
                        // Park under the lock that saw the empty queue so a
                        // concurrent pull either lands before this or sees
                        // the cursor paused and restarts it.
                        state.iter = iter;
                        state.positioned = positioned;
                        state.emitted = emitted;
                        state.run = RunState::Paused;
                        drop(state);
                        self.stopped.notify_all();
                        return;
                    }
                }
            }

            if current.as_ref().is_some_and(|r| r.remaining == 0) {
                if let Some(request) = current.take() {
                    request.finish(ScanEnd::QuotaReached);
                }
                continue;
            }

            if iter.is_none() {
                match self.open_iterator() {
                    Ok(raw) => iter = Some(raw),
                    Err(err) => break Halt::Finish(ScanEnd::Failed(err.kind())),
                }
            }
            let Some(it) = iter.as_mut() else {
                break Halt::Finish(ScanEnd::Closed);
            };

            if !positioned {
                self.bounds.seek_start(&mut **it);
                positioned = true;
            }

            if let Some(end) = self.scan_end(&**it, emitted) {
                break Halt::Finish(end);
            }
            let Some((key, value)) = it
                .key()
                .zip(it.value())
                .map(|(k, v)| (Bytes::copy_from_slice(k), Bytes::copy_from_slice(v)))
            else {
                break Halt::Finish(ScanEnd::ExhaustedRange);
            };
            let Some(request) = current.as_mut() else {
                continue;
            };

            if !request.sink.row(key, value) {
                // Nobody is listening; the row stays unread for the next pull.
                if let Some(request) = current.take() {
                    request.finish(ScanEnd::Closed);
                }
                continue;
            }
            request.remaining -= 1;
            emitted += 1;
            it.next();

            if request.remaining == 0 {
                // Report the end of the range on the request that reached it
                // rather than making the caller pull once more to find out.
                if let Some(end) = self.scan_end(&**it, emitted) {
                    break Halt::Finish(end);
                }
                if let Some(request) = current.take() {
                    request.finish(ScanEnd::QuotaReached);
                }
            }
        };

        let mut state = self.state.lock();
        state.iter = iter;
        state.positioned = positioned;
        state.emitted = emitted;
        state.current = current;
        match halt {
            Halt::Park => {
                state.run = RunState::Paused;
                drop(state);
                self.stopped.notify_all();
            }
            Halt::Finish(end) => self.finalize(state, end),
        }
    }

    /// Moves to `Finalized`: releases the iterator, then the store
    /// references, leaves the handle's cursor set, and ends every pending
    /// request with `end`.
    fn finalize(&self, mut state: MutexGuard<'_, CursorState>, end: ScanEnd) {
        state.run = RunState::Finalized;
        state.end = Some(end);
        let iter = state.iter.take();
        let current = state.current.take();
        let queued: Vec<PullRequest> = state.queue.drain(..).collect();
        let leases = state.leases.take();
        let emitted = state.emitted;
        drop(state);
        self.stopped.notify_all();

        drop(iter);
        drop(leases);
        if let Some(set) = self.set.upgrade() {
            set.lock().live.remove(&self.serial);
        }
        debug!(cursor = self.serial, ?end, emitted, "cursor finalized");

        for request in current.into_iter().chain(queued) {
            request.finish(end);
        }
    }
}

impl fmt::Debug for CursorInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Cursor")
            .field("id", &self.serial)
            .field("bounds", &self.bounds)
            .field("run", &state.run)
            .field("emitted", &state.emitted)
            .field("queued", &state.queue.len())
            .field("end", &state.end)
            .finish()
    }
}

/// A bounded, resumable range scan over a store.
///
/// Dropping a cursor cancels it.
pub struct Cursor {
    inner: Arc<CursorInner>,
}

impl Cursor {
    pub(crate) fn create(
        store: StoreRef,
        open: OpenRef,
        bounds: RangeBounds,
        read_options: ReadOptions,
        set: &Arc<Mutex<CursorSet>>,
    ) -> LodeResult<Self> {
        let serial = NEXT_CURSOR.fetch_add(1, Ordering::Relaxed);
        let store_id = store.store().id();
        let inner = Arc::new(CursorInner {
            serial,
            bounds,
            read_options,
            store: Arc::clone(store.store()),
            set: Arc::downgrade(set),
            state: Mutex::new(CursorState {
                run: RunState::Idle,
                end: None,
                cancelled: false,
                iter: None,
                positioned: false,
                emitted: 0,
                queue: VecDeque::new(),
                current: None,
                worker: None,
                leases: Some(Leases {
                    _open: open,
                    _store: store,
                }),
            }),
            stopped: Condvar::new(),
            pause_requested: AtomicBool::new(false),
        });

        {
            let mut cursors = set.lock();
            if cursors.closed {
                drop(cursors);
                // Dropping `inner` releases the references it took.
                return Err(LodeError::ResourceClosed);
            }
            cursors.live.insert(serial, Arc::downgrade(&inner));
        }
        debug!(cursor = serial, store = store_id, bounds = ?inner.bounds, "cursor created");

        if inner.bounds.limit_reached(0) {
            let state = inner.state.lock();
            inner.finalize(state, ScanEnd::ExhaustedRange);
        }
        Ok(Self { inner })
    }

    /// Process-unique cursor number.
    pub fn id(&self) -> u64 {
        self.inner.serial
    }

    /// The bounds this cursor scans.
    pub fn bounds(&self) -> &RangeBounds {
        &self.inner.bounds
    }

    /// Current run state.
    pub fn state(&self) -> RunState {
        self.inner.state.lock().run
    }

    /// Rows emitted so far. Only advances while no worker is running; read
    /// it after a pull has ended.
    pub fn emitted(&self) -> u64 {
        self.inner.state.lock().emitted
    }

    /// Why the cursor finalized, once it has.
    pub fn end_reason(&self) -> Option<ScanEnd> {
        self.inner.state.lock().end
    }

    /// Queues a pull of at most `max_rows` rows into `sink` and makes sure a
    /// worker is serving the queue. Pulls are served in the order queued.
    ///
    /// On a cursor that no longer accepts pulls the sink is ended at once:
    /// with `Closed` after a cancel, otherwise with the reason the cursor
    /// finished.
    pub fn request_rows(&self, max_rows: u32, sink: RowSink) {
        self.inner.request_rows(max_rows, sink);
    }

    /// Queues a pull and returns the stream it is delivered on.
    pub fn pull(&self, max_rows: u32) -> RowStream {
        let (sink, stream) = RowSink::channel();
        self.request_rows(max_rows, sink);
        stream
    }

    /// Stops the worker and blocks until it has stopped. Queued pulls stay
    /// queued until the next [`request_rows`](Self::request_rows) or
    /// [`resume`](Self::resume). Idempotent.
    pub fn pause(&self) {
        self.inner.pause();
    }

    /// Restarts a paused worker if pulls are queued.
    pub fn resume(&self) {
        self.inner.resume();
    }

    /// Stops the worker, releases the iterator and the store, and ends every
    /// pending pull with `Closed`.
    ///
    /// Safe to call while a worker is mid-scan: it blocks until the worker
    /// has stopped. A second call reports [`LodeError::ResourceClosed`].
    pub fn cancel(&self) -> LodeResult<()> {
        self.inner.cancel()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        let _ = self.inner.cancel();
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}
