//! Reply channels and row streams.
//!
//! A [`ReplyChannel`] accepts exactly one posted value and never blocks the
//! poster; whether anyone still listens is the receiver's business. Row
//! pulls deliver zero or more [`RowEvent::Row`] events followed by exactly
//! one [`RowEvent::End`] through a [`RowSink`].

use std::fmt;

use bytes::Bytes;
use lode_common::ErrorKind;
use tokio::sync::{mpsc, oneshot};

/// One-shot, fire-and-forget reply target.
pub struct ReplyChannel<T> {
    post: Box<dyn FnOnce(T) + Send>,
}

impl<T: Send + 'static> ReplyChannel<T> {
    /// Wraps a callback.
    pub fn new(post: impl FnOnce(T) + Send + 'static) -> Self {
        Self {
            post: Box::new(post),
        }
    }

    /// Creates a channel backed by a tokio oneshot.
    pub fn oneshot() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self::from(tx), rx)
    }

    /// A channel that drops whatever is posted.
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    /// Delivers the value.
    pub fn post(self, value: T) {
        (self.post)(value);
    }
}

impl<T: Send + 'static> From<oneshot::Sender<T>> for ReplyChannel<T> {
    fn from(tx: oneshot::Sender<T>) -> Self {
        Self::new(move |value| {
            let _ = tx.send(value);
        })
    }
}

impl<T> fmt::Debug for ReplyChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyChannel").finish_non_exhaustive()
    }
}

/// How a row pull ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanEnd {
    /// The pull's quota was used up; more rows may be available.
    QuotaReached,
    /// The range (or row limit) is exhausted; nothing more will come.
    ExhaustedRange,
    /// The cursor was cancelled or its handle closed.
    Closed,
    /// The engine reported an error; the cursor is finished.
    Failed(ErrorKind),
}

impl ScanEnd {
    /// Returns true if pulling again may yield more rows.
    #[inline]
    pub fn has_more(self) -> bool {
        matches!(self, Self::QuotaReached)
    }
}

/// One event of a row pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowEvent {
    /// A matching row.
    Row {
        /// Row key.
        key: Bytes,
        /// Row value.
        value: Bytes,
    },
    /// Terminal event; exactly one per pull.
    End(ScanEnd),
}

/// Sending side of a row pull.
///
/// Dropping a sink that was never ended delivers `End(Closed)`, so every
/// pull gets its terminal event on every path.
pub struct RowSink {
    tx: mpsc::UnboundedSender<RowEvent>,
    ended: bool,
}

impl RowSink {
    /// Creates a connected sink and stream.
    pub fn channel() -> (RowSink, RowStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, ended: false }, RowStream { rx })
    }

    /// Sends a row. Returns false if the receiver is gone.
    pub fn row(&self, key: Bytes, value: Bytes) -> bool {
        self.tx.send(RowEvent::Row { key, value }).is_ok()
    }

    /// Sends the terminal event.
    pub fn end(mut self, end: ScanEnd) {
        self.ended = true;
        let _ = self.tx.send(RowEvent::End(end));
    }

    /// Returns true if the receiver was dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Drop for RowSink {
    fn drop(&mut self) {
        if !self.ended {
            let _ = self.tx.send(RowEvent::End(ScanEnd::Closed));
        }
    }
}

impl fmt::Debug for RowSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowSink")
            .field("ended", &self.ended)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiving side of a row pull.
#[derive(Debug)]
pub struct RowStream {
    rx: mpsc::UnboundedReceiver<RowEvent>,
}

impl RowStream {
    /// Waits for the next event from async code.
    pub async fn next(&mut self) -> Option<RowEvent> {
        self.rx.recv().await
    }

    /// Waits for the next event, blocking the thread.
    ///
    /// Must not be called from inside an async runtime.
    pub fn next_blocking(&mut self) -> Option<RowEvent> {
        self.rx.blocking_recv()
    }

    /// Blocks until the terminal event and returns the rows and how the pull
    /// ended.
    pub fn collect_blocking(mut self) -> (Vec<(Bytes, Bytes)>, ScanEnd) {
        let mut rows = Vec::new();
        while let Some(event) = self.next_blocking() {
            match event {
                RowEvent::Row { key, value } => rows.push((key, value)),
                RowEvent::End(end) => return (rows, end),
            }
        }
        (rows, ScanEnd::Closed)
    }

    /// Async counterpart of [`collect_blocking`](Self::collect_blocking).
    pub async fn collect(mut self) -> (Vec<(Bytes, Bytes)>, ScanEnd) {
        let mut rows = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                RowEvent::Row { key, value } => rows.push((key, value)),
                RowEvent::End(end) => return (rows, end),
            }
        }
        (rows, ScanEnd::Closed)
    }
}
