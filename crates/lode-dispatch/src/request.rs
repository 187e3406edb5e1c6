//! Request messages and their reply types.

use std::fmt;

use bytes::Bytes;
use lode_common::{CursorId, ErrorKind, HandleId, StoreIdentity};
use lode_core::{RangeBounds, ReplyChannel, RowSink};

/// Result delivered on a reply channel.
pub type DispatchResult<T> = Result<T, ErrorKind>;

/// One request to the dispatcher. Every variant carries the target its
/// reply is posted to, exactly once.
pub enum Request {
    /// Open a store. Replies when the open completes.
    Open {
        /// Store identity.
        identity: StoreIdentity,
        /// Join an existing open of the same identity.
        shared: bool,
        /// Receives the new handle id.
        reply: ReplyChannel<DispatchResult<HandleId>>,
    },
    /// Close a handle.
    Close {
        /// Target handle.
        handle: HandleId,
        /// Receives the outcome.
        reply: ReplyChannel<DispatchResult<()>>,
    },
    /// Point read.
    Get {
        /// Target handle.
        handle: HandleId,
        /// Key to read.
        key: Bytes,
        /// Receives the value, or `None` on a miss.
        reply: ReplyChannel<DispatchResult<Option<Bytes>>>,
    },
    /// Point write.
    Put {
        /// Target handle.
        handle: HandleId,
        /// Key to write.
        key: Bytes,
        /// Value to write.
        value: Bytes,
        /// Flush to stable storage before replying.
        durable: bool,
        /// Receives the outcome.
        reply: ReplyChannel<DispatchResult<()>>,
    },
    /// Point delete.
    Delete {
        /// Target handle.
        handle: HandleId,
        /// Key to delete.
        key: Bytes,
        /// Receives the outcome.
        reply: ReplyChannel<DispatchResult<()>>,
    },
    /// Create a cursor.
    NewCursor {
        /// Target handle.
        handle: HandleId,
        /// Range to scan.
        bounds: RangeBounds,
        /// Receives the new cursor id.
        reply: ReplyChannel<DispatchResult<CursorId>>,
    },
    /// Pull up to `max_rows` rows.
    PullRows {
        /// Target cursor.
        cursor: CursorId,
        /// Row quota for this pull.
        max_rows: u32,
        /// Receives the rows and the terminal event.
        sink: RowSink,
    },
    /// Cancel a cursor.
    CancelCursor {
        /// Target cursor.
        cursor: CursorId,
        /// Receives the outcome.
        reply: ReplyChannel<DispatchResult<()>>,
    },
    /// The caller dropped its handle id without closing it.
    ForgetHandle {
        /// Forgotten handle.
        handle: HandleId,
    },
    /// The caller dropped its cursor id without cancelling it.
    ForgetCursor {
        /// Forgotten cursor.
        cursor: CursorId,
    },
}

impl Request {
    /// Short request name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Close { .. } => "close",
            Self::Get { .. } => "get",
            Self::Put { .. } => "put",
            Self::Delete { .. } => "delete",
            Self::NewCursor { .. } => "new_cursor",
            Self::PullRows { .. } => "pull_rows",
            Self::CancelCursor { .. } => "cancel_cursor",
            Self::ForgetHandle { .. } => "forget_handle",
            Self::ForgetCursor { .. } => "forget_cursor",
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Request");
        s.field("op", &self.name());
        match self {
            Self::Open {
                identity, shared, ..
            } => s.field("identity", identity).field("shared", shared),
            Self::Close { handle, .. }
            | Self::ForgetHandle { handle }
            | Self::Get { handle, .. }
            | Self::Delete { handle, .. } => s.field("handle", handle),
            Self::Put {
                handle, durable, ..
            } => s.field("handle", handle).field("durable", durable),
            Self::NewCursor { handle, bounds, .. } => {
                s.field("handle", handle).field("bounds", bounds)
            }
            Self::PullRows {
                cursor, max_rows, ..
            } => s.field("cursor", cursor).field("max_rows", max_rows),
            Self::CancelCursor { cursor, .. } | Self::ForgetCursor { cursor } => {
                s.field("cursor", cursor)
            }
        };
        s.finish_non_exhaustive()
    }
}
