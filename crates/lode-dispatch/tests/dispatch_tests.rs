//! Integration tests for the request dispatcher.

use std::sync::Arc;

use bytes::Bytes;
use lode_common::{
    CursorId, EngineConfig, ErrorKind, HandleId, OpenMode, OpenOptions, RegistryConfig,
    StoreIdentity,
};
use lode_core::{RangeBounds, ReplyChannel, RowSink, ScanEnd};
use lode_dispatch::{DispatchResult, Dispatcher, Request};
use lode_engine::LogEngineOpener;
use tempfile::TempDir;

fn dispatcher(mode: OpenMode) -> Dispatcher {
    Dispatcher::new(
        Arc::new(LogEngineOpener::new(EngineConfig::for_testing())),
        RegistryConfig::default().with_open_mode(mode),
    )
}

fn open(d: &Dispatcher, identity: StoreIdentity) -> DispatchResult<HandleId> {
    let (reply, rx) = ReplyChannel::oneshot();
    d.dispatch(Request::Open {
        identity,
        shared: true,
        reply,
    });
    rx.blocking_recv().unwrap()
}

fn call<T: Send + 'static>(
    d: &Dispatcher,
    build: impl FnOnce(ReplyChannel<DispatchResult<T>>) -> Request,
) -> DispatchResult<T> {
    let (reply, rx) = ReplyChannel::oneshot();
    d.dispatch(build(reply));
    rx.blocking_recv().unwrap()
}

fn pull(d: &Dispatcher, cursor: CursorId, max_rows: u32) -> (Vec<(Bytes, Bytes)>, ScanEnd) {
    let (sink, stream) = RowSink::channel();
    d.dispatch(Request::PullRows {
        cursor,
        max_rows,
        sink,
    });
    stream.collect_blocking()
}

fn keys(rows: &[(Bytes, Bytes)]) -> Vec<&[u8]> {
    rows.iter().map(|(k, _)| &k[..]).collect()
}

#[test]
fn test_point_requests() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(OpenMode::Inline);
    let h = open(&d, d.identity(dir.path())).unwrap();

    call(&d, |reply| Request::Put {
        handle: h,
        key: Bytes::from_static(b"k"),
        value: Bytes::from_static(b"v"),
        durable: true,
        reply,
    })
    .unwrap();
    let value = call(&d, |reply| Request::Get {
        handle: h,
        key: Bytes::from_static(b"k"),
        reply,
    })
    .unwrap();
    assert_eq!(value, Some(Bytes::from_static(b"v")));

    call(&d, |reply| Request::Delete {
        handle: h,
        key: Bytes::from_static(b"k"),
        reply,
    })
    .unwrap();
    assert_eq!(d.get(h, b"k").unwrap(), None);
    assert_eq!(d.get(h, b"missing").unwrap(), None);
}

#[test]
fn test_shared_open_issues_distinct_ids() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(OpenMode::Background);
    let a = open(&d, d.identity(dir.path())).unwrap();
    let b = open(&d, d.identity(dir.path())).unwrap();
    assert_ne!(a, b);
    assert_eq!(d.registry().live_handles(), 1);
    assert_eq!(d.handle_count(), 2);

    d.put(a, b"shared", b"yes", false).unwrap();
    d.close(a).unwrap();
    assert_eq!(d.get(b, b"shared").unwrap().as_deref(), Some(&b"yes"[..]));
    d.close(b).unwrap();
    assert_eq!(d.registry().live_handles(), 0);
}

#[test]
fn test_close_twice_and_use_after_close() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(OpenMode::Inline);
    let h = open(&d, d.identity(dir.path())).unwrap();

    call(&d, |reply| Request::Close { handle: h, reply }).unwrap();
    assert_eq!(
        call(&d, |reply| Request::Close { handle: h, reply }),
        Err(ErrorKind::AlreadyClosed)
    );
    assert_eq!(d.get(h, b"k"), Err(ErrorKind::ResourceClosed));
    assert_eq!(
        d.new_cursor(h, RangeBounds::all()),
        Err(ErrorKind::ResourceClosed)
    );

    let unknown = HandleId::new(999);
    assert_eq!(d.close(unknown), Err(ErrorKind::ResourceClosed));
    assert_eq!(d.put(unknown, b"k", b"v", false), Err(ErrorKind::ResourceClosed));
}

#[test]
fn test_failed_open_is_not_registered() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(OpenMode::Background);
    let identity = StoreIdentity::new(
        dir.path().join("absent"),
        OpenOptions::default().with_create_if_missing(false),
    );

    assert_eq!(open(&d, identity), Err(ErrorKind::InvalidArgument));
    assert_eq!(d.handle_count(), 0);
    assert_eq!(d.registry().live_handles(), 0);
}

#[test]
fn test_cursor_requests() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(OpenMode::Inline);
    let h = open(&d, d.identity(dir.path())).unwrap();
    for key in ["a", "b", "c", "d", "e"] {
        d.put(h, key.as_bytes(), b"v", false).unwrap();
    }

    let c = call(&d, |reply| Request::NewCursor {
        handle: h,
        bounds: RangeBounds::all(),
        reply,
    })
    .unwrap();

    let (rows, end) = pull(&d, c, 2);
    assert_eq!(keys(&rows), vec![&b"a"[..], b"b"]);
    assert_eq!(end, ScanEnd::QuotaReached);
    let (rows, end) = pull(&d, c, 10);
    assert_eq!(keys(&rows), vec![&b"c"[..], b"d", b"e"]);
    assert_eq!(end, ScanEnd::ExhaustedRange);

    call(&d, |reply| Request::CancelCursor { cursor: c, reply }).unwrap();
    assert_eq!(d.cancel_cursor(c), Err(ErrorKind::ResourceClosed));
    assert_eq!(pull(&d, c, 1).1, ScanEnd::Closed);
}

#[test]
fn test_bounded_cursor_request() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(OpenMode::Inline);
    let h = open(&d, d.identity(dir.path())).unwrap();
    for key in ["a", "b", "c", "d"] {
        d.put(h, key.as_bytes(), b"v", false).unwrap();
    }

    let c = d
        .new_cursor(h, RangeBounds::all().gt("b").lte("d"))
        .unwrap();
    let (rows, end) = pull(&d, c, 10);
    assert_eq!(keys(&rows), vec![&b"c"[..], b"d"]);
    assert_eq!(end, ScanEnd::ExhaustedRange);
}

#[test]
fn test_unknown_cursor_reports_closed() {
    let d = dispatcher(OpenMode::Inline);
    let missing = CursorId::new(u64::MAX);
    assert_eq!(pull(&d, missing, 5), (Vec::new(), ScanEnd::Closed));
    assert_eq!(d.cancel_cursor(missing), Err(ErrorKind::ResourceClosed));
}

#[test]
fn test_close_handle_cancels_its_cursors() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(OpenMode::Inline);
    let h = open(&d, d.identity(dir.path())).unwrap();
    d.put(h, b"a", b"1", false).unwrap();
    d.put(h, b"b", b"2", false).unwrap();

    let c = d.new_cursor(h, RangeBounds::all()).unwrap();
    assert_eq!(pull(&d, c, 1).1, ScanEnd::QuotaReached);
    d.close(h).unwrap();

    assert_eq!(pull(&d, c, 1), (Vec::new(), ScanEnd::Closed));
    assert_eq!(d.cancel_cursor(c), Err(ErrorKind::ResourceClosed));
    assert_eq!(d.registry().live_handles(), 0);
}

#[test]
fn test_forget_closes_what_was_left_open() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(OpenMode::Inline);
    let h = open(&d, d.identity(dir.path())).unwrap();
    d.put(h, b"a", b"1", false).unwrap();
    let c = d.new_cursor(h, RangeBounds::all()).unwrap();
    assert_eq!(d.cursor_count(), 1);

    d.dispatch(Request::ForgetCursor { cursor: c });
    assert_eq!(d.cursor_count(), 0);
    assert_eq!(pull(&d, c, 1).1, ScanEnd::Closed);

    d.dispatch(Request::ForgetHandle { handle: h });
    assert_eq!(d.handle_count(), 0);
    assert_eq!(d.registry().live_handles(), 0);
    assert_eq!(d.get(h, b"a"), Err(ErrorKind::ResourceClosed));

    // The store can be opened again, with its data intact.
    let again = open(&d, d.identity(dir.path())).unwrap();
    assert_eq!(d.get(again, b"a").unwrap().as_deref(), Some(&b"1"[..]));
}

#[test]
fn test_forgotten_handle_releases_cursor_store() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(OpenMode::Inline);
    let h = open(&d, d.identity(dir.path())).unwrap();
    d.put(h, b"a", b"1", false).unwrap();
    let c = d.new_cursor(h, RangeBounds::all()).unwrap();

    // Forgetting the handle cancels its cursors, so the cursor id now
    // only reports closed.
    d.forget_handle(h);
    assert_eq!(pull(&d, c, 1).1, ScanEnd::Closed);
    assert_eq!(d.registry().live_handles(), 0);
    d.forget_cursor(c);
}

#[test]
fn test_stats_count_requests_and_errors() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(OpenMode::Inline);
    let h = open(&d, d.identity(dir.path())).unwrap();
    let _ = call(&d, |reply| Request::Close { handle: h, reply });
    let _ = call(&d, |reply| Request::Close { handle: h, reply });

    let stats = d.stats();
    assert_eq!(stats.requests.load(std::sync::atomic::Ordering::Relaxed), 3);
    assert_eq!(stats.errors.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_callers() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(OpenMode::Background);

    let (reply, rx) = ReplyChannel::oneshot();
    d.open(d.identity(dir.path()), true, reply);
    let h = rx.await.unwrap().unwrap();

    for i in 0..10u32 {
        d.put(h, format!("k{:02}", i).as_bytes(), b"v", false)
            .unwrap();
    }
    let c = d.new_cursor(h, RangeBounds::all().gte("k05")).unwrap();

    let (sink, stream) = RowSink::channel();
    d.pull_rows(c, 100, sink);
    let (rows, end) = stream.collect().await;
    assert_eq!(rows.len(), 5);
    assert_eq!(end, ScanEnd::ExhaustedRange);

    d.close(h).unwrap();
}
