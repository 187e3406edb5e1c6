//! Integration tests for shared opens, reference counting, and close.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::Fixture;
use lode_common::{ErrorKind, LodeError, OpenMode, OpenOptions, StoreIdentity};
use lode_core::{RangeBounds, ReplyChannel, ScanEnd, StoreStatus};
use parking_lot::Mutex;

#[test]
fn test_concurrent_shared_acquire_opens_once() {
    let fx = Fixture::new(OpenMode::Background);
    *fx.probe.open_delay.lock() = Duration::from_millis(50);
    let identity = fx.identity("a");

    let barrier = Arc::new(Barrier::new(8));
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let registry = fx.registry.clone();
            let identity = identity.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let handle = registry.acquire(identity, true);
                handle.wait_ready().unwrap();
                handle
            })
        })
        .collect();
    let handles: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    assert_eq!(fx.probe.opens(), 1);
    for h in &handles[1..] {
        assert!(handles[0].same_store(h));
    }
    assert_eq!(handles[0].ref_counts(), (8, 8));
    assert_eq!(fx.registry.live_handles(), 1);

    for (i, h) in handles.iter().enumerate() {
        h.close().unwrap();
        let expected = if i == handles.len() - 1 { 1 } else { 0 };
        assert_eq!(fx.probe.closes(), expected);
    }
    assert_eq!(fx.registry.live_handles(), 0);
    drop(handles);
    assert_eq!(fx.probe.opens(), 1);
    assert_eq!(fx.probe.closes(), 1);
}

#[test]
fn test_two_shared_opens_resolve_to_same_handle() {
    let fx = Fixture::new(OpenMode::Inline);
    let a = fx.registry.acquire(fx.identity("A"), true);
    let b = fx.registry.acquire(fx.identity("A"), true);
    assert!(a.same_store(&b));
    assert_eq!(fx.probe.opens(), 1);

    a.put(b"k", b"v", false).unwrap();
    assert_eq!(b.get(b"k").unwrap().as_deref(), Some(&b"v"[..]));
}

#[test]
fn test_non_shared_acquire_is_separate() {
    let fx = Fixture::new(OpenMode::Inline);
    let a = fx.registry.acquire(fx.identity("x"), false);
    a.wait_ready().unwrap();
    let b = fx.registry.acquire(fx.identity("y"), false);
    assert!(!a.same_store(&b));
    assert_eq!(fx.registry.live_handles(), 0);
    assert_eq!(fx.probe.opens(), 2);
}

#[test]
fn test_identity_includes_open_options() {
    let fx = Fixture::new(OpenMode::Inline);
    let path = fx.dir.path().join("opts");
    let a = fx
        .registry
        .acquire(StoreIdentity::new(&path, OpenOptions::default()), true);
    a.wait_ready().unwrap();
    let b = fx.registry.acquire(
        StoreIdentity::new(&path, OpenOptions::default().with_block_size(8192)),
        true,
    );
    assert!(!a.same_store(&b));
    // The engine allows one open instance per directory.
    assert_eq!(b.wait_ready().unwrap_err().kind(), ErrorKind::IoError);
}

#[test]
fn test_waiters_notified_in_arrival_order() {
    let fx = Fixture::new(OpenMode::Background);
    *fx.probe.open_delay.lock() = Duration::from_millis(100);
    let identity = fx.identity("order");
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for i in 0..5 {
        let order = Arc::clone(&order);
        let reply = ReplyChannel::new(move |result: Result<(), LodeError>| {
            assert!(result.is_ok());
            order.lock().push(i);
        });
        handles.push(fx.registry.acquire_with(identity.clone(), true, reply));
    }

    handles[0].wait_ready().unwrap();
    // Replies are posted by the open thread after readiness is published.
    for _ in 0..100 {
        if order.lock().len() == 5 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);

    // Arriving after completion replies immediately.
    let (reply, rx) = ReplyChannel::oneshot();
    let late = fx.registry.acquire_with(identity, true, reply);
    assert_eq!(rx.blocking_recv().unwrap(), Ok(()));
    assert!(late.same_store(&handles[0]));
    assert_eq!(fx.probe.opens(), 1);
}

#[test]
fn test_failed_open_reported_to_all_and_not_reused() {
    let fx = Fixture::new(OpenMode::Background);
    *fx.probe.open_delay.lock() = Duration::from_millis(50);
    *fx.probe.fail_open.lock() = Some(LodeError::corruption("bad manifest"));
    let identity = fx.identity("broken");

    let mut receivers = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..3 {
        let (reply, rx) = ReplyChannel::oneshot();
        handles.push(fx.registry.acquire_with(identity.clone(), true, reply));
        receivers.push(rx);
    }
    for rx in receivers {
        let result = rx.blocking_recv().unwrap();
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Corruption);
    }
    assert!(matches!(handles[0].status(), StoreStatus::Failed(_)));
    assert_eq!(
        handles[1].get(b"k").unwrap_err().kind(),
        ErrorKind::Corruption
    );
    assert!(!fx.registry.contains(&identity));

    // A new acquire retries with a fresh instance.
    *fx.probe.fail_open.lock() = None;
    let retry = fx.registry.acquire(identity, true);
    retry.wait_ready().unwrap();
    assert!(!retry.same_store(&handles[0]));
    assert_eq!(fx.probe.opens(), 1);

    for h in &handles {
        h.close().unwrap();
    }
    retry.close().unwrap();
    assert_eq!(fx.probe.closes(), 1);
}

#[test]
fn test_close_is_idempotent() {
    let fx = Fixture::new(OpenMode::Inline);
    let handle = fx.registry.acquire(fx.identity("idem"), true);
    handle.close().unwrap();
    assert_eq!(handle.close().unwrap_err(), LodeError::AlreadyClosed);
    assert_eq!(fx.probe.closes(), 1);
    assert!(handle.is_closed());
    assert_eq!(handle.status(), StoreStatus::Closed);
}

#[test]
fn test_operations_after_close_report_resource_closed() {
    let fx = Fixture::new(OpenMode::Inline);
    let handle = fx.registry.acquire(fx.identity("closed"), true);
    handle.put(b"a", b"1", true).unwrap();
    handle.close().unwrap();

    assert_eq!(handle.get(b"a").unwrap_err(), LodeError::ResourceClosed);
    assert_eq!(
        handle.put(b"a", b"2", false).unwrap_err(),
        LodeError::ResourceClosed
    );
    assert_eq!(handle.delete(b"a").unwrap_err(), LodeError::ResourceClosed);
    assert_eq!(
        handle.cursor(RangeBounds::all()).unwrap_err(),
        LodeError::ResourceClosed
    );
}

#[test]
fn test_closing_one_sharer_keeps_engine_open() {
    let fx = Fixture::new(OpenMode::Inline);
    let a = fx.registry.acquire(fx.identity("s"), true);
    let b = fx.registry.acquire(fx.identity("s"), true);
    a.close().unwrap();

    assert_eq!(fx.probe.closes(), 0);
    b.put(b"still", b"open", false).unwrap();
    assert_eq!(b.ref_counts(), (2, 1));
    b.close().unwrap();
    assert_eq!(fx.probe.closes(), 1);
}

#[test]
fn test_dropped_handle_is_closed() {
    let fx = Fixture::new(OpenMode::Inline);
    let handle = fx.registry.acquire(fx.identity("dropped"), true);
    let clone = handle.clone();
    drop(handle);
    assert_eq!(fx.probe.closes(), 0);
    drop(clone);
    assert_eq!(fx.probe.closes(), 1);
    assert_eq!(fx.registry.live_handles(), 0);
}

#[test]
fn test_cursor_keeps_engine_open_after_handle_close() {
    let fx = Fixture::new(OpenMode::Inline);
    let owner = fx.registry.acquire(fx.identity("c"), true);
    for key in ["a", "b", "c"] {
        owner.put(key.as_bytes(), b"v", false).unwrap();
    }

    // A second sharer's cursor outlives the first sharer's close.
    let other = fx.registry.acquire(fx.identity("c"), true);
    let cursor = other.cursor(RangeBounds::all()).unwrap();
    owner.close().unwrap();
    assert_eq!(fx.probe.closes(), 0);

    let (rows, end) = cursor.pull(10).collect_blocking();
    assert_eq!(common::keys(&rows), vec!["a", "b", "c"]);
    assert_eq!(end, ScanEnd::ExhaustedRange);

    other.close().unwrap();
    assert_eq!(fx.probe.closes(), 1);
}

#[test]
fn test_reacquire_after_close_reopens() {
    let fx = Fixture::new(OpenMode::Background);
    let identity = fx.identity("again");

    for round in 1..=5 {
        let handle = fx.registry.acquire(identity.clone(), true);
        handle.put(b"round", round.to_string().as_bytes(), false).unwrap();
        handle.close().unwrap();
        assert_eq!(fx.probe.opens(), round);
        assert_eq!(fx.probe.closes(), round);
    }

    let handle = fx.registry.acquire(identity, true);
    assert_eq!(handle.get(b"round").unwrap().as_deref(), Some(&b"5"[..]));
}

#[test]
fn test_release_during_background_open() {
    let fx = Fixture::new(OpenMode::Background);
    *fx.probe.open_delay.lock() = Duration::from_millis(50);
    let identity = fx.identity("early");

    let handle = fx.registry.acquire(identity.clone(), true);
    handle.close().unwrap();
    // The close waits for the in-flight open, then closes what it produced.
    assert_eq!(fx.probe.opens(), 1);
    assert_eq!(fx.probe.closes(), 1);

    let again = fx.registry.acquire(identity, true);
    again.wait_ready().unwrap();
    again.close().unwrap();
    assert_eq!(fx.probe.closes(), 2);
}

#[test]
fn test_racing_acquire_and_close_never_double_open() {
    let fx = Fixture::new(OpenMode::Background);
    let identity = fx.identity("race");

    let threads: Vec<_> = (0..6)
        .map(|i| {
            let registry = fx.registry.clone();
            let identity = identity.clone();
            thread::spawn(move || {
                for j in 0..20 {
                    let handle = registry.acquire(identity.clone(), true);
                    let key = format!("t{}-{}", i, j);
                    handle.put(key.as_bytes(), b"v", false).unwrap();
                    handle.close().unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(fx.registry.live_handles(), 0);
    assert_eq!(fx.probe.opens(), fx.probe.closes());

    let handle = fx.registry.acquire(identity, true);
    assert_eq!(handle.key_count().unwrap(), 120);
}
