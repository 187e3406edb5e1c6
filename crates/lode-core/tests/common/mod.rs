//! Shared fixtures for lode-core integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use lode_common::{
    EngineConfig, LodeError, LodeResult, OpenMode, OpenOptions, ReadOptions, RegistryConfig,
    StoreIdentity, WriteOptions,
};
use lode_core::HandleRegistry;
use lode_engine::{EngineOpener, LogEngineOpener, RawIterator, StorageEngine};
use tempfile::TempDir;

/// Counts opens and closes, and can slow down or fail opens and iterators.
#[derive(Default)]
pub struct Probe {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub open_delay: parking_lot::Mutex<Duration>,
    pub fail_open: parking_lot::Mutex<Option<LodeError>>,
    pub step_delay: parking_lot::Mutex<Duration>,
    /// Iterators fail with Corruption after this many `next` calls.
    pub fail_after: parking_lot::Mutex<Option<usize>>,
}

impl Probe {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub struct ProbeOpener {
    inner: LogEngineOpener,
    probe: Arc<Probe>,
}

impl ProbeOpener {
    pub fn new(probe: Arc<Probe>) -> Self {
        Self {
            inner: LogEngineOpener::new(EngineConfig::for_testing()),
            probe,
        }
    }
}

impl EngineOpener for ProbeOpener {
    fn open(&self, path: &Path, options: &OpenOptions) -> LodeResult<Box<dyn StorageEngine>> {
        let delay = *self.probe.open_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if let Some(err) = self.probe.fail_open.lock().clone() {
            return Err(err);
        }
        let engine = self.inner.open(path, options)?;
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ProbeEngine {
            inner: engine,
            probe: Arc::clone(&self.probe),
        }))
    }
}

struct ProbeEngine {
    inner: Box<dyn StorageEngine>,
    probe: Arc<Probe>,
}

impl StorageEngine for ProbeEngine {
    fn get(&self, options: &ReadOptions, key: &[u8]) -> LodeResult<Option<Bytes>> {
        self.inner.get(options, key)
    }

    fn put(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> LodeResult<()> {
        self.inner.put(options, key, value)
    }

    fn delete(&self, options: &WriteOptions, key: &[u8]) -> LodeResult<()> {
        self.inner.delete(options, key)
    }

    fn iter(&self, options: &ReadOptions) -> LodeResult<Box<dyn RawIterator>> {
        Ok(Box::new(ProbeIterator {
            inner: self.inner.iter(options)?,
            step_delay: *self.probe.step_delay.lock(),
            fail_after: *self.probe.fail_after.lock(),
            steps: 0,
            failed: None,
        }))
    }

    fn key_count(&self) -> LodeResult<usize> {
        self.inner.key_count()
    }

    fn close(&self) -> LodeResult<()> {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close()
    }
}

struct ProbeIterator {
    inner: Box<dyn RawIterator>,
    step_delay: Duration,
    fail_after: Option<usize>,
    steps: usize,
    failed: Option<LodeError>,
}

impl RawIterator for ProbeIterator {
    fn seek_to_first(&mut self) {
        self.inner.seek_to_first();
    }

    fn seek(&mut self, target: &[u8]) {
        self.inner.seek(target);
    }

    fn next(&mut self) {
        if !self.step_delay.is_zero() {
            thread::sleep(self.step_delay);
        }
        self.steps += 1;
        if self.fail_after.is_some_and(|n| self.steps >= n) {
            self.failed = Some(LodeError::corruption("injected"));
            return;
        }
        self.inner.next();
    }

    fn valid(&self) -> bool {
        self.failed.is_none() && self.inner.valid()
    }

    fn key(&self) -> Option<&[u8]> {
        self.inner.key()
    }

    fn value(&self) -> Option<&[u8]> {
        self.inner.value()
    }

    fn status(&self) -> LodeResult<()> {
        match &self.failed {
            Some(err) => Err(err.clone()),
            None => self.inner.status(),
        }
    }
}

/// A registry over a temp directory with an attached probe.
pub struct Fixture {
    pub dir: TempDir,
    pub probe: Arc<Probe>,
    pub registry: HandleRegistry,
}

impl Fixture {
    pub fn new(mode: OpenMode) -> Self {
        let probe = Arc::new(Probe::default());
        let registry = HandleRegistry::new(
            Arc::new(ProbeOpener::new(Arc::clone(&probe))),
            RegistryConfig::default().with_open_mode(mode),
        );
        Self {
            dir: TempDir::new().unwrap(),
            probe,
            registry,
        }
    }

    pub fn identity(&self, name: &str) -> StoreIdentity {
        StoreIdentity::new(self.dir.path().join(name), OpenOptions::default())
    }
}

pub fn keys(rows: &[(Bytes, Bytes)]) -> Vec<String> {
    rows.iter()
        .map(|(k, _)| String::from_utf8_lossy(k).into_owned())
        .collect()
}
