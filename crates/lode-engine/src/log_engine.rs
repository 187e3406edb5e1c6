//! Log-structured ordered engine.
//!
//! A store is a directory holding one append-only data log. Opening the
//! store replays the log into an ordered in-memory index that maps each
//! live key to the location of its latest value; values are read back from
//! the log on demand and optionally kept in a [`ValueCache`].
//!
//! ```text
//!   put/delete ──► append record ──► data.log
//!                        │
//!                        ▼
//!              BTreeMap<key, location> ◄── replay on open
//!                        │
//!   get/iter ────────────┴──► read value at location (via cache)
//! ```
//!
//! Only one engine per process may hold a given store directory open.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::mem;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use lode_common::{
    EngineConfig, LodeError, LodeResult, OpenOptions, ReadOptions, WriteOptions, DATA_FILE_NAME,
    MAX_KEY_SIZE, MAX_VALUE_SIZE,
};

use crate::cache::ValueCache;
use crate::error::{EngineError, EngineResult};
use crate::record::{self, RecordHeader};
use crate::traits::{EngineOpener, RawIterator, StorageEngine};

/// Store directories currently held open by this process.
static OPEN_PATHS: Mutex<BTreeSet<PathBuf>> = Mutex::new(BTreeSet::new());

/// Exclusive in-process claim on a store directory, released on drop.
struct PathClaim {
    path: PathBuf,
}

impl PathClaim {
    fn acquire(path: &Path) -> EngineResult<Self> {
        let mut open = OPEN_PATHS.lock();
        if !open.insert(path.to_path_buf()) {
            return Err(EngineError::Locked {
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        OPEN_PATHS.lock().remove(&self.path);
    }
}

/// Where a value lives in the data log.
#[derive(Debug, Clone, Copy)]
struct ValueLocation {
    offset: u64,
    len: u32,
}

struct DataLog {
    writer: BufWriter<File>,
    reader: File,
    /// Offset just past the last good record.
    end: u64,
    /// A failed append could not be rolled back.
    broken: bool,
}

impl DataLog {
    /// Appends a record and returns its starting offset.
    ///
    /// If any step fails the log is rolled back to `end`, so the record is
    /// neither indexed now nor replayed later.
    fn append(&mut self, record: &[u8], sync: bool) -> EngineResult<u64> {
        if self.broken {
            return Err(EngineError::LogUnusable);
        }
        if let Err(err) = self.write_record(record, sync) {
            if let Err(rollback) = self.rollback() {
                self.broken = true;
                error!(
                    end = self.end,
                    error = %rollback,
                    "data log rollback failed; refusing further writes"
                );
            }
            return Err(err.into());
        }
        let start = self.end;
        self.end += record.len() as u64;
        Ok(start)
    }

    fn write_record(&mut self, record: &[u8], sync: bool) -> io::Result<()> {
        self.writer.write_all(record)?;
        self.writer.flush()?;
        if sync {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Drops everything past `end`, whether still buffered or already in
    /// the file.
    fn rollback(&mut self) -> io::Result<()> {
        let mut file = self.writer.get_ref().try_clone()?;
        file.set_len(self.end)?;
        file.seek(SeekFrom::Start(self.end))?;
        let fresh = BufWriter::with_capacity(self.writer.capacity(), file);
        // into_parts hands back the buffer instead of flushing it.
        let (_, _unwritten) = mem::replace(&mut self.writer, fresh).into_parts();
        Ok(())
    }

    /// Flushes and syncs, unless the log is broken, in which case buffered
    /// bytes are discarded.
    fn finish(self) -> io::Result<()> {
        let mut writer = self.writer;
        if self.broken {
            let (_, _unwritten) = writer.into_parts();
            return Ok(());
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    fn read_value(&mut self, loc: ValueLocation) -> EngineResult<Bytes> {
        self.reader.seek(SeekFrom::Start(loc.offset))?;
        let mut buf = vec![0u8; loc.len as usize];
        self.reader.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

struct EngineState {
    index: BTreeMap<Bytes, ValueLocation>,
    log: Option<DataLog>,
    claim: Option<PathClaim>,
}

/// Engine operation counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Point reads served.
    pub gets: AtomicU64,
    /// Puts appended.
    pub puts: AtomicU64,
    /// Deletes appended.
    pub deletes: AtomicU64,
    /// Writes flushed with sync.
    pub syncs: AtomicU64,
    /// Bytes appended to the log.
    pub bytes_written: AtomicU64,
}

struct EngineShared {
    dir: PathBuf,
    state: Mutex<EngineState>,
    // Lock order: state, then cache.
    cache: Mutex<ValueCache>,
    closed: AtomicBool,
    stats: EngineStats,
}

impl EngineShared {
    #[inline]
    fn check_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn load_value(
        &self,
        state: &mut EngineState,
        key: &Bytes,
        loc: ValueLocation,
        fill_cache: bool,
    ) -> EngineResult<Bytes> {
        if let Some(value) = self.cache.lock().get(key) {
            return Ok(value);
        }
        let log = state.log.as_mut().ok_or(EngineError::Closed)?;
        let value = log.read_value(loc)?;
        if fill_cache {
            self.cache.lock().insert(key.clone(), value.clone());
        }
        Ok(value)
    }

    fn get(&self, options: &ReadOptions, key: &[u8]) -> EngineResult<Option<Bytes>> {
        self.check_open()?;
        self.stats.gets.fetch_add(1, Ordering::Relaxed);

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some((key, loc)) = state.index.get_key_value(key).map(|(k, l)| (k.clone(), *l)) else {
            return Ok(None);
        };
        self.load_value(state, &key, loc, options.fill_cache).map(Some)
    }

    /// First entry at or after `from`.
    fn entry_from(
        &self,
        from: Bound<&[u8]>,
        fill_cache: bool,
    ) -> EngineResult<Option<(Bytes, Bytes)>> {
        self.check_open()?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some((key, loc)) = state
            .index
            .range::<[u8], _>((from, Bound::Unbounded))
            .next()
            .map(|(k, l)| (k.clone(), *l))
        else {
            return Ok(None);
        };
        let value = self.load_value(state, &key, loc, fill_cache)?;
        Ok(Some((key, value)))
    }

    fn append(&self, key: &[u8], value: Option<&[u8]>, options: &WriteOptions) -> EngineResult<()> {
        if key.len() > MAX_KEY_SIZE {
            return Err(EngineError::TooLarge {
                what: "key",
                size: key.len(),
                max: MAX_KEY_SIZE,
            });
        }
        if let Some(v) = value {
            if v.len() > MAX_VALUE_SIZE {
                return Err(EngineError::TooLarge {
                    what: "value",
                    size: v.len(),
                    max: MAX_VALUE_SIZE,
                });
            }
        }
        self.check_open()?;

        let record = record::encode(key, value);
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let log = state.log.as_mut().ok_or(EngineError::Closed)?;
        let start = log.append(&record, options.sync)?;

        match value {
            Some(v) => {
                let loc = ValueLocation {
                    offset: start + (RecordHeader::SIZE + key.len()) as u64,
                    len: v.len() as u32,
                };
                state.index.insert(Bytes::copy_from_slice(key), loc);
                self.stats.puts.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                state.index.remove(key);
                self.stats.deletes.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.cache.lock().invalidate(key);

        self.stats
            .bytes_written
            .fetch_add(record.len() as u64, Ordering::Relaxed);
        if options.sync {
            self.stats.syncs.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Replays the data log. Returns the index, the offset just past the last
/// complete record, and the number of records applied.
fn replay(
    file: &File,
    block_size: usize,
) -> EngineResult<(BTreeMap<Bytes, ValueLocation>, u64, u64)> {
    let len = file.metadata()?.len();
    let mut reader = BufReader::with_capacity(block_size, file);
    let mut index = BTreeMap::new();
    let mut offset = 0u64;
    let mut records = 0u64;
    let mut header_buf = [0u8; RecordHeader::SIZE];

    while offset < len {
        let remaining = len - offset;
        if remaining < RecordHeader::SIZE as u64 {
            break;
        }
        reader.read_exact(&mut header_buf)?;
        let header = RecordHeader::decode(&mut &header_buf[..], offset)?;

        let payload_len = header.payload_len();
        // The header checked out, so a payload running past the end of the
        // file is a torn final write rather than a damaged length.
        if remaining - (RecordHeader::SIZE as u64) < payload_len as u64 {
            break;
        }
        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload)?;
        header.verify(&payload, offset)?;

        let payload = Bytes::from(payload);
        let key = payload.slice(..header.key_len as usize);
        if header.is_tombstone() {
            index.remove(&key);
        } else {
            index.insert(
                key,
                ValueLocation {
                    offset: offset + (RecordHeader::SIZE + header.key_len as usize) as u64,
                    len: header.value_len,
                },
            );
        }
        offset += (RecordHeader::SIZE + payload_len) as u64;
        records += 1;
    }

    Ok((index, offset, records))
}

/// Ordered key-value store backed by an append-only log.
pub struct LogEngine {
    shared: Arc<EngineShared>,
}

impl LogEngine {
    /// Opens or creates the store at `path`.
    pub fn open(path: &Path, options: &OpenOptions, config: &EngineConfig) -> EngineResult<Self> {
        options
            .validate()
            .map_err(|e| EngineError::InvalidOptions(e.to_string()))?;

        let exists = path.join(DATA_FILE_NAME).exists();
        if !exists && !options.create_if_missing {
            return Err(EngineError::Missing {
                path: path.to_path_buf(),
            });
        }
        if exists && options.error_if_exists {
            return Err(EngineError::Exists {
                path: path.to_path_buf(),
            });
        }

        fs::create_dir_all(path)?;
        let dir = fs::canonicalize(path)?;
        let claim = PathClaim::acquire(&dir)?;

        let data_path = dir.join(DATA_FILE_NAME);
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&data_path)?;

        let (index, end, records) = replay(&file, options.block_size)?;
        let file_len = file.metadata()?.len();
        if end < file_len {
            warn!(
                path = %data_path.display(),
                valid_end = end,
                file_len,
                "truncating torn record at end of data log"
            );
            file.set_len(end)?;
        }

        let mut write_handle = file;
        write_handle.seek(SeekFrom::Start(end))?;
        let reader = File::open(&data_path)?;

        info!(
            path = %dir.display(),
            keys = index.len(),
            records,
            "opened store"
        );

        Ok(Self {
            shared: Arc::new(EngineShared {
                dir,
                state: Mutex::new(EngineState {
                    index,
                    log: Some(DataLog {
                        writer: BufWriter::with_capacity(options.block_size, write_handle),
                        reader,
                        end,
                        broken: false,
                    }),
                    claim: Some(claim),
                }),
                cache: Mutex::new(ValueCache::new(config.cache_capacity)),
                closed: AtomicBool::new(false),
                stats: EngineStats::default(),
            }),
        })
    }

    /// Returns the canonical store directory.
    pub fn path(&self) -> &Path {
        &self.shared.dir
    }

    /// Returns operation counters.
    pub fn stats(&self) -> &EngineStats {
        &self.shared.stats
    }

    /// Returns true once [`StorageEngine::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Returns (hits, misses) for the value cache.
    pub fn cache_stats(&self) -> (u64, u64) {
        self.shared.cache.lock().hit_stats()
    }
}

impl StorageEngine for LogEngine {
    fn get(&self, options: &ReadOptions, key: &[u8]) -> LodeResult<Option<Bytes>> {
        Ok(self.shared.get(options, key)?)
    }

    fn put(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> LodeResult<()> {
        Ok(self.shared.append(key, Some(value), options)?)
    }

    fn delete(&self, options: &WriteOptions, key: &[u8]) -> LodeResult<()> {
        Ok(self.shared.append(key, None, options)?)
    }

    fn iter(&self, options: &ReadOptions) -> LodeResult<Box<dyn RawIterator>> {
        self.shared.check_open()?;
        Ok(Box::new(LogIterator {
            shared: Arc::clone(&self.shared),
            fill_cache: options.fill_cache,
            current: None,
            status: None,
        }))
    }

    fn key_count(&self) -> LodeResult<usize> {
        self.shared.check_open()?;
        Ok(self.shared.state.lock().index.len())
    }

    fn close(&self) -> LodeResult<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut state = self.shared.state.lock();
        let result = match state.log.take() {
            Some(log) => log.finish(),
            None => Ok(()),
        };
        state.index.clear();
        drop(state.claim.take());
        drop(state);
        self.shared.cache.lock().clear();

        debug!(path = %self.shared.dir.display(), "closed store");
        result.map_err(|e| LodeError::from(EngineError::from(e)))
    }
}

impl fmt::Debug for LogEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogEngine")
            .field("path", &self.shared.dir)
            .field("closed", &self.is_closed())
            .field("puts", &self.shared.stats.puts.load(Ordering::Relaxed))
            .field("gets", &self.shared.stats.gets.load(Ordering::Relaxed))
            .finish()
    }
}

/// Forward iterator over a [`LogEngine`].
///
/// Each step reads the live index, so writes made after the iterator was
/// created are visible to later steps.
pub struct LogIterator {
    shared: Arc<EngineShared>,
    fill_cache: bool,
    current: Option<(Bytes, Bytes)>,
    status: Option<LodeError>,
}

impl LogIterator {
    fn position(&mut self, from: Bound<&[u8]>) {
        if self.status.is_some() {
            return;
        }
        match self.shared.entry_from(from, self.fill_cache) {
            Ok(entry) => self.current = entry,
            Err(err) => {
                self.current = None;
                self.status = Some(err.into());
            }
        }
    }
}

impl RawIterator for LogIterator {
    fn seek_to_first(&mut self) {
        self.current = None;
        self.position(Bound::Unbounded);
    }

    fn seek(&mut self, target: &[u8]) {
        self.current = None;
        self.position(Bound::Included(target));
    }

    fn next(&mut self) {
        if let Some((key, _)) = self.current.take() {
            self.position(Bound::Excluded(&key));
        }
    }

    fn valid(&self) -> bool {
        self.status.is_none() && self.current.is_some()
    }

    fn key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(k, _)| &k[..])
    }

    fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(_, v)| &v[..])
    }

    fn status(&self) -> LodeResult<()> {
        match &self.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for LogIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogIterator")
            .field("valid", &self.valid())
            .field("fill_cache", &self.fill_cache)
            .finish()
    }
}

/// Opens [`LogEngine`]s with a fixed engine configuration.
#[derive(Debug, Clone, Default)]
pub struct LogEngineOpener {
    config: EngineConfig,
}

impl LogEngineOpener {
    /// Creates an opener.
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

impl EngineOpener for LogEngineOpener {
    fn open(&self, path: &Path, options: &OpenOptions) -> LodeResult<Box<dyn StorageEngine>> {
        let engine = LogEngine::open(path, options, &self.config)?;
        Ok(Box::new(engine))
    }
}
