//! The local store.
//!
//! A keyspaced record log over a [`StorageBackend`]. Every put or delete is
//! appended as a CRC-framed [`Frame`](record::Frame) and mirrored in an
//! in-memory index, which is rebuilt by replaying the log on open. Each write
//! receives a monotonically increasing sequence number.
//!
//! A frame that fails its CRC, or a torn frame at the end of the log, stops
//! replay. The log is truncated to the last good frame so that later appends
//! stay replayable, and the problem is kept in [`LocalStore::replay_errors`]
//! for the integrity checker.

mod domain;
mod record;

pub use domain::{
    normalize_entity_key, EntityRecord, SyncedVersion, META_MIGRATION_LEDGER, META_QUICK_WATERMARK,
};
pub use record::{compute_crc32, Frame, FrameFlags, Keyspace};

use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use pawsync_protocol::{decode, encode};
use pawsync_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// A log position where replay stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayError {
    /// Byte offset of the bad frame.
    pub offset: u64,
    /// Bytes discarded from that offset on.
    pub discarded_bytes: u64,
    /// What was wrong.
    pub message: String,
}

/// Size and shape of the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Live records per keyspace.
    pub records: BTreeMap<&'static str, usize>,
    /// Bytes held by live keys and values.
    pub live_bytes: u64,
    /// Bytes of log on the backend.
    pub log_bytes: u64,
    /// Log bytes held by overwritten or deleted records.
    pub reclaimable_bytes: u64,
    /// Last assigned sequence number.
    pub last_seq: u64,
    /// Configured capacity.
    pub capacity_bytes: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    seq: u64,
}

impl Entry {
    fn live_size(&self, key: &str) -> u64 {
        (key.len() + self.value.len()) as u64
    }

    fn frame_size(&self, key: &str) -> u64 {
        Frame::OVERHEAD as u64 + self.live_size(key)
    }
}

/// Meta key of the tombstone that carries the last sequence number through
/// a compaction when the newest write was a delete.
const SEQ_MARK_KEY: &str = "seq_mark";

struct StoreInner {
    backend: Box<dyn StorageBackend>,
    index: BTreeMap<(Keyspace, String), Entry>,
    next_seq: u64,
    live_bytes: u64,
    replay_errors: Vec<ReplayError>,
}

impl StoreInner {
    fn reclaimable_bytes(&self) -> CoreResult<u64> {
        let live: u64 = self.index.iter().map(|((_, k), e)| e.frame_size(k)).sum();
        Ok(self.backend.size()?.saturating_sub(live))
    }
}

/// Durable storage for entities and engine metadata.
pub struct LocalStore {
    inner: Mutex<StoreInner>,
    config: StoreConfig,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LocalStore")
            .field("records", &inner.index.len())
            .field("next_seq", &inner.next_seq)
            .field("live_bytes", &inner.live_bytes)
            .finish()
    }
}

impl LocalStore {
    /// Opens a store over `backend`, replaying its log.
    pub fn open(mut backend: Box<dyn StorageBackend>, config: StoreConfig) -> CoreResult<Self> {
        let data = backend.read_all()?;
        let mut index = BTreeMap::new();
        let mut next_seq = 1;
        let mut replay_errors = Vec::new();
        let mut pos = 0usize;

        while pos < data.len() {
            match Frame::decode(&data[pos..]) {
                Ok(Some((frame, used))) => {
                    next_seq = next_seq.max(frame.seq + 1);
                    let key = (frame.keyspace, frame.key);
                    if frame.flags.is_tombstone() {
                        index.remove(&key);
                    } else {
                        index.insert(
                            key,
                            Entry {
                                value: frame.value,
                                seq: frame.seq,
                            },
                        );
                    }
                    pos += used;
                }
                Ok(None) => {
                    replay_errors.push(ReplayError {
                        offset: pos as u64,
                        discarded_bytes: (data.len() - pos) as u64,
                        message: "torn frame at end of log".into(),
                    });
                    break;
                }
                Err(e) => {
                    replay_errors.push(ReplayError {
                        offset: pos as u64,
                        discarded_bytes: (data.len() - pos) as u64,
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }

        if let Some(err) = replay_errors.first() {
            warn!(
                offset = err.offset,
                discarded = err.discarded_bytes,
                "log replay stopped early: {}",
                err.message
            );
            backend.truncate(err.offset)?;
            backend.sync()?;
        }

        let live_bytes = index.iter().map(|((_, k), e)| e.live_size(k)).sum();
        info!(records = index.len(), live_bytes, "local store opened");

        Ok(Self {
            inner: Mutex::new(StoreInner {
                backend,
                index,
                next_seq,
                live_bytes,
                replay_errors,
            }),
            config,
        })
    }

    /// An empty in-memory store with default settings.
    pub fn in_memory() -> CoreResult<Self> {
        Self::open(Box::new(InMemoryBackend::new()), StoreConfig::default())
    }

    /// Opens or creates a file-backed store.
    pub fn open_file(path: &Path, config: StoreConfig) -> CoreResult<Self> {
        Self::open(Box::new(FileBackend::open(path)?), config)
    }

    /// The store settings.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Reads a raw value.
    pub fn get(&self, keyspace: Keyspace, key: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .index
            .get(&(keyspace, key.to_string()))
            .map(|e| e.value.clone())
    }

    /// Sequence number of the last write to `key`.
    pub fn seq_of(&self, keyspace: Keyspace, key: &str) -> Option<u64> {
        self.inner
            .lock()
            .index
            .get(&(keyspace, key.to_string()))
            .map(|e| e.seq)
    }

    /// Whether `key` exists.
    pub fn contains(&self, keyspace: Keyspace, key: &str) -> bool {
        self.inner
            .lock()
            .index
            .contains_key(&(keyspace, key.to_string()))
    }

    /// Writes a raw value and returns its sequence number.
    ///
    /// # Errors
    ///
    /// [`CoreError::StorageFull`] if the live data would exceed capacity.
    pub fn put(&self, keyspace: Keyspace, key: &str, value: Vec<u8>) -> CoreResult<u64> {
        let mut inner = self.inner.lock();
        let map_key = (keyspace, key.to_string());

        let old_size = inner.index.get(&map_key).map_or(0, |e| e.live_size(key));
        let new_size = (key.len() + value.len()) as u64;
        let requested = inner.live_bytes - old_size + new_size;
        if new_size > old_size && requested > self.config.capacity_bytes {
            return Err(CoreError::StorageFull {
                requested,
                capacity: self.config.capacity_bytes,
            });
        }

        let seq = inner.next_seq;
        let frame = Frame::put(keyspace, key, value, seq);
        self.append(&mut inner, &frame)?;

        inner.next_seq += 1;
        inner.live_bytes = requested;
        inner.index.insert(
            map_key,
            Entry {
                value: frame.value,
                seq,
            },
        );
        Ok(seq)
    }

    /// Deletes `key`. Returns whether it existed.
    pub fn delete(&self, keyspace: Keyspace, key: &str) -> CoreResult<bool> {
        let mut inner = self.inner.lock();
        let map_key = (keyspace, key.to_string());
        let Some(old_size) = inner.index.get(&map_key).map(|e| e.live_size(key)) else {
            return Ok(false);
        };

        let seq = inner.next_seq;
        self.append(&mut inner, &Frame::tombstone(keyspace, key, seq))?;

        inner.next_seq += 1;
        inner.live_bytes -= old_size;
        inner.index.remove(&map_key);
        Ok(true)
    }

    fn append(&self, inner: &mut StoreInner, frame: &Frame) -> CoreResult<()> {
        let bytes = frame.encode()?;
        inner.backend.append(&bytes)?;
        if self.config.sync_on_write {
            inner.backend.sync()?;
        }
        debug!(
            keyspace = frame.keyspace.name(),
            key = %frame.key,
            seq = frame.seq,
            tombstone = frame.flags.is_tombstone(),
            "store write"
        );
        Ok(())
    }

    /// All records of a keyspace, ordered by key.
    pub fn scan(&self, keyspace: Keyspace) -> Vec<(String, Vec<u8>)> {
        self.scan_prefix(keyspace, "")
    }

    /// Records of a keyspace whose key starts with `prefix`.
    pub fn scan_prefix(&self, keyspace: Keyspace, prefix: &str) -> Vec<(String, Vec<u8>)> {
        let inner = self.inner.lock();
        inner
            .index
            .range((keyspace, prefix.to_string())..)
            .take_while(|((ks, key), _)| *ks == keyspace && key.starts_with(prefix))
            .map(|((_, key), e)| (key.clone(), e.value.clone()))
            .collect()
    }

    /// Number of records in a keyspace.
    pub fn count(&self, keyspace: Keyspace) -> usize {
        let inner = self.inner.lock();
        inner
            .index
            .range((keyspace, String::new())..)
            .take_while(|((ks, _), _)| *ks == keyspace)
            .count()
    }

    /// Records written after sequence number `seq`.
    pub fn touched_since(&self, seq: u64) -> Vec<(Keyspace, String, u64)> {
        let inner = self.inner.lock();
        let mut touched: Vec<_> = inner
            .index
            .iter()
            .filter(|(_, e)| e.seq > seq)
            .map(|((ks, key), e)| (*ks, key.clone(), e.seq))
            .collect();
        touched.sort_by_key(|(_, _, s)| *s);
        touched
    }

    /// Last assigned sequence number, 0 for an empty store.
    pub fn last_seq(&self) -> u64 {
        self.inner.lock().next_seq - 1
    }

    /// Problems met while replaying the log on open.
    pub fn replay_errors(&self) -> Vec<ReplayError> {
        self.inner.lock().replay_errors.clone()
    }

    /// Forgets replay problems once they were reported and handled.
    pub fn clear_replay_errors(&self) -> usize {
        std::mem::take(&mut self.inner.lock().replay_errors).len()
    }

    /// Size and shape of the store.
    pub fn stats(&self) -> CoreResult<StoreStats> {
        let inner = self.inner.lock();
        let mut records = BTreeMap::new();
        for (ks, _) in inner.index.keys() {
            *records.entry(ks.name()).or_insert(0) += 1;
        }
        Ok(StoreStats {
            records,
            live_bytes: inner.live_bytes,
            log_bytes: inner.backend.size()?,
            reclaimable_bytes: inner.reclaimable_bytes()?,
            last_seq: inner.next_seq - 1,
            capacity_bytes: self.config.capacity_bytes,
        })
    }

    /// Rewrites the log with live records only. Returns the bytes reclaimed.
    ///
    /// The compacted log is installed with [`StorageBackend::replace`], so an
    /// interrupted compaction leaves the previous log in place.
    pub fn compact(&self) -> CoreResult<u64> {
        let mut inner = self.inner.lock();
        let before = inner.backend.size()?;
        let last_seq = inner.next_seq - 1;

        let mut entries: Vec<_> = inner.index.iter().collect();
        entries.sort_by_key(|(_, e)| e.seq);
        let mut buf = Vec::new();
        for ((ks, key), entry) in &entries {
            buf.extend(Frame::put(*ks, key.as_str(), entry.value.clone(), entry.seq).encode()?);
        }
        if last_seq > 0 && !entries.last().is_some_and(|(_, e)| e.seq >= last_seq) {
            buf.extend(Frame::tombstone(Keyspace::Meta, SEQ_MARK_KEY, last_seq).encode()?);
        }

        inner.backend.replace(&buf)?;

        let reclaimed = before.saturating_sub(buf.len() as u64);
        info!(before, after = buf.len(), "store compacted");
        Ok(reclaimed)
    }

    /// Compacts when the log is past [`StoreConfig::compact_min_log_bytes`]
    /// and at least [`StoreConfig::compact_dead_percent`] of it is dead.
    /// Returns the bytes reclaimed, or `None` when no compaction ran.
    pub fn compact_if_needed(&self) -> CoreResult<Option<u64>> {
        let (log, dead) = {
            let inner = self.inner.lock();
            (inner.backend.size()?, inner.reclaimable_bytes()?)
        };
        if log < self.config.compact_min_log_bytes
            || dead * 100 < log * u64::from(self.config.compact_dead_percent)
        {
            return Ok(None);
        }
        debug!(log, dead, "dead frame share over threshold");
        self.compact().map(Some)
    }

    /// Reads and decodes a value.
    pub fn get_typed<T: DeserializeOwned>(&self, keyspace: Keyspace, key: &str) -> CoreResult<Option<T>> {
        self.get(keyspace, key)
            .map(|bytes| decode(&bytes).map_err(CoreError::from))
            .transpose()
    }

    /// Encodes and writes a value.
    pub fn put_typed<T: Serialize>(&self, keyspace: Keyspace, key: &str, value: &T) -> CoreResult<u64> {
        self.put(keyspace, key, encode(value)?)
    }

    /// Decodes every record of a keyspace, skipping those that do not decode.
    pub fn scan_typed<T: DeserializeOwned>(&self, keyspace: Keyspace) -> Vec<(String, T)> {
        self.scan(keyspace)
            .into_iter()
            .filter_map(|(key, bytes)| match decode(&bytes) {
                Ok(value) => Some((key, value)),
                Err(e) => {
                    warn!(keyspace = keyspace.name(), key = %key, "skipping undecodable record: {e}");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reopen(backend: &InMemoryBackend) -> LocalStore {
        LocalStore::open(Box::new(backend.clone()), StoreConfig::default()).unwrap()
    }

    #[test]
    fn put_get_delete() {
        let store = LocalStore::in_memory().unwrap();
        let s1 = store.put(Keyspace::Meta, "a", b"1".to_vec()).unwrap();
        let s2 = store.put(Keyspace::Meta, "a", b"2".to_vec()).unwrap();
        assert!(s2 > s1);
        assert_eq!(store.get(Keyspace::Meta, "a").unwrap(), b"2");
        assert_eq!(store.get(Keyspace::Queue, "a"), None);

        assert!(store.delete(Keyspace::Meta, "a").unwrap());
        assert!(!store.delete(Keyspace::Meta, "a").unwrap());
        assert_eq!(store.stats().unwrap().live_bytes, 0);
    }

    #[test]
    fn replay_restores_index_and_seq() {
        let backend = InMemoryBackend::new();
        {
            let store = reopen(&backend);
            store.put(Keyspace::Entities, "dog/1", b"rex".to_vec()).unwrap();
            store.put(Keyspace::Entities, "dog/2", b"fido".to_vec()).unwrap();
            store.delete(Keyspace::Entities, "dog/1").unwrap();
        }
        let store = reopen(&backend);
        assert_eq!(store.scan(Keyspace::Entities), vec![("dog/2".to_string(), b"fido".to_vec())]);
        assert_eq!(store.last_seq(), 3);
        assert_eq!(store.put(Keyspace::Meta, "x", vec![]).unwrap(), 4);
        assert!(store.replay_errors().is_empty());
    }

    #[test]
    fn corrupt_frame_stops_replay_and_truncates() {
        let backend = InMemoryBackend::new();
        let first_len;
        {
            let store = reopen(&backend);
            store.put(Keyspace::Queue, "q1", b"first".to_vec()).unwrap();
            first_len = backend.data().len();
            store.put(Keyspace::Queue, "q2", b"second".to_vec()).unwrap();
        }
        backend.corrupt_byte(first_len + 20);

        let store = reopen(&backend);
        assert_eq!(store.count(Keyspace::Queue), 1);
        let errors = store.replay_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].offset, first_len as u64);
        assert_eq!(backend.data().len(), first_len);

        store.put(Keyspace::Queue, "q3", b"third".to_vec()).unwrap();
        drop(store);
        let store = reopen(&backend);
        assert_eq!(store.count(Keyspace::Queue), 2);
        assert!(store.replay_errors().is_empty());
    }

    #[test]
    fn capacity_is_enforced_but_shrinking_is_allowed() {
        let store = LocalStore::open(
            Box::new(InMemoryBackend::new()),
            StoreConfig::default().capacity_bytes(16),
        )
        .unwrap();
        store.put(Keyspace::Meta, "k", vec![0; 10]).unwrap();
        assert!(matches!(
            store.put(Keyspace::Meta, "k2", vec![0; 10]),
            Err(CoreError::StorageFull { .. })
        ));
        store.put(Keyspace::Meta, "k", vec![0; 2]).unwrap();
        store.put(Keyspace::Meta, "k2", vec![0; 10]).unwrap();
    }

    #[test]
    fn prefix_scan_and_touched_since() {
        let store = LocalStore::in_memory().unwrap();
        store.put(Keyspace::Entities, "dog/1", vec![1]).unwrap();
        let mark = store.last_seq();
        store.put(Keyspace::Entities, "feeding/1", vec![2]).unwrap();
        store.put(Keyspace::Entities, "feeding/2", vec![3]).unwrap();

        assert_eq!(store.scan_prefix(Keyspace::Entities, "feeding/").len(), 2);
        let touched = store.touched_since(mark);
        assert_eq!(touched.len(), 2);
        assert_eq!(touched[0].1, "feeding/1");
    }

    #[test]
    fn compact_keeps_live_records() {
        let backend = InMemoryBackend::new();
        let store = reopen(&backend);
        for i in 0..10u8 {
            store.put(Keyspace::Meta, "counter", vec![i; 32]).unwrap();
        }
        let reclaimed = store.compact().unwrap();
        assert!(reclaimed > 0);
        drop(store);

        let store = reopen(&backend);
        assert_eq!(store.get(Keyspace::Meta, "counter").unwrap(), vec![9u8; 32]);
        assert_eq!(store.last_seq(), 10);
        assert_eq!(store.stats().unwrap().reclaimable_bytes, 0);
    }

    #[test]
    fn compaction_keeps_sequence_after_trailing_delete() {
        let backend = InMemoryBackend::new();
        let store = reopen(&backend);
        store.put(Keyspace::Entities, "dog/1", b"rex".to_vec()).unwrap();
        store.put(Keyspace::Entities, "dog/2", b"fido".to_vec()).unwrap();
        store.delete(Keyspace::Entities, "dog/2").unwrap();
        store.compact().unwrap();
        drop(store);

        let store = reopen(&backend);
        assert_eq!(store.last_seq(), 3);
        assert_eq!(store.count(Keyspace::Entities), 1);
        assert!(!store.contains(Keyspace::Meta, SEQ_MARK_KEY));
        assert_eq!(store.put(Keyspace::Meta, "x", vec![]).unwrap(), 4);
    }

    #[test]
    fn automatic_compaction_waits_for_dead_share() {
        let backend = InMemoryBackend::new();
        let store = LocalStore::open(
            Box::new(backend.clone()),
            StoreConfig::default().compaction(256, 50),
        )
        .unwrap();
        store.put(Keyspace::Queue, "q1", vec![1; 64]).unwrap();
        store.put(Keyspace::Queue, "q2", vec![2; 64]).unwrap();
        store.put(Keyspace::Queue, "q3", vec![3; 64]).unwrap();
        assert_eq!(store.compact_if_needed().unwrap(), None);

        for round in 0..4u8 {
            store.put(Keyspace::Queue, "q1", vec![round; 64]).unwrap();
        }
        let stats = store.stats().unwrap();
        assert!(stats.reclaimable_bytes * 2 >= stats.log_bytes);

        let reclaimed = store.compact_if_needed().unwrap().unwrap();
        assert_eq!(reclaimed, stats.reclaimable_bytes);
        drop(store);

        let store = reopen(&backend);
        assert_eq!(store.count(Keyspace::Queue), 3);
        assert_eq!(store.get(Keyspace::Queue, "q1").unwrap(), vec![3u8; 64]);
        assert_eq!(store.last_seq(), 7);
    }
}
