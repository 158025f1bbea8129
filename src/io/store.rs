//! Durable event store
//!
//! Layout under `store.dir`:
//! - `pending/<event-id>.json`      records awaiting delivery
//! - `dead_letter/<event-id>.json`  records past the attempt ceiling
//! - `images/<event-id>.jpg`         frames saved for events, removed on delivery
//!
//! Each record is its own file, written to `<name>.tmp` and renamed into
//! place, so a crash mid-write leaves either the old record or the new one.
//! When the medium refuses a write the event is parked in a bounded
//! in-memory overflow queue and retried by `flush_overflow`.

use crate::domain::event::{EventStatus, PotholeEvent};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const PENDING_DIR: &str = "pending";
const DEAD_LETTER_DIR: &str = "dead_letter";
const IMAGES_DIR: &str = "images";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store record encoding error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no such record: {0}")]
    UnknownRecord(Uuid),
}

/// One queued event plus its delivery bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub event: PotholeEvent,
    /// Enqueue order, preserved across restarts
    pub seq: u64,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Metadata already accepted; only the image remains
    #[serde(default)]
    pub metadata_delivered: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl StoredRecord {
    #[inline]
    pub fn id(&self) -> Uuid {
        self.event.id
    }
}

/// Result of recording a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Still pending with this many attempts used
    Retry { attempt_count: u32 },
    DeadLettered,
}

struct StoreInner {
    pending: FxHashMap<Uuid, StoredRecord>,
    dead_letter: FxHashMap<Uuid, StoredRecord>,
    /// Ids of pending records that are not on disk yet, oldest first
    overflow: VecDeque<Uuid>,
    next_seq: u64,
}

/// Store-and-forward queue shared by the fusion lane (enqueue) and the
/// delivery lane (claim, mark, flush)
pub struct EventStore {
    pending_dir: PathBuf,
    dead_letter_dir: PathBuf,
    images_dir: PathBuf,
    overflow_capacity: usize,
    max_attempts: u32,
    inner: Mutex<StoreInner>,
    enqueued: Notify,
    metrics: Arc<Metrics>,
}

impl EventStore {
    /// Open (or create) the store and load every record left on disk
    pub fn open(config: &Config, metrics: Arc<Metrics>) -> Result<Self, StoreError> {
        let root = PathBuf::from(config.store_dir());
        let pending_dir = root.join(PENDING_DIR);
        let dead_letter_dir = root.join(DEAD_LETTER_DIR);
        let images_dir = root.join(IMAGES_DIR);
        fs::create_dir_all(&pending_dir)?;
        fs::create_dir_all(&dead_letter_dir)?;
        fs::create_dir_all(&images_dir)?;

        let dead_letter = load_dir(&dead_letter_dir)?;
        let mut pending = load_dir(&pending_dir)?;

        // A crash between writing the dead-letter copy and removing the
        // pending file leaves both; the dead-letter copy wins.
        pending.retain(|id, _| {
            if dead_letter.contains_key(id) {
                let _ = fs::remove_file(record_path(&pending_dir, *id));
                false
            } else {
                true
            }
        });

        for record in pending.values_mut() {
            record.event.status = EventStatus::Pending;
        }

        let next_seq = pending
            .values()
            .chain(dead_letter.values())
            .map(|r| r.seq + 1)
            .max()
            .unwrap_or(0);

        info!(
            dir = %root.display(),
            pending = %pending.len(),
            dead_letter = %dead_letter.len(),
            "event_store_opened"
        );

        let store = Self {
            pending_dir,
            dead_letter_dir,
            images_dir,
            overflow_capacity: config.overflow_capacity(),
            max_attempts: config.max_attempts(),
            inner: Mutex::new(StoreInner { pending, dead_letter, overflow: VecDeque::new(), next_seq }),
            enqueued: Notify::new(),
            metrics,
        };
        store.update_depths(&store.inner.lock());
        Ok(store)
    }

    /// Accept a confirmed event; never fails and never touches the network
    ///
    /// If the record cannot be written it is kept in memory; when the
    /// overflow queue is full the oldest unwritten event is evicted.
    pub fn enqueue(&self, event: PotholeEvent) -> Uuid {
        let id = event.id;
        {
            let mut inner = self.inner.lock();
            let record = StoredRecord {
                event,
                seq: inner.next_seq,
                attempt_count: 0,
                last_attempt_at: None,
                metadata_delivered: false,
                last_error: None,
            };
            inner.next_seq += 1;

            match write_record(&self.pending_dir, &record) {
                Ok(()) => {
                    debug!(event_id = %id, seq = %record.seq, "event_persisted");
                }
                Err(e) => {
                    self.metrics.record_store_write_failure();
                    log_store_write_failed(id, &e);
                    if inner.overflow.len() >= self.overflow_capacity {
                        if let Some(evicted) = inner.overflow.pop_front() {
                            inner.pending.remove(&evicted);
                            self.metrics.record_overflow_eviction();
                            log_overflow_eviction(evicted, self.overflow_capacity);
                        }
                    }
                    if self.overflow_capacity > 0 {
                        inner.overflow.push_back(id);
                    } else {
                        self.metrics.record_overflow_eviction();
                        log_overflow_eviction(id, 0);
                        self.update_depths(&inner);
                        return id;
                    }
                }
            }

            inner.pending.insert(id, record);
            self.metrics.record_event_enqueued();
            self.update_depths(&inner);
        }
        self.enqueued.notify_one();
        id
    }

    /// Save the confirming frame under `images/` and enqueue the event
    /// pointing at it; if the frame cannot be written the event goes
    /// without an image
    pub fn enqueue_with_frame(&self, mut event: PotholeEvent, frame: Option<Bytes>) -> Uuid {
        if let Some(data) = frame {
            let path = image_path(&self.images_dir, event.id);
            match write_atomic(&path, &data) {
                Ok(()) => {
                    debug!(event_id = %event.id, bytes = %data.len(), "event_frame_saved");
                    event.image_ref = Some(path);
                }
                Err(e) => warn!(event_id = %event.id, error = %e, "event_frame_save_failed"),
            }
        }
        self.enqueue(event)
    }

    /// Wait until something is enqueued (a stored permit returns immediately)
    pub async fn wait_for_enqueue(&self) {
        self.enqueued.notified().await;
    }

    /// Pending records in delivery priority: never attempted first (in
    /// enqueue order), then least recently attempted
    pub fn list_pending(&self) -> Vec<StoredRecord> {
        let inner = self.inner.lock();
        let mut records: Vec<StoredRecord> = inner.pending.values().cloned().collect();
        records.sort_by(|a, b| {
            a.last_attempt_at
                .is_some()
                .cmp(&b.last_attempt_at.is_some())
                .then_with(|| a.last_attempt_at.cmp(&b.last_attempt_at))
                .then_with(|| a.seq.cmp(&b.seq))
        });
        records
    }

    /// Take a pending record for upload; the delivery lane is its only writer
    /// until it is marked delivered, failed or released
    pub fn claim(&self, id: Uuid) -> Option<StoredRecord> {
        let mut inner = self.inner.lock();
        let record = inner.pending.get_mut(&id)?;
        if record.event.status == EventStatus::Uploading {
            return None;
        }
        record.event.status = EventStatus::Uploading;
        Some(record.clone())
    }

    /// Return every claimed record to Pending (worker restart or aborted upload)
    pub fn release_claims(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut released = 0;
        for record in inner.pending.values_mut() {
            if record.event.status == EventStatus::Uploading {
                record.event.status = EventStatus::Pending;
                released += 1;
            }
        }
        released
    }

    /// Record that the metadata upload succeeded so a retry only sends the image
    pub fn mark_metadata_delivered(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let durable = !inner.overflow.contains(&id);
        let record = inner.pending.get_mut(&id).ok_or(StoreError::UnknownRecord(id))?;
        record.metadata_delivered = true;
        if durable {
            write_record(&self.pending_dir, record)?;
        }
        Ok(())
    }

    /// Remove a delivered record; delivering an unknown id is a no-op
    pub fn mark_delivered(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let Some(mut record) = inner.pending.remove(&id) else {
            return Ok(false);
        };
        record.event.status = EventStatus::Delivered;
        let durable = !inner.overflow.contains(&id);
        inner.overflow.retain(|o| *o != id);
        self.update_depths(&inner);
        self.remove_saved_image(&record);

        if !durable {
            info!(event_id = %id, attempts = %record.attempt_count, "event_delivered");
            return Ok(true);
        }
        if let Err(e) = remove_if_exists(&record_path(&self.pending_dir, id)) {
            // Still on disk: it will be uploaded again after a restart and
            // the backend deduplicates by id.
            warn!(event_id = %id, error = %e, "delivered_record_remove_failed");
            return Err(e.into());
        }
        info!(
            event_id = %id,
            attempts = %record.attempt_count,
            "event_delivered"
        );
        Ok(true)
    }

    /// Count a failed attempt; past the ceiling the record is dead-lettered
    pub fn mark_failed(&self, id: Uuid, reason: &str) -> Result<FailOutcome, StoreError> {
        let mut inner = self.inner.lock();
        let durable = !inner.overflow.contains(&id);
        let record = inner.pending.get_mut(&id).ok_or(StoreError::UnknownRecord(id))?;
        record.attempt_count = record.attempt_count.saturating_add(1);
        record.last_attempt_at = Some(Utc::now());
        record.last_error = Some(reason.to_string());
        record.event.status = EventStatus::Pending;

        if record.attempt_count < self.max_attempts {
            let attempt_count = record.attempt_count;
            match write_record(&self.pending_dir, record) {
                Ok(()) if !durable => inner.overflow.retain(|o| *o != id),
                Ok(()) => {}
                Err(e) => warn!(event_id = %id, error = %e, "attempt_count_persist_failed"),
            }
            return Ok(FailOutcome::Retry { attempt_count });
        }

        let mut record = record.clone();
        record.event.status = EventStatus::Failed;
        write_record(&self.dead_letter_dir, &record)?;
        remove_if_exists(&record_path(&self.pending_dir, id))?;

        inner.pending.remove(&id);
        inner.overflow.retain(|o| *o != id);
        let attempts = record.attempt_count;
        inner.dead_letter.insert(id, record);
        self.metrics.record_dead_lettered();
        self.update_depths(&inner);

        warn!(
            event_id = %id,
            attempts = %attempts,
            reason = %reason,
            "event_dead_lettered"
        );
        Ok(FailOutcome::DeadLettered)
    }

    /// Dead-lettered records in enqueue order
    pub fn list_dead_letter(&self) -> Vec<StoredRecord> {
        let inner = self.inner.lock();
        let mut records: Vec<StoredRecord> = inner.dead_letter.values().cloned().collect();
        records.sort_by_key(|r| r.seq);
        records
    }

    /// Operator purge of a dead-lettered record
    pub fn purge_dead_letter(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if !inner.dead_letter.contains_key(&id) {
            return Ok(false);
        }
        remove_if_exists(&record_path(&self.dead_letter_dir, id))?;
        if let Some(record) = inner.dead_letter.remove(&id) {
            self.remove_saved_image(&record);
        }
        self.update_depths(&inner);
        info!(event_id = %id, "dead_letter_purged");
        Ok(true)
    }

    /// Operator requeue: back to pending with a fresh attempt budget
    pub fn requeue_dead_letter(&self, id: Uuid) -> Result<bool, StoreError> {
        {
            let mut inner = self.inner.lock();
            let Some(record) = inner.dead_letter.get(&id) else {
                return Ok(false);
            };
            let mut record = record.clone();
            record.attempt_count = 0;
            record.last_attempt_at = None;
            record.last_error = None;
            record.event.status = EventStatus::Pending;

            write_record(&self.pending_dir, &record)?;
            remove_if_exists(&record_path(&self.dead_letter_dir, id))?;
            inner.dead_letter.remove(&id);
            inner.pending.insert(id, record);
            self.update_depths(&inner);
            info!(event_id = %id, "dead_letter_requeued");
        }
        self.enqueued.notify_one();
        Ok(true)
    }

    /// Retry writing overflow records to disk; returns how many are still in memory
    pub fn flush_overflow(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut flushed = 0;
        while let Some(id) = inner.overflow.front().copied() {
            let Some(record) = inner.pending.get(&id) else {
                inner.overflow.pop_front();
                continue;
            };
            if let Err(e) = write_record(&self.pending_dir, record) {
                debug!(event_id = %id, error = %e, "overflow_flush_blocked");
                break;
            }
            inner.overflow.pop_front();
            flushed += 1;
        }
        if flushed > 0 {
            info!(flushed = %flushed, remaining = %inner.overflow.len(), "overflow_flushed");
        }
        inner.overflow.len()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn dead_letter_len(&self) -> usize {
        self.inner.lock().dead_letter.len()
    }

    pub fn overflow_len(&self) -> usize {
        self.inner.lock().overflow.len()
    }

    /// Delete the frame this store saved for a record; files written by a
    /// camera driver elsewhere are left alone
    fn remove_saved_image(&self, record: &StoredRecord) {
        let Some(path) = record.event.image_ref.as_deref() else {
            return;
        };
        if !path.starts_with(&self.images_dir) {
            return;
        }
        if let Err(e) = remove_if_exists(path) {
            warn!(event_id = %record.id(), path = %path.display(), error = %e, "event_frame_remove_failed");
        }
    }

    fn update_depths(&self, inner: &StoreInner) {
        self.metrics.set_store_depths(inner.pending.len(), inner.dead_letter.len());
    }
}

fn record_path(dir: &Path, id: Uuid) -> PathBuf {
    dir.join(format!("{}.json", id))
}

fn image_path(dir: &Path, id: Uuid) -> PathBuf {
    dir.join(format!("{}.jpg", id))
}

fn write_record(dir: &Path, record: &StoredRecord) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(record)?;
    write_atomic(&record_path(dir, record.id()), &bytes)
}

/// Write to `<path>.tmp`, sync, then rename over `path`
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Load every `*.json` record in a directory; unreadable files are logged and left in place
fn load_dir(dir: &Path) -> Result<FxHashMap<Uuid, StoredRecord>, StoreError> {
    let mut records = FxHashMap::default();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {}
            Some("tmp") => {
                // Interrupted write; the previous version (if any) is intact
                let _ = fs::remove_file(&path);
                continue;
            }
            _ => continue,
        }

        let parsed = fs::read(&path)
            .map_err(StoreError::from)
            .and_then(|bytes| serde_json::from_slice::<StoredRecord>(&bytes).map_err(StoreError::from));
        match parsed {
            Ok(record) => {
                records.insert(record.id(), record);
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "store_record_unreadable");
            }
        }
    }
    Ok(records)
}

/// Storage failure on the enqueue path (cold path)
#[cold]
fn log_store_write_failed(id: Uuid, e: &StoreError) {
    error!(
        event_id = %id,
        error = %e,
        "event_store_write_failed: holding event in memory, not yet durable"
    );
}

/// Last-resort eviction: an event is lost (cold path)
#[cold]
fn log_overflow_eviction(id: Uuid, capacity: usize) {
    error!(
        event_id = %id,
        overflow_capacity = %capacity,
        "event_lost: overflow buffer full, evicted oldest unwritten event"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::Corroboration;
    use crate::domain::types::SensorKind;
    use tempfile::tempdir;

    fn event() -> PotholeEvent {
        let corroboration: Corroboration =
            [SensorKind::Vibration, SensorKind::Vision].into_iter().collect();
        PotholeEvent::confirm(corroboration, 0.4, 0.9, None, None).unwrap()
    }

    fn config(dir: &Path) -> Config {
        Config::default().with_store_dir(dir.to_str().unwrap()).with_max_attempts(3)
    }

    fn open(dir: &Path) -> EventStore {
        EventStore::open(&config(dir), Arc::new(Metrics::new())).unwrap()
    }

    /// Replace the pending directory with a plain file so writes fail
    fn break_pending_dir(dir: &Path) {
        let pending = dir.join(PENDING_DIR);
        fs::remove_dir_all(&pending).unwrap();
        fs::write(&pending, b"not a directory").unwrap();
    }

    fn restore_pending_dir(dir: &Path) {
        let pending = dir.join(PENDING_DIR);
        fs::remove_file(&pending).unwrap();
        fs::create_dir_all(&pending).unwrap();
    }

    #[test]
    fn test_enqueue_persists_record_file() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let id = store.enqueue(event());

        let path = dir.path().join(PENDING_DIR).join(format!("{}.json", id));
        assert!(path.exists());
        let record: StoredRecord = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(record.id(), id);
        assert_eq!(record.attempt_count, 0);
        assert_eq!(record.event.status, EventStatus::Pending);
    }

    #[test]
    fn test_records_survive_restart() {
        let dir = tempdir().unwrap();
        let ids: Vec<Uuid> = {
            let store = open(dir.path());
            let ids = (0..3).map(|_| store.enqueue(event())).collect::<Vec<_>>();
            store.mark_delivered(ids[1]).unwrap();
            store.mark_failed(ids[2], "timeout").unwrap();
            ids
            // dropped without any shutdown hook, like a crash
        };

        let store = open(dir.path());
        let pending = store.list_pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id(), ids[0]);
        assert_eq!(pending[1].id(), ids[2]);
        assert_eq!(pending[1].attempt_count, 1);
        assert_eq!(pending[1].last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_sequence_continues_after_restart() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path());
            store.enqueue(event());
            store.enqueue(event());
        }
        let store = open(dir.path());
        let id = store.enqueue(event());
        let last = store.list_pending().into_iter().find(|r| r.id() == id).unwrap();
        assert_eq!(last.seq, 2);
    }

    #[test]
    fn test_list_pending_priority_order() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let a = store.enqueue(event());
        let b = store.enqueue(event());
        let c = store.enqueue(event());
        let d = store.enqueue(event());

        store.mark_failed(b, "first").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.mark_failed(a, "second").unwrap();

        let order: Vec<Uuid> = store.list_pending().iter().map(|r| r.id()).collect();
        assert_eq!(order, vec![c, d, b, a]);
    }

    #[test]
    fn test_mark_delivered_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let id = store.enqueue(event());

        assert!(store.mark_delivered(id).unwrap());
        assert!(!store.mark_delivered(id).unwrap());
        assert!(store.list_pending().is_empty());
        assert!(!dir.path().join(PENDING_DIR).join(format!("{}.json", id)).exists());
    }

    #[test]
    fn test_attempt_ceiling_moves_to_dead_letter() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let id = store.enqueue(event());

        assert_eq!(store.mark_failed(id, "e1").unwrap(), FailOutcome::Retry { attempt_count: 1 });
        assert_eq!(store.mark_failed(id, "e2").unwrap(), FailOutcome::Retry { attempt_count: 2 });
        assert_eq!(store.mark_failed(id, "e3").unwrap(), FailOutcome::DeadLettered);

        assert!(store.list_pending().is_empty());
        let dead = store.list_dead_letter();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id(), id);
        assert_eq!(dead[0].event.status, EventStatus::Failed);
        assert_eq!(dead[0].attempt_count, 3);
        assert!(dir.path().join(DEAD_LETTER_DIR).join(format!("{}.json", id)).exists());

        // Dead letter survives restart too
        drop(store);
        let store = open(dir.path());
        assert_eq!(store.dead_letter_len(), 1);
        assert_eq!(store.pending_len(), 0);
    }

    #[test]
    fn test_requeue_and_purge_dead_letter() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let a = store.enqueue(event());
        let b = store.enqueue(event());
        for _ in 0..3 {
            store.mark_failed(a, "down").unwrap();
            store.mark_failed(b, "down").unwrap();
        }
        assert_eq!(store.dead_letter_len(), 2);

        assert!(store.requeue_dead_letter(a).unwrap());
        let pending = store.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempt_count, 0);
        assert_eq!(pending[0].last_attempt_at, None);

        assert!(store.purge_dead_letter(b).unwrap());
        assert!(!store.purge_dead_letter(b).unwrap());
        assert_eq!(store.dead_letter_len(), 0);
    }

    #[test]
    fn test_duplicate_after_dead_letter_crash_resolves_to_dead_letter() {
        let dir = tempdir().unwrap();
        let id = {
            let store = open(dir.path());
            let id = store.enqueue(event());
            for _ in 0..3 {
                store.mark_failed(id, "down").unwrap();
            }
            id
        };
        // Simulate a crash after the dead-letter write but before the pending remove
        let dead = fs::read(dir.path().join(DEAD_LETTER_DIR).join(format!("{}.json", id))).unwrap();
        fs::write(dir.path().join(PENDING_DIR).join(format!("{}.json", id)), dead).unwrap();

        let store = open(dir.path());
        assert_eq!(store.pending_len(), 0);
        assert_eq!(store.dead_letter_len(), 1);
        assert!(!dir.path().join(PENDING_DIR).join(format!("{}.json", id)).exists());
    }

    #[test]
    fn test_claimed_records_reload_as_pending() {
        let dir = tempdir().unwrap();
        let id = {
            let store = open(dir.path());
            let id = store.enqueue(event());
            assert!(store.claim(id).is_some());
            assert!(store.claim(id).is_none());
            store.mark_metadata_delivered(id).unwrap();
            id
        };
        let store = open(dir.path());
        let record = store.claim(id).unwrap();
        assert!(record.metadata_delivered);
        assert_eq!(store.release_claims(), 1);
    }

    #[test]
    fn test_write_failure_uses_overflow_then_flushes() {
        let dir = tempdir().unwrap();
        let metrics = Arc::new(Metrics::new());
        let store = EventStore::open(&config(dir.path()), metrics.clone()).unwrap();

        break_pending_dir(dir.path());
        let id = store.enqueue(event());
        assert_eq!(store.overflow_len(), 1);
        // Still deliverable from memory
        assert_eq!(store.list_pending()[0].id(), id);

        // Medium still broken: nothing flushed
        assert_eq!(store.flush_overflow(), 1);

        restore_pending_dir(dir.path());
        assert_eq!(store.flush_overflow(), 0);
        assert!(dir.path().join(PENDING_DIR).join(format!("{}.json", id)).exists());
        assert_eq!(metrics.overflow_evictions(), 0);
    }

    #[test]
    fn test_overflow_full_evicts_oldest() {
        let dir = tempdir().unwrap();
        let metrics = Arc::new(Metrics::new());
        let config = config(dir.path()).with_overflow_capacity(2);
        let store = EventStore::open(&config, metrics.clone()).unwrap();

        break_pending_dir(dir.path());
        let first = store.enqueue(event());
        let second = store.enqueue(event());
        let third = store.enqueue(event());

        let ids: Vec<Uuid> = store.list_pending().iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![second, third]);
        assert!(!ids.contains(&first));
        assert_eq!(metrics.overflow_evictions(), 1);
    }

    #[test]
    fn test_delivering_overflow_record_clears_it() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        break_pending_dir(dir.path());
        let id = store.enqueue(event());

        assert!(store.mark_delivered(id).unwrap());
        assert_eq!(store.overflow_len(), 0);
        assert_eq!(store.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiter() {
        let dir = tempdir().unwrap();
        let store = Arc::new(open(dir.path()));

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_for_enqueue().await })
        };
        tokio::task::yield_now().await;
        store.enqueue(event());

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[test]
    fn test_frame_saved_with_event_and_removed_on_delivery() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let id = store.enqueue_with_frame(event(), Some(Bytes::from_static(b"\xff\xd8frame")));
        let expected = dir.path().join(IMAGES_DIR).join(format!("{}.jpg", id));

        let record = &store.list_pending()[0];
        assert_eq!(record.event.image_ref.as_deref(), Some(expected.as_path()));
        assert_eq!(fs::read(&expected).unwrap(), b"\xff\xd8frame");

        // The path survives a restart with the record
        drop(store);
        let store = open(dir.path());
        assert_eq!(store.list_pending()[0].event.image_ref.as_deref(), Some(expected.as_path()));

        assert!(store.mark_delivered(id).unwrap());
        assert!(!expected.exists());
    }

    #[test]
    fn test_purge_removes_saved_frame() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let id = store.enqueue_with_frame(event(), Some(Bytes::from_static(b"jpeg")));
        let image = store.list_pending()[0].event.image_ref.clone().unwrap();

        for _ in 0..3 {
            store.mark_failed(id, "timeout").unwrap();
        }
        // Kept while dead-lettered so a requeue can still upload it
        assert!(image.exists());

        assert!(store.purge_dead_letter(id).unwrap());
        assert!(!image.exists());
    }

    #[test]
    fn test_delivery_leaves_driver_frames_alone() {
        let dir = tempdir().unwrap();
        let camera_dir = tempdir().unwrap();
        let frame = camera_dir.path().join("0001.jpg");
        fs::write(&frame, b"jpeg").unwrap();

        let store = open(dir.path());
        let corroboration: Corroboration =
            [SensorKind::Vibration, SensorKind::Vision].into_iter().collect();
        let event = PotholeEvent::confirm(corroboration, 0.4, 0.9, None, Some(frame.clone())).unwrap();
        let id = store.enqueue(event);

        assert!(store.mark_delivered(id).unwrap());
        assert!(frame.exists());
    }
}
