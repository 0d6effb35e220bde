//! Durable filesystem work queue for the Estafette agent.
//!
//! One queued item is three co-located files in the queue root, sharing a
//! ULID base name:
//!
//! ```text
//! <id>.payload   the packaged blob, present while the item is outstanding
//! <id>.meta      flat string map (JSON), written right after the payload
//! <id>.claim     present only while a delivery attempt is underway
//! ```
//!
//! The filesystem is the whole persistence layer. Recovery after a crash is
//! a directory scan: every payload still on disk is still outstanding, and
//! a stale claim marker left by an interrupted delivery is cleared by the
//! next `abandon` or `complete`. ULIDs sort lexicographically in enqueue
//! order, so FIFO survives restarts without an index.
//!
//! Two queue handles in one process may share a root; two *processes* must
//! not point at the same root concurrently.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};
use ulid::Ulid;

const PAYLOAD_EXT: &str = "payload";
const META_EXT: &str = "meta";
const CLAIM_EXT: &str = "claim";

/// Metadata key recorded automatically at enqueue time (ISO-8601 UTC).
pub const CREATED_KEY: &str = "created_utc";

/// Flat string-to-string metadata attached to an item. A `BTreeMap` keeps
/// key order stable across serialization.
pub type ItemMeta = BTreeMap<String, String>;

/// Opaque identifier of a queued item, stable for the item's lifetime.
///
/// Backed by a ULID rendered in Crockford base32, so the derived `Ord`
/// orders ids by enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemId(String);

impl ItemId {
    fn generate(ids: &mut ulid::Generator) -> Self {
        // Generator output is monotonic within a millisecond; on the
        // (astronomically unlikely) random-part overflow, fall back to a
        // fresh ULID.
        let ulid = ids.generate().unwrap_or_else(|_| Ulid::new());
        Self(ulid.to_string())
    }

    fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok()?;
        Some(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an item, derived from which files exist on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Payload present, no claim marker: awaiting delivery.
    Pending,
    /// Payload and claim marker present: a delivery attempt is underway.
    InProgress,
    /// Nothing on disk: delivered and cleaned up (or never enqueued).
    Completed,
}

/// Errors returned by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The payload could not be stored durably. Fatal to the enqueue: the
    /// caller must not discard its source artifact.
    #[error("failed to store queue item at {path}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A housekeeping write or delete failed. Queue correctness is not
    /// affected (the item stays outstanding, or cleanup is retried on the
    /// next terminal call); callers log these and move on.
    #[error("queue housekeeping failed at {path}: {source}")]
    Ignorable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl QueueError {
    /// Whether the caller may log this error and continue.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, QueueError::Ignorable { .. })
    }
}

/// Filesystem-backed durable queue.
///
/// Mutations serialize on one internal lock; `peek` and `count_pending`
/// are plain directory scans and may race a mutation by at most one item,
/// which the metrics reader tolerates.
pub struct FileQueue {
    root: PathBuf,
    // Single mutation lock for the store; doubles as the id generator so
    // ids stay monotonic under the same exclusion.
    write_gate: Mutex<ulid::Generator>,
}

impl FileQueue {
    /// Open (creating if needed) a queue rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| QueueError::Store {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            root,
            write_gate: Mutex::new(ulid::Generator::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `payload` durably and record `tags` merged with a
    /// `created_utc` timestamp. The payload file is moved (not copied) into
    /// the queue; on any error it is left where it was.
    pub fn enqueue(&self, payload: &Path, tags: ItemMeta) -> Result<ItemId, QueueError> {
        let mut gate = self.write_gate.lock().unwrap_or_else(|e| e.into_inner());
        let id = ItemId::generate(&mut gate);

        let dest = self.slot(&id, PAYLOAD_EXT);
        move_into_place(payload, &dest)?;

        // Payload first, metadata second: a crash between the two leaves a
        // deliverable item that reads back as "no tags".
        let mut meta = tags;
        meta.insert(CREATED_KEY.to_string(), Utc::now().to_rfc3339());
        let meta_path = self.slot(&id, META_EXT);
        let body = serde_json::to_vec(&meta).map_err(|e| QueueError::Store {
            path: meta_path.clone(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;
        fs::write(&meta_path, body).map_err(|source| QueueError::Store {
            path: meta_path.clone(),
            source,
        })?;

        debug!(id = %id, payload = %dest.display(), "item enqueued");
        Ok(id)
    }

    /// Id of the earliest-enqueued outstanding item, claimed or not.
    /// `None` when the queue is empty. No side effects.
    pub fn peek(&self) -> Option<ItemId> {
        self.scan_payload_ids().into_iter().min()
    }

    /// Idempotently record that delivery of `id` is underway. Does not
    /// affect `peek` ordering.
    pub fn mark_in_progress(&self, id: &ItemId) -> Result<(), QueueError> {
        let _gate = self.write_gate.lock().unwrap_or_else(|e| e.into_inner());
        let claim = self.slot(id, CLAIM_EXT);
        fs::write(&claim, Utc::now().to_rfc3339()).map_err(|source| QueueError::Ignorable {
            path: claim.clone(),
            source,
        })
    }

    /// Idempotently and durably remove the item and all its artifacts.
    /// Files already gone count as done.
    pub fn complete(&self, id: &ItemId) -> Result<(), QueueError> {
        let _gate = self.write_gate.lock().unwrap_or_else(|e| e.into_inner());
        remove_if_present(&self.slot(id, PAYLOAD_EXT))?;
        remove_if_present(&self.slot(id, META_EXT))?;
        remove_if_present(&self.slot(id, CLAIM_EXT))?;
        debug!(id = %id, "item completed");
        Ok(())
    }

    /// Idempotently clear the claim marker, returning the item to
    /// `Pending` for a later retry. Payload and metadata are retained.
    pub fn abandon(&self, id: &ItemId) -> Result<(), QueueError> {
        let _gate = self.write_gate.lock().unwrap_or_else(|e| e.into_inner());
        remove_if_present(&self.slot(id, CLAIM_EXT))?;
        debug!(id = %id, "item abandoned for retry");
        Ok(())
    }

    /// Number of outstanding items (in-progress included).
    pub fn count_pending(&self) -> usize {
        self.scan_payload_ids().len()
    }

    /// Recorded metadata for `id`. A missing or malformed record reads as
    /// "no tags", never as an error.
    pub fn meta(&self, id: &ItemId) -> ItemMeta {
        let path = self.slot(id, META_EXT);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return ItemMeta::new(),
            Err(err) => {
                warn!(id = %id, error = %err, "metadata unreadable, treating as empty");
                return ItemMeta::new();
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(id = %id, error = %err, "metadata malformed, treating as empty");
                ItemMeta::new()
            }
        }
    }

    /// Where the payload blob for `id` lives.
    pub fn payload_path(&self, id: &ItemId) -> PathBuf {
        self.slot(id, PAYLOAD_EXT)
    }

    /// Lifecycle state of `id`, derived from the files present on disk.
    pub fn state(&self, id: &ItemId) -> ItemState {
        if !self.slot(id, PAYLOAD_EXT).exists() {
            ItemState::Completed
        } else if self.slot(id, CLAIM_EXT).exists() {
            ItemState::InProgress
        } else {
            ItemState::Pending
        }
    }

    fn slot(&self, id: &ItemId, ext: &str) -> PathBuf {
        self.root.join(format!("{}.{ext}", id.as_str()))
    }

    fn scan_payload_ids(&self) -> Vec<ItemId> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(root = %self.root.display(), error = %err, "queue root unreadable");
                return Vec::new();
            }
        };
        entries
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                if path.extension()?.to_str()? != PAYLOAD_EXT {
                    return None;
                }
                ItemId::parse(path.file_stem()?.to_str()?)
            })
            .collect()
    }
}

/// Move `src` to `dest`, falling back to copy + fsync + remove when a plain
/// rename is not possible (e.g. across filesystems).
fn move_into_place(src: &Path, dest: &Path) -> Result<(), QueueError> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }

    let store_err = |source: io::Error| QueueError::Store {
        path: dest.to_path_buf(),
        source,
    };
    let mut reader = fs::File::open(src).map_err(store_err)?;
    let mut writer = fs::File::create(dest).map_err(|source| QueueError::Store {
        path: dest.to_path_buf(),
        source,
    })?;
    io::copy(&mut reader, &mut writer).map_err(|source| QueueError::Store {
        path: dest.to_path_buf(),
        source,
    })?;
    writer.flush().and_then(|_| writer.sync_all()).map_err(|source| QueueError::Store {
        path: dest.to_path_buf(),
        source,
    })?;
    // The copy is durable; a leftover source only means a duplicate
    // enqueue later, which the at-least-once contract absorbs.
    if let Err(err) = fs::remove_file(src) {
        warn!(src = %src.display(), error = %err, "could not remove source after copy");
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<(), QueueError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(QueueError::Ignorable {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_blob(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"journal bytes").unwrap();
        path
    }

    #[test]
    fn enqueue_persists_payload_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path().join("queue")).unwrap();
        let blob = write_blob(dir.path(), "a.zip");

        let mut tags = ItemMeta::new();
        tags.insert("bank".into(), "BGFI".into());
        tags.insert("gab".into(), "ATM-001".into());
        let id = queue.enqueue(&blob, tags).unwrap();

        assert!(queue.payload_path(&id).exists());
        assert!(!blob.exists(), "payload must be moved, not copied");
        let meta = queue.meta(&id);
        assert_eq!(meta.get("bank").map(String::as_str), Some("BGFI"));
        assert_eq!(meta.get("gab").map(String::as_str), Some("ATM-001"));
        assert!(meta.contains_key(CREATED_KEY));
        assert_eq!(queue.state(&id), ItemState::Pending);
    }

    #[test]
    fn enqueue_of_missing_payload_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path().join("queue")).unwrap();

        let err = queue
            .enqueue(&dir.path().join("nope.zip"), ItemMeta::new())
            .unwrap_err();
        assert!(!err.is_ignorable());
        assert_eq!(queue.count_pending(), 0);
    }

    #[test]
    fn same_millisecond_enqueues_keep_call_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path().join("queue")).unwrap();

        let ids: Vec<ItemId> = (0..20)
            .map(|i| {
                let blob = write_blob(dir.path(), &format!("{i}.zip"));
                queue.enqueue(&blob, ItemMeta::new()).unwrap()
            })
            .collect();

        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted, "ids must be monotonic even within one ms");
        assert_eq!(queue.peek(), Some(ids[0].clone()));
    }

    #[test]
    fn stray_files_in_queue_root_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path().join("queue")).unwrap();
        fs::write(queue.root().join("20240101.jrn.zip"), b"staged").unwrap();
        fs::write(queue.root().join("notes.txt"), b"hello").unwrap();

        assert_eq!(queue.peek(), None);
        assert_eq!(queue.count_pending(), 0);
    }

    #[test]
    fn malformed_metadata_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path().join("queue")).unwrap();
        let blob = write_blob(dir.path(), "a.zip");
        let id = queue.enqueue(&blob, ItemMeta::new()).unwrap();

        fs::write(queue.root().join(format!("{id}.meta")), b"{not json").unwrap();
        assert!(queue.meta(&id).is_empty());
        // The item itself is still deliverable.
        assert_eq!(queue.peek(), Some(id));
    }

    #[test]
    fn missing_metadata_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path().join("queue")).unwrap();
        let blob = write_blob(dir.path(), "a.zip");
        let id = queue.enqueue(&blob, ItemMeta::new()).unwrap();

        fs::remove_file(queue.root().join(format!("{id}.meta"))).unwrap();
        assert!(queue.meta(&id).is_empty());
    }
}
