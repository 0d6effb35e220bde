//! Agent metrics.
//!
//! Plain atomic counters with a snapshot view and a Prometheus exposition
//! renderer. The pending-queue gauge is not stored here: callers pull it
//! live from the queue and pass it in, so the metrics module never holds a
//! stale copy or a callback into the store.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Global metrics instance.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    /// Journals discovered and packaged into the queue.
    collected: AtomicU64,
    /// Items delivered and completed.
    uploaded: AtomicU64,
    /// Delivery attempts that ended in an abandon.
    failed: AtomicU64,
    /// Version string of a staged (not applied) update, if any.
    staged_version: Mutex<Option<String>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            collected: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            staged_version: Mutex::new(None),
        }
    }

    #[inline]
    pub fn inc_collected(&self) {
        self.collected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_uploaded(&self) {
        self.uploaded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_staged_version(&self, version: &str) {
        let mut slot = self.staged_version.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(version.to_string());
    }

    /// Immutable view of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            collected: self.collected.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            staged_version: self
                .staged_version
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    /// Render the Prometheus exposition text. `pending` is the live
    /// outstanding-item count pulled from the queue by the caller.
    pub fn prometheus_format(&self, pending: u64) -> String {
        let s = self.snapshot();
        let staged = match &s.staged_version {
            Some(version) => format!("estafette_staged_update_info{{version=\"{version}\"}} 1"),
            None => "estafette_staged_update_info 0".to_string(),
        };
        format!(
            r#"# HELP estafette_collected_files_total Journals discovered and packaged into the queue
# TYPE estafette_collected_files_total counter
estafette_collected_files_total {}

# HELP estafette_uploaded_files_total Items delivered to the remote store
# TYPE estafette_uploaded_files_total counter
estafette_uploaded_files_total {}

# HELP estafette_failed_uploads_total Delivery attempts returned to the queue
# TYPE estafette_failed_uploads_total counter
estafette_failed_uploads_total {}

# HELP estafette_pending_queue Items currently outstanding in the queue
# TYPE estafette_pending_queue gauge
estafette_pending_queue {}

# HELP estafette_staged_update_info Version staged by the update checker
# TYPE estafette_staged_update_info gauge
{}
"#,
            s.collected, s.uploaded, s.failed, pending, staged,
        )
    }

    /// Atomically write the exposition text to `path` (tmp + rename), for
    /// a textfile-collector style scrape.
    pub fn write_textfile(&self, path: &Path, pending: u64) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("prom.tmp");
        fs::write(&tmp, self.prometheus_format(pending))?;
        fs::rename(&tmp, path)
    }
}

/// Immutable snapshot of the counters.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub collected: u64,
    pub uploaded: u64,
    pub failed: u64,
    pub staged_version: Option<String>,
}

impl MetricsSnapshot {
    /// One-line human summary for the cycle log.
    pub fn summary(&self, pending: u64) -> String {
        format!(
            "{} collected, {} uploaded, {} failed, {} pending",
            self.collected, self.uploaded, self.failed, pending,
        )
    }
}
