//! The pipeline loop.
//!
//! One cycle: drain discovery into the queue, attempt exactly one
//! delivery, refresh metrics, sleep. Every per-item error is logged and
//! skipped; nothing in a cycle terminates the loop. The loop runs until a
//! message (or disconnect) arrives on the stop channel.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use estafette_queue::{FileQueue, ItemId, ItemMeta};

use crate::archive;
use crate::cancel::CancellationToken;
use crate::collector::{JournalCollector, JournalFile};
use crate::config::EstafetteConfig;
use crate::metrics::METRICS;
use crate::uploader::Uploader;

/// Metadata keys written for every queued journal.
pub const TAG_BANK: &str = "bank";
pub const TAG_GAB: &str = "gab";
pub const TAG_ORIGINAL: &str = "original";
pub const TAG_ARCHIVE: &str = "archive";

pub struct Agent {
    config: EstafetteConfig,
    queue: Arc<FileQueue>,
    collector: JournalCollector,
    uploader: Box<dyn Uploader>,
    cancel: CancellationToken,
}

impl Agent {
    pub fn new(
        config: EstafetteConfig,
        queue: Arc<FileQueue>,
        uploader: Box<dyn Uploader>,
        cancel: CancellationToken,
    ) -> Self {
        let collector = JournalCollector::new(&config.agent);
        Self {
            config,
            queue,
            collector,
            uploader,
            cancel,
        }
    }

    /// Run cycles until `stop_rx` fires or the cancellation token flips.
    pub fn run(&self, stop_rx: Receiver<()>) -> Result<()> {
        let interval = Duration::from_secs(self.config.agent.scan_interval_secs.max(1));
        info!(
            source = %self.config.agent.source_path.display(),
            queue = %self.queue.root().display(),
            interval_secs = interval.as_secs(),
            "agent loop started"
        );

        loop {
            self.run_cycle();
            if self.cancel.is_cancelled() {
                break;
            }
            match stop_rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        info!("agent loop stopped");
        Ok(())
    }

    /// One full pipeline cycle. Public so tests can drive the pipeline
    /// without the timer.
    pub fn run_cycle(&self) {
        let collected = self.drain_source();
        self.deliver_next();

        let pending = self.queue.count_pending() as u64;
        if let Err(err) = METRICS.write_textfile(&self.config.agent.metrics_path, pending) {
            warn!(
                path = %self.config.agent.metrics_path.display(),
                error = %err,
                "failed to write metrics textfile"
            );
        }
        debug!(collected, pending, summary = %METRICS.snapshot().summary(pending), "cycle finished");
    }

    /// Package and enqueue every discovered journal. A failure on one
    /// journal never blocks the rest of the drain.
    fn drain_source(&self) -> u64 {
        let mut collected = 0;
        for journal in self.collector.discover() {
            match self.intake(&journal) {
                Ok(id) => {
                    collected += 1;
                    METRICS.inc_collected();
                    debug!(id = %id, journal = %journal.path.display(), "journal queued");
                    // Only risk on failure here is re-discovery, which the
                    // at-least-once contract absorbs.
                    if let Err(err) = self.retire(&journal) {
                        warn!(
                            journal = %journal.path.display(),
                            error = %format!("{err:#}"),
                            "failed to archive processed journal"
                        );
                    }
                }
                Err(err) => {
                    error!(
                        journal = %journal.path.display(),
                        error = %format!("{err:#}"),
                        "failed to queue journal, will retry next scan"
                    );
                }
            }
        }
        collected
    }

    fn intake(&self, journal: &JournalFile) -> Result<ItemId> {
        let archive_path = archive::compress_file(&journal.path, self.queue.root())?;
        let archive_name = archive_path
            .file_name()
            .and_then(|n| n.to_str())
            .context("archive path has no file name")?
            .to_string();

        let mut tags = ItemMeta::new();
        tags.insert(TAG_BANK.to_string(), journal.bank.clone());
        tags.insert(TAG_GAB.to_string(), journal.gab.clone());
        tags.insert(TAG_ORIGINAL.to_string(), journal.file_name.clone());
        tags.insert(TAG_ARCHIVE.to_string(), archive_name);

        let id = self
            .queue
            .enqueue(&archive_path, tags)
            .context("failed to enqueue packaged journal")?;
        Ok(id)
    }

    /// Move the raw journal under `processed/<bank>/<gab>/`, suffixing a
    /// UTC timestamp rather than overwriting a previous file of the same
    /// name.
    fn retire(&self, journal: &JournalFile) -> Result<()> {
        let dest_dir = self
            .config
            .agent
            .processed_path
            .join(&journal.bank)
            .join(&journal.gab);
        fs::create_dir_all(&dest_dir)
            .with_context(|| format!("failed to create {}", dest_dir.display()))?;

        let mut dest = dest_dir.join(&journal.file_name);
        if dest.exists() {
            dest = dest_dir.join(disambiguated_name(&journal.file_name));
        }
        fs::rename(&journal.path, &dest).with_context(|| {
            format!(
                "failed to move {} to {}",
                journal.path.display(),
                dest.display()
            )
        })
    }

    /// Attempt delivery of the oldest outstanding item, if any.
    fn deliver_next(&self) {
        let Some(id) = self.queue.peek() else {
            return;
        };

        if let Err(err) = self.queue.mark_in_progress(&id) {
            // The claim marker is bookkeeping; the attempt itself proceeds.
            warn!(id = %id, error = %err, "failed to write claim marker");
        }

        let remote = self.remote_path_for(&id);
        let local = self.queue.payload_path(&id);
        match self.uploader.upload(&local, &remote, &self.cancel) {
            Ok(()) => {
                METRICS.inc_uploaded();
                info!(id = %id, remote = %remote, "item delivered");
                if let Err(err) = self.queue.complete(&id) {
                    warn!(id = %id, error = %err, "cleanup after delivery incomplete");
                }
            }
            Err(err) => {
                METRICS.inc_failed();
                warn!(id = %id, remote = %remote, error = %err, "delivery failed, item returned to queue");
                if let Err(abandon_err) = self.queue.abandon(&id) {
                    warn!(id = %id, error = %abandon_err, "failed to clear claim marker");
                }
            }
        }
    }

    /// `/<base>/<bank>/<gab>/<archive-name>`, metadata tags first, then
    /// configured overrides, then the default token.
    fn remote_path_for(&self, id: &ItemId) -> String {
        let meta = self.queue.meta(id);
        let agent = &self.config.agent;
        let tag = |key: &str, configured: &Option<String>| {
            meta.get(key)
                .cloned()
                .or_else(|| configured.clone())
                .unwrap_or_else(|| agent.default_routing_tag.clone())
        };
        let bank = tag(TAG_BANK, &agent.bank_name);
        let gab = tag(TAG_GAB, &agent.gab_id);
        let blob_name = meta
            .get(TAG_ARCHIVE)
            .cloned()
            .unwrap_or_else(|| format!("{id}.payload"));
        let base = self.config.sftp.remote_base_path.trim_matches('/');
        format!("/{base}/{bank}/{gab}/{blob_name}")
    }
}

fn disambiguated_name(file_name: &str) -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
    match file_name.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}_{stamp}.{ext}"),
        None => format!("{file_name}_{stamp}"),
    }
}
