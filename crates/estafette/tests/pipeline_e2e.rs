//! End-to-end pipeline scenarios against a scripted uploader.
//!
//! The uploader is the trait seam: tests swap in a mock that records every
//! requested transfer and answers from a prepared script, so the whole
//! discover → package → enqueue → deliver → complete/abandon path runs on
//! real files in temp directories.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use estafette::agent::Agent;
use estafette::cancel::CancellationToken;
use estafette::config::EstafetteConfig;
use estafette::uploader::{UploadError, Uploader};
use estafette_queue::{FileQueue, ItemState};

/// Uploader that answers each call from a scripted outcome list (`true` =
/// success) and records the remote path of every attempt.
#[derive(Clone, Default)]
struct ScriptedUploader {
    outcomes: Arc<Mutex<VecDeque<bool>>>,
    attempts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedUploader {
    fn scripted(outcomes: &[bool]) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(outcomes.iter().copied().collect())),
            attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

impl Uploader for ScriptedUploader {
    fn upload(
        &self,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        assert!(local.exists(), "payload must exist during the attempt");
        self.attempts.lock().unwrap().push(remote.to_string());
        let ok = self.outcomes.lock().unwrap().pop_front().unwrap_or(true);
        if ok {
            Ok(())
        } else {
            Err(UploadError::Transfer {
                remote: remote.to_string(),
                message: "scripted failure".to_string(),
            })
        }
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    config: EstafetteConfig,
    queue: Arc<FileQueue>,
    source: PathBuf,
    processed: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        let processed = dir.path().join("processed");
        fs::create_dir_all(&source).unwrap();

        let mut config = EstafetteConfig::default();
        config.agent.source_path = source.clone();
        config.agent.queue_path = dir.path().join("queue");
        config.agent.processed_path = processed.clone();
        config.agent.metrics_path = dir.path().join("metrics.prom");
        config.sftp.remote_base_path = "data".to_string();

        let queue = Arc::new(FileQueue::open(&config.agent.queue_path).unwrap());
        Self {
            _dir: dir,
            config,
            queue,
            source,
            processed,
        }
    }

    fn agent(&self, uploader: ScriptedUploader) -> Agent {
        Agent::new(
            self.config.clone(),
            Arc::clone(&self.queue),
            Box::new(uploader),
            CancellationToken::new(),
        )
    }

    fn drop_journal(&self, bank: &str, gab: &str, name: &str) -> PathBuf {
        let dir = self.source.join(bank).join(gab);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, format!("journal {name}")).unwrap();
        path
    }
}

#[test]
fn discovered_journal_is_queued_with_inferred_routing() {
    let harness = Harness::new();
    let raw = harness.drop_journal("BANK1", "ATM7", "20250101.jrn");
    let uploader = ScriptedUploader::scripted(&[false]);
    let agent = harness.agent(uploader.clone());

    agent.run_cycle();

    // The raw journal left the source tree for the processed area.
    assert!(!raw.exists());
    assert!(harness
        .processed
        .join("BANK1")
        .join("ATM7")
        .join("20250101.jrn")
        .exists());

    // One outstanding item, tagged from the path.
    assert_eq!(harness.queue.count_pending(), 1);
    let id = harness.queue.peek().unwrap();
    let meta = harness.queue.meta(&id);
    assert_eq!(meta.get("bank").map(String::as_str), Some("BANK1"));
    assert_eq!(meta.get("gab").map(String::as_str), Some("ATM7"));
    assert_eq!(meta.get("original").map(String::as_str), Some("20250101.jrn"));
    assert_eq!(meta.get("archive").map(String::as_str), Some("20250101.jrn.zip"));
}

#[test]
fn failed_delivery_retries_same_item_then_succeeds() {
    let harness = Harness::new();
    harness.drop_journal("BANK1", "ATM7", "20250101.jrn");
    let uploader = ScriptedUploader::scripted(&[false, true]);
    let agent = harness.agent(uploader.clone());

    // Cycle 1: enqueue + failing delivery attempt.
    agent.run_cycle();
    let id = harness.queue.peek().expect("item must survive the failure");
    assert_eq!(harness.queue.state(&id), ItemState::Pending, "claim must be cleared");
    assert_eq!(harness.queue.count_pending(), 1);

    // Cycle 2: nothing new to discover; the same item is retried and goes
    // through.
    agent.run_cycle();
    assert_eq!(harness.queue.count_pending(), 0);
    assert_eq!(harness.queue.peek(), None);

    let attempts = uploader.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0], "/data/BANK1/ATM7/20250101.jrn.zip");
    assert_eq!(attempts[1], attempts[0], "retry must target the same address");
}

#[test]
fn delivery_is_fifo_one_item_per_cycle() {
    let harness = Harness::new();
    harness.drop_journal("BANK1", "ATM7", "20250101.jrn");
    harness.drop_journal("BANK1", "ATM7", "20250102.jrn");
    let uploader = ScriptedUploader::scripted(&[true, true]);
    let agent = harness.agent(uploader.clone());

    agent.run_cycle();
    assert_eq!(harness.queue.count_pending(), 1, "one delivery per cycle");
    agent.run_cycle();
    assert_eq!(harness.queue.count_pending(), 0);

    let attempts = uploader.attempts();
    assert_eq!(
        attempts,
        vec![
            "/data/BANK1/ATM7/20250101.jrn.zip".to_string(),
            "/data/BANK1/ATM7/20250102.jrn.zip".to_string(),
        ],
        "oldest item first"
    );
}

#[test]
fn configured_routing_overrides_path_inference() {
    let harness = Harness::new();
    let mut config = harness.config.clone();
    config.agent.bank_name = Some("HQ".to_string());
    config.agent.gab_id = Some("GAB-9".to_string());
    harness.drop_journal("BANK1", "ATM7", "20250101.jrn");

    let uploader = ScriptedUploader::scripted(&[true]);
    let agent = Agent::new(
        config,
        Arc::clone(&harness.queue),
        Box::new(uploader.clone()),
        CancellationToken::new(),
    );
    agent.run_cycle();

    assert_eq!(uploader.attempts(), vec!["/data/HQ/GAB-9/20250101.jrn.zip".to_string()]);
}

#[test]
fn relocation_collision_gets_a_timestamp_suffix() {
    let harness = Harness::new();
    harness.drop_journal("BANK1", "ATM7", "20250101.jrn");
    let blocker_dir = harness.processed.join("BANK1").join("ATM7");
    fs::create_dir_all(&blocker_dir).unwrap();
    fs::write(blocker_dir.join("20250101.jrn"), "previous run").unwrap();

    let agent = harness.agent(ScriptedUploader::scripted(&[true]));
    agent.run_cycle();

    let names: Vec<String> = fs::read_dir(&blocker_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names.len(), 2, "both files must survive: {names:?}");
    assert!(names.contains(&"20250101.jrn".to_string()));
    assert!(names
        .iter()
        .any(|n| n.starts_with("20250101_") && n.ends_with(".jrn")));
    assert_eq!(
        fs::read_to_string(blocker_dir.join("20250101.jrn")).unwrap(),
        "previous run",
        "existing file must not be overwritten"
    );
}

#[test]
fn relocation_failure_leaves_item_queued_and_rediscovery_duplicates() {
    let harness = Harness::new();
    harness.drop_journal("BANK1", "ATM7", "20250101.jrn");

    // Make the processed area unusable by putting a file where the bank
    // directory should go.
    fs::write(&harness.processed, "not a directory").unwrap();

    let agent = harness.agent(ScriptedUploader::scripted(&[false, false]));
    agent.run_cycle();

    // The enqueue succeeded even though relocation failed.
    assert_eq!(harness.queue.count_pending(), 1);
    assert!(harness.source.join("BANK1").join("ATM7").join("20250101.jrn").exists());

    // Next cycle re-discovers the same journal: a duplicate item appears,
    // which at-least-once delivery tolerates.
    agent.run_cycle();
    assert_eq!(harness.queue.count_pending(), 2);
}

#[test]
fn cancelled_shutdown_abandons_the_in_flight_item() {
    let harness = Harness::new();
    harness.drop_journal("BANK1", "ATM7", "20250101.jrn");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let agent = Agent::new(
        harness.config.clone(),
        Arc::clone(&harness.queue),
        Box::new(ScriptedUploader::default()),
        cancel,
    );
    agent.run_cycle();

    // The upload was refused by the cancelled token; the item must be back
    // to pending, not stuck in progress.
    let id = harness.queue.peek().expect("item must remain queued");
    assert_eq!(harness.queue.state(&id), ItemState::Pending);
}

#[test]
fn metrics_textfile_tracks_the_cycle() {
    let harness = Harness::new();
    harness.drop_journal("BANK1", "ATM7", "20250101.jrn");
    let agent = harness.agent(ScriptedUploader::scripted(&[false]));

    agent.run_cycle();

    let text = fs::read_to_string(&harness.config.agent.metrics_path).unwrap();
    assert!(text.contains("estafette_pending_queue 1"));
}
