//! Configuration for the Estafette agent.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration, one section per concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EstafetteConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub sftp: SftpConfig,
    #[serde(default)]
    pub update: UpdateConfig,
}

/// Collection pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Root of the tree scanned for new journal files.
    #[serde(default = "default_source_path")]
    pub source_path: PathBuf,

    /// Directory holding the durable queue.
    #[serde(default = "default_queue_path")]
    pub queue_path: PathBuf,

    /// Where raw journals are moved after a successful enqueue.
    #[serde(default = "default_processed_path")]
    pub processed_path: PathBuf,

    /// Prometheus textfile written once per cycle.
    #[serde(default = "default_metrics_path")]
    pub metrics_path: PathBuf,

    /// Seconds between pipeline cycles.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Routing overrides; when unset, both are inferred from the journal's
    /// directory layout (`…/<bank>/<gab>/<file>`).
    #[serde(default)]
    pub bank_name: Option<String>,
    #[serde(default)]
    pub gab_id: Option<String>,

    /// Token substituted for a routing tag that is neither configured nor
    /// inferable.
    #[serde(default = "default_routing_tag")]
    pub default_routing_tag: String,
}

/// Remote store connection settings. An empty host selects the no-op
/// uploader (dry-run mode).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SftpConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_sftp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub private_key_passphrase: Option<String>,
    /// Logical base under which `<bank>/<gab>/<archive>` is placed.
    #[serde(default = "default_remote_base")]
    pub remote_base_path: String,
    /// OpenSSH-style SHA-256 host key fingerprint; when set, a mismatching
    /// host is rejected.
    #[serde(default)]
    pub fingerprint_sha256: Option<String>,
}

/// Self-update staging. An empty manifest URL disables the checker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default)]
    pub manifest_url: String,
    #[serde(default)]
    pub download_base_url: String,
    #[serde(default = "default_updates_path")]
    pub updates_path: PathBuf,
    #[serde(default = "default_update_interval")]
    pub check_interval_minutes: u64,
}

fn default_source_path() -> PathBuf {
    estafette_logging::estafette_home().join("incoming")
}

fn default_queue_path() -> PathBuf {
    estafette_logging::estafette_home().join("queue")
}

fn default_processed_path() -> PathBuf {
    estafette_logging::estafette_home().join("processed")
}

fn default_metrics_path() -> PathBuf {
    estafette_logging::estafette_home().join("metrics.prom")
}

fn default_scan_interval() -> u64 {
    60
}

fn default_routing_tag() -> String {
    "UNKNOWN".to_string()
}

fn default_sftp_port() -> u16 {
    22
}

fn default_remote_base() -> String {
    "data".to_string()
}

fn default_updates_path() -> PathBuf {
    estafette_logging::estafette_home().join("updates")
}

fn default_update_interval() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            source_path: default_source_path(),
            queue_path: default_queue_path(),
            processed_path: default_processed_path(),
            metrics_path: default_metrics_path(),
            scan_interval_secs: default_scan_interval(),
            bank_name: None,
            gab_id: None,
            default_routing_tag: default_routing_tag(),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            manifest_url: String::new(),
            download_base_url: String::new(),
            updates_path: default_updates_path(),
            check_interval_minutes: default_update_interval(),
        }
    }
}

impl EstafetteConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("failed to render config")?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config file: {}", path.display()))
    }
}
