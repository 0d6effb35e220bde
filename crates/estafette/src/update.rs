//! Self-update staging.
//!
//! The checker only downloads and stages a newer package; applying it is a
//! deployment concern. Runs on its own thread, disjoint from the pipeline.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::io;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::UpdateConfig;
use crate::metrics::METRICS;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct Manifest {
    version: String,
    package: String,
}

pub struct UpdateChecker {
    config: UpdateConfig,
    client: reqwest::blocking::Client,
}

impl UpdateChecker {
    pub fn new(config: UpdateConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build update http client")?;
        Ok(Self { config, client })
    }

    pub fn enabled(&self) -> bool {
        !self.config.manifest_url.is_empty()
    }

    /// Fetch the manifest and stage the package when its version differs
    /// from the running binary. Returns the staged version, if any.
    pub fn check_and_stage(&self) -> Result<Option<String>> {
        let manifest: Manifest = self
            .client
            .get(&self.config.manifest_url)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .with_context(|| format!("manifest fetch from {} failed", self.config.manifest_url))?
            .json()
            .context("manifest is not valid JSON")?;

        if manifest.version == env!("CARGO_PKG_VERSION") {
            return Ok(None);
        }

        let package_name = std::path::Path::new(&manifest.package)
            .file_name()
            .and_then(|n| n.to_str())
            .context("manifest package has no usable file name")?;
        if package_name != manifest.package {
            bail!("manifest package name {:?} contains path segments", manifest.package);
        }

        fs::create_dir_all(&self.config.updates_path).with_context(|| {
            format!("failed to create {}", self.config.updates_path.display())
        })?;
        let package_url = format!(
            "{}/{}",
            self.config.download_base_url.trim_end_matches('/'),
            package_name,
        );
        let mut response = self
            .client
            .get(&package_url)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .with_context(|| format!("package download from {package_url} failed"))?;

        let dest = self.config.updates_path.join(package_name);
        let mut file = fs::File::create(&dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;
        io::copy(&mut response, &mut file)
            .with_context(|| format!("failed to write {}", dest.display()))?;

        METRICS.set_staged_version(&manifest.version);
        info!(
            version = %manifest.version,
            path = %dest.display(),
            "update staged; apply step is deployment-specific"
        );
        Ok(Some(manifest.version))
    }

    /// Periodic loop; a message or disconnect on `stop_rx` ends it.
    pub fn run(&self, stop_rx: &Receiver<()>) {
        let interval = Duration::from_secs(self.config.check_interval_minutes.max(1) * 60);
        if !self.enabled() {
            info!("update checker disabled (no manifest url)");
            return;
        }
        loop {
            if let Err(err) = self.check_and_stage() {
                warn!(error = %format!("{err:#}"), "update check failed, will retry");
            }
            match stop_rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
}
