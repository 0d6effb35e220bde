//! Journal discovery.
//!
//! Each `discover` call starts a fresh walk of the source tree; the
//! collector keeps no memory of what it has seen. Relocating processed
//! journals out of the tree (done by the pipeline) is the only thing that
//! stops a file from being found again.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::AgentConfig;

/// Journal file names: eight digits plus the `.jrn` extension.
static JOURNAL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\d{8}\.jrn$").expect("journal name pattern"));

/// A newly discovered journal with its routing tags.
#[derive(Debug, Clone)]
pub struct JournalFile {
    pub path: PathBuf,
    pub file_name: String,
    pub bank: String,
    pub gab: String,
}

pub struct JournalCollector {
    root: PathBuf,
    bank_override: Option<String>,
    gab_override: Option<String>,
    fallback_tag: String,
}

impl JournalCollector {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            root: config.source_path.clone(),
            bank_override: config.bank_name.clone(),
            gab_override: config.gab_id.clone(),
            fallback_tag: config.default_routing_tag.clone(),
        }
    }

    /// Walk the source tree and yield every journal found, lazily.
    /// Unreadable entries are logged and skipped; a missing root yields
    /// nothing.
    pub fn discover(&self) -> impl Iterator<Item = JournalFile> + '_ {
        let walker = self
            .root
            .is_dir()
            .then(|| WalkDir::new(&self.root).sort_by_file_name().into_iter());
        walker.into_iter().flatten().filter_map(|entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable entry during journal scan");
                    return None;
                }
            };
            if !entry.file_type().is_file() {
                return None;
            }
            let file_name = entry.file_name().to_str()?.to_string();
            if !JOURNAL_NAME.is_match(&file_name) {
                return None;
            }
            let (bank, gab) = self.routing_for(entry.path());
            Some(JournalFile {
                path: entry.into_path(),
                file_name,
                bank,
                gab,
            })
        })
    }

    /// Configured tags win; otherwise the layout `…/<bank>/<gab>/<file>`
    /// is assumed, with the fallback token filling any gap.
    fn routing_for(&self, path: &Path) -> (String, String) {
        if let (Some(bank), Some(gab)) = (&self.bank_override, &self.gab_override) {
            return (bank.clone(), gab.clone());
        }

        let gab_dir = path.parent();
        let inferred_gab = gab_dir
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
            .map(str::to_string);
        let inferred_bank = gab_dir
            .and_then(Path::parent)
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
            .map(str::to_string);

        let bank = self
            .bank_override
            .clone()
            .or(inferred_bank)
            .unwrap_or_else(|| self.fallback_tag.clone());
        let gab = self
            .gab_override
            .clone()
            .or(inferred_gab)
            .unwrap_or_else(|| self.fallback_tag.clone());
        (bank, gab)
    }
}
