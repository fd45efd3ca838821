//! Verification history: the last digest pair recorded for each image file,
//! with the time it was taken.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::digest::DigestPair;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashEntry {
    pub filename: String,
    pub sha1: String,
    pub sha256: String,
    pub timestamp: DateTime<Utc>,
}

/// JSON file mapping canonical file paths to their last [`HashEntry`].
#[derive(Debug)]
pub struct HashLog {
    path: PathBuf,
    entries: BTreeMap<String, HashEntry>,
}

impl HashLog {
    /// A missing or corrupt log starts out empty.
    pub fn load(path: &Path) -> Self {
        let entries = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable hash log");
                BTreeMap::new()
            }),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No hash log yet");
                BTreeMap::new()
            }
        };
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    pub fn entry(&self, file: &Path) -> Option<&HashEntry> {
        self.entries.get(&key(file))
    }

    /// Store `pair` as the latest result for `file` and write the log out.
    pub fn record(&mut self, file: &Path, pair: &DigestPair, at: DateTime<Utc>) -> Result<()> {
        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.entries.insert(
            key(file),
            HashEntry {
                filename,
                sha1: pair.sha1.clone(),
                sha256: pair.sha256.clone(),
                timestamp: at,
            },
        );
        self.save()
    }

    /// Whole days since `file` was last hashed, `None` if it never was.
    pub fn days_since(&self, file: &Path, now: DateTime<Utc>) -> Option<i64> {
        self.entry(file).map(|e| (now - e.timestamp).num_days())
    }

    pub fn is_stale(&self, file: &Path, now: DateTime<Utc>, stale_days: u32) -> bool {
        self.days_since(file, now)
            .is_some_and(|days| days >= i64::from(stale_days))
    }

    fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write hash log {}", self.path.display()))
    }
}

fn key(file: &Path) -> String {
    std::fs::canonicalize(file)
        .unwrap_or_else(|_| file.to_path_buf())
        .to_string_lossy()
        .into_owned()
}
