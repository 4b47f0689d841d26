// src/watermark.rs
//! Persisted incremental-sync checkpoint.
//!
//! The watermark only moves forward, and only after a page has been durably
//! loaded. The file is rewritten per page (temp file + rename), so a crash
//! mid-run costs at most one page of re-delivery, which the idempotent load
//! absorbs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::SyncError;

/// Where a run starts: resume from the persisted watermark, or a caller
/// supplied timestamp that ignores it for this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPoint {
    FromWatermark,
    FromExplicitSince(DateTime<Utc>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cursor: Option<String>,
}

impl Watermark {
    /// Fold one loaded page into the checkpoint: `since` takes the max
    /// observed record timestamp (never moves backwards), the cursor always
    /// tracks the latest continuation token.
    pub fn advance(&mut self, observed: Option<DateTime<Utc>>, cursor: Option<String>) {
        if let Some(ts) = observed {
            if self.since.is_none_or(|cur| ts > cur) {
                self.since = Some(ts);
            }
        }
        self.cursor = cursor;
    }
}

#[derive(Debug, Clone)]
pub struct WatermarkStore {
    path: PathBuf,
}

impl WatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absent or unreadable file means "no prior watermark".
    pub async fn load(&self) -> Option<Watermark> {
        let raw = tokio::fs::read_to_string(&self.path).await.ok()?;
        match serde_json::from_str(&raw) {
            Ok(wm) => Some(wm),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %self.path.display(),
                    "ignoring unreadable watermark file"
                );
                None
            }
        }
    }

    /// Durable write: temp file in the same directory, then rename over the
    /// old checkpoint.
    pub async fn save(&self, wm: &Watermark) -> Result<(), SyncError> {
        let bytes = serde_json::to_vec_pretty(wm).map_err(|e| SyncError::Watermark {
            message: e.to_string(),
        })?;
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| self.io_err("creating watermark dir", e))?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| self.io_err("writing watermark temp file", e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_err("replacing watermark file", e))?;
        Ok(())
    }

    fn io_err(&self, what: &str, e: std::io::Error) -> SyncError {
        SyncError::Watermark {
            message: format!("{what} {}: {e}", self.path.display()),
        }
    }
}
