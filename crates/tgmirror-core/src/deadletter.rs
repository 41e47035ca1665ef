//! Append-only record of units that could not be delivered.
//!
//! Past mode advances the offset past a unit even when every delivery attempt failed;
//! this log is what an operator reconciles from afterwards.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChatId, MessageId},
    Result,
};

const MAX_REASON_LEN: usize = 500;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub timestamp: String,
    pub source: i64,
    pub destination: i64,
    pub post_ids: Vec<i32>,
    pub reason: String,
}

impl DeadLetter {
    pub fn new(source: ChatId, destination: ChatId, post_ids: &[MessageId], reason: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            source: source.0,
            destination: destination.0,
            post_ids: post_ids.iter().map(|m| m.0).collect(),
            reason: reason.chars().take(MAX_REASON_LEN).collect(),
        }
    }
}

/// JSONL writer; one line per undeliverable (source, destination, posts) tuple.
pub struct DeadLetterLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DeadLetterLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, entry: &DeadLetter) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Best-effort variant used on delivery paths: failures are logged, never returned.
    pub fn record(&self, entry: DeadLetter) {
        if let Err(e) = self.write(&entry) {
            tracing::error!(
                "failed to write dead letter to {}: {e}",
                self.path.display()
            );
        }
    }

    pub fn read_all(&self) -> Result<Vec<DeadLetter>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let txt = std::fs::read_to_string(&self.path)?;
        txt.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| Ok(serde_json::from_str(l)?))
            .collect()
    }
}
