//! Append-only processing log.
//!
//! Every decision and external call lands here with its item id and stage,
//! guarded by a mutex so worker tasks can append concurrently. Entries are
//! mirrored to tracing and, when configured, to a plain-text log file. The
//! `Decision` kind exists so dry-run equivalence can be checked: a dry run
//! and a live run over the same batch must produce identical decision
//! sequences.

use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::io;

// ---------------------------------------------------------------------------
// Stage / LogKind / LogEntry
// ---------------------------------------------------------------------------

/// Pipeline stage an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Parse,
    Resolve,
    Publish,
    Assign,
    LinkBack,
    Orchestrate,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Parse => "parse",
            Stage::Resolve => "resolve",
            Stage::Publish => "publish",
            Stage::Assign => "assign",
            Stage::LinkBack => "link_back",
            Stage::Orchestrate => "orchestrate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    /// Pure decision logic, identical between dry-run and live runs.
    Decision,
    /// An external call or its result (differs between modes by design).
    Call,
    Error,
    Info,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub work_item_id: Option<u64>,
    pub stage: Stage,
    pub kind: LogKind,
    pub message: String,
}

impl LogEntry {
    fn render(&self) -> String {
        let id = self
            .work_item_id
            .map(|id| format!("#{id}"))
            .unwrap_or_else(|| "-".to_string());
        format!(
            "[{}] {} {} {}\n",
            self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            id,
            self.stage,
            self.message
        )
    }
}

// ---------------------------------------------------------------------------
// ProcessingLog
// ---------------------------------------------------------------------------

pub struct ProcessingLog {
    entries: Mutex<Vec<LogEntry>>,
    file: Option<PathBuf>,
}

impl ProcessingLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            file: None,
        }
    }

    /// Mirror every entry to a plain-text file as well.
    pub fn with_file(path: PathBuf) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            file: Some(path),
        }
    }

    pub fn append(
        &self,
        work_item_id: Option<u64>,
        stage: Stage,
        kind: LogKind,
        message: impl Into<String>,
    ) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            work_item_id,
            stage,
            kind,
            message: message.into(),
        };
        match kind {
            LogKind::Error => {
                tracing::warn!(item = ?work_item_id, stage = %stage, "{}", entry.message)
            }
            _ => tracing::info!(item = ?work_item_id, stage = %stage, "{}", entry.message),
        }
        if let Some(path) = &self.file {
            // Best-effort mirror; a full disk must not take down processing.
            if let Err(e) = io::append_text(path, &entry.render()) {
                tracing::warn!("processing log file append failed: {e}");
            }
        }
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    pub fn decision(&self, work_item_id: u64, stage: Stage, message: impl Into<String>) {
        self.append(Some(work_item_id), stage, LogKind::Decision, message);
    }

    pub fn error(&self, work_item_id: Option<u64>, stage: Stage, message: impl Into<String>) {
        self.append(work_item_id, stage, LogKind::Error, message);
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .ok()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// The decision messages only, in append order. Two runs with identical
    /// decision logic produce identical sequences here.
    pub fn decisions(&self) -> Vec<String> {
        self.entries
            .lock()
            .ok()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.kind == LogKind::Decision)
                    .map(|e| e.message.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for ProcessingLog {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
