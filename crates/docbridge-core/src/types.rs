use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ItemState
// ---------------------------------------------------------------------------

/// Per-item processing state machine.
///
/// Happy path: `Fetched → Parsed → Resolved → IssuePending → IssueCreated →
/// Linked`. Side branches: `Skipped` (parse failure), `Unresolved`
/// (repository undeterminable), `Failed` (retry ceiling exhausted). The three
/// branches and `Linked` are terminal until an operator forces a re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Fetched,
    Parsed,
    Resolved,
    IssuePending,
    IssueCreated,
    Linked,
    Skipped,
    Unresolved,
    Failed,
}

impl ItemState {
    pub fn all() -> &'static [ItemState] {
        &[
            ItemState::Fetched,
            ItemState::Parsed,
            ItemState::Resolved,
            ItemState::IssuePending,
            ItemState::IssueCreated,
            ItemState::Linked,
            ItemState::Skipped,
            ItemState::Unresolved,
            ItemState::Failed,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemState::Fetched => "fetched",
            ItemState::Parsed => "parsed",
            ItemState::Resolved => "resolved",
            ItemState::IssuePending => "issue_pending",
            ItemState::IssueCreated => "issue_created",
            ItemState::Linked => "linked",
            ItemState::Skipped => "skipped",
            ItemState::Unresolved => "unresolved",
            ItemState::Failed => "failed",
        }
    }

    /// No further automatic transition happens from these states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemState::Linked | ItemState::Skipped | ItemState::Unresolved | ItemState::Failed
        )
    }

    /// True once a real issue exists (or, in dry-run, would exist) for the
    /// item. The single-flight check keys off this.
    pub fn issue_created(self) -> bool {
        matches!(self, ItemState::IssueCreated | ItemState::Linked)
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemState {
    type Err = crate::error::BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ItemState::all()
            .iter()
            .copied()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| crate::error::BridgeError::MalformedPayload(format!("bad state: {s}")))
    }
}

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

/// A documentation-change request fetched from the tracker.
///
/// The tracker is the source of truth; the cache is a read-through mirror.
/// Parsed fields stay empty until the field parser has run. Immutable after
/// fetch except for operator edits to `proposed_new_text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: u64,
    pub title: String,
    pub raw_description: String,
    #[serde(default)]
    pub nature_of_request: String,
    #[serde(default)]
    pub doc_url: Option<String>,
    #[serde(default)]
    pub text_to_change: String,
    #[serde(default)]
    pub proposed_new_text: String,
    #[serde(default)]
    pub discovered_author: Option<String>,
    /// Web URL of the tracker item (rewritten from the API URL), used to
    /// hyperlink the item id inside the issue body.
    #[serde(default)]
    pub source_url: Option<String>,
}

impl WorkItem {
    pub fn new(id: u64, title: impl Into<String>, raw_description: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            raw_description: raw_description.into(),
            nature_of_request: String::new(),
            doc_url: None,
            text_to_change: String::new(),
            proposed_new_text: String::new(),
            discovered_author: None,
            source_url: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ResolvedTarget
// ---------------------------------------------------------------------------

/// Repository identity derived from a document's embedded metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTarget {
    pub owner: String,
    pub repo: String,
    pub source_doc_url: String,
    #[serde(default)]
    pub author: Option<String>,
}

impl ResolvedTarget {
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

// ---------------------------------------------------------------------------
// ProcessingRecord
// ---------------------------------------------------------------------------

/// One record per work item id, spanning the full state machine.
///
/// Invariant: `issue_url.is_some()` only when `state.issue_created()`, and
/// never in dry-run, where the synthetic success leaves the URL absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub work_item_id: u64,
    pub state: ItemState,
    #[serde(default)]
    pub issue_url: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub attempt_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingRecord {
    pub fn new(work_item_id: u64) -> Self {
        Self {
            work_item_id,
            state: ItemState::Fetched,
            issue_url: None,
            last_error: None,
            attempt_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn transition(&mut self, state: ItemState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
        self.updated_at = Utc::now();
    }

    /// An `IssueCreated` record whose link-back failed still needs work.
    pub fn needs_processing(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Re-enter the state machine at `Fetched` (operator-forced re-run).
    pub fn reset(&mut self) {
        self.state = ItemState::Fetched;
        self.issue_url = None;
        self.last_error = None;
        self.attempt_count = 0;
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// CacheEntry
// ---------------------------------------------------------------------------

/// The on-disk unit: one work item plus its processing record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub item: WorkItem,
    pub record: ProcessingRecord,
    /// Set once resolution succeeds, so a restart re-enters the state
    /// machine without re-fetching the document page.
    #[serde(default)]
    pub target: Option<ResolvedTarget>,
}

// ---------------------------------------------------------------------------
// Source-host result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedIssue {
    pub id: String,
    pub url: String,
    pub number: u64,
}

/// An assignable actor on the source host (e.g. the Copilot bot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub login: String,
}

// ---------------------------------------------------------------------------
// BridgeEvent
// ---------------------------------------------------------------------------

/// State-change events pushed to the presentation layer over a broadcast
/// channel; never a shared ambient singleton.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    BatchStarted { item_count: usize },
    StateChanged {
        work_item_id: u64,
        state: ItemState,
        issue_url: Option<String>,
    },
    BatchFinished { summary: BatchSummary },
}

/// Per-batch outcome counts returned by the orchestrator.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub linked: usize,
    pub skipped: usize,
    pub unresolved: usize,
    pub failed: usize,
    pub duplicates_suppressed: usize,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn state_roundtrip() {
        for state in ItemState::all() {
            let parsed = ItemState::from_str(state.as_str()).unwrap();
            assert_eq!(*state, parsed);
        }
    }

    #[test]
    fn terminal_states() {
        assert!(ItemState::Linked.is_terminal());
        assert!(ItemState::Skipped.is_terminal());
        assert!(ItemState::Unresolved.is_terminal());
        assert!(ItemState::Failed.is_terminal());
        assert!(!ItemState::IssueCreated.is_terminal());
        assert!(!ItemState::IssuePending.is_terminal());
    }

    #[test]
    fn issue_created_phase() {
        assert!(ItemState::IssueCreated.issue_created());
        assert!(ItemState::Linked.issue_created());
        assert!(!ItemState::IssuePending.issue_created());
    }

    #[test]
    fn record_reset_clears_progress() {
        let mut record = ProcessingRecord::new(7);
        record.transition(ItemState::Failed);
        record.record_error("boom");
        record.attempt_count = 3;

        record.reset();
        assert_eq!(record.state, ItemState::Fetched);
        assert!(record.issue_url.is_none());
        assert!(record.last_error.is_none());
        assert_eq!(record.attempt_count, 0);
    }
}
