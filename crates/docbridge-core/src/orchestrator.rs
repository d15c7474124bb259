//! Batch orchestration.
//!
//! Drives every cached work item through the state machine: parse the
//! description, resolve the target repository, create the issue, assign the
//! coding agent, link the issue back to the tracker. Items advance
//! independently on a semaphore-bounded worker pool; the cache is written
//! after every transition so a crash resumes where it stopped.
//!
//! Mutation discipline: `IssuePending` is persisted before the create call
//! goes out, and recovery from `IssuePending` searches the host for the
//! item's marker before creating anything, so at most one issue exists per
//! work item even across crashes.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Semaphore};

use crate::cache::CacheStore;
use crate::config::RetryConfig;
use crate::content;
use crate::error::{BridgeError, Result};
use crate::log::{LogKind, ProcessingLog, Stage};
use crate::parser;
use crate::publisher::{IssuePublisher, PublishOutcome, SourceHostApi};
use crate::resolver::{DocumentHost, DocumentResolver, ResolveOutcome};
use crate::tracker::TrackerApi;
use crate::types::{
    BatchSummary, BridgeEvent, CacheEntry, CreatedIssue, ItemState, ProcessingRecord,
    ResolvedTarget,
};

const EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// with_retry
// ---------------------------------------------------------------------------

/// Runs `op`, retrying retryable failures with doubling backoff until the
/// attempt ceiling. Cancellation is honored between attempts, never inside
/// one.
pub async fn with_retry<T, F, Fut>(retry: &RetryConfig, cancel: &AtomicBool, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(retry.backoff_base_ms);
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                if cancel.load(Ordering::SeqCst) {
                    return Err(BridgeError::Cancelled);
                }
                tracing::debug!(attempt, "retryable failure, backing off: {e}");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct ItemOutcome {
    state: ItemState,
    /// The issue already existed on the host before this run touched it.
    duplicate: bool,
}

enum CreateAttempt {
    Fresh(PublishOutcome),
    /// An earlier attempt's create committed on the host but its response
    /// was lost; the marker search found it.
    Recovered(CreatedIssue),
}

pub struct Orchestrator<T, H, S> {
    tracker: T,
    resolver: DocumentResolver<H>,
    publisher: IssuePublisher<S>,
    cache: CacheStore,
    log: Arc<ProcessingLog>,
    retry: RetryConfig,
    worker_count: usize,
    events: broadcast::Sender<BridgeEvent>,
    cancel: AtomicBool,
}

impl<T, H, S> Orchestrator<T, H, S>
where
    T: TrackerApi + 'static,
    H: DocumentHost + 'static,
    S: SourceHostApi + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tracker: T,
        resolver: DocumentResolver<H>,
        publisher: IssuePublisher<S>,
        cache: CacheStore,
        log: Arc<ProcessingLog>,
        retry: RetryConfig,
        worker_count: usize,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            tracker,
            resolver,
            publisher,
            cache,
            log,
            retry,
            worker_count: worker_count.max(1),
            events,
            cancel: AtomicBool::new(false),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Stops the batch at the next step boundary. In-flight API calls run
    /// to completion so no item is left mid-mutation.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn log(&self) -> &ProcessingLog {
        &self.log
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    // -----------------------------------------------------------------------
    // Fetch
    // -----------------------------------------------------------------------

    /// Runs the saved query and caches work items not seen before. Existing
    /// entries keep their processing state untouched, which makes fetch
    /// safe to repeat.
    pub async fn fetch(&self) -> Result<Vec<u64>> {
        self.log
            .append(None, Stage::Fetch, LogKind::Info, "running saved query");
        let ids = with_retry(&self.retry, &self.cancel, || self.tracker.run_query()).await?;

        let mut new_ids = Vec::new();
        for id in &ids {
            if self.cache.get(*id)?.is_none() {
                new_ids.push(*id);
            }
        }
        if !new_ids.is_empty() {
            let items =
                with_retry(&self.retry, &self.cancel, || self.tracker.get_items(&new_ids)).await?;
            for item in items {
                let record = ProcessingRecord::new(item.id);
                self.cache.put(&CacheEntry {
                    item,
                    record,
                    target: None,
                })?;
            }
        }
        self.log.append(
            None,
            Stage::Fetch,
            LogKind::Info,
            format!("query returned {} items, {} new", ids.len(), new_ids.len()),
        );
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Batch processing
    // -----------------------------------------------------------------------

    /// Processes every cached item that is not in a terminal state. Returns
    /// the per-batch counts; a fatal error (bad credentials, cancellation)
    /// aborts the batch after the in-flight items settle.
    pub async fn process_batch(self: &Arc<Self>) -> Result<BatchSummary> {
        self.process_matching(None).await
    }

    /// Drives a single cached item, leaving the rest untouched.
    pub async fn process_one(self: &Arc<Self>, id: u64) -> Result<BatchSummary> {
        if self.cache.get(id)?.is_none() {
            return Err(BridgeError::ItemNotCached(id));
        }
        self.process_matching(Some(id)).await
    }

    async fn process_matching(self: &Arc<Self>, only: Option<u64>) -> Result<BatchSummary> {
        let ids: Vec<u64> = self
            .cache
            .list()?
            .into_iter()
            .filter(|e| only.map_or(true, |id| e.record.work_item_id == id))
            .filter(|e| e.record.needs_processing())
            .map(|e| e.record.work_item_id)
            .collect();

        let _ = self.events.send(BridgeEvent::BatchStarted {
            item_count: ids.len(),
        });

        let semaphore = Arc::new(Semaphore::new(self.worker_count));
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| BridgeError::Cancelled)?;
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                (id, this.process_item(id).await)
            }));
        }

        let mut summary = BatchSummary::default();
        let mut fatal: Option<BridgeError> = None;
        for handle in handles {
            let (id, result) = handle
                .await
                .map_err(|e| BridgeError::Internal(format!("worker task failed: {e}")))?;
            summary.processed += 1;
            match result {
                Ok(outcome) => {
                    if outcome.duplicate {
                        summary.duplicates_suppressed += 1;
                    } else {
                        match outcome.state {
                            ItemState::Linked => summary.linked += 1,
                            ItemState::Skipped => summary.skipped += 1,
                            ItemState::Unresolved => summary.unresolved += 1,
                            // A created-but-unlinked issue still needs work.
                            ItemState::Failed | ItemState::IssueCreated => summary.failed += 1,
                            _ => {}
                        }
                    }
                }
                Err(e) if e.is_fatal() => {
                    self.cancel();
                    self.log
                        .error(Some(id), Stage::Orchestrate, format!("fatal: {e}"));
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    summary.failed += 1;
                    self.log.error(Some(id), Stage::Orchestrate, e.to_string());
                }
            }
        }

        let _ = self.events.send(BridgeEvent::BatchFinished {
            summary: summary.clone(),
        });
        match fatal {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Puts `Failed` records back to `Fetched` so the next batch retries
    /// them. Returns how many were reset.
    pub fn reset_failed(&self) -> Result<usize> {
        let mut count = 0;
        for mut entry in self.cache.list()? {
            if entry.record.state == ItemState::Failed {
                entry.record.reset();
                self.cache.put(&entry)?;
                count += 1;
            }
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Per-item state machine
    // -----------------------------------------------------------------------

    async fn process_item(self: Arc<Self>, id: u64) -> Result<ItemOutcome> {
        let mut entry = self
            .cache
            .get(id)?
            .ok_or(BridgeError::ItemNotCached(id))?;
        let mut duplicate = false;

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(BridgeError::Cancelled);
            }
            match entry.record.state {
                ItemState::Fetched => self.step_parse(&mut entry)?,
                ItemState::Parsed => self.step_resolve(&mut entry).await?,
                ItemState::Resolved => {
                    if self.step_publish(&mut entry).await? {
                        duplicate = true;
                    }
                }
                ItemState::IssuePending => self.step_recover_pending(&mut entry).await?,
                ItemState::IssueCreated => {
                    self.step_link_back(&mut entry).await?;
                    // Link-back failure leaves the state unchanged; stop
                    // instead of spinning on it.
                    if entry.record.state == ItemState::IssueCreated {
                        break;
                    }
                }
                _ => break,
            }
        }

        Ok(ItemOutcome {
            state: entry.record.state,
            duplicate,
        })
    }

    fn step_parse(&self, entry: &mut CacheEntry) -> Result<()> {
        let id = entry.item.id;
        match parser::parse_description(&entry.item.raw_description) {
            Ok(fields) => {
                entry.item.nature_of_request = fields.nature_of_request;
                entry.item.doc_url = Some(fields.doc_url);
                entry.item.text_to_change = fields.text_to_change;
                entry.item.proposed_new_text = fields.proposed_new_text;
                self.log.decision(id, Stage::Parse, "description fields parsed");
                self.set_state(entry, ItemState::Parsed)
            }
            Err(reason) => {
                self.log.decision(id, Stage::Parse, format!("skip item: {reason}"));
                entry.record.record_error(reason.to_string());
                self.set_state(entry, ItemState::Skipped)
            }
        }
    }

    async fn step_resolve(&self, entry: &mut CacheEntry) -> Result<()> {
        let id = entry.item.id;
        let result = with_retry(&self.retry, &self.cancel, || {
            self.resolver.resolve(&entry.item)
        })
        .await;
        match result {
            Ok(ResolveOutcome::Resolved(target)) => {
                self.log
                    .decision(id, Stage::Resolve, format!("target {}", target.slug()));
                entry.target = Some(target);
                self.set_state(entry, ItemState::Resolved)
            }
            Ok(ResolveOutcome::Unresolved(failure)) => {
                self.log
                    .decision(id, Stage::Resolve, format!("unresolved: {failure}"));
                entry.record.record_error(failure.to_string());
                self.set_state(entry, ItemState::Unresolved)
            }
            Err(e) => self.step_failure(entry, Stage::Resolve, e),
        }
    }

    /// Returns true when an existing issue suppressed the create.
    async fn step_publish(&self, entry: &mut CacheEntry) -> Result<bool> {
        let id = entry.item.id;
        let target = entry
            .target
            .clone()
            .ok_or_else(|| BridgeError::Internal(format!("item {id} resolved without target")))?;

        // Single-flight: the host is the authority on whether an issue for
        // this marker already exists, whatever the local cache thinks.
        self.log
            .decision(id, Stage::Publish, "check host for existing issue");
        let marker = content::marker(id);
        let existing = match with_retry(&self.retry, &self.cancel, || {
            self.publisher
                .host()
                .find_issue_by_marker(&target.owner, &target.repo, &marker)
        })
        .await
        {
            Ok(found) => found,
            Err(e) => {
                self.step_failure(entry, Stage::Publish, e)?;
                return Ok(false);
            }
        };
        if let Some(issue) = existing {
            self.log
                .decision(id, Stage::Publish, "issue already exists, suppressing create");
            self.log.append(
                Some(id),
                Stage::Publish,
                LogKind::Call,
                format!("existing issue {}", issue.url),
            );
            entry.record.issue_url = Some(issue.url);
            self.set_state(entry, ItemState::Linked)?;
            return Ok(true);
        }

        self.log
            .decision(id, Stage::Publish, format!("create issue in {}", target.slug()));
        // Persisted before the mutation so a crash cannot double-create.
        self.set_state(entry, ItemState::IssuePending)?;

        // Every retry re-checks the host first: a transient failure can mean
        // the create committed and only the response was lost.
        let first_attempt = AtomicBool::new(true);
        let attempt = match with_retry(&self.retry, &self.cancel, || {
            let first = first_attempt.swap(false, Ordering::SeqCst);
            let marker = &marker;
            let target = &target;
            let item = &entry.item;
            async move {
                if !first {
                    if let Some(issue) = self
                        .publisher
                        .host()
                        .find_issue_by_marker(&target.owner, &target.repo, marker)
                        .await?
                    {
                        return Ok(CreateAttempt::Recovered(issue));
                    }
                }
                Ok(CreateAttempt::Fresh(self.publisher.publish(item, target).await?))
            }
        })
        .await
        {
            Ok(attempt) => attempt,
            Err(e) => {
                self.step_failure(entry, Stage::Publish, e)?;
                return Ok(false);
            }
        };

        match attempt {
            CreateAttempt::Fresh(PublishOutcome {
                issue: Some(issue), ..
            }) => {
                self.log.append(
                    Some(id),
                    Stage::Publish,
                    LogKind::Call,
                    format!("created issue #{} at {}", issue.number, issue.url),
                );
                self.finish_create(entry, &target, issue).await?;
            }
            CreateAttempt::Recovered(issue) => {
                self.log.append(
                    Some(id),
                    Stage::Publish,
                    LogKind::Call,
                    format!("create reached host on an earlier attempt: {}", issue.url),
                );
                self.finish_create(entry, &target, issue).await?;
            }
            CreateAttempt::Fresh(outcome) => {
                self.log.append(
                    Some(id),
                    Stage::Publish,
                    LogKind::Call,
                    format!("dry run, payload: {}", outcome.payload),
                );
                self.set_state(entry, ItemState::IssueCreated)?;
                self.log.decision(id, Stage::Assign, "request agent assignment");
            }
        }
        Ok(false)
    }

    /// Records a live issue on the entry and requests agent assignment.
    async fn finish_create(
        &self,
        entry: &mut CacheEntry,
        target: &ResolvedTarget,
        issue: CreatedIssue,
    ) -> Result<()> {
        let id = entry.item.id;
        entry.record.issue_url = Some(issue.url.clone());
        self.set_state(entry, ItemState::IssueCreated)?;

        self.log.decision(id, Stage::Assign, "request agent assignment");
        match self.publisher.assign_agent(target, &issue).await {
            Ok(Some(login)) => self.log.append(
                Some(id),
                Stage::Assign,
                LogKind::Call,
                format!("assigned {login}"),
            ),
            Ok(None) => self.log.append(
                Some(id),
                Stage::Assign,
                LogKind::Call,
                "no assignable agent in repository",
            ),
            // Assignment is best-effort; the issue is already live.
            Err(e) => self
                .log
                .error(Some(id), Stage::Assign, format!("assignment failed: {e}")),
        }
        Ok(())
    }

    /// A crash left the record at `IssuePending`: the create may or may not
    /// have reached the host. Search for the marker before deciding.
    async fn step_recover_pending(&self, entry: &mut CacheEntry) -> Result<()> {
        let id = entry.item.id;
        let target = entry
            .target
            .clone()
            .ok_or_else(|| BridgeError::Internal(format!("item {id} pending without target")))?;

        self.log
            .decision(id, Stage::Publish, "recover interrupted create");
        let marker = content::marker(id);
        let existing = match with_retry(&self.retry, &self.cancel, || {
            self.publisher
                .host()
                .find_issue_by_marker(&target.owner, &target.repo, &marker)
        })
        .await
        {
            Ok(found) => found,
            Err(e) => return self.step_failure(entry, Stage::Publish, e),
        };
        match existing {
            Some(issue) => {
                self.log.append(
                    Some(id),
                    Stage::Publish,
                    LogKind::Call,
                    format!("interrupted create did reach host: {}", issue.url),
                );
                entry.record.issue_url = Some(issue.url);
                self.set_state(entry, ItemState::IssueCreated)
            }
            None => self.set_state(entry, ItemState::Resolved),
        }
    }

    async fn step_link_back(&self, entry: &mut CacheEntry) -> Result<()> {
        let id = entry.item.id;
        self.log
            .decision(id, Stage::LinkBack, "link issue back to work item");

        if self.publisher.is_dry_run() {
            return self.set_state(entry, ItemState::Linked);
        }

        let issue_url = entry.record.issue_url.clone().ok_or_else(|| {
            BridgeError::Internal(format!("item {id} in issue_created without url"))
        })?;
        let result = with_retry(&self.retry, &self.cancel, || {
            self.tracker.add_hyperlink(id, &issue_url)
        })
        .await;
        match result {
            Ok(()) => {
                self.log.append(
                    Some(id),
                    Stage::LinkBack,
                    LogKind::Call,
                    "hyperlink added to work item",
                );
                self.set_state(entry, ItemState::Linked)
            }
            Err(e) if e.is_fatal() => Err(e),
            // Keep IssueCreated so the next batch retries the link without
            // creating anything.
            Err(e) => {
                entry.record.record_error(e.to_string());
                self.log
                    .error(Some(id), Stage::LinkBack, format!("link-back failed: {e}"));
                self.persist(entry)
            }
        }
    }

    fn step_failure(&self, entry: &mut CacheEntry, stage: Stage, err: BridgeError) -> Result<()> {
        if err.is_fatal() {
            return Err(err);
        }
        entry.record.attempt_count += 1;
        entry.record.record_error(err.to_string());
        self.log
            .error(Some(entry.item.id), stage, err.to_string());
        self.set_state(entry, ItemState::Failed)
    }

    fn set_state(&self, entry: &mut CacheEntry, state: ItemState) -> Result<()> {
        entry.record.transition(state);
        self.persist(entry)?;
        let _ = self.events.send(BridgeEvent::StateChanged {
            work_item_id: entry.record.work_item_id,
            state,
            issue_url: entry.record.issue_url.clone(),
        });
        Ok(())
    }

    /// Dry-run never writes processing state, so repeated dry runs start
    /// from the same place.
    fn persist(&self, entry: &CacheEntry) -> Result<()> {
        if self.publisher.is_dry_run() {
            return Ok(());
        }
        self.cache.put(entry)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Actor, CreatedIssue, WorkItem};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const DOC_URL: &str = "https://learn.example.com/docs/retries";
    const PAGE: &str = r#"<html><head>
        <meta name="original_content_git_url" content="https://github.com/octo/docs/blob/main/retries.md" />
        <meta name="ms.author" content="mruiz" />
        </head></html>"#;

    fn good_description() -> String {
        format!(
            "Nature of request: Modify existing docs\n\
             Link to doc: {DOC_URL}\n\
             Text to change: Retries are unlimited.\n\
             Proposed new text: Retries stop after four attempts."
        )
    }

    // -----------------------------------------------------------------------
    // Fakes
    // -----------------------------------------------------------------------

    #[derive(Default)]
    struct FakeTracker {
        ids: Vec<u64>,
        items: Vec<WorkItem>,
        hyperlinks: Mutex<Vec<(u64, String)>>,
        fail_hyperlinks: AtomicBool,
    }

    #[async_trait]
    impl TrackerApi for FakeTracker {
        async fn run_query(&self) -> Result<Vec<u64>> {
            Ok(self.ids.clone())
        }

        async fn get_items(&self, ids: &[u64]) -> Result<Vec<WorkItem>> {
            Ok(self
                .items
                .iter()
                .filter(|i| ids.contains(&i.id))
                .cloned()
                .collect())
        }

        async fn add_hyperlink(&self, work_item_id: u64, issue_url: &str) -> Result<()> {
            if self.fail_hyperlinks.load(Ordering::SeqCst) {
                return Err(BridgeError::UpstreamUnavailable("tracker down".into()));
            }
            self.hyperlinks
                .lock()
                .unwrap()
                .push((work_item_id, issue_url.to_string()));
            Ok(())
        }
    }

    struct FakeDocs {
        pages: HashMap<String, String>,
    }

    #[async_trait]
    impl DocumentHost for FakeDocs {
        async fn fetch_rendered(&self, url: &str) -> Result<String> {
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| BridgeError::NotFound(url.to_string()))
        }
    }

    #[derive(Default)]
    struct FakeSource {
        create_calls: AtomicUsize,
        fail_creates: AtomicUsize,
        /// Creates that commit on the host but lose their response.
        drop_responses: AtomicUsize,
        issues: Mutex<Vec<(CreatedIssue, String)>>,
        actors: Vec<Actor>,
    }

    #[async_trait]
    impl SourceHostApi for FakeSource {
        async fn repository_id(&self, _owner: &str, _repo: &str) -> Result<String> {
            Ok("R_1".to_string())
        }

        async fn create_issue(
            &self,
            _repository_id: &str,
            _title: &str,
            body: &str,
        ) -> Result<CreatedIssue> {
            if self.fail_creates.load(Ordering::SeqCst) > 0 {
                self.fail_creates.fetch_sub(1, Ordering::SeqCst);
                return Err(BridgeError::UpstreamUnavailable("503".into()));
            }
            let n = self.create_calls.fetch_add(1, Ordering::SeqCst) as u64 + 1;
            let issue = CreatedIssue {
                id: format!("I_{n}"),
                number: n,
                url: format!("https://github.com/octo/docs/issues/{n}"),
            };
            self.issues
                .lock()
                .unwrap()
                .push((issue.clone(), body.to_string()));
            if self.drop_responses.load(Ordering::SeqCst) > 0 {
                self.drop_responses.fetch_sub(1, Ordering::SeqCst);
                return Err(BridgeError::UpstreamUnavailable("response lost".into()));
            }
            Ok(issue)
        }

        async fn suggested_actors(&self, _owner: &str, _repo: &str) -> Result<Vec<Actor>> {
            Ok(self.actors.clone())
        }

        async fn assign_actor(&self, _issue_id: &str, _actor_id: &str) -> Result<()> {
            Ok(())
        }

        async fn find_issue_by_marker(
            &self,
            _owner: &str,
            _repo: &str,
            marker: &str,
        ) -> Result<Option<CreatedIssue>> {
            Ok(self
                .issues
                .lock()
                .unwrap()
                .iter()
                .find(|(_, body)| body.contains(marker))
                .map(|(issue, _)| issue.clone()))
        }
    }

    // -----------------------------------------------------------------------
    // Harness
    // -----------------------------------------------------------------------

    struct Harness {
        _dir: TempDir,
        orch: Arc<Orchestrator<Arc<FakeTracker>, FakeDocs, Arc<FakeSource>>>,
        tracker: Arc<FakeTracker>,
        source: Arc<FakeSource>,
    }

    fn harness_with(tracker: FakeTracker, source: FakeSource, dry_run: bool) -> Harness {
        let dir = TempDir::new().unwrap();
        let cache = CacheStore::open(&dir.path().join("cache.redb")).unwrap();
        let mut pages = HashMap::new();
        pages.insert(DOC_URL.to_string(), PAGE.to_string());
        let tracker = Arc::new(tracker);
        let source = Arc::new(source);
        let retry = RetryConfig {
            max_attempts: 3,
            backoff_base_ms: 10,
        };
        let orch = Orchestrator::new(
            Arc::clone(&tracker),
            DocumentResolver::new(FakeDocs { pages }, None),
            IssuePublisher::new(Arc::clone(&source), dry_run),
            cache,
            Arc::new(ProcessingLog::new()),
            retry,
            1,
        );
        Harness {
            _dir: dir,
            orch,
            tracker,
            source,
        }
    }

    fn harness(items: Vec<WorkItem>, dry_run: bool) -> Harness {
        let tracker = FakeTracker {
            ids: items.iter().map(|i| i.id).collect(),
            items,
            ..Default::default()
        };
        harness_with(tracker, FakeSource::default(), dry_run)
    }

    fn good_item(id: u64) -> WorkItem {
        WorkItem::new(id, format!("Fix docs {id}"), good_description())
    }

    // Arc delegation so fakes can be observed after being handed over.
    #[async_trait]
    impl TrackerApi for Arc<FakeTracker> {
        async fn run_query(&self) -> Result<Vec<u64>> {
            (**self).run_query().await
        }
        async fn get_items(&self, ids: &[u64]) -> Result<Vec<WorkItem>> {
            (**self).get_items(ids).await
        }
        async fn add_hyperlink(&self, work_item_id: u64, issue_url: &str) -> Result<()> {
            (**self).add_hyperlink(work_item_id, issue_url).await
        }
    }

    #[async_trait]
    impl SourceHostApi for Arc<FakeSource> {
        async fn repository_id(&self, owner: &str, repo: &str) -> Result<String> {
            (**self).repository_id(owner, repo).await
        }
        async fn create_issue(&self, r: &str, t: &str, b: &str) -> Result<CreatedIssue> {
            (**self).create_issue(r, t, b).await
        }
        async fn suggested_actors(&self, owner: &str, repo: &str) -> Result<Vec<Actor>> {
            (**self).suggested_actors(owner, repo).await
        }
        async fn assign_actor(&self, issue_id: &str, actor_id: &str) -> Result<()> {
            (**self).assign_actor(issue_id, actor_id).await
        }
        async fn find_issue_by_marker(
            &self,
            owner: &str,
            repo: &str,
            marker: &str,
        ) -> Result<Option<CreatedIssue>> {
            (**self).find_issue_by_marker(owner, repo, marker).await
        }
    }

    // -----------------------------------------------------------------------
    // Scenarios
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn happy_path_ends_linked_with_hyperlink() {
        let h = harness(vec![good_item(7)], false);
        h.orch.fetch().await.unwrap();
        let summary = h.orch.process_batch().await.unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.linked, 1);
        assert_eq!(h.source.create_calls.load(Ordering::SeqCst), 1);

        let entry = h.orch.cache().get(7).unwrap().unwrap();
        assert_eq!(entry.record.state, ItemState::Linked);
        assert!(entry.record.issue_url.is_some());

        let links = h.tracker.hyperlinks.lock().unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].0, 7);

        let issues = h.source.issues.lock().unwrap();
        assert!(issues[0].1.contains("AB#7"));
    }

    #[tokio::test]
    async fn parse_failure_skips_without_any_calls() {
        let item = WorkItem::new(3, "bad", "no recognizable fields here");
        let h = harness(vec![item], false);
        h.orch.fetch().await.unwrap();
        let summary = h.orch.process_batch().await.unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(h.source.create_calls.load(Ordering::SeqCst), 0);
        let entry = h.orch.cache().get(3).unwrap().unwrap();
        assert_eq!(entry.record.state, ItemState::Skipped);
        assert!(entry.record.last_error.is_some());
    }

    #[tokio::test]
    async fn missing_page_metadata_parks_item_unresolved() {
        let mut item = good_item(4);
        item.raw_description = item
            .raw_description
            .replace(DOC_URL, "https://learn.example.com/docs/gone");
        let h = harness(vec![item], false);
        h.orch.fetch().await.unwrap();
        let summary = h.orch.process_batch().await.unwrap();

        assert_eq!(summary.unresolved, 1);
        assert_eq!(h.source.create_calls.load(Ordering::SeqCst), 0);
        let entry = h.orch.cache().get(4).unwrap().unwrap();
        assert_eq!(entry.record.state, ItemState::Unresolved);
    }

    #[tokio::test]
    async fn second_run_is_idempotent() {
        let h = harness(vec![good_item(7)], false);
        h.orch.fetch().await.unwrap();
        h.orch.process_batch().await.unwrap();

        h.orch.fetch().await.unwrap();
        let second = h.orch.process_batch().await.unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(h.source.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lost_cache_suppresses_duplicate_create() {
        let h = harness(vec![good_item(7)], false);
        h.orch.fetch().await.unwrap();
        h.orch.process_batch().await.unwrap();
        assert_eq!(h.source.create_calls.load(Ordering::SeqCst), 1);

        // Operator wipes local state; the host still has the issue.
        h.orch.cache().clear().unwrap();
        h.orch.fetch().await.unwrap();
        let summary = h.orch.process_batch().await.unwrap();

        assert_eq!(summary.duplicates_suppressed, 1);
        assert_eq!(h.source.create_calls.load(Ordering::SeqCst), 1);
        let entry = h.orch.cache().get(7).unwrap().unwrap();
        assert_eq!(entry.record.state, ItemState::Linked);
    }

    #[tokio::test]
    async fn dry_run_mutates_nothing_and_matches_live_decisions() {
        let dry = harness(vec![good_item(7)], true);
        dry.orch.fetch().await.unwrap();
        let dry_summary = dry.orch.process_batch().await.unwrap();

        assert_eq!(dry_summary.linked, 1);
        assert_eq!(dry.source.create_calls.load(Ordering::SeqCst), 0);
        assert!(dry.tracker.hyperlinks.lock().unwrap().is_empty());
        let entry = dry.orch.cache().get(7).unwrap().unwrap();
        assert_eq!(entry.record.state, ItemState::Fetched);
        assert!(entry.record.issue_url.is_none());

        // The would-be payload is logged in full, not just its title.
        let payload_logged = dry.orch.log().snapshot().iter().any(|e| {
            e.kind == LogKind::Call
                && e.message.contains(r#""repository":"octo/docs""#)
                && e.message.contains(r#""title":"[AB#7] Fix docs 7""#)
                && e.message.contains("AB#7")
        });
        assert!(payload_logged);

        let live = harness(vec![good_item(7)], false);
        live.orch.fetch().await.unwrap();
        live.orch.process_batch().await.unwrap();

        assert_eq!(dry.orch.log().decisions(), live.orch.log().decisions());
    }

    #[tokio::test]
    async fn pending_recovery_finds_existing_issue() {
        let h = harness(vec![good_item(7)], false);
        h.orch.fetch().await.unwrap();
        h.orch.process_batch().await.unwrap();

        // Simulate a crash right after the create reached the host: rewind
        // the record to IssuePending with no issue_url.
        let mut entry = h.orch.cache().get(7).unwrap().unwrap();
        entry.record.transition(ItemState::IssuePending);
        entry.record.issue_url = None;
        h.orch.cache().put(&entry).unwrap();
        h.tracker.hyperlinks.lock().unwrap().clear();

        let summary = h.orch.process_batch().await.unwrap();
        assert_eq!(summary.linked, 1);
        // Recovery found the marker instead of creating a second issue.
        assert_eq!(h.source.create_calls.load(Ordering::SeqCst), 1);
        let entry = h.orch.cache().get(7).unwrap().unwrap();
        assert_eq!(entry.record.state, ItemState::Linked);
        assert!(entry.record.issue_url.is_some());
    }

    #[tokio::test]
    async fn pending_recovery_creates_when_nothing_reached_host() {
        let h = harness(vec![good_item(7)], false);
        h.orch.fetch().await.unwrap();

        let mut entry = h.orch.cache().get(7).unwrap().unwrap();
        // Entry must be parsed/resolved for the pending arm to have a target.
        h.orch.process_batch().await.unwrap();
        entry = h.orch.cache().get(7).unwrap().unwrap();
        assert_eq!(entry.record.state, ItemState::Linked);

        // Wipe the host side and rewind: the create never happened.
        h.source.issues.lock().unwrap().clear();
        h.source.create_calls.store(0, Ordering::SeqCst);
        entry.record.transition(ItemState::IssuePending);
        entry.record.issue_url = None;
        h.orch.cache().put(&entry).unwrap();

        let summary = h.orch.process_batch().await.unwrap();
        assert_eq!(summary.linked, 1);
        assert_eq!(h.source.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_create_failure_retries_to_success() {
        let tracker = FakeTracker {
            ids: vec![7],
            items: vec![good_item(7)],
            ..Default::default()
        };
        let source = FakeSource {
            fail_creates: AtomicUsize::new(2),
            ..Default::default()
        };
        let h = harness_with(tracker, source, false);
        h.orch.fetch().await.unwrap();
        let summary = h.orch.process_batch().await.unwrap();

        assert_eq!(summary.linked, 1);
        assert_eq!(h.source.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_create_response_does_not_double_create() {
        let tracker = FakeTracker {
            ids: vec![7],
            items: vec![good_item(7)],
            ..Default::default()
        };
        // The create commits on the host, but the response never arrives.
        let source = FakeSource {
            drop_responses: AtomicUsize::new(1),
            ..Default::default()
        };
        let h = harness_with(tracker, source, false);
        h.orch.fetch().await.unwrap();
        let summary = h.orch.process_batch().await.unwrap();

        assert_eq!(summary.linked, 1);
        // The retry found the committed issue instead of creating another.
        assert_eq!(h.source.issues.lock().unwrap().len(), 1);
        let entry = h.orch.cache().get(7).unwrap().unwrap();
        assert_eq!(entry.record.state, ItemState::Linked);
        assert!(entry.record.issue_url.is_some());
        assert_eq!(h.tracker.hyperlinks.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_mark_item_failed() {
        let tracker = FakeTracker {
            ids: vec![7],
            items: vec![good_item(7)],
            ..Default::default()
        };
        let source = FakeSource {
            fail_creates: AtomicUsize::new(100),
            ..Default::default()
        };
        let h = harness_with(tracker, source, false);
        h.orch.fetch().await.unwrap();
        let summary = h.orch.process_batch().await.unwrap();

        assert_eq!(summary.failed, 1);
        let entry = h.orch.cache().get(7).unwrap().unwrap();
        assert_eq!(entry.record.state, ItemState::Failed);
        assert!(entry.record.last_error.is_some());
        assert_eq!(entry.record.attempt_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn link_back_failure_keeps_issue_created_then_resumes() {
        let h = harness(vec![good_item(7)], false);
        h.tracker.fail_hyperlinks.store(true, Ordering::SeqCst);
        h.orch.fetch().await.unwrap();
        let summary = h.orch.process_batch().await.unwrap();

        assert_eq!(summary.failed, 1);
        let entry = h.orch.cache().get(7).unwrap().unwrap();
        assert_eq!(entry.record.state, ItemState::IssueCreated);
        assert!(entry.record.issue_url.is_some());
        assert_eq!(h.source.create_calls.load(Ordering::SeqCst), 1);

        // Tracker comes back; the next batch finishes linking without a
        // second create.
        h.tracker.fail_hyperlinks.store(false, Ordering::SeqCst);
        let summary = h.orch.process_batch().await.unwrap();
        assert_eq!(summary.linked, 1);
        assert_eq!(h.source.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.tracker.hyperlinks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reset_failed_reenters_state_machine() {
        let tracker = FakeTracker {
            ids: vec![7],
            items: vec![good_item(7)],
            ..Default::default()
        };
        let source = FakeSource::default();
        let h = harness_with(tracker, source, false);
        h.orch.fetch().await.unwrap();

        let mut entry = h.orch.cache().get(7).unwrap().unwrap();
        entry.record.transition(ItemState::Failed);
        entry.record.record_error("boom");
        h.orch.cache().put(&entry).unwrap();

        assert_eq!(h.orch.reset_failed().unwrap(), 1);
        let summary = h.orch.process_batch().await.unwrap();
        assert_eq!(summary.linked, 1);
    }

    #[tokio::test]
    async fn process_one_leaves_other_items_alone() {
        let h = harness(vec![good_item(7), good_item(8)], false);
        h.orch.fetch().await.unwrap();
        let summary = h.orch.process_one(7).await.unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.linked, 1);
        assert_eq!(
            h.orch.cache().get(7).unwrap().unwrap().record.state,
            ItemState::Linked
        );
        assert_eq!(
            h.orch.cache().get(8).unwrap().unwrap().record.state,
            ItemState::Fetched
        );

        let err = h.orch.process_one(99).await.unwrap_err();
        assert!(matches!(err, BridgeError::ItemNotCached(99)));
    }

    #[tokio::test]
    async fn mixed_batch_counts_every_bucket() {
        let items = vec![
            good_item(1),
            WorkItem::new(2, "bad", "nothing parseable"),
            {
                let mut i = good_item(3);
                i.raw_description = i
                    .raw_description
                    .replace(DOC_URL, "https://learn.example.com/docs/missing");
                i
            },
        ];
        let h = harness(items, false);
        h.orch.fetch().await.unwrap();
        let summary = h.orch.process_batch().await.unwrap();

        assert_eq!(summary.processed, 3);
        assert_eq!(summary.linked, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.unresolved, 1);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn events_follow_state_transitions() {
        let h = harness(vec![good_item(7)], false);
        let mut rx = h.orch.subscribe();
        h.orch.fetch().await.unwrap();
        h.orch.process_batch().await.unwrap();

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let BridgeEvent::StateChanged { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                ItemState::Parsed,
                ItemState::Resolved,
                ItemState::IssuePending,
                ItemState::IssueCreated,
                ItemState::Linked,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_backs_off_then_succeeds() {
        let retry = RetryConfig {
            max_attempts: 3,
            backoff_base_ms: 100,
        };
        let cancel = AtomicBool::new(false);
        let calls = AtomicUsize::new(0);
        let result = with_retry(&retry, &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BridgeError::UpstreamUnavailable("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_retry_does_not_retry_non_retryable() {
        let retry = RetryConfig::default();
        let cancel = AtomicBool::new(false);
        let calls = AtomicUsize::new(0);
        let err = with_retry(&retry, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(BridgeError::NotFound("gone".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_auth_error_aborts_batch() {
        struct DenyingSource;

        #[async_trait]
        impl SourceHostApi for DenyingSource {
            async fn repository_id(&self, _: &str, _: &str) -> Result<String> {
                Err(BridgeError::AuthorizationDenied("bad token".into()))
            }
            async fn create_issue(&self, _: &str, _: &str, _: &str) -> Result<CreatedIssue> {
                Err(BridgeError::AuthorizationDenied("bad token".into()))
            }
            async fn suggested_actors(&self, _: &str, _: &str) -> Result<Vec<Actor>> {
                Ok(vec![])
            }
            async fn assign_actor(&self, _: &str, _: &str) -> Result<()> {
                Ok(())
            }
            async fn find_issue_by_marker(
                &self,
                _: &str,
                _: &str,
                _: &str,
            ) -> Result<Option<CreatedIssue>> {
                Err(BridgeError::AuthorizationDenied("bad token".into()))
            }
        }

        let dir = TempDir::new().unwrap();
        let cache = CacheStore::open(&dir.path().join("cache.redb")).unwrap();
        let mut pages = HashMap::new();
        pages.insert(DOC_URL.to_string(), PAGE.to_string());
        let tracker = Arc::new(FakeTracker {
            ids: vec![7],
            items: vec![good_item(7)],
            ..Default::default()
        });
        let orch = Orchestrator::new(
            Arc::clone(&tracker),
            DocumentResolver::new(FakeDocs { pages }, None),
            IssuePublisher::new(DenyingSource, false),
            cache,
            Arc::new(ProcessingLog::new()),
            RetryConfig::default(),
            1,
        );
        orch.fetch().await.unwrap();
        let err = orch.process_batch().await.unwrap_err();
        assert!(err.is_fatal());
    }
}
