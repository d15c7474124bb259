pub mod cache;
pub mod fetch;
pub mod init;
pub mod log;
pub mod process;
pub mod state;

use anyhow::Context;
use docbridge_core::cache::CacheStore;
use docbridge_core::config::{Config, WarnLevel};
use docbridge_core::log::ProcessingLog;
use docbridge_core::orchestrator::Orchestrator;
use docbridge_core::paths;
use docbridge_core::publisher::{GitHubClient, IssuePublisher};
use docbridge_core::resolver::{DocumentResolver, HttpDocumentHost};
use docbridge_core::tracker::{QueryLocator, TrackerClient};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const ADO_PAT_VAR: &str = "DOCBRIDGE_ADO_PAT";
pub const GITHUB_TOKEN_VAR: &str = "DOCBRIDGE_GITHUB_TOKEN";

type LiveOrchestrator = Orchestrator<TrackerClient, HttpDocumentHost, GitHubClient>;

/// Builds the full pipeline from config plus credential env vars.
///
/// The GitHub token is only demanded when the command can reach the issue
/// mutation path; `fetch` runs with the tracker credential alone.
pub(crate) fn build(
    root: &Path,
    dry_run_flag: bool,
    require_github: bool,
) -> anyhow::Result<(Arc<LiveOrchestrator>, Config)> {
    let config = Config::load(root)?;
    let mut blocked = false;
    for warning in config.validate() {
        match warning.level {
            WarnLevel::Error => {
                tracing::error!("config: {}", warning.message);
                blocked = true;
            }
            WarnLevel::Warning => tracing::warn!("config: {}", warning.message),
        }
    }
    if blocked {
        anyhow::bail!("configuration is invalid, see errors above");
    }

    let pat = std::env::var(ADO_PAT_VAR)
        .with_context(|| format!("{ADO_PAT_VAR} is not set (tracker personal access token)"))?;
    let token = if require_github {
        std::env::var(GITHUB_TOKEN_VAR)
            .with_context(|| format!("{GITHUB_TOKEN_VAR} is not set (GitHub token)"))?
    } else {
        std::env::var(GITHUB_TOKEN_VAR).unwrap_or_default()
    };

    let dry_run = dry_run_flag || config.dry_run;
    let timeout = Duration::from_secs(config.request_timeout_secs);
    let locator = QueryLocator::parse(&config.tracker.query_url)?;

    let tracker = TrackerClient::new(&config.tracker.base_url, locator, pat, timeout)?;
    let resolver = DocumentResolver::new(
        HttpDocumentHost::new(timeout)?,
        config.source_host.repo_override.clone(),
    );
    let publisher = IssuePublisher::new(
        GitHubClient::new(&config.source_host.graphql_url, token, timeout)?,
        dry_run,
    );
    let cache = CacheStore::open(&paths::cache_path(root))?;
    let log = Arc::new(ProcessingLog::with_file(paths::log_path(root)));

    let orchestrator = Orchestrator::new(
        tracker,
        resolver,
        publisher,
        cache,
        log,
        config.retry.clone(),
        config.worker_count,
    );
    Ok((orchestrator, config))
}
