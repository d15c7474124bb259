//! Target repository resolution.
//!
//! A published documentation page embeds meta tags pointing back at the
//! source file in git and the page owner. `DocumentResolver` fetches the
//! rendered page, reads those tags and decides which `owner/repo` should
//! receive the issue. Semantic failures (missing tags, non-GitHub source)
//! come back as `ResolveOutcome::Unresolved` so the orchestrator can park
//! the item instead of retrying it.

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::error::{BridgeError, Result};
use crate::types::{ResolvedTarget, WorkItem};

// ---------------------------------------------------------------------------
// DocumentHost
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DocumentHost: Send + Sync {
    /// Fetches the rendered HTML of a documentation page.
    async fn fetch_rendered(&self, url: &str) -> Result<String>;
}

pub struct HttpDocumentHost {
    http: reqwest::Client,
}

/// Some documentation hosts refuse requests with an obvious bot agent.
const USER_AGENT: &str = "Mozilla/5.0 (compatible; docbridge)";

impl HttpDocumentHost {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| BridgeError::from_transport(e, "document host client"))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl DocumentHost for HttpDocumentHost {
    async fn fetch_rendered(&self, url: &str) -> Result<String> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| BridgeError::from_transport(e, "fetch document page"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BridgeError::from_status(status.as_u16(), "fetch document page"));
        }
        resp.text()
            .await
            .map_err(|e| BridgeError::from_transport(e, "fetch document page"))
    }
}

// ---------------------------------------------------------------------------
// ResolveOutcome / ResolveFailure
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved(ResolvedTarget),
    Unresolved(ResolveFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveFailure {
    /// Parsing produced no document link to follow.
    NoDocUrl,
    /// The page has no source-url meta tag.
    MissingSourceTag,
    /// The source url points somewhere other than GitHub.
    NotGitHub(String),
    /// The source url path is too short to name owner and repository.
    BadRepoPath(String),
}

impl fmt::Display for ResolveFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveFailure::NoDocUrl => write!(f, "work item has no document link"),
            ResolveFailure::MissingSourceTag => {
                write!(f, "page has no original_content_git_url meta tag")
            }
            ResolveFailure::NotGitHub(url) => write!(f, "source url is not on github.com: {url}"),
            ResolveFailure::BadRepoPath(url) => {
                write!(f, "source url does not name owner/repo: {url}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Meta tag extraction
// ---------------------------------------------------------------------------

fn meta_regexes(name: &'static str) -> &'static [Regex; 2] {
    // name-first and content-first attribute orders both occur in the wild.
    static SOURCE: OnceLock<[Regex; 2]> = OnceLock::new();
    static AUTHOR: OnceLock<[Regex; 2]> = OnceLock::new();
    let cell = match name {
        "original_content_git_url" => &SOURCE,
        _ => &AUTHOR,
    };
    cell.get_or_init(|| {
        let name_first = format!(
            r#"(?i)<meta[^>]*\bname\s*=\s*["']{name}["'][^>]*\bcontent\s*=\s*["']([^"']+)["']"#
        );
        let content_first = format!(
            r#"(?i)<meta[^>]*\bcontent\s*=\s*["']([^"']+)["'][^>]*\bname\s*=\s*["']{name}["']"#
        );
        [
            Regex::new(&name_first).unwrap(),
            Regex::new(&content_first).unwrap(),
        ]
    })
}

pub fn extract_meta(html: &str, name: &'static str) -> Option<String> {
    meta_regexes(name)
        .iter()
        .find_map(|re| re.captures(html))
        .map(|c| c[1].trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Looser match for pages that carry the source url in embedded JSON or
/// script config rather than a meta tag.
fn source_url_fallback(html: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r#"(?i)original_content_git_url["']?\s*[:=]\s*["']?(https?://[^"'<>\s]+)"#)
            .unwrap()
    });
    re.captures(html).map(|c| c[1].to_string())
}

/// Splits a GitHub blob URL into owner and repository.
fn owner_repo_from(source_url: &str) -> std::result::Result<(String, String), ResolveFailure> {
    let rest = source_url
        .strip_prefix("https://")
        .or_else(|| source_url.strip_prefix("http://"))
        .ok_or_else(|| ResolveFailure::NotGitHub(source_url.to_string()))?;
    let mut segments = rest.split('/').filter(|s| !s.is_empty());
    let host = segments
        .next()
        .ok_or_else(|| ResolveFailure::NotGitHub(source_url.to_string()))?;
    if !host.eq_ignore_ascii_case("github.com") {
        return Err(ResolveFailure::NotGitHub(source_url.to_string()));
    }
    let owner = segments
        .next()
        .ok_or_else(|| ResolveFailure::BadRepoPath(source_url.to_string()))?;
    let repo = segments
        .next()
        .ok_or_else(|| ResolveFailure::BadRepoPath(source_url.to_string()))?;
    let repo = repo.trim_end_matches(".git");
    if owner.is_empty() || repo.is_empty() {
        return Err(ResolveFailure::BadRepoPath(source_url.to_string()));
    }
    Ok((owner.to_string(), repo.to_string()))
}

// ---------------------------------------------------------------------------
// DocumentResolver
// ---------------------------------------------------------------------------

pub struct DocumentResolver<H> {
    host: H,
    repo_override: Option<(String, String)>,
}

impl<H: DocumentHost> DocumentResolver<H> {
    pub fn new(host: H, repo_override: Option<String>) -> Self {
        let repo_override = repo_override.and_then(|slug| {
            let (owner, repo) = slug.split_once('/')?;
            Some((owner.to_string(), repo.to_string()))
        });
        Self {
            host,
            repo_override,
        }
    }

    /// Errors propagate only for transport and permission problems, which
    /// the caller may retry. Everything decidable from page content comes
    /// back as an outcome.
    pub async fn resolve(&self, item: &WorkItem) -> Result<ResolveOutcome> {
        let doc_url = match &item.doc_url {
            Some(url) => url,
            None => return Ok(ResolveOutcome::Unresolved(ResolveFailure::NoDocUrl)),
        };

        if let Some((owner, repo)) = &self.repo_override {
            return Ok(ResolveOutcome::Resolved(ResolvedTarget {
                owner: owner.clone(),
                repo: repo.clone(),
                source_doc_url: doc_url.clone(),
                author: item.discovered_author.clone(),
            }));
        }

        let html = match self.host.fetch_rendered(doc_url).await {
            Ok(html) => html,
            // A page that no longer exists cannot be resolved, ever.
            Err(BridgeError::NotFound(_)) => {
                return Ok(ResolveOutcome::Unresolved(ResolveFailure::MissingSourceTag))
            }
            Err(e) => return Err(e),
        };

        let source_url = match extract_meta(&html, "original_content_git_url")
            .or_else(|| source_url_fallback(&html))
        {
            Some(url) => url,
            None => return Ok(ResolveOutcome::Unresolved(ResolveFailure::MissingSourceTag)),
        };
        let author = extract_meta(&html, "ms.author").or_else(|| item.discovered_author.clone());

        match owner_repo_from(&source_url) {
            Ok((owner, repo)) => Ok(ResolveOutcome::Resolved(ResolvedTarget {
                owner,
                repo,
                source_doc_url: source_url,
                author,
            })),
            Err(failure) => Ok(ResolveOutcome::Unresolved(failure)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
