//! Issue creation on the source host.
//!
//! `GitHubClient` speaks GraphQL. `IssuePublisher` sits above it and owns
//! the dry-run split: in dry-run mode it assembles the exact payload a live
//! run would send and returns it without touching the network, so both
//! modes share every decision up to the mutation boundary.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::content;
use crate::error::{BridgeError, Result};
use crate::types::{Actor, CreatedIssue, ResolvedTarget, WorkItem};

// ---------------------------------------------------------------------------
// SourceHostApi
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SourceHostApi: Send + Sync {
    async fn repository_id(&self, owner: &str, repo: &str) -> Result<String>;

    async fn create_issue(
        &self,
        repository_id: &str,
        title: &str,
        body: &str,
    ) -> Result<CreatedIssue>;

    /// Actors the repository accepts as assignees.
    async fn suggested_actors(&self, owner: &str, repo: &str) -> Result<Vec<Actor>>;

    async fn assign_actor(&self, issue_id: &str, actor_id: &str) -> Result<()>;

    /// Searches open and closed issues whose body contains the marker.
    async fn find_issue_by_marker(
        &self,
        owner: &str,
        repo: &str,
        marker: &str,
    ) -> Result<Option<CreatedIssue>>;
}

// ---------------------------------------------------------------------------
// GitHubClient
// ---------------------------------------------------------------------------

pub struct GitHubClient {
    http: reqwest::Client,
    graphql_url: String,
    token: String,
}

impl GitHubClient {
    pub fn new(
        graphql_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("docbridge")
            .build()
            .map_err(|e| BridgeError::from_transport(e, "source host client"))?;
        Ok(Self {
            http,
            graphql_url: graphql_url.into(),
            token: token.into(),
        })
    }

    async fn run(&self, query: &str, variables: Value, context: &str) -> Result<Value> {
        let resp = self
            .http
            .post(&self.graphql_url)
            .bearer_auth(&self.token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| BridgeError::from_transport(e, context))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BridgeError::from_status(status.as_u16(), context));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| BridgeError::from_transport(e, context))?;

        if let Some(errors) = body.get("errors").and_then(Value::as_array) {
            if let Some(first) = errors.first() {
                let kind = first.get("type").and_then(Value::as_str).unwrap_or("");
                let message = first
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown GraphQL error");
                return Err(match kind {
                    "FORBIDDEN" => {
                        BridgeError::PermissionDenied(format!("{context}: {message}"))
                    }
                    "NOT_FOUND" => BridgeError::NotFound(format!("{context}: {message}")),
                    _ => BridgeError::MalformedPayload(format!("{context}: {message}")),
                });
            }
        }
        body.get("data").cloned().ok_or_else(|| {
            BridgeError::MalformedPayload(format!("{context}: response has no data"))
        })
    }
}

#[async_trait]
impl SourceHostApi for GitHubClient {
    async fn repository_id(&self, owner: &str, repo: &str) -> Result<String> {
        let data = self
            .run(
                "query($owner: String!, $name: String!) { \
                   repository(owner: $owner, name: $name) { id } }",
                json!({ "owner": owner, "name": repo }),
                "look up repository",
            )
            .await?;
        data.pointer("/repository/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BridgeError::NotFound(format!("repository {owner}/{repo}")))
    }

    async fn create_issue(
        &self,
        repository_id: &str,
        title: &str,
        body: &str,
    ) -> Result<CreatedIssue> {
        let data = self
            .run(
                "mutation($repositoryId: ID!, $title: String!, $body: String!) { \
                   createIssue(input: {repositoryId: $repositoryId, title: $title, body: $body}) { \
                     issue { id number url } } }",
                json!({ "repositoryId": repository_id, "title": title, "body": body }),
                "create issue",
            )
            .await?;
        let issue = data.pointer("/createIssue/issue").ok_or_else(|| {
            BridgeError::MalformedPayload("create issue: response has no issue".to_string())
        })?;
        issue_from_node(issue).ok_or_else(|| {
            BridgeError::MalformedPayload("create issue: incomplete issue node".to_string())
        })
    }

    async fn suggested_actors(&self, owner: &str, repo: &str) -> Result<Vec<Actor>> {
        let data = self
            .run(
                "query($owner: String!, $name: String!) { \
                   repository(owner: $owner, name: $name) { \
                     suggestedActors(capabilities: [CAN_BE_ASSIGNED], first: 100) { \
                       nodes { login ... on User { id } ... on Bot { id } } } } }",
                json!({ "owner": owner, "name": repo }),
                "list suggested actors",
            )
            .await?;
        let nodes = data
            .pointer("/repository/suggestedActors/nodes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(nodes
            .iter()
            .filter_map(|n| {
                Some(Actor {
                    id: n.get("id")?.as_str()?.to_string(),
                    login: n.get("login")?.as_str()?.to_string(),
                })
            })
            .collect())
    }

    async fn assign_actor(&self, issue_id: &str, actor_id: &str) -> Result<()> {
        self.run(
            "mutation($assignableId: ID!, $actorIds: [ID!]!) { \
               replaceActorsForAssignable(input: {assignableId: $assignableId, actorIds: $actorIds}) { \
                 assignable { ... on Issue { id } } } }",
            json!({ "assignableId": issue_id, "actorIds": [actor_id] }),
            "assign actor",
        )
        .await?;
        Ok(())
    }

    async fn find_issue_by_marker(
        &self,
        owner: &str,
        repo: &str,
        marker: &str,
    ) -> Result<Option<CreatedIssue>> {
        let search = format!("repo:{owner}/{repo} is:issue in:body \"{marker}\"");
        let data = self
            .run(
                "query($q: String!) { \
                   search(query: $q, type: ISSUE, first: 10) { \
                     nodes { ... on Issue { id number url body } } } }",
                json!({ "q": search }),
                "search for existing issue",
            )
            .await?;
        let nodes = data
            .pointer("/search/nodes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        // Search tokenization is loose, so confirm the literal marker.
        Ok(nodes
            .iter()
            .find(|n| {
                n.get("body")
                    .and_then(Value::as_str)
                    .is_some_and(|b| body_has_marker(b, marker))
            })
            .and_then(issue_from_node))
    }
}

/// True when `body` contains `marker` not followed by another digit, so
/// `AB#12` does not match inside `AB#120`.
fn body_has_marker(body: &str, marker: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = body[start..].find(marker) {
        let end = start + pos + marker.len();
        if !body[end..].starts_with(|c: char| c.is_ascii_digit()) {
            return true;
        }
        start = end;
    }
    false
}

fn issue_from_node(node: &Value) -> Option<CreatedIssue> {
    Some(CreatedIssue {
        id: node.get("id")?.as_str()?.to_string(),
        number: node.get("number")?.as_u64()?,
        url: node.get("url")?.as_str()?.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Actor selection
// ---------------------------------------------------------------------------

/// Logins tried in order before falling back to a substring match.
const PREFERRED_LOGINS: [&str; 3] = ["copilot-swe-agent", "copilot", "github-copilot"];

/// Picks the coding agent among assignable actors, if the repository has
/// one enabled.
pub fn pick_agent(actors: &[Actor]) -> Option<&Actor> {
    for preferred in PREFERRED_LOGINS {
        if let Some(actor) = actors
            .iter()
            .find(|a| a.login.eq_ignore_ascii_case(preferred))
        {
            return Some(actor);
        }
    }
    actors
        .iter()
        .find(|a| a.login.to_ascii_lowercase().contains("copilot"))
}

// ---------------------------------------------------------------------------
// IssuePublisher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    /// `None` in dry-run mode.
    pub issue: Option<CreatedIssue>,
    /// The payload a live run sends, kept for logging in both modes.
    pub payload: Value,
}

pub struct IssuePublisher<S> {
    host: S,
    dry_run: bool,
}

impl<S: SourceHostApi> IssuePublisher<S> {
    pub fn new(host: S, dry_run: bool) -> Self {
        Self { host, dry_run }
    }

    pub fn host(&self) -> &S {
        &self.host
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub async fn publish(&self, item: &WorkItem, target: &ResolvedTarget) -> Result<PublishOutcome> {
        let title = content::issue_title(item);
        let body = content::issue_body(item, target);
        let payload = json!({
            "repository": target.slug(),
            "title": title,
            "body": body,
        });

        if self.dry_run {
            return Ok(PublishOutcome {
                issue: None,
                payload,
            });
        }

        let repository_id = self.host.repository_id(&target.owner, &target.repo).await?;
        let issue = self.host.create_issue(&repository_id, &title, &body).await?;
        Ok(PublishOutcome {
            issue: Some(issue),
            payload,
        })
    }

    /// Assigns the repository's coding agent to the issue when one exists.
    /// Returns the assigned login. Assignment is optional, so callers treat
    /// an error here as a warning rather than an item failure.
    pub async fn assign_agent(
        &self,
        target: &ResolvedTarget,
        issue: &CreatedIssue,
    ) -> Result<Option<String>> {
        if self.dry_run {
            return Ok(None);
        }
        let actors = self.host.suggested_actors(&target.owner, &target.repo).await?;
        let Some(agent) = pick_agent(&actors) else {
            return Ok(None);
        };
        self.host.assign_actor(&issue.id, &agent.id).await?;
        Ok(Some(agent.login.clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
