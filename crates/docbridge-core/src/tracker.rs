//! Work item tracker access.
//!
//! `QueryLocator` turns the saved-query URL a user pastes from their browser
//! into the pieces the REST API needs. `TrackerClient` runs the query, pulls
//! work item fields in batches, and writes the back-link once an issue
//! exists. Everything goes through the `TrackerApi` trait so the
//! orchestrator can be tested against a fake.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{BridgeError, Result};
use crate::types::WorkItem;

const API_VERSION: &str = "7.1";
/// The batch endpoint caps ids per request.
const BATCH_SIZE: usize = 200;

// ---------------------------------------------------------------------------
// QueryLocator
// ---------------------------------------------------------------------------

/// Organization, project and query id extracted from a saved-query URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryLocator {
    pub organization: String,
    pub project: String,
    pub query_id: Uuid,
}

impl QueryLocator {
    /// Accepts the two URL shapes the tracker produces:
    ///
    /// * `https://dev.azure.com/{org}/{project}/_queries/query/{id}`
    /// * `https://{org}.visualstudio.com/{project}/_queries/query/{id}`
    ///
    /// plus the `query-edit` path variant and a `?queryId={id}` (or `?id=`)
    /// query parameter in place of the path segment.
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = || BridgeError::InvalidQueryLocator(url.to_string());

        let rest = url
            .trim()
            .strip_prefix("https://")
            .or_else(|| url.trim().strip_prefix("http://"))
            .ok_or_else(invalid)?;

        let (host_and_path, query_string) = match rest.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (rest, None),
        };
        let mut segments = host_and_path.split('/');
        let host = segments.next().ok_or_else(invalid)?;
        let segments: Vec<&str> = segments.filter(|s| !s.is_empty()).collect();

        let (organization, project, path_tail) = if host.eq_ignore_ascii_case("dev.azure.com") {
            if segments.len() < 2 {
                return Err(invalid());
            }
            (
                segments[0].to_string(),
                segments[1].to_string(),
                &segments[2..],
            )
        } else if let Some(org) = host
            .strip_suffix(".visualstudio.com")
            .filter(|org| !org.is_empty())
        {
            if segments.is_empty() {
                return Err(invalid());
            }
            (org.to_string(), segments[0].to_string(), &segments[1..])
        } else {
            return Err(invalid());
        };

        // Prefer an explicit query parameter, then the path segment after
        // `_queries/query` or `_queries/query-edit`.
        let id_str = query_string
            .and_then(find_id_param)
            .or_else(|| id_from_path(path_tail))
            .ok_or_else(invalid)?;
        let query_id = Uuid::parse_str(id_str).map_err(|_| invalid())?;

        Ok(Self {
            organization,
            project,
            query_id,
        })
    }
}

fn find_id_param(query_string: &str) -> Option<&str> {
    query_string.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key.eq_ignore_ascii_case("queryId") || key.eq_ignore_ascii_case("id") {
            Some(value)
        } else {
            None
        }
    })
}

fn id_from_path<'a>(segments: &[&'a str]) -> Option<&'a str> {
    let mut iter = segments.iter();
    while let Some(seg) = iter.next() {
        if seg.eq_ignore_ascii_case("_queries") {
            let kind = iter.next()?;
            if kind.eq_ignore_ascii_case("query") || kind.eq_ignore_ascii_case("query-edit") {
                return iter.next().copied();
            }
            return None;
        }
    }
    None
}

/// Rewrites the REST resource URL the API returns into the page a human
/// can open (`/_apis/wit/workItems/{id}` -> `/_workitems/edit/{id}`).
pub fn api_url_to_web(api_url: &str) -> String {
    api_url
        .replace("/_apis/wit/workItems/", "/_workitems/edit/")
        .replace("/_apis/wit/workitems/", "/_workitems/edit/")
}

// ---------------------------------------------------------------------------
// TrackerApi
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TrackerApi: Send + Sync {
    /// Runs the saved query and returns the matching work item ids.
    async fn run_query(&self) -> Result<Vec<u64>>;

    /// Fetches full work items for the given ids, preserving input order.
    async fn get_items(&self, ids: &[u64]) -> Result<Vec<WorkItem>>;

    /// Adds a hyperlink relation pointing at the created issue.
    async fn add_hyperlink(&self, work_item_id: u64, issue_url: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// TrackerClient
// ---------------------------------------------------------------------------

pub struct TrackerClient {
    http: reqwest::Client,
    base_url: String,
    locator: QueryLocator,
    pat: String,
}

impl TrackerClient {
    pub fn new(
        base_url: impl Into<String>,
        locator: QueryLocator,
        pat: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::from_transport(e, "tracker client"))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            locator,
            pat: pat.into(),
        })
    }

    fn project_api(&self, tail: &str) -> String {
        format!(
            "{}/{}/{}/_apis/wit/{}",
            self.base_url, self.locator.organization, self.locator.project, tail
        )
    }

    async fn get_json(&self, url: &str, context: &str) -> Result<Value> {
        let resp = self
            .http
            .get(url)
            .basic_auth("", Some(&self.pat))
            .send()
            .await
            .map_err(|e| BridgeError::from_transport(e, context))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BridgeError::from_status(status.as_u16(), context));
        }
        resp.json()
            .await
            .map_err(|e| BridgeError::from_transport(e, context))
    }

    fn item_from_value(value: &Value) -> Option<WorkItem> {
        let id = value.get("id")?.as_u64()?;
        let fields = value.get("fields")?;
        let title = fields
            .get("System.Title")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let description = fields
            .get("System.Description")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let mut item = WorkItem::new(id, title, description);
        item.source_url = value
            .get("url")
            .and_then(Value::as_str)
            .map(api_url_to_web);
        Some(item)
    }
}

#[async_trait]
impl TrackerApi for TrackerClient {
    async fn run_query(&self) -> Result<Vec<u64>> {
        let url = format!(
            "{}?api-version={}",
            self.project_api(&format!("wiql/{}", self.locator.query_id)),
            API_VERSION
        );
        let body = self.get_json(&url, "run query").await?;
        let ids = body
            .get("workItems")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                BridgeError::MalformedPayload("query result has no workItems array".to_string())
            })?
            .iter()
            .filter_map(|w| w.get("id").and_then(Value::as_u64))
            .collect();
        Ok(ids)
    }

    async fn get_items(&self, ids: &[u64]) -> Result<Vec<WorkItem>> {
        let mut items = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(BATCH_SIZE) {
            let joined = chunk
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let url = format!(
                "{}?ids={}&$expand=fields&api-version={}",
                self.project_api("workitems"),
                joined,
                API_VERSION
            );
            let body = self.get_json(&url, "fetch work items").await?;
            let values = body.get("value").and_then(Value::as_array).ok_or_else(|| {
                BridgeError::MalformedPayload("work item batch has no value array".to_string())
            })?;
            for value in values {
                if let Some(item) = Self::item_from_value(value) {
                    items.push(item);
                }
            }
        }
        Ok(items)
    }

    async fn add_hyperlink(&self, work_item_id: u64, issue_url: &str) -> Result<()> {
        let url = format!(
            "{}?api-version={}",
            self.project_api(&format!("workitems/{work_item_id}")),
            API_VERSION
        );
        let patch = json!([{
            "op": "add",
            "path": "/relations/-",
            "value": {
                "rel": "Hyperlink",
                "url": issue_url,
                "attributes": { "comment": "Tracking issue" }
            }
        }]);
        let resp = self
            .http
            .patch(&url)
            .basic_auth("", Some(&self.pat))
            .header("Content-Type", "application/json-patch+json")
            .json(&patch)
            .send()
            .await
            .map_err(|e| BridgeError::from_transport(e, "add hyperlink"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BridgeError::from_status(status.as_u16(), "add hyperlink"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
