use crate::error::{BridgeError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_backoff_base_ms() -> u64 {
    500
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// TrackerConfig
// ---------------------------------------------------------------------------

/// Where the saved query lives and how to reach the work item tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// URL of the saved query whose results seed each batch.
    pub query_url: String,
    #[serde(default = "default_tracker_base_url")]
    pub base_url: String,
}

fn default_tracker_base_url() -> String {
    "https://dev.azure.com".to_string()
}

// ---------------------------------------------------------------------------
// SourceHostConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHostConfig {
    #[serde(default = "default_graphql_url")]
    pub graphql_url: String,
    /// Forces every item into one `owner/repo` target, skipping page
    /// metadata resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_override: Option<String>,
}

fn default_graphql_url() -> String {
    "https://api.github.com/graphql".to_string()
}

impl Default for SourceHostConfig {
    fn default() -> Self {
        Self {
            graphql_url: default_graphql_url(),
            repo_override: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub source_host: SourceHostConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub dry_run: bool,
}

fn default_version() -> u32 {
    1
}

fn default_worker_count() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Config {
    pub fn new(query_url: impl Into<String>) -> Self {
        Self {
            version: 1,
            tracker: TrackerConfig {
                query_url: query_url.into(),
                base_url: default_tracker_base_url(),
            },
            source_host: SourceHostConfig::default(),
            retry: RetryConfig::default(),
            worker_count: default_worker_count(),
            request_timeout_secs: default_request_timeout_secs(),
            dry_run: false,
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(BridgeError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.tracker.query_url.trim().is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "tracker.query_url is empty".to_string(),
            });
        }

        if let Some(slug) = &self.source_host.repo_override {
            if slug.splitn(2, '/').filter(|s| !s.is_empty()).count() != 2 {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!(
                        "source_host.repo_override '{}' is not in owner/repo form",
                        slug
                    ),
                });
            }
        }

        if self.worker_count == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "worker_count must be at least 1".to_string(),
            });
        }

        if self.worker_count > 32 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "worker_count={} (>32 is unusual for API-bound work)",
                    self.worker_count
                ),
            });
        }

        if self.retry.max_attempts == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "retry.max_attempts must be at least 1".to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const QUERY: &str = "https://dev.azure.com/org/project/_queries/query/0b8a2de3-0c9d-4f3a-9b1e-2f6d5a7c4e10";

    #[test]
    fn default_config_roundtrip() {
        let cfg = Config::new(QUERY);
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.tracker.query_url, QUERY);
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.worker_count, 4);
        assert!(!parsed.dry_run);
    }

    #[test]
    fn minimal_yaml_fills_defaults() {
        let yaml = format!("tracker:\n  query_url: \"{QUERY}\"\n");
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.tracker.base_url, "https://dev.azure.com");
        assert_eq!(cfg.source_host.graphql_url, "https://api.github.com/graphql");
        assert!(cfg.source_host.repo_override.is_none());
        assert_eq!(cfg.retry.max_attempts, 4);
        assert_eq!(cfg.retry.backoff_base_ms, 500);
        assert_eq!(cfg.request_timeout_secs, 30);
    }

    #[test]
    fn repo_override_not_serialized_when_none() {
        let cfg = Config::new(QUERY);
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        assert!(!yaml.contains("repo_override"));
    }

    #[test]
    fn load_missing_config_is_not_initialized() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(dir.path()).unwrap_err();
        assert!(matches!(err, BridgeError::NotInitialized));
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::new(QUERY);
        cfg.source_host.repo_override = Some("octo/docs".to_string());
        cfg.dry_run = true;
        cfg.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.source_host.repo_override.as_deref(), Some("octo/docs"));
        assert!(loaded.dry_run);
    }

    #[test]
    fn validate_valid_config_no_warnings() {
        let cfg = Config::new(QUERY);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn validate_bad_repo_override() {
        let mut cfg = Config::new(QUERY);
        cfg.source_host.repo_override = Some("just-a-repo".to_string());
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("owner/repo")));
    }

    #[test]
    fn validate_zero_workers() {
        let mut cfg = Config::new(QUERY);
        cfg.worker_count = 0;
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.message.contains("worker_count")));
    }

    #[test]
    fn validate_empty_query_url() {
        let cfg = Config::new("  ");
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.message.contains("query_url is empty")));
    }
}
