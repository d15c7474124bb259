use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("not initialized: run 'docbridge init'")]
    NotInitialized,

    #[error("invalid query locator: {0}")]
    InvalidQueryLocator(String),

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed upstream payload: {0}")]
    MalformedPayload(String),

    #[error("work item not found in cache: {0}")]
    ItemNotCached(u64),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("batch cancelled by operator")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Transient upstream failures that the orchestrator retries with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::UpstreamUnavailable(_))
    }

    /// Errors that abort the whole batch rather than a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidQueryLocator(_)
                | BridgeError::AuthorizationDenied(_)
                | BridgeError::NotInitialized
                | BridgeError::Cancelled
        )
    }

    /// Classify an HTTP status from either upstream API.
    ///
    /// 401/403 on the tracker side mean a bad credential; on the source-host
    /// side 403 can also mean a per-repository permission gap, which callers
    /// remap via [`BridgeError::PermissionDenied`] where appropriate.
    pub fn from_status(status: u16, context: &str) -> Self {
        match status {
            401 => BridgeError::AuthorizationDenied(format!("HTTP 401: {context}")),
            403 => BridgeError::AuthorizationDenied(format!("HTTP 403: {context}")),
            404 => BridgeError::NotFound(context.to_string()),
            429 => BridgeError::UpstreamUnavailable(format!("HTTP 429 rate limited: {context}")),
            s if s >= 500 => BridgeError::UpstreamUnavailable(format!("HTTP {s}: {context}")),
            s => BridgeError::MalformedPayload(format!("unexpected HTTP {s}: {context}")),
        }
    }

    /// Classify a reqwest transport error. Timeouts and connection failures
    /// are the retryable class; everything else is a payload defect.
    pub fn from_transport(err: reqwest::Error, context: &str) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            BridgeError::UpstreamUnavailable(format!("{context}: {err}"))
        } else {
            BridgeError::MalformedPayload(format!("{context}: {err}"))
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
