//! Error taxonomy for the hub and its collaborators. Kinds, not exhaustive causes:
//! callers match on variant to pick an HTTP status / wire event, never on message text.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl HubError {
    /// Short machine-stable tag used in logs and in `terminal:error` / `tabs:error` payloads.
    pub fn tag(&self) -> &'static str {
        match self {
            HubError::UpstreamUnavailable(_) => "upstream_unavailable",
            HubError::BadRequest(_) => "bad_request",
            HubError::Forbidden(_) => "forbidden",
            HubError::NotFound(_) => "not_found",
            HubError::Conflict(_) => "conflict",
            HubError::Transient(_) => "transient",
            HubError::Fatal(_) => "fatal",
        }
    }
}
