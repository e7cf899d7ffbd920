//! Error taxonomy shared by every layer. Nothing here is fatal: callers get an explicit
//! failure value and decide whether to retry, fix input, or cancel.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum DashboardError {
    /// Network/HTTP failure reaching the cluster API.
    #[error("transport: {0}")]
    Transport(String),
    /// Structured rejection from the cluster API. Displays the server message verbatim.
    #[error("{message}")]
    ServerRejection { message: String, details: Option<String> },
    /// Manifest text failed to parse.
    #[error("parse: {0}")]
    Parse(String),
    /// A field that cannot change after creation was edited.
    #[error("field {path} is immutable once the resource exists")]
    ImmutableField { path: String },
    /// A fetch response lost the race against a newer request for the same query.
    #[error("stale response discarded")]
    StaleResponse,
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("cancelled")]
    Cancelled,
}

pub type DashboardResult<T> = Result<T, DashboardError>;

impl DashboardError {
    pub fn rejection(message: impl Into<String>) -> Self {
        DashboardError::ServerRejection { message: message.into(), details: None }
    }

    /// Transport failures get a retry affordance; everything else is fixed or dismissed in place.
    pub fn is_retryable(&self) -> bool { matches!(self, DashboardError::Transport(_)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_displays_verbatim() {
        let e = DashboardError::ServerRejection { message: "quota exceeded".into(), details: Some("Forbidden".into()) };
        assert_eq!(e.to_string(), "quota exceeded");
        assert!(!e.is_retryable());
        assert!(DashboardError::Transport("connection refused".into()).is_retryable());
    }
}
