//! Error taxonomy shared by the posture and remediation agents.
//!
//! Each agent keeps its own `thiserror` enum; this module only names the
//! kind of failure so the HTTP layer can pick a status code without
//! inspecting upstream error text.

use axum::http::StatusCode;
use serde::Serialize;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller mistake: empty issue, malformed credentials
    Input,
    /// Upstream catalog unreachable or credentials rejected
    Connectivity,
    /// Credentials valid but not allowed to read catalog metadata
    Permission,
    /// Completion provider unavailable or refusing the request
    Provider,
    /// Provider stream ended in an error
    Generation,
    /// Call torn down by timeout or caller abort
    Cancelled,
}

impl ErrorKind {
    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorKind::Input | ErrorKind::Connectivity => StatusCode::BAD_REQUEST,
            ErrorKind::Permission => StatusCode::FORBIDDEN,
            ErrorKind::Provider | ErrorKind::Generation => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Cancelled => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Input => write!(f, "input"),
            ErrorKind::Connectivity => write!(f, "connectivity"),
            ErrorKind::Permission => write!(f, "permission"),
            ErrorKind::Provider => write!(f, "provider"),
            ErrorKind::Generation => write!(f, "generation"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}
