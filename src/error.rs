use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use thiserror::Error;

/// OpenAI-style error body: `{ "error": { "message", "type", "param", "code" } }`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

/// Failures the bridge can surface to clients.
///
/// Each variant maps to exactly one HTTP status and one JSON error body;
/// the upstream's request id never leaks into the body.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    NotImplemented(String),

    /// Non-retriable upstream failure; the upstream status and error body
    /// are passed through.
    #[error("upstream returned {status}: {}", .detail.message)]
    Upstream { status: u16, detail: ErrorDetail },

    #[error("{0}")]
    BadGateway(String),

    #[error("upstream request timed out")]
    Timeout,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BridgeError {
    pub fn status(&self) -> StatusCode {
        match self {
            BridgeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BridgeError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            BridgeError::NotFound(_) => StatusCode::NOT_FOUND,
            BridgeError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            BridgeError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            BridgeError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            BridgeError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn detail(&self) -> ErrorDetail {
        match self {
            BridgeError::Upstream { detail, .. } => detail.clone(),
            other => ErrorDetail {
                message: other.to_string(),
                kind: other.kind().to_string(),
                param: None,
                code: None,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            BridgeError::InvalidRequest(_) => "invalid_request_error",
            BridgeError::Unauthorized(_) => "unauthorized",
            BridgeError::NotFound(_) => "not_found",
            BridgeError::NotImplemented(_) => "not_implemented",
            BridgeError::Upstream { .. } => "upstream_error",
            BridgeError::BadGateway(_) => "bad_gateway",
            BridgeError::Timeout => "timeout",
            BridgeError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.detail(),
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Internal(anyhow::Error::new(err))
    }
}

impl From<crate::state::StateError> for BridgeError {
    fn from(err: crate::state::StateError) -> Self {
        match err {
            crate::state::StateError::Disabled => {
                BridgeError::NotImplemented("State store is disabled".into())
            }
            other => BridgeError::Internal(anyhow::Error::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_http_statuses() {
        assert_eq!(
            BridgeError::InvalidRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            BridgeError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            BridgeError::NotImplemented("x".into()).status(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(BridgeError::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            BridgeError::BadGateway("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn upstream_error_passes_status_through() {
        let err = BridgeError::Upstream {
            status: 403,
            detail: ErrorDetail {
                message: "denied".into(),
                kind: "forbidden".into(),
                param: None,
                code: None,
            },
        };
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.detail().message, "denied");
    }
}
