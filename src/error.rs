//! Error taxonomy for the stream multiplexer.
//!
//! Mirrors the kind-not-type table in spec §7: one variant per row, a
//! `status_code()` mapping, and a manual `IntoResponse` so handlers can
//! just `?` their way to a JSON error body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("missing or invalid request parameters: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("no stored credentials for user")]
    NoCredentials,

    #[error("upstream requires reauthentication")]
    RequiresReauth,

    #[error("upstream connect timed out")]
    GatewayTimeout,

    #[error("upstream network error: {0}")]
    BadGateway(String),

    #[error("upstream returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("stale exclusive open: user switched keys during connect")]
    StaleOpen,

    #[error("internal error: {0}")]
    Internal(String),
}

impl MuxError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) | Self::RequiresReauth => StatusCode::UNAUTHORIZED,
            Self::NoCredentials => StatusCode::NOT_FOUND,
            Self::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamStatus { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::RateLimited(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::StaleOpen => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_name(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BadRequest",
            Self::Unauthorized(_) => "Unauthorized",
            Self::NoCredentials => "NoCredentials",
            Self::RequiresReauth => "RequiresReauth",
            Self::GatewayTimeout => "GatewayTimeout",
            Self::BadGateway(_) => "BadGateway",
            Self::UpstreamStatus { .. } => "UpstreamStatus",
            Self::RateLimited(_) => "ServiceUnavailable",
            Self::StaleOpen => "StaleOpen",
            Self::Internal(_) => "InternalError",
        }
    }
}

impl From<crate::token_provider::TokenError> for MuxError {
    fn from(err: crate::token_provider::TokenError) -> Self {
        use crate::token_provider::TokenError;
        match err {
            TokenError::NoCredentials => MuxError::NoCredentials,
            TokenError::Undecipherable => MuxError::Unauthorized("undecipherable credentials".into()),
            TokenError::RequiresReauth => MuxError::RequiresReauth,
            TokenError::TransportError(msg) => MuxError::BadGateway(msg),
        }
    }
}

impl IntoResponse for MuxError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_name = self.error_name();

        if status.is_server_error() {
            tracing::error!(error = %self, error_name, "mux request failed");
        } else {
            tracing::debug!(error = %self, error_name, "mux request rejected");
        }

        (
            status,
            Json(json!({ "error": error_name, "details": self.to_string() })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(
            MuxError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            MuxError::Unauthorized("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(MuxError::NoCredentials.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            MuxError::RequiresReauth.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            MuxError::GatewayTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            MuxError::BadGateway("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            MuxError::RateLimited("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(MuxError::StaleOpen.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            MuxError::UpstreamStatus {
                status: 418,
                body: "teapot".into()
            }
            .status_code(),
            StatusCode::IM_A_TEAPOT
        );
    }
}
