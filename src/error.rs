//! Canonical error taxonomy used across all modules.
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::state::request_id::TraceId;

/// Gateway-wide error type returned by the request-path engine.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Missing or invalid API key")]
    ApiKeyUnauthorized,
    #[error("API key is inactive")]
    ApiKeyInactive,
    #[error("Insufficient balance")]
    PaymentRequired,
    #[error("未找到模型[{0}]的渠道")]
    ModelUnknown(String),
    #[error("不存在的接口[{0}]")]
    RouteNotFound(String),
    #[error("Rate limit exceeded")]
    TooManyRequests,
    #[error("Invalid request: {0}")]
    Unprocessable(String),
    #[error("Upstream error: {message}")]
    Gateway { status: u16, message: String },
    #[error("Upstream request timed out")]
    Timeout,
    #[error("Upstream service unavailable")]
    Unavailable,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::ApiKeyUnauthorized | GatewayError::ApiKeyInactive => 401,
            GatewayError::PaymentRequired => 402,
            GatewayError::ModelUnknown(_) => 400,
            GatewayError::RouteNotFound(_) => 404,
            GatewayError::TooManyRequests => 429,
            GatewayError::Unprocessable(_) => 422,
            GatewayError::Gateway { status, .. } => *status,
            GatewayError::Timeout => 504,
            GatewayError::Unavailable => 503,
            GatewayError::Internal(_) => 500,
        }
    }

    /// Render the `/v1/*` wire error body: `{object, message, code}` with the
    /// trace id appended to the message.
    #[must_use]
    pub fn to_wire_body(&self, trace_id: &TraceId) -> serde_json::Value {
        let code = self.status_code();
        let message = format!("{self}(request id: {trace_id})");
        serde_json::json!({
            "object": "error",
            "message": message,
            "code": code,
        })
    }

    /// Render this error as the final HTTP response for a request, carrying
    /// the same trace id that would have been attached on success: every
    /// response, error or not, surfaces `trace-id`.
    #[must_use]
    pub fn into_response(self, trace_id: &TraceId) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = self.to_wire_body(trace_id);
        (status, [("trace-id", trace_id.to_string())], axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(GatewayError::ApiKeyUnauthorized.status_code(), 401);
        assert_eq!(GatewayError::PaymentRequired.status_code(), 402);
        assert_eq!(GatewayError::ModelUnknown("x".into()).status_code(), 400);
        assert_eq!(GatewayError::RouteNotFound("/x".into()).status_code(), 404);
        assert_eq!(GatewayError::TooManyRequests.status_code(), 429);
        assert_eq!(GatewayError::Unprocessable("x".into()).status_code(), 422);
        assert_eq!(
            GatewayError::Gateway {
                status: 502,
                message: "x".into()
            }
            .status_code(),
            502
        );
        assert_eq!(GatewayError::Timeout.status_code(), 504);
        assert_eq!(GatewayError::Unavailable.status_code(), 503);
    }

    #[test]
    fn wire_body_appends_trace_id() {
        let trace_id = TraceId::from(uuid::Uuid::nil());
        let err = GatewayError::ModelUnknown("nope".to_string());
        let body = err.to_wire_body(&trace_id);
        let message = body["message"].as_str().unwrap();
        assert!(message.contains("未找到模型[nope]的渠道"));
        assert!(message.contains(&trace_id.to_string()));
        assert_eq!(body["code"], 400);
    }
}
