//! Gateway-wide error taxonomy.
//!
//! Internal plumbing freely uses `anyhow::Result` with `.context(...)`, but every
//! boundary the generation handler and the admin surface branch on returns this
//! closed enum so callers can match on kind rather than sniff error strings.

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("upstream authentication failed: {0}")]
    Auth(String),

    #[error("challenge negotiation failed: {0}")]
    Challenge(String),

    #[error("upstream unavailable ({status}): {body}")]
    UpstreamUnavailable { status: u16, body: String },

    #[error("unknown model: {0}")]
    InvalidModel(String),

    #[error("no eligible token for this request")]
    NoEligibleToken,

    #[error("upstream timed out after {0:?}")]
    UpstreamTimeout(std::time::Duration),

    #[error("upstream error ({status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("country not supported: {0}")]
    CountryUnsupported(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// The stable machine-readable kind, independent of message text.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "config_error",
            GatewayError::Auth(_) => "auth_error",
            GatewayError::Challenge(_) => "challenge_error",
            GatewayError::UpstreamUnavailable { .. } => "upstream_unavailable",
            GatewayError::InvalidModel(_) => "invalid_model",
            GatewayError::NoEligibleToken => "no_eligible_token",
            GatewayError::UpstreamTimeout(_) => "upstream_timeout",
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::Cache(_) => "cache_error",
            GatewayError::Cancelled => "cancelled",
            GatewayError::CountryUnsupported(_) => "country_unsupported",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Whether this kind should count against a token's error-ban threshold.
    ///
    /// `cancelled`, `no_eligible_token`, `invalid_model`, and `upstream_unavailable`
    /// are excluded — none of them reflect something wrong with the credential.
    pub fn counts_against_token(&self) -> bool {
        !matches!(
            self,
            GatewayError::Cancelled
                | GatewayError::NoEligibleToken
                | GatewayError::InvalidModel(_)
                | GatewayError::UpstreamUnavailable { .. }
        )
    }

    /// The HTTP status this error maps to, shared by the `IntoResponse` impl
    /// below and by callers that need it before building a response body of
    /// their own (e.g. the request log).
    pub fn http_status(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Challenge(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamUnavailable { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::InvalidModel(_) => StatusCode::BAD_REQUEST,
            GatewayError::NoEligibleToken => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::Cache(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Cancelled => StatusCode::from_u16(499).unwrap(),
            GatewayError::CountryUnsupported(_) => StatusCode::FORBIDDEN,
        }
    }

    /// Human-readable reason used both in JSON error bodies and stream chunks.
    pub fn reason(&self) -> String {
        self.to_string()
    }

    /// Render this error as the terminal chat-completion-chunk the caller sees
    /// mid-stream, per the generation handler's "user-visible failures during
    /// streaming are emitted as a final stream chunk" rule.
    pub fn to_stream_chunk(&self, id: &str, model: &str, created: i64) -> serde_json::Value {
        json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{
                "index": 0,
                "delta": { "content": self.reason() },
                "finish_reason": "STOP",
                "native_finish_reason": self.kind(),
            }],
            "usage": null,
        })
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response<Body> {
        let status = self.http_status();
        let body = json!({
            "error": {
                "kind": self.kind(),
                "message": self.reason(),
            }
        });

        tracing::warn!(kind = self.kind(), status = %status, "gateway error: {}", self);

        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(Body::from("internal error building error response")))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
