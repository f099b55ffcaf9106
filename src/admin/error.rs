//! Admin surface error type, in the same `IntoResponse` style as the gateway's
//! `GatewayError` but scoped to session/auth/not-found concerns the core
//! error taxonomy doesn't model.

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<crate::error::GatewayError> for AdminError {
    fn from(err: crate::error::GatewayError) -> Self {
        AdminError::Internal(anyhow::anyhow!(err))
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response<Body> {
        let status = match self {
            AdminError::Unauthorized => StatusCode::UNAUTHORIZED,
            AdminError::NotFound(_) => StatusCode::NOT_FOUND,
            AdminError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            AdminError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.to_string() });

        tracing::warn!(status = %status, "admin error: {}", self);

        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(Body::from("internal error building error response")))
    }
}
