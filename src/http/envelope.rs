use crate::steam::TradeError;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// The body of every api response, sent with status 200 regardless of the outcome
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub error: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(response: T) -> Self {
        Envelope {
            error: false,
            message: "OK".into(),
            response: Some(response),
        }
    }
}

impl Envelope<()> {
    pub fn error(message: impl Into<String>) -> Self {
        Envelope {
            error: true,
            message: message.into(),
            response: None,
        }
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error(transparent)]
    Trade(#[from] TradeError),
    #[error("Timeout")]
    Timeout,
}

impl ApiError {
    /// The message shown to the caller, free of urls and other internals
    fn public_message(&self) -> String {
        match self {
            ApiError::Trade(TradeError::Network(_)) => "Failed to reach steam".into(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::Trade(e) => warn!(error = %e, "trade request failed"),
            ApiError::Timeout => warn!("request timed out"),
            e => debug!(error = %e, "rejected request"),
        }
        Envelope::error(self.public_message()).into_response()
    }
}
