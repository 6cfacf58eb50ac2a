//! Query token authentication
//!
//! Every request carries `?token=<token>`, checked against the tokens loaded at startup.

use super::envelope::ApiError;
use crate::store::{read_json, FileStoreError};
use axum::extract::{Query, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// The accepted api tokens
#[derive(Debug, Default, Clone)]
pub struct TokenList(HashSet<String>);

impl TokenList {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        TokenList(tokens.into_iter().filter(|token| !token.is_empty()).collect())
    }

    /// Load a json array of tokens, a missing file accepts nothing
    pub async fn load(path: &Path) -> Result<Self, FileStoreError> {
        let tokens: Option<Vec<String>> = read_json(path).await?;
        let tokens = TokenList::new(tokens.unwrap_or_default());
        if tokens.is_empty() {
            warn!(path = %path.display(), "no api tokens configured, every request will be rejected");
        }
        Ok(tokens)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.0.contains(token)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Reject requests without a known token before they reach a handler
pub async fn require_token(
    State(tokens): State<Arc<TokenList>>,
    request: Request,
    next: Next,
) -> Response {
    let token = Query::<TokenQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(query)| query.token)
        .filter(|token| !token.is_empty());
    match token {
        Some(token) if tokens.contains(&token) => next.run(request).await,
        Some(_) => ApiError::Unauthorized("Invalid token").into_response(),
        None => ApiError::Unauthorized("Please provide authentication token.").into_response(),
    }
}
