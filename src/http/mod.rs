//! The http api
//!
//! Every endpoint answers with status 200 and an [`Envelope`], failures set `error: true`.

mod auth;
mod envelope;
mod handlers;

pub use auth::{require_token, TokenList};
pub use envelope::{ApiError, Envelope};

use crate::session::SessionHandle;
use crate::steam::TradeApi;
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Requests running longer than this are answered with a `Timeout` error
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay before retrying a failed trade offer after refreshing the session
pub const SEND_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct AppState<T> {
    pub session: SessionHandle,
    pub trades: Arc<T>,
    pub tokens: Arc<TokenList>,
    pub retry_delay: Duration,
}

impl<T> AppState<T> {
    pub fn new(session: SessionHandle, trades: Arc<T>, tokens: TokenList) -> Self {
        AppState {
            session,
            trades,
            tokens: Arc::new(tokens),
            retry_delay: SEND_RETRY_DELAY,
        }
    }
}

impl<T> Clone for AppState<T> {
    fn clone(&self) -> Self {
        AppState {
            session: self.session.clone(),
            trades: self.trades.clone(),
            tokens: self.tokens.clone(),
            retry_delay: self.retry_delay,
        }
    }
}

async fn halt_on_timeout(request: Request, next: Next) -> Response {
    match timeout(REQUEST_TIMEOUT, next.run(request)).await {
        Ok(response) => response,
        Err(_) => ApiError::Timeout.into_response(),
    }
}

pub fn router<T: TradeApi>(state: AppState<T>) -> Router {
    let tokens = state.tokens.clone();
    Router::new()
        .route("/login", get(handlers::login::<T>))
        .route("/status", get(handlers::status::<T>))
        .route("/consoleLog", get(handlers::console_log))
        .route("/inventory", get(handlers::inventory::<T>))
        .route("/steam2", get(handlers::steam2))
        .route("/getTradeOffer", get(handlers::get_trade_offer::<T>))
        .route("/cancelTradeOffer", get(handlers::cancel_trade_offer::<T>))
        .route("/sendTradeOffer", post(handlers::send_trade_offer::<T>))
        .route("/kill", get(handlers::kill::<T>))
        .layer(middleware::from_fn(halt_on_timeout))
        .layer(middleware::from_fn_with_state(tokens, require_token))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
