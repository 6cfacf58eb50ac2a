use super::envelope::{ApiError, Envelope};
use super::AppState;
use crate::broker::is_guard_code;
use crate::steam::{
    parse_steam_id, InventoryItem, NewOffer, OfferItem, SentOffer, TradeApi, TradeLink, TradeOffer,
};
use axum::extract::{FromRequest, Query, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::{Form, Json};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{error, info, warn};

type ApiResult<T> = Result<Envelope<T>, ApiError>;

fn required(value: Option<String>, name: &str) -> Result<String, ApiError> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::Validation(format!("Missing {name}")))
}

fn offer_id(value: Option<String>, name: &str) -> Result<String, ApiError> {
    let id = required(value, name)?;
    if id.bytes().all(|b| b.is_ascii_digit()) {
        Ok(id)
    } else {
        Err(ApiError::Validation(format!("Invalid {name}")))
    }
}

#[derive(Deserialize)]
pub struct LoginQuery {
    code: Option<String>,
}

/// Start a login, the outcome is reported to the operators
pub async fn login<T>(
    State(state): State<AppState<T>>,
    Query(query): Query<LoginQuery>,
) -> ApiResult<&'static str> {
    let code = query.code.filter(|code| !code.is_empty());
    if let Some(code) = &code {
        if !is_guard_code(code) {
            return Err(ApiError::Validation("Invalid 2FA code".into()));
        }
    }
    info!(with_code = code.is_some(), "login requested");
    state.session.trigger_log_on(code);
    Ok(Envelope::ok("Trying to login..."))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    online: bool,
    logged: bool,
}

pub async fn status<T>(State(state): State<AppState<T>>) -> ApiResult<StatusResponse> {
    let status = state.session.status();
    Ok(Envelope::ok(StatusResponse {
        online: status.online,
        logged: status.authenticated,
    }))
}

#[derive(Deserialize)]
pub struct ConsoleLogQuery {
    message: Option<String>,
}

/// Write a caller supplied line to the service log
pub async fn console_log(Query(query): Query<ConsoleLogQuery>) -> ApiResult<&'static str> {
    let text = query.message.unwrap_or_default();
    info!(%text, "console log");
    Ok(Envelope::ok("Logged"))
}

#[derive(Deserialize)]
pub struct InventoryQuery {
    steamid: Option<String>,
}

pub async fn inventory<T: TradeApi>(
    State(state): State<AppState<T>>,
    Query(query): Query<InventoryQuery>,
) -> ApiResult<Vec<InventoryItem>> {
    let steam_id = required(query.steamid, "steamid")?;
    let steam_id = parse_steam_id(&steam_id).map_err(|e| ApiError::Validation(e.to_string()))?;
    let items = state.trades.inventory(steam_id).await?;
    info!(steam_id = u64::from(steam_id), count = items.len(), "returned inventory");
    Ok(Envelope::ok(items))
}

/// Render a SteamID64 in the legacy `STEAM_X:Y:Z` form
pub async fn steam2(Query(query): Query<InventoryQuery>) -> ApiResult<String> {
    let steam_id = required(query.steamid, "steamid")?;
    let steam_id = parse_steam_id(&steam_id).map_err(|e| ApiError::Validation(e.to_string()))?;
    Ok(Envelope::ok(steam_id.steam2()))
}

#[derive(Deserialize)]
pub struct GetOfferQuery {
    offerid: Option<String>,
}

pub async fn get_trade_offer<T: TradeApi>(
    State(state): State<AppState<T>>,
    Query(query): Query<GetOfferQuery>,
) -> ApiResult<TradeOffer> {
    let id = offer_id(query.offerid, "offerid")?;
    let offer = state.trades.get_offer(&id).await?;
    info!(offer = %id, "returned offer");
    Ok(Envelope::ok(offer))
}

#[derive(Deserialize)]
pub struct CancelOfferQuery {
    tradeid: Option<String>,
}

pub async fn cancel_trade_offer<T: TradeApi>(
    State(state): State<AppState<T>>,
    Query(query): Query<CancelOfferQuery>,
) -> ApiResult<&'static str> {
    let id = offer_id(query.tradeid, "tradeid")?;
    state.trades.cancel_offer(&id).await?;
    Ok(Envelope::ok("Trade offer canceled!"))
}

#[derive(Deserialize)]
pub struct SendOfferBody {
    items: Option<String>,
}

/// The json document in the `items` field
#[derive(Deserialize)]
struct OfferPayload {
    tradelink: String,
    #[serde(default)]
    message: String,
    encoded_items: Vec<OfferItem>,
}

impl OfferPayload {
    fn into_offer(self) -> Result<NewOffer, ApiError> {
        if self.encoded_items.is_empty() {
            return Err(ApiError::Validation("No items to trade".into()));
        }
        let partner =
            TradeLink::parse(&self.tradelink).map_err(|e| ApiError::Validation(e.to_string()))?;
        Ok(NewOffer {
            partner,
            message: self.message,
            items: self.encoded_items,
        })
    }
}

async fn read_offer_body(request: Request) -> Result<SendOfferBody, ApiError> {
    let is_json = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));
    if is_json {
        Json::<SendOfferBody>::from_request(request, &())
            .await
            .map(|Json(body)| body)
            .map_err(|e| ApiError::Validation(e.body_text()))
    } else {
        Form::<SendOfferBody>::from_request(request, &())
            .await
            .map(|Form(body)| body)
            .map_err(|e| ApiError::Validation(e.body_text()))
    }
}

/// Send an offer asking for the partner's items
///
/// A failed send refreshes the web session and is retried once after a delay.
pub async fn send_trade_offer<T: TradeApi>(
    State(state): State<AppState<T>>,
    request: Request,
) -> ApiResult<SentOffer> {
    let body = read_offer_body(request).await?;
    let items = required(body.items, "items")?;
    let payload: OfferPayload = serde_json::from_str(&items)
        .map_err(|e| ApiError::Validation(format!("Invalid items: {e}")))?;
    let offer = payload.into_offer()?;

    match state.trades.send_offer(&offer).await {
        Ok(sent) => return Ok(Envelope::ok(sent)),
        Err(e) => {
            warn!(error = %e, "failed to send trade offer, refreshing session and retrying")
        }
    }
    state.session.refresh();
    sleep(state.retry_delay).await;
    match state.trades.send_offer(&offer).await {
        Ok(sent) => Ok(Envelope::ok(sent)),
        Err(e) => {
            error!(error = %e, "failed to send trade offer after refreshing the session");
            Err(e.into())
        }
    }
}

/// Terminate the process
pub async fn kill<T>(State(state): State<AppState<T>>) -> &'static str {
    warn!("kill requested");
    state.session.kill();
    "Killing this instance"
}
