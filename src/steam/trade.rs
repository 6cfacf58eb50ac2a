use crate::de::{bool_from_any, string_from_any, u64_from_any};
use crate::provider::{CookieError, EventSender, ProviderEvent, WebCookies, WebSessionSink};
use reqwest::header::{COOKIE, REFERER};
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::{PoisonError, RwLock};
use steamid_ng::SteamID;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

const COMMUNITY: &str = "https://steamcommunity.com";
const ECON_API: &str = "https://api.steampowered.com/IEconService";

/// Counter-strike inventories
pub const INVENTORY_APP_ID: u32 = 730;
pub const INVENTORY_CONTEXT_ID: u32 = 2;
const INVENTORY_PAGE_SIZE: u32 = 2000;

/// Difference between a 64 bit individual steam id and its 32 bit account id
const STEAM_ID64_BASE: u64 = 76561197960265728;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TradeError {
    #[error("not logged in to steam community")]
    NotLoggedIn,
    #[error("steam community session expired")]
    SessionExpired,
    #[error("Network error: {0:#}")]
    Network(#[from] reqwest::Error),
    #[error("steam error: {0}")]
    Steam(String),
    #[error("invalid trade link: {0}")]
    InvalidTradeLink(String),
    #[error("invalid steam id: {0}")]
    InvalidSteamId(String),
    #[error("trade offer {0} not found")]
    NotFound(String),
}

/// Parse a 64 bit steam id as passed by api callers
pub fn parse_steam_id(raw: &str) -> Result<SteamID, TradeError> {
    match raw.trim().parse::<u64>() {
        Ok(id) if id > STEAM_ID64_BASE => Ok(SteamID::from(id)),
        _ => Err(TradeError::InvalidSteamId(raw.to_string())),
    }
}

/// A partner's trade link, `https://steamcommunity.com/tradeoffer/new/?partner=..&token=..`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeLink {
    pub account_id: u32,
    pub token: Option<String>,
}

impl TradeLink {
    pub fn parse(link: &str) -> Result<Self, TradeError> {
        let invalid = || TradeError::InvalidTradeLink(link.to_string());
        let url = Url::parse(link.trim()).map_err(|_| invalid())?;
        let mut account_id = None;
        let mut token = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "partner" => account_id = value.parse::<u32>().ok(),
                "token" if !value.is_empty() => token = Some(value.into_owned()),
                _ => {}
            }
        }
        Ok(TradeLink {
            account_id: account_id.ok_or_else(invalid)?,
            token,
        })
    }

    pub fn steam_id(&self) -> SteamID {
        SteamID::from(STEAM_ID64_BASE + u64::from(self.account_id))
    }
}

/// An item to request from the partner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferItem {
    #[serde(deserialize_with = "string_from_any")]
    pub assetid: String,
    #[serde(deserialize_with = "u64_from_any")]
    pub appid: u64,
    #[serde(deserialize_with = "string_from_any")]
    pub contextid: String,
}

/// A trade offer to create
#[derive(Debug, Clone)]
pub struct NewOffer {
    pub partner: TradeLink,
    pub message: String,
    pub items: Vec<OfferItem>,
}

impl NewOffer {
    /// The offer as steam's `json_tradeoffer` form field, asking for every item with amount 1
    fn trade_json(&self) -> serde_json::Value {
        let assets: Vec<_> = self
            .items
            .iter()
            .map(|item| {
                json!({
                    "appid": item.appid,
                    "contextid": item.contextid,
                    "amount": 1,
                    "assetid": item.assetid,
                })
            })
            .collect();
        json!({
            "newversion": true,
            "version": assets.len() + 1,
            "me": { "assets": [], "currency": [], "ready": false },
            "them": { "assets": assets, "currency": [], "ready": false },
        })
    }

    fn referer(&self) -> String {
        match &self.partner.token {
            Some(token) => format!(
                "{COMMUNITY}/tradeoffer/new/?partner={}&token={token}",
                self.partner.account_id
            ),
            None => format!(
                "{COMMUNITY}/tradeoffer/new/?partner={}",
                self.partner.account_id
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentOffer {
    #[serde(deserialize_with = "string_from_any")]
    pub tradeofferid: String,
    #[serde(default)]
    pub needs_mobile_confirmation: bool,
    #[serde(default)]
    pub needs_email_confirmation: bool,
}

/// An inventory item with its description merged in
#[derive(Debug, Clone, Serialize)]
pub struct InventoryItem {
    pub assetid: String,
    pub appid: u32,
    pub contextid: String,
    pub classid: String,
    pub instanceid: String,
    pub amount: u64,
    pub name: String,
    pub market_hash_name: String,
    #[serde(rename = "type")]
    pub item_type: String,
    pub icon_url: String,
    pub tradable: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InventoryPage {
    assets: Vec<InventoryAsset>,
    descriptions: Vec<ItemDescription>,
    #[serde(deserialize_with = "bool_from_any")]
    more_items: bool,
    #[serde(deserialize_with = "string_from_any")]
    last_assetid: String,
    #[serde(deserialize_with = "u64_from_any")]
    success: u64,
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InventoryAsset {
    appid: u32,
    #[serde(deserialize_with = "string_from_any")]
    contextid: String,
    #[serde(deserialize_with = "string_from_any")]
    assetid: String,
    #[serde(deserialize_with = "string_from_any")]
    classid: String,
    #[serde(deserialize_with = "string_from_any")]
    instanceid: String,
    #[serde(deserialize_with = "u64_from_any")]
    amount: u64,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
struct ItemDescription {
    #[serde(deserialize_with = "string_from_any")]
    classid: String,
    #[serde(deserialize_with = "string_from_any")]
    instanceid: String,
    name: String,
    market_hash_name: String,
    #[serde(rename = "type")]
    item_type: String,
    icon_url: String,
    #[serde(deserialize_with = "bool_from_any")]
    tradable: bool,
}

impl InventoryPage {
    /// Join assets with their descriptions, keeping only tradable items
    fn tradable_items(&self) -> Vec<InventoryItem> {
        let descriptions: HashMap<(&str, &str), &ItemDescription> = self
            .descriptions
            .iter()
            .map(|desc| ((desc.classid.as_str(), desc.instanceid.as_str()), desc))
            .collect();
        self.assets
            .iter()
            .filter_map(|asset| {
                let desc = descriptions.get(&(asset.classid.as_str(), asset.instanceid.as_str()))?;
                desc.tradable.then(|| InventoryItem {
                    assetid: asset.assetid.clone(),
                    appid: asset.appid,
                    contextid: asset.contextid.clone(),
                    classid: asset.classid.clone(),
                    instanceid: asset.instanceid.clone(),
                    amount: asset.amount,
                    name: desc.name.clone(),
                    market_hash_name: desc.market_hash_name.clone(),
                    item_type: desc.item_type.clone(),
                    icon_url: desc.icon_url.clone(),
                    tradable: true,
                })
            })
            .collect()
    }
}

/// `ETradeOfferState`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum TradeOfferState {
    Invalid,
    Active,
    Accepted,
    Countered,
    Expired,
    Canceled,
    Declined,
    InvalidItems,
    CreatedNeedsConfirmation,
    CanceledBySecondFactor,
    InEscrow,
    Unknown,
}

impl From<u64> for TradeOfferState {
    fn from(value: u64) -> Self {
        match value {
            1 => TradeOfferState::Invalid,
            2 => TradeOfferState::Active,
            3 => TradeOfferState::Accepted,
            4 => TradeOfferState::Countered,
            5 => TradeOfferState::Expired,
            6 => TradeOfferState::Canceled,
            7 => TradeOfferState::Declined,
            8 => TradeOfferState::InvalidItems,
            9 => TradeOfferState::CreatedNeedsConfirmation,
            10 => TradeOfferState::CanceledBySecondFactor,
            11 => TradeOfferState::InEscrow,
            _ => TradeOfferState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OfferAsset {
    #[serde(deserialize_with = "u64_from_any")]
    pub appid: u64,
    #[serde(deserialize_with = "string_from_any")]
    pub contextid: String,
    #[serde(deserialize_with = "string_from_any")]
    pub assetid: String,
    #[serde(deserialize_with = "string_from_any")]
    pub classid: String,
    #[serde(deserialize_with = "string_from_any")]
    pub instanceid: String,
    #[serde(deserialize_with = "u64_from_any")]
    pub amount: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawOffer {
    #[serde(deserialize_with = "string_from_any")]
    tradeofferid: String,
    accountid_other: u32,
    message: String,
    expiration_time: u64,
    trade_offer_state: u64,
    items_to_give: Vec<OfferAsset>,
    items_to_receive: Vec<OfferAsset>,
    is_our_offer: bool,
    time_created: u64,
    time_updated: u64,
}

/// A trade offer as reported by steam
#[derive(Debug, Clone, Serialize)]
pub struct TradeOffer {
    pub id: String,
    pub partner: String,
    pub message: String,
    pub state: TradeOfferState,
    pub is_our_offer: bool,
    pub items_to_give: Vec<OfferAsset>,
    pub items_to_receive: Vec<OfferAsset>,
    pub time_created: u64,
    pub time_updated: u64,
    pub expiration_time: u64,
}

impl From<RawOffer> for TradeOffer {
    fn from(raw: RawOffer) -> Self {
        TradeOffer {
            id: raw.tradeofferid,
            partner: (STEAM_ID64_BASE + u64::from(raw.accountid_other)).to_string(),
            message: raw.message,
            state: TradeOfferState::from(raw.trade_offer_state),
            is_our_offer: raw.is_our_offer,
            items_to_give: raw.items_to_give,
            items_to_receive: raw.items_to_receive,
            time_created: raw.time_created,
            time_updated: raw.time_updated,
            expiration_time: raw.expiration_time,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GetOfferResponse {
    response: GetOfferInner,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GetOfferInner {
    offer: Option<RawOffer>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SendOfferResponse {
    tradeofferid: Option<serde_json::Value>,
    #[serde(rename = "strError")]
    str_error: Option<String>,
    needs_mobile_confirmation: bool,
    needs_email_confirmation: bool,
}

/// The trading operations the http api exposes
pub trait TradeApi: Send + Sync + 'static {
    /// The tradable counter-strike items of `owner`
    fn inventory(
        &self,
        owner: SteamID,
    ) -> impl Future<Output = Result<Vec<InventoryItem>, TradeError>> + Send;

    fn get_offer(&self, offer_id: &str)
        -> impl Future<Output = Result<TradeOffer, TradeError>> + Send;

    fn cancel_offer(&self, offer_id: &str) -> impl Future<Output = Result<(), TradeError>> + Send;

    fn send_offer(&self, offer: &NewOffer)
        -> impl Future<Output = Result<SentOffer, TradeError>> + Send;
}

/// Trading over the steam community website with the cookies of the current web session
pub struct TradeClient {
    client: Client,
    cookies: RwLock<Option<WebCookies>>,
    events: EventSender,
}

impl Debug for TradeClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeClient")
            .field("logged_in", &self.cookies().is_ok())
            .finish_non_exhaustive()
    }
}

impl TradeClient {
    /// Session expiry detected by requests is reported on `events`
    pub fn new(client: Client, events: EventSender) -> Self {
        TradeClient {
            client,
            cookies: RwLock::default(),
            events,
        }
    }

    fn cookies(&self) -> Result<WebCookies, TradeError> {
        self.cookies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TradeError::NotLoggedIn)
    }

    /// Turn responses that show a dead session into [`TradeError::SessionExpired`]
    fn check_session(&self, response: Response) -> Result<Response, TradeError> {
        if is_session_expired(response.status(), response.url()) {
            warn!(path = response.url().path(), "steam community session expired");
            if self.events.send(ProviderEvent::SessionExpired).is_err() {
                debug!("session controller stopped, dropping session expiry");
            }
            return Err(TradeError::SessionExpired);
        }
        Ok(response)
    }
}

fn is_session_expired(status: StatusCode, url: &Url) -> bool {
    status == StatusCode::UNAUTHORIZED || url.path().starts_with("/login")
}

impl WebSessionSink for TradeClient {
    fn set_cookies(&self, cookies: WebCookies) -> Result<(), CookieError> {
        if cookies.session_id.is_empty() || cookies.steam_login_secure.is_empty() {
            return Err(CookieError("session cookies are empty".into()));
        }
        debug!(steam_id = cookies.steam_id, "updated community cookies");
        *self.cookies.write().unwrap_or_else(PoisonError::into_inner) = Some(cookies);
        Ok(())
    }
}

impl TradeApi for TradeClient {
    #[instrument(skip(self, owner), fields(owner = u64::from(owner)))]
    async fn inventory(&self, owner: SteamID) -> Result<Vec<InventoryItem>, TradeError> {
        let cookies = self.cookies().ok();
        let url = format!(
            "{COMMUNITY}/inventory/{}/{INVENTORY_APP_ID}/{INVENTORY_CONTEXT_ID}",
            u64::from(owner)
        );
        let mut items = Vec::new();
        let mut start_assetid: Option<String> = None;
        loop {
            let mut request = self.client.get(&url).query(&[
                ("l", "english".to_string()),
                ("count", INVENTORY_PAGE_SIZE.to_string()),
            ]);
            if let Some(start) = &start_assetid {
                request = request.query(&[("start_assetid", start)]);
            }
            if let Some(cookies) = &cookies {
                request = request.header(COOKIE, cookies.header_value());
            }
            let response = self.check_session(request.send().await?)?;
            if response.status() == StatusCode::FORBIDDEN {
                return Err(TradeError::Steam("inventory is private".into()));
            }
            let page: InventoryPage = response.error_for_status()?.json().await?;
            if page.success != 1 {
                return Err(TradeError::Steam(
                    page.error.unwrap_or_else(|| "failed to load inventory".into()),
                ));
            }
            items.extend(page.tradable_items());
            if !page.more_items || page.last_assetid.is_empty() {
                break;
            }
            start_assetid = Some(page.last_assetid);
        }
        debug!(count = items.len(), "loaded inventory");
        Ok(items)
    }

    #[instrument(skip(self))]
    async fn get_offer(&self, offer_id: &str) -> Result<TradeOffer, TradeError> {
        let cookies = self.cookies()?;
        // the url carries the access token, keep it out of errors
        let response = self
            .client
            .get(format!("{ECON_API}/GetTradeOffer/v1/"))
            .query(&[
                ("access_token", cookies.access_token.as_str()),
                ("tradeofferid", offer_id),
                ("language", "en"),
            ])
            .send()
            .await
            .map_err(|e| TradeError::Network(e.without_url()))?;
        let response: GetOfferResponse = self
            .check_session(response)?
            .error_for_status()
            .map_err(|e| TradeError::Network(e.without_url()))?
            .json()
            .await
            .map_err(|e| TradeError::Network(e.without_url()))?;
        response
            .response
            .offer
            .map(TradeOffer::from)
            .ok_or_else(|| TradeError::NotFound(offer_id.to_string()))
    }

    #[instrument(skip(self))]
    async fn cancel_offer(&self, offer_id: &str) -> Result<(), TradeError> {
        let cookies = self.cookies()?;
        let response = self
            .client
            .post(format!("{COMMUNITY}/tradeoffer/{offer_id}/cancel"))
            .header(COOKIE, cookies.header_value())
            .form(&[("sessionid", cookies.session_id.as_str())])
            .send()
            .await?;
        self.check_session(response)?.error_for_status()?;
        info!("canceled trade offer");
        Ok(())
    }

    #[instrument(skip_all, fields(partner = offer.partner.account_id, items = offer.items.len()))]
    async fn send_offer(&self, offer: &NewOffer) -> Result<SentOffer, TradeError> {
        let cookies = self.cookies()?;
        let create_params = match &offer.partner.token {
            Some(token) => json!({ "trade_offer_access_token": token }),
            None => json!({}),
        };
        let partner = u64::from(offer.partner.steam_id()).to_string();
        let trade_json = offer.trade_json().to_string();
        let create_params = create_params.to_string();
        let response = self
            .client
            .post(format!("{COMMUNITY}/tradeoffer/new/send"))
            .header(COOKIE, cookies.header_value())
            .header(REFERER, offer.referer())
            .form(&[
                ("sessionid", cookies.session_id.as_str()),
                ("serverid", "1"),
                ("partner", partner.as_str()),
                ("tradeoffermessage", offer.message.as_str()),
                ("json_tradeoffer", trade_json.as_str()),
                ("captcha", ""),
                ("trade_offer_create_params", create_params.as_str()),
            ])
            .send()
            .await?;
        let response = self.check_session(response)?;
        let status = response.status();
        let body: SendOfferResponse = response.json().await.unwrap_or_default();
        let sent = parse_send_response(status, body)?;
        info!(offer = %sent.tradeofferid, "sent trade offer");
        Ok(sent)
    }
}

fn parse_send_response(
    status: StatusCode,
    body: SendOfferResponse,
) -> Result<SentOffer, TradeError> {
    if let Some(error) = body.str_error {
        return Err(TradeError::Steam(error));
    }
    let id = match body.tradeofferid {
        Some(serde_json::Value::String(id)) => id,
        Some(serde_json::Value::Number(id)) => id.to_string(),
        _ => {
            return Err(TradeError::Steam(format!(
                "steam did not create the offer (status {status})"
            )))
        }
    };
    Ok(SentOffer {
        tradeofferid: id,
        needs_mobile_confirmation: body.needs_mobile_confirmation,
        needs_email_confirmation: body.needs_email_confirmation,
    })
}
