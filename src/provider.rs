//! The steam session capability the session controller drives
//!
//! A provider performs the actual network work. Calls are fire-and-forget, outcomes
//! are reported back as [`ProviderEvent`]s on the channel handed to the provider.

use std::fmt::{Debug, Formatter};
use steamid_ng::SteamID;
use thiserror::Error;
use tokio::sync::mpsc;

/// Something the provider observed
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ProviderEvent {
    /// Steam wants a guard code before the login can complete
    SteamGuard { last_code_wrong: bool },
    /// The account is logged on
    LoggedOn { steam_id: SteamID },
    /// Web cookies for the trading endpoints are available
    WebSession { cookies: WebCookies },
    /// Steam no longer accepts the web session
    SessionExpired,
    /// The stored session identity was rejected, a credential login is needed
    IdentityLost { reason: String },
    /// Refreshing the web session failed, the identity is still valid
    RefreshFailed { reason: String },
    /// A login could not reach steam
    Disconnected { reason: String },
    /// A login attempt failed without a way to continue it
    LogOnFailed { reason: String },
    /// The data needed to resume the session changed
    ContinuationChanged(serde_json::Value),
}

pub type EventSender = mpsc::UnboundedSender<ProviderEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ProviderEvent>;

/// A channel for provider events
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Steam login capability
///
/// None of the methods wait for the outcome of the request.
pub trait SessionProvider: Send + Sync + 'static {
    /// Start a login, optionally with a guard code the operator already knows
    fn log_on(&self, code: Option<String>);

    /// Request fresh web cookies for the current identity
    fn web_log_on(&self);

    /// Answer a [`ProviderEvent::SteamGuard`] challenge
    fn submit_guard_code(&self, code: String);
}

/// Cookies authenticating requests against steam community
#[derive(Clone, PartialEq, Eq)]
pub struct WebCookies {
    pub steam_id: u64,
    pub session_id: String,
    pub steam_login_secure: String,
    pub access_token: String,
}

impl WebCookies {
    /// Render the cookies as a `Cookie` header value
    pub fn header_value(&self) -> String {
        format!(
            "sessionid={}; steamLoginSecure={}",
            self.session_id, self.steam_login_secure
        )
    }
}

impl Debug for WebCookies {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebCookies")
            .field("steam_id", &self.steam_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
#[error("rejected web cookies: {0}")]
pub struct CookieError(pub String);

/// Consumer of new web cookies
pub trait WebSessionSink: Send + Sync {
    fn set_cookies(&self, cookies: WebCookies) -> Result<(), CookieError>;
}
