use crate::auth::{
    AuthClient, AuthConfirmationHandler, AuthError, ConfirmationAction, ConfirmationMethod,
    DeviceConfirmationHandler, LoginError, ProvidedCodeConfirmationHandler,
    SharedSecretAuthConfirmationHandler, StartedAuth, SteamGuardToken, Token, Tokens,
};
use crate::provider::{EventSender, ProviderEvent, SessionProvider, WebCookies};
use futures_util::future::{select, Either};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use steamid_ng::SteamID;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// How often a credential login is retried after steam rejected the guard code
const MAX_CODE_ATTEMPTS: u32 = 3;

/// Account credentials used for a full login
#[derive(Clone)]
pub struct Credentials {
    pub account: String,
    pub password: String,
    pub shared_secret: Option<String>,
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("account", &self.account)
            .field("shared_secret", &self.shared_secret.is_some())
            .finish_non_exhaustive()
    }
}

/// What is needed to resume the session after a restart
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
struct Continuation {
    account: String,
    steam_id: u64,
    refresh_token: Option<String>,
    guard_data: Option<String>,
}

impl Continuation {
    fn identity(&self) -> Option<(SteamID, Token)> {
        match (&self.refresh_token, self.steam_id) {
            (Some(token), steam_id) if steam_id != 0 => {
                Some((SteamID::from(steam_id), Token::new(token.as_str())))
            }
            _ => None,
        }
    }
}

/// Build the community cookies for an access token
pub fn web_cookies(steam_id: SteamID, access_token: &Token) -> WebCookies {
    let steam_id = u64::from(steam_id);
    let session_id: String = rand::random::<[u8; 12]>()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect();
    WebCookies {
        steam_id,
        session_id,
        steam_login_secure: format!("{steam_id}%7C%7C{}", access_token.as_ref()),
        access_token: access_token.as_ref().to_string(),
    }
}

struct Inner {
    auth: AuthClient,
    credentials: Credentials,
    events: EventSender,
    continuation: Mutex<Continuation>,
    access_token: Mutex<Option<Token>>,
    codes_tx: mpsc::UnboundedSender<String>,
    codes_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    logon_in_flight: AtomicBool,
}

/// Session provider logging in over the steam web api
///
/// A refresh token stands in for a connected client: as long as steam accepts it
/// the account counts as logged on and new web cookies can be minted from it.
#[derive(Clone)]
pub struct WebSessionProvider {
    inner: Arc<Inner>,
}

impl Debug for WebSessionProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSessionProvider")
            .field("account", &self.inner.credentials.account)
            .finish_non_exhaustive()
    }
}

impl WebSessionProvider {
    /// Create the provider, resuming from a persisted continuation of the same account
    pub fn new(
        client: reqwest::Client,
        credentials: Credentials,
        events: EventSender,
        continuation: Option<serde_json::Value>,
    ) -> Self {
        let continuation = continuation
            .and_then(|raw| match serde_json::from_value::<Continuation>(raw) {
                Ok(continuation) => Some(continuation),
                Err(e) => {
                    warn!(error = %e, "ignoring unreadable session continuation");
                    None
                }
            })
            .filter(|continuation| continuation.account == credentials.account)
            .unwrap_or_else(|| Continuation {
                account: credentials.account.clone(),
                ..Continuation::default()
            });
        if continuation.identity().is_some() {
            info!(account = %credentials.account, "found stored session");
        }
        let (codes_tx, codes_rx) = mpsc::unbounded_channel();
        WebSessionProvider {
            inner: Arc::new(Inner {
                auth: AuthClient::new(client),
                credentials,
                events,
                continuation: Mutex::new(continuation),
                access_token: Mutex::default(),
                codes_tx,
                codes_rx: tokio::sync::Mutex::new(codes_rx),
                logon_in_flight: AtomicBool::new(false),
            }),
        }
    }
}

impl SessionProvider for WebSessionProvider {
    fn log_on(&self, code: Option<String>) {
        if self.inner.logon_in_flight.swap(true, Ordering::AcqRel) {
            debug!("login already in progress");
            if let Some(code) = code {
                self.submit_guard_code(code);
            }
            return;
        }
        let in_flight = InFlight(self.inner.clone());
        tokio::spawn(async move {
            in_flight.0.log_on(code).await;
            drop(in_flight);
        });
    }

    fn web_log_on(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.web_log_on().await });
    }

    fn submit_guard_code(&self, code: String) {
        if self.inner.codes_tx.send(code).is_err() {
            warn!("guard code receiver is gone");
        }
    }
}

/// Clears the in-flight flag once a login attempt ends, however it ends
struct InFlight(Arc<Inner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.logon_in_flight.store(false, Ordering::Release);
    }
}

impl Inner {
    fn emit(&self, event: ProviderEvent) {
        if self.events.send(event).is_err() {
            debug!("session controller stopped, dropping provider event");
        }
    }

    fn continuation(&self) -> std::sync::MutexGuard<'_, Continuation> {
        self.continuation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn update_continuation(&self, update: impl FnOnce(&mut Continuation)) {
        let snapshot = {
            let mut continuation = self.continuation();
            let before = continuation.clone();
            update(&mut *continuation);
            if *continuation == before {
                return;
            }
            continuation.clone()
        };
        match serde_json::to_value(&snapshot) {
            Ok(value) => self.emit(ProviderEvent::ContinuationChanged(value)),
            Err(e) => error!(error = %e, "failed to encode session continuation"),
        }
    }

    fn forget_identity(&self) {
        self.access_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.update_continuation(|continuation| continuation.refresh_token = None);
    }

    #[instrument(skip_all, fields(account = %self.credentials.account))]
    async fn log_on(&self, code: Option<String>) {
        let stored = self.continuation().identity();
        if let (None, Some((steam_id, refresh_token))) = (&code, stored) {
            match self.auth.generate_access_token(&refresh_token, steam_id).await {
                Ok(tokens) => {
                    info!("resumed stored session");
                    self.logged_on(steam_id, tokens);
                    return;
                }
                Err(AuthError::Login(e)) => {
                    warn!(error = %e, "stored session was rejected, logging in with credentials");
                    self.forget_identity();
                }
                Err(e) => {
                    self.emit(ProviderEvent::Disconnected {
                        reason: e.to_string(),
                    });
                    return;
                }
            }
        }

        match self.credentials_log_on(code).await {
            Ok((steam_id, tokens)) => {
                info!("logged on with credentials");
                self.logged_on(steam_id, tokens)
            }
            Err(AuthError::Network(e)) => {
                warn!(error = %e, "could not reach steam");
                self.emit(ProviderEvent::Disconnected {
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                error!(error = %e, "login failed");
                self.emit(ProviderEvent::LogOnFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn logged_on(&self, steam_id: SteamID, tokens: Tokens) {
        *self
            .access_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tokens.access_token);
        self.update_continuation(|continuation| {
            continuation.steam_id = u64::from(steam_id);
            continuation.refresh_token = Some(tokens.refresh_token.as_ref().to_string());
            if let Some(guard_data) = tokens.new_guard_data {
                continuation.guard_data = Some(guard_data);
            }
        });
        self.emit(ProviderEvent::LoggedOn { steam_id });
    }

    async fn credentials_log_on(
        &self,
        mut code: Option<String>,
    ) -> Result<(SteamID, Tokens), AuthError> {
        let guard_data = self.continuation().guard_data.clone();
        let mut last_code_wrong = false;
        let mut attempt = 1;
        loop {
            self.drain_codes().await;
            let begin = StartedAuth::begin_via_credentials(
                &self.auth,
                &self.credentials.account,
                &self.credentials.password,
                guard_data.as_deref(),
            )
            .await?;
            let operator = GuardEventConfirmationHandler {
                events: self.events.clone(),
                codes: &self.codes_rx,
                last_code_wrong,
            }
            .or(DeviceConfirmationHandler);

            let result = match (code.take(), &self.credentials.shared_secret) {
                (Some(code), _) => {
                    self.confirm(&begin, ProvidedCodeConfirmationHandler::new(code).or(operator))
                        .await
                }
                (None, Some(secret)) if !last_code_wrong => {
                    self.confirm(
                        &begin,
                        SharedSecretAuthConfirmationHandler::new(secret).or(operator),
                    )
                    .await
                }
                (None, _) => self.confirm(&begin, operator).await,
            };

            match result {
                Err(AuthError::Login(LoginError::InvalidGuardCode))
                    if attempt < MAX_CODE_ATTEMPTS =>
                {
                    warn!(attempt, "steam rejected the guard code");
                    last_code_wrong = true;
                    attempt += 1;
                }
                result => return result.map(|tokens| (begin.steam_id(), tokens)),
            }
        }
    }

    async fn confirm<H: AuthConfirmationHandler>(
        &self,
        begin: &StartedAuth,
        confirmation_handler: H,
    ) -> Result<Tokens, AuthError> {
        let allowed_confirmations = begin.allowed_confirmations();
        match select(
            pin!(confirmation_handler.handle_confirmation(&allowed_confirmations)),
            pin!(begin.wait_for_tokens(&self.auth)),
        )
        .await
        {
            Either::Left((confirmation_action, tokens_fut)) => {
                if let Some(confirmation_action) = confirmation_action {
                    begin
                        .submit_confirmation(&self.auth, confirmation_action)
                        .await?;
                    tokens_fut.await
                } else if begin.action_required() {
                    Err(LoginError::UnsupportedConfirmationAction(allowed_confirmations).into())
                } else {
                    tokens_fut.await
                }
            }
            Either::Right((tokens, _)) => tokens,
        }
    }

    /// Drop codes that were meant for an earlier challenge
    async fn drain_codes(&self) {
        let mut codes = self.codes_rx.lock().await;
        while codes.try_recv().is_ok() {
            debug!("discarding stale guard code");
        }
    }

    #[instrument(skip_all)]
    async fn web_log_on(&self) {
        let Some((steam_id, refresh_token)) = self.continuation().identity() else {
            self.emit(ProviderEvent::IdentityLost {
                reason: "no stored session".into(),
            });
            return;
        };
        let cached = self
            .access_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let access_token = match cached {
            Some(token) => token,
            None => match self.auth.generate_access_token(&refresh_token, steam_id).await {
                Ok(tokens) => {
                    self.update_continuation(|continuation| {
                        continuation.refresh_token =
                            Some(tokens.refresh_token.as_ref().to_string())
                    });
                    tokens.access_token
                }
                Err(AuthError::Login(e)) => {
                    warn!(error = %e, "steam rejected the stored session");
                    self.forget_identity();
                    self.emit(ProviderEvent::IdentityLost {
                        reason: e.to_string(),
                    });
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "failed to refresh web session");
                    self.emit(ProviderEvent::RefreshFailed {
                        reason: e.to_string(),
                    });
                    return;
                }
            },
        };
        debug!("new web session");
        self.emit(ProviderEvent::WebSession {
            cookies: web_cookies(steam_id, &access_token),
        });
    }
}

/// Forward the challenge to the session controller and wait for the code it sends back
struct GuardEventConfirmationHandler<'a> {
    events: EventSender,
    codes: &'a tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    last_code_wrong: bool,
}

impl AuthConfirmationHandler for GuardEventConfirmationHandler<'_> {
    async fn handle_confirmation(
        self,
        allowed_confirmations: &[ConfirmationMethod],
    ) -> Option<ConfirmationAction> {
        let token_type = allowed_confirmations
            .iter()
            .find_map(ConfirmationMethod::token_type)?;
        let challenge = ProviderEvent::SteamGuard {
            last_code_wrong: self.last_code_wrong,
        };
        if self.events.send(challenge).is_err() {
            return Some(ConfirmationAction::Abort);
        }
        match self.codes.lock().await.recv().await {
            Some(code) => Some(ConfirmationAction::GuardToken(
                SteamGuardToken::new(code),
                token_type,
            )),
            None => Some(ConfirmationAction::Abort),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowedConfirmation, GuardTokenType, GuardType};
    use crate::provider::event_channel;
    use serde_json::json;

    fn credentials() -> Credentials {
        Credentials {
            account: "trader".into(),
            password: "hunter2".into(),
            shared_secret: None,
        }
    }

    #[test]
    fn cookies_embed_identity() {
        let cookies = web_cookies(SteamID::from(76561197960287930), &Token::new("eyAbc"));
        assert_eq!(cookies.steam_id, 76561197960287930);
        assert_eq!(cookies.steam_login_secure, "76561197960287930%7C%7CeyAbc");
        assert_eq!(cookies.session_id.len(), 24);
        assert!(cookies.session_id.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn credentials_are_not_printed() {
        let debug = format!("{:?}", credentials());
        assert!(debug.contains("trader"));
        assert!(!debug.contains("hunter2"));
    }

    #[tokio::test]
    async fn restores_continuation_for_same_account() {
        let (tx, _rx) = event_channel();
        let stored = json!({
            "account": "trader",
            "steam_id": 76561197960287930u64,
            "refresh_token": "refresh",
            "guard_data": "machine",
        });
        let provider =
            WebSessionProvider::new(reqwest::Client::new(), credentials(), tx, Some(stored));
        let (steam_id, token) = provider.inner.continuation().identity().unwrap();
        assert_eq!(u64::from(steam_id), 76561197960287930);
        assert_eq!(token.as_ref(), "refresh");
    }

    #[tokio::test]
    async fn ignores_continuation_of_other_account() {
        let (tx, _rx) = event_channel();
        let stored = json!({ "account": "someone", "steam_id": 1, "refresh_token": "x" });
        let provider =
            WebSessionProvider::new(reqwest::Client::new(), credentials(), tx, Some(stored));
        assert!(provider.inner.continuation().identity().is_none());

        let (tx, _rx) = event_channel();
        let provider =
            WebSessionProvider::new(reqwest::Client::new(), credentials(), tx, Some(json!([1, 2])));
        assert!(provider.inner.continuation().identity().is_none());
    }

    #[tokio::test]
    async fn forgetting_identity_announces_continuation() {
        let (tx, mut rx) = event_channel();
        let stored = json!({ "account": "trader", "steam_id": 5, "refresh_token": "x" });
        let provider =
            WebSessionProvider::new(reqwest::Client::new(), credentials(), tx, Some(stored));

        provider.inner.forget_identity();
        match rx.try_recv() {
            Ok(ProviderEvent::ContinuationChanged(value)) => {
                assert_eq!(value["refresh_token"], serde_json::Value::Null);
                assert_eq!(value["steam_id"], 5);
            }
            other => panic!("unexpected event {other:?}"),
        }
        // nothing changed the second time
        provider.inner.forget_identity();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn web_log_on_without_identity() {
        let (tx, mut rx) = event_channel();
        let provider = WebSessionProvider::new(reqwest::Client::new(), credentials(), tx, None);
        provider.inner.web_log_on().await;
        assert!(matches!(
            rx.try_recv(),
            Ok(ProviderEvent::IdentityLost { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_refresh_is_not_a_disconnect() {
        let (tx, mut rx) = event_channel();
        let stored = json!({ "account": "trader", "steam_id": 5, "refresh_token": "x" });
        let mut provider =
            WebSessionProvider::new(reqwest::Client::new(), credentials(), tx, Some(stored));
        Arc::get_mut(&mut provider.inner).unwrap().auth =
            AuthClient::new(reqwest::Client::new()).with_base("http://127.0.0.1:1");

        provider.inner.web_log_on().await;
        assert!(matches!(
            rx.try_recv(),
            Ok(ProviderEvent::RefreshFailed { .. })
        ));
        // the identity survives for the next attempt
        assert!(provider.inner.continuation().identity().is_some());
    }

    #[tokio::test]
    async fn guard_event_handler_waits_for_code() {
        let (tx, mut rx) = event_channel();
        let provider =
            WebSessionProvider::new(reqwest::Client::new(), credentials(), tx.clone(), None);
        let allowed = vec![ConfirmationMethod::from(AllowedConfirmation::new(
            GuardType::DeviceCode,
        ))];
        provider.submit_guard_code("X7K2M".into());

        let handler = GuardEventConfirmationHandler {
            events: tx,
            codes: &provider.inner.codes_rx,
            last_code_wrong: true,
        };
        match handler.handle_confirmation(&allowed).await {
            Some(ConfirmationAction::GuardToken(token, GuardTokenType::Device)) => {
                assert_eq!(format!("{token:?}"), r#"SteamGuardToken("X7K2M")"#);
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert!(matches!(
            rx.try_recv(),
            Ok(ProviderEvent::SteamGuard {
                last_code_wrong: true
            })
        ));
    }
}
