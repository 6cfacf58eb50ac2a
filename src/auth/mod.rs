//! Steam account authentication over the `IAuthenticationService` web api

mod confirmation;

use crate::de::u64_from_any;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
pub use confirmation::*;
use num_bigint_dig::BigUint;
use num_traits::Num;
use reqwest::{Client, Method};
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::fmt::{Debug, Formatter};
use std::time::Duration;
use steamid_ng::SteamID;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, instrument};

const AUTH_API: &str = "https://api.steampowered.com/IAuthenticationService";

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    #[error("Network error: {0:#}")]
    Network(#[from] reqwest::Error),
    #[error("Login failed: {0:#}")]
    Login(#[from] LoginError),
    #[error("malformed response for {method}: {reason}")]
    MalformedResponse {
        method: &'static str,
        reason: String,
    },
    #[error("failed to encrypt password: {0}")]
    Encryption(#[from] rsa::Error),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoginError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid steam guard code")]
    InvalidGuardCode,
    #[error("too many login attempts, rate limited by steam")]
    RateLimited,
    #[error("session token expired or revoked")]
    TokenRejected,
    #[error("login aborted")]
    Aborted,
    #[error("none of the allowed confirmation methods are supported: {}", .0.iter().map(ConfirmationMethod::confirmation_type).collect::<Vec<_>>().join(", "))]
    UnsupportedConfirmationAction(Vec<ConfirmationMethod>),
    #[error("unknown error {0}")]
    Unknown(i32),
}

impl LoginError {
    /// Map the `x-eresult` of a response
    ///
    /// https://steam.readthedocs.io/en/latest/api/steam.enums.html#steam.enums.common.EResult
    pub fn from_e_result(result: i32) -> Result<(), Self> {
        match result {
            1 => Ok(()),
            5 => Err(LoginError::InvalidCredentials),
            65 | 88 => Err(LoginError::InvalidGuardCode),
            84 => Err(LoginError::RateLimited),
            8 | 15 | 27 => Err(LoginError::TokenRejected),
            _ => Err(LoginError::Unknown(result)),
        }
    }
}

/// An access or refresh token
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(token: impl Into<String>) -> Self {
        Token(token.into())
    }
}

impl AsRef<str> for Token {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl Debug for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Token(..)")
    }
}

/// The token to send to steam to confirm the login
#[derive(Debug)]
pub struct SteamGuardToken(String);

impl SteamGuardToken {
    pub fn new(code: impl Into<String>) -> Self {
        SteamGuardToken(code.into())
    }
}

#[derive(Debug, Clone)]
pub struct Tokens {
    pub access_token: Token,
    pub refresh_token: Token,
    pub new_guard_data: Option<String>,
}

/// Client for the steam authentication web api
#[derive(Debug, Clone)]
pub struct AuthClient {
    client: Client,
    base: String,
}

#[derive(Deserialize)]
struct ServiceResponse<T> {
    response: Option<T>,
}

impl AuthClient {
    pub fn new(client: Client) -> Self {
        AuthClient {
            client,
            base: AUTH_API.into(),
        }
    }

    /// Talk to another endpoint than the public steam api
    pub fn with_base(self, base: impl Into<String>) -> Self {
        AuthClient {
            base: base.into(),
            ..self
        }
    }

    #[instrument(skip(self, input))]
    async fn call<Rsp: DeserializeOwned + Default>(
        &self,
        http_method: Method,
        method: &'static str,
        input: serde_json::Value,
    ) -> Result<Rsp, AuthError> {
        let url = format!("{}/{method}/v1/", self.base);
        let params = [("input_json", input.to_string())];
        let request = if http_method == Method::GET {
            self.client.get(url).query(&params)
        } else {
            self.client.post(url).form(&params)
        };
        let response = request.send().await?;
        let e_result = response
            .headers()
            .get("x-eresult")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(1);
        debug!(e_result, "auth response");
        LoginError::from_e_result(e_result)?;
        let body: ServiceResponse<Rsp> = response.error_for_status()?.json().await?;
        Ok(body.response.unwrap_or_default())
    }

    #[instrument(skip(self))]
    async fn get_password_rsa(&self, account: &str) -> Result<(RsaPublicKey, u64), AuthError> {
        debug!("getting password rsa");
        let response: RsaKeyResponse = self
            .call(
                Method::GET,
                "GetPasswordRSAPublicKey",
                json!({ "account_name": account }),
            )
            .await?;
        Ok((response.public_key()?, response.timestamp))
    }

    /// Exchange a refresh token for a fresh access token
    #[instrument(skip(self, refresh_token))]
    pub async fn generate_access_token(
        &self,
        refresh_token: &Token,
        steam_id: SteamID,
    ) -> Result<Tokens, AuthError> {
        let response: AccessTokenResponse = self
            .call(
                Method::POST,
                "GenerateAccessTokenForApp",
                json!({
                    "refresh_token": refresh_token.as_ref(),
                    "steamid": u64::from(steam_id).to_string(),
                    "renewal_type": 1,
                }),
            )
            .await?;
        if response.access_token.is_empty() {
            return Err(LoginError::TokenRejected.into());
        }
        Ok(Tokens {
            access_token: Token(response.access_token),
            refresh_token: response
                .refresh_token
                .filter(|token| !token.is_empty())
                .map(Token)
                .unwrap_or_else(|| refresh_token.clone()),
            new_guard_data: None,
        })
    }
}

/// Encrypt the account password with the key steam handed out for it
pub fn encrypt_password(key: &RsaPublicKey, password: &str) -> Result<String, AuthError> {
    let mut rng = rand::thread_rng();
    let encrypted = key.encrypt(&mut rng, Pkcs1v15Encrypt, password.as_bytes())?;
    Ok(BASE64_STANDARD.encode(encrypted))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RsaKeyResponse {
    publickey_mod: String,
    publickey_exp: String,
    #[serde(deserialize_with = "u64_from_any")]
    timestamp: u64,
}

impl RsaKeyResponse {
    fn public_key(&self) -> Result<RsaPublicKey, AuthError> {
        let malformed = |reason: String| AuthError::MalformedResponse {
            method: "GetPasswordRSAPublicKey",
            reason,
        };
        let key_mod =
            BigUint::from_str_radix(&self.publickey_mod, 16).map_err(|e| malformed(e.to_string()))?;
        let key_exp =
            BigUint::from_str_radix(&self.publickey_exp, 16).map_err(|e| malformed(e.to_string()))?;
        RsaPublicKey::new(key_mod, key_exp).map_err(|e| malformed(e.to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BeginAuthResponse {
    #[serde(deserialize_with = "u64_from_any")]
    client_id: u64,
    request_id: String,
    interval: f32,
    allowed_confirmations: Vec<AllowedConfirmation>,
    #[serde(deserialize_with = "u64_from_any")]
    steamid: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PollResponse {
    refresh_token: String,
    access_token: String,
    new_guard_data: Option<String>,
    #[serde(deserialize_with = "u64_from_any")]
    new_client_id: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AccessTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
}

/// A credentials login that steam accepted and that now waits for confirmation
#[derive(Debug)]
pub struct StartedAuth {
    client_id: u64,
    request_id: String,
    interval: Duration,
    allowed_confirmations: Vec<AllowedConfirmation>,
    steam_id: u64,
}

impl StartedAuth {
    #[instrument(skip(client, password, guard_data))]
    pub async fn begin_via_credentials(
        client: &AuthClient,
        account: &str,
        password: &str,
        guard_data: Option<&str>,
    ) -> Result<Self, AuthError> {
        let (pub_key, timestamp) = client.get_password_rsa(account).await?;
        let encrypted_password = encrypt_password(&pub_key, password)?;
        info!(account, "starting credentials login");
        let mut input = json!({
            "account_name": account,
            "encrypted_password": encrypted_password,
            "encryption_timestamp": timestamp.to_string(),
            "remember_login": true,
            "persistence": 1,
            "website_id": "Mobile",
            "device_details": {
                "device_friendly_name": "steam-account-api",
                "platform_type": 3,
                "os_type": -500,
                "gaming_device_type": 528,
            },
        });
        if let Some(guard_data) = guard_data {
            input["guard_data"] = guard_data.into();
        }
        let res: BeginAuthResponse = client
            .call(Method::POST, "BeginAuthSessionViaCredentials", input)
            .await?;
        if res.client_id == 0 || res.request_id.is_empty() {
            return Err(AuthError::MalformedResponse {
                method: "BeginAuthSessionViaCredentials",
                reason: "missing client or request id".into(),
            });
        }
        Ok(StartedAuth {
            client_id: res.client_id,
            request_id: res.request_id,
            interval: Duration::from_secs_f32(res.interval.max(0.0)).max(MIN_POLL_INTERVAL),
            allowed_confirmations: res.allowed_confirmations,
            steam_id: res.steamid,
        })
    }

    pub fn allowed_confirmations(&self) -> Vec<ConfirmationMethod> {
        self.allowed_confirmations
            .iter()
            .cloned()
            .map(ConfirmationMethod::from)
            .collect()
    }

    pub fn action_required(&self) -> bool {
        self.allowed_confirmations()
            .iter()
            .any(ConfirmationMethod::action_required)
    }

    pub fn steam_id(&self) -> SteamID {
        SteamID::from(self.steam_id)
    }

    pub async fn submit_confirmation(
        &self,
        client: &AuthClient,
        confirmation: ConfirmationAction,
    ) -> Result<(), AuthError> {
        match confirmation {
            ConfirmationAction::GuardToken(token, ty) => {
                debug!(?ty, "submitting steam guard code");
                let _: serde_json::Value = client
                    .call(
                        Method::POST,
                        "UpdateAuthSessionWithSteamGuardCode",
                        json!({
                            "client_id": self.client_id.to_string(),
                            "steamid": self.steam_id.to_string(),
                            "code": token.0,
                            "code_type": ty.code_type(),
                        }),
                    )
                    .await?;
            }
            ConfirmationAction::None => {}
            ConfirmationAction::Abort => return Err(LoginError::Aborted.into()),
        };
        Ok(())
    }

    /// Poll steam until the login is confirmed and tokens are issued
    pub async fn wait_for_tokens(&self, client: &AuthClient) -> Result<Tokens, AuthError> {
        let mut client_id = self.client_id;
        loop {
            let response: PollResponse = client
                .call(
                    Method::POST,
                    "PollAuthSessionStatus",
                    json!({
                        "client_id": client_id.to_string(),
                        "request_id": self.request_id,
                    }),
                )
                .await?;
            if response.new_client_id != 0 {
                client_id = response.new_client_id;
            }
            if !response.refresh_token.is_empty() {
                return Ok(Tokens {
                    access_token: Token(response.access_token),
                    refresh_token: Token(response.refresh_token),
                    new_guard_data: response.new_guard_data.filter(|data| !data.is_empty()),
                });
            }
            sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::traits::PublicKeyParts;
    use rsa::RsaPrivateKey;

    #[test]
    fn e_result_mapping() {
        assert!(LoginError::from_e_result(1).is_ok());
        assert!(matches!(
            LoginError::from_e_result(5),
            Err(LoginError::InvalidCredentials)
        ));
        assert!(matches!(
            LoginError::from_e_result(88),
            Err(LoginError::InvalidGuardCode)
        ));
        assert!(matches!(
            LoginError::from_e_result(84),
            Err(LoginError::RateLimited)
        ));
        assert!(matches!(
            LoginError::from_e_result(2),
            Err(LoginError::Unknown(2))
        ));
    }

    #[test]
    fn password_encryption_round_trip() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public = private.to_public_key();
        let response = RsaKeyResponse {
            publickey_mod: public.n().to_str_radix(16),
            publickey_exp: public.e().to_str_radix(16),
            timestamp: 1,
        };

        let key = response.public_key().unwrap();
        let encrypted = encrypt_password(&key, "hunter2").unwrap();
        let decrypted = private
            .decrypt(Pkcs1v15Encrypt, &BASE64_STANDARD.decode(encrypted).unwrap())
            .unwrap();
        assert_eq!(decrypted, b"hunter2");
    }

    #[test]
    fn malformed_rsa_key() {
        let response = RsaKeyResponse {
            publickey_mod: "not hex".into(),
            publickey_exp: "010001".into(),
            timestamp: 0,
        };
        assert!(matches!(
            response.public_key(),
            Err(AuthError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn begin_response_decoding() {
        let raw = r#"{"response":{"client_id":"8212345678901234567","request_id":"AAEC","interval":5,
            "allowed_confirmations":[{"confirmation_type":3,"associated_message":""}],
            "steamid":"76561197960287930","weak_token":"x"}}"#;
        let response: ServiceResponse<BeginAuthResponse> = serde_json::from_str(raw).unwrap();
        let response = response.response.unwrap();
        assert_eq!(response.client_id, 8212345678901234567);
        assert_eq!(response.steamid, 76561197960287930);
        assert_eq!(response.allowed_confirmations.len(), 1);
    }

    #[test]
    fn empty_service_response() {
        let response: ServiceResponse<PollResponse> =
            serde_json::from_str(r#"{"response":{}}"#).unwrap();
        assert!(response.response.unwrap().refresh_token.is_empty());
        let response: ServiceResponse<PollResponse> = serde_json::from_str("{}").unwrap();
        assert!(response.response.is_none());
    }

    #[test]
    fn tokens_are_not_printed() {
        let token = Token::new("secret-refresh-token");
        assert_eq!(format!("{token:?}"), "Token(..)");
    }
}
