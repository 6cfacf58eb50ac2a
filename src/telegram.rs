use crate::broker::{is_guard_code, OperatorNotifier, TwoFactorBroker};
use crate::chats::{ChatChannel, ChatId, ChatRegistry, ChatStore};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const API_BASE: &str = "https://api.telegram.org";

/// Seconds a `getUpdates` call is held open by telegram
const LONG_POLL_SECONDS: u64 = 30;

const RETRY_DELAY: Duration = Duration::from_secs(5);

pub const REGISTERED_REPLY: &str = "Registered to receive Steam Account events.";
pub const ALREADY_REGISTERED_REPLY: &str = "Chat already registered!";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TelegramError {
    #[error("Failed to reach telegram: {0:#}")]
    Network(#[from] reqwest::Error),
    #[error("telegram rejected {method}: {description}")]
    Api {
        method: &'static str,
        description: String,
    },
}

/// Minimal client for the telegram bot api
#[derive(Clone)]
pub struct TelegramBot {
    client: Client,
    base: String,
}

impl Debug for TelegramBot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramBot").finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

impl TelegramBot {
    pub fn new(client: Client, token: &str) -> Self {
        TelegramBot {
            client,
            base: format!("{API_BASE}/bot{token}"),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        body: serde_json::Value,
    ) -> Result<T, TelegramError> {
        let response: ApiResponse<T> = self
            .client
            .post(format!("{}/{method}", self.base))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        match response {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            ApiResponse { description, .. } => Err(TelegramError::Api {
                method,
                description: description.unwrap_or_else(|| "no description".into()),
            }),
        }
    }

    /// Long-poll for new updates after `offset`
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TelegramError> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": LONG_POLL_SECONDS,
                "allowed_updates": ["message"],
            }),
        )
        .await
    }
}

impl ChatChannel for TelegramBot {
    type Err = TelegramError;

    #[instrument(skip(self, text))]
    async fn send_message(&self, chat: ChatId, text: &str) -> Result<(), Self::Err> {
        let _: serde_json::Value = self
            .call("sendMessage", json!({ "chat_id": chat.0, "text": text }))
            .await?;
        Ok(())
    }
}

/// What an operator message asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Register,
    Code(String),
    Other,
}

impl BotCommand {
    pub fn parse(text: &str) -> Self {
        if text.contains("/start") || text.contains("/register") {
            BotCommand::Register
        } else if is_guard_code(text) {
            BotCommand::Code(text.to_string())
        } else {
            BotCommand::Other
        }
    }
}

/// Handle a single operator message
pub async fn handle_message<S, C, N>(
    registry: &ChatRegistry<S, C>,
    broker: &TwoFactorBroker<N>,
    chat: ChatId,
    text: &str,
) where
    S: ChatStore,
    C: ChatChannel,
    N: OperatorNotifier,
{
    match BotCommand::parse(text) {
        BotCommand::Register => {
            let reply = match registry.register(chat).await {
                Ok(true) => REGISTERED_REPLY,
                Ok(false) => ALREADY_REGISTERED_REPLY,
                Err(e) => {
                    error!(error = %e, %chat, "failed to register chat");
                    return;
                }
            };
            if let Err(e) = registry.channel().send_message(chat, reply).await {
                warn!(error = %e, %chat, "failed to reply to registration");
            }
        }
        BotCommand::Code(code) => {
            info!(%chat, "received 2FA code");
            if !broker.submit_code(&code) {
                debug!("2FA code was not used");
            }
        }
        BotCommand::Other => {}
    }
}

/// Poll telegram for operator messages until `shutdown` is cancelled
pub async fn run_relay<S, N>(
    registry: Arc<ChatRegistry<S, TelegramBot>>,
    broker: Arc<TwoFactorBroker<N>>,
    shutdown: CancellationToken,
) where
    S: ChatStore,
    N: OperatorNotifier,
{
    info!("starting telegram relay");
    let mut offset = 0;
    loop {
        let updates = select! {
            _ = shutdown.cancelled() => break,
            updates = registry.channel().get_updates(offset) => updates,
        };
        match updates {
            Ok(updates) => {
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    let Some(Message {
                        chat,
                        text: Some(text),
                    }) = update.message
                    else {
                        continue;
                    };
                    handle_message(&registry, &broker, ChatId(chat.id), &text).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch telegram updates, retrying in {:?}", RETRY_DELAY);
                select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(RETRY_DELAY) => {}
                }
            }
        }
    }
    info!("telegram relay stopped");
}
