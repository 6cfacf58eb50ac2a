use crate::broker::OperatorNotifier;
use crate::store::{read_json, write_json, FileStoreError};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Identifier of an operator chat
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl Display for ChatId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A channel that can deliver text messages to operator chats
pub trait ChatChannel: Send + Sync {
    type Err: Error + Send + Sync + 'static;

    /// Send a message to a single chat
    fn send_message(
        &self,
        chat: ChatId,
        text: &str,
    ) -> impl Future<Output = Result<(), Self::Err>> + Send;
}

/// Trait for persisting the registered operator chats
pub trait ChatStore: Send + Sync {
    type Err: Error + Send + Sync + 'static;

    /// Load the registered chats in registration order
    fn load(&self) -> impl Future<Output = Result<Vec<ChatId>, Self::Err>> + Send;

    /// Replace the stored chats
    fn save(&self, chats: &[ChatId]) -> impl Future<Output = Result<(), Self::Err>> + Send;
}

/// Store the registered chats as a json array
pub struct FileChatStore {
    path: PathBuf,
}

impl FileChatStore {
    pub fn new(path: PathBuf) -> Self {
        FileChatStore { path }
    }
}

impl ChatStore for FileChatStore {
    type Err = FileStoreError;

    async fn load(&self) -> Result<Vec<ChatId>, Self::Err> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    async fn save(&self, chats: &[ChatId]) -> Result<(), Self::Err> {
        write_json(&self.path, chats).await
    }
}

/// Keep the registered chats in memory only
#[derive(Default)]
pub struct MemoryChatStore {
    chats: Mutex<Vec<ChatId>>,
}

impl ChatStore for MemoryChatStore {
    type Err = Infallible;

    async fn load(&self) -> Result<Vec<ChatId>, Self::Err> {
        Ok(self
            .chats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn save(&self, chats: &[ChatId]) -> Result<(), Self::Err> {
        *self.chats.lock().unwrap_or_else(PoisonError::into_inner) = chats.to_vec();
        Ok(())
    }
}

/// The set of operator chats that receive account events and may answer 2FA requests
///
/// The registry is re-read from the store on every operation, so edits to the stored
/// list are picked up without a restart. Mutations are serialized to keep concurrent
/// registrations from overwriting each other.
pub struct ChatRegistry<S, C> {
    store: S,
    channel: C,
    write_lock: tokio::sync::Mutex<()>,
}

impl<S: ChatStore, C: ChatChannel> ChatRegistry<S, C> {
    pub fn new(store: S, channel: C) -> Self {
        ChatRegistry {
            store,
            channel,
            write_lock: tokio::sync::Mutex::default(),
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// The registered chats, without duplicates, in registration order
    pub async fn chats(&self) -> Result<Vec<ChatId>, S::Err> {
        let mut chats = self.store.load().await?;
        let mut seen = Vec::with_capacity(chats.len());
        chats.retain(|chat| {
            if seen.contains(chat) {
                false
            } else {
                seen.push(*chat);
                true
            }
        });
        Ok(chats)
    }

    /// Register a chat, returning `false` if it was already registered
    pub async fn register(&self, chat: ChatId) -> Result<bool, S::Err> {
        let _guard = self.write_lock.lock().await;
        let mut chats = self.chats().await?;
        let added = !chats.contains(&chat);
        if added {
            chats.push(chat);
        }
        self.store.save(&chats).await?;
        if added {
            info!(%chat, "registered operator chat");
        }
        Ok(added)
    }

    /// Send a message to every registered chat
    ///
    /// Delivery is best effort, failing chats are logged and skipped.
    /// Returns the number of chats the message was delivered to.
    pub async fn broadcast(&self, message: &str) -> Result<usize, S::Err> {
        let chats = self.chats().await?;
        let mut delivered = 0;
        for chat in chats {
            match self.channel.send_message(chat, message).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(error = %e, %chat, "failed to deliver message to operator"),
            }
        }
        debug!(delivered, "broadcast message to operators");
        Ok(delivered)
    }
}

impl<S: ChatStore, C: ChatChannel> OperatorNotifier for ChatRegistry<S, C> {
    async fn notify(&self, message: &str) {
        if let Err(e) = self.broadcast(message).await {
            warn!(error = %e, "failed to load operator chats");
        }
    }
}
