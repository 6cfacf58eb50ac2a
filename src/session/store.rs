use crate::store::{read_json, write_json, FileStoreError};
use std::convert::Infallible;
use std::error::Error;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Trait for persisting the data needed to resume a session
///
/// The stored value is opaque to the store, the provider decides its shape.
pub trait SessionStore: Send + Sync + 'static {
    type Err: Error + Send + Sync + 'static;

    fn load(&self) -> impl Future<Output = Result<Option<serde_json::Value>, Self::Err>> + Send;

    /// Replace the stored continuation
    fn store(&self, continuation: &serde_json::Value)
        -> impl Future<Output = Result<(), Self::Err>> + Send;
}

/// Store the continuation in a json file
pub struct FileSessionStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileSessionStore {
    pub fn new(path: PathBuf) -> Self {
        FileSessionStore {
            path,
            write_lock: tokio::sync::Mutex::default(),
        }
    }
}

impl SessionStore for FileSessionStore {
    type Err = FileStoreError;

    async fn load(&self) -> Result<Option<serde_json::Value>, Self::Err> {
        read_json(&self.path).await
    }

    async fn store(&self, continuation: &serde_json::Value) -> Result<(), Self::Err> {
        let _guard = self.write_lock.lock().await;
        write_json(&self.path, continuation).await?;
        debug!(path = %self.path.display(), "stored session continuation");
        Ok(())
    }
}

/// Keep the continuation in memory only
#[derive(Default)]
pub struct MemorySessionStore {
    continuation: Mutex<Option<serde_json::Value>>,
}

impl SessionStore for MemorySessionStore {
    type Err = Infallible;

    async fn load(&self) -> Result<Option<serde_json::Value>, Self::Err> {
        Ok(self
            .continuation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn store(&self, continuation: &serde_json::Value) -> Result<(), Self::Err> {
        *self
            .continuation
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(continuation.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn file_store_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("state").join("session.json"));
        assert_eq!(store.load().await.unwrap(), None);

        store.store(&json!({ "refresh_token": "a" })).await.unwrap();
        store.store(&json!({ "refresh_token": "b" })).await.unwrap();

        assert_eq!(
            store.load().await.unwrap(),
            Some(json!({ "refresh_token": "b" }))
        );
        assert!(!dir.path().join("state").join("session.json.tmp").exists());
    }

    #[tokio::test]
    async fn concurrent_writes_leave_a_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FileSessionStore::new(dir.path().join("session.json")));
        let writes: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.store(&json!({ "generation": i })).await })
            })
            .collect();
        for write in writes {
            write.await.unwrap().unwrap();
        }
        let stored = store.load().await.unwrap().unwrap();
        assert!(stored["generation"].is_u64());
    }
}
