use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Process wide termination signal carrying the exit code
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    exit_code: Arc<AtomicI32>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every task to stop, the first requested exit code wins
    pub fn terminate(&self, exit_code: i32) {
        if self.token.is_cancelled() {
            return;
        }
        info!(exit_code, "shutting down");
        self.exit_code.store(exit_code, Ordering::Release);
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_terminated(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_exit_code_wins() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_terminated());
        let waiting = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        });

        shutdown.terminate(1);
        shutdown.terminate(0);
        waiting.await.unwrap();
        assert!(shutdown.is_terminated());
        assert_eq!(shutdown.exit_code(), 1);
    }
}
