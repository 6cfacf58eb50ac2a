use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// How long operators have to answer a code request
pub const CODE_TIMEOUT: Duration = Duration::from_secs(30);

/// Message sent to every operator when a code is needed
pub const CODE_REQUEST_MESSAGE: &str = "API is requesting 2FA code...";

/// Something that can deliver a message to all operators
pub trait OperatorNotifier: Send + Sync {
    fn notify(&self, message: &str) -> impl Future<Output = ()> + Send;
}

impl<T: OperatorNotifier> OperatorNotifier for Arc<T> {
    fn notify(&self, message: &str) -> impl Future<Output = ()> + Send {
        (**self).notify(message)
    }
}

/// Without an operator channel messages only end up in the log
impl<T: OperatorNotifier> OperatorNotifier for Option<T> {
    async fn notify(&self, message: &str) {
        match self {
            Some(notifier) => notifier.notify(message).await,
            None => info!(text = message, "no operator channel configured"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum BrokerError {
    #[error("no 2FA code received within {0:?}")]
    Timeout(Duration),
    #[error("a 2FA code request is already in flight")]
    AlreadyPending,
    #[error("2FA code request was abandoned")]
    Closed,
}

/// Check if a message has the shape of a steam guard code: exactly 5 ascii letters or digits
pub fn is_guard_code(text: &str) -> bool {
    text.len() == 5 && text.bytes().all(|b| b.is_ascii_alphanumeric())
}

struct PendingRequest {
    id: u64,
    created: Instant,
    reply: oneshot::Sender<String>,
}

/// Relays a steam guard code request to the operators and hands the first valid answer back
///
/// At most one request is outstanding at a time, a second `request_code` while one is pending
/// fails with [`BrokerError::AlreadyPending`] instead of replacing the first.
pub struct TwoFactorBroker<N> {
    notifier: N,
    timeout: Duration,
    pending: Mutex<Option<PendingRequest>>,
    next_id: AtomicU64,
}

impl<N: OperatorNotifier> TwoFactorBroker<N> {
    pub fn new(notifier: N) -> Self {
        TwoFactorBroker {
            notifier,
            timeout: CODE_TIMEOUT,
            pending: Mutex::default(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        TwoFactorBroker { timeout, ..self }
    }

    /// The channel used to reach the operators
    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Ask all operators for a code and wait for the first valid answer
    pub async fn request_code(&self) -> Result<String, BrokerError> {
        let (tx, rx) = oneshot::channel();
        let created = Instant::now();
        let id = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if pending.is_some() {
                debug!("rejecting code request, another one is in flight");
                return Err(BrokerError::AlreadyPending);
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            *pending = Some(PendingRequest {
                id,
                created,
                reply: tx,
            });
            id
        };
        // dropping this future early must not leave the slot occupied
        let _guard = PendingGuard { broker: self, id };

        info!("requesting 2FA code from operators");
        self.notifier.notify(CODE_REQUEST_MESSAGE).await;

        match timeout_at(created + self.timeout, rx).await {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(_)) => Err(BrokerError::Closed),
            Err(_) => {
                warn!(timeout = ?self.timeout, "no 2FA code received in time");
                Err(BrokerError::Timeout(self.timeout))
            }
        }
    }

    /// Offer a message as the answer to the pending request
    ///
    /// Returns `true` if the message was a well-formed code and a request was waiting for it.
    pub fn submit_code(&self, text: &str) -> bool {
        if !is_guard_code(text) {
            return false;
        }
        let Some(request) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            debug!("ignoring 2FA code, no request pending");
            return false;
        };
        let waited = request.created.elapsed();
        if request.reply.send(text.to_string()).is_ok() {
            info!(?waited, "received 2FA code");
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn clear(&self, id: u64) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.as_ref().is_some_and(|request| request.id == id) {
            *pending = None;
        }
    }
}

struct PendingGuard<'a, N: OperatorNotifier> {
    broker: &'a TwoFactorBroker<N>,
    id: u64,
}

impl<N: OperatorNotifier> Drop for PendingGuard<'_, N> {
    fn drop(&mut self) {
        self.broker.clear(self.id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::time::sleep;

    /// Notifier recording every message
    #[derive(Clone, Default)]
    pub struct RecordingNotifier {
        pub messages: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingNotifier {
        pub fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl OperatorNotifier for RecordingNotifier {
        async fn notify(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    #[test]
    fn guard_code_shape() {
        assert!(is_guard_code("AB12C"));
        assert!(is_guard_code("x7k2m"));
        assert!(!is_guard_code("AB12"));
        assert!(!is_guard_code("AB12CD"));
        assert!(!is_guard_code("AB 2C"));
        assert!(!is_guard_code("/star"));
        assert!(!is_guard_code("ÄB12C"));
        assert!(!is_guard_code(""));
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_with_submitted_code() {
        let notifier = RecordingNotifier::default();
        let broker = Arc::new(TwoFactorBroker::new(notifier.clone()));

        let waiting = tokio::spawn({
            let broker = broker.clone();
            async move { broker.request_code().await }
        });
        sleep(Duration::from_secs(12)).await;
        assert!(broker.is_pending());
        assert!(broker.submit_code("AB12C"));

        assert_eq!(waiting.await.unwrap(), Ok("AB12C".to_string()));
        assert_eq!(notifier.messages(), vec![CODE_REQUEST_MESSAGE.to_string()]);
        assert!(!broker.is_pending());
        // a second answer for the same window is a no-op
        assert!(!broker.submit_code("ZZZZZ"));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_answer() {
        let broker = Arc::new(TwoFactorBroker::new(RecordingNotifier::default()));

        let started = Instant::now();
        let result = broker.request_code().await;
        assert_eq!(result, Err(BrokerError::Timeout(CODE_TIMEOUT)));
        assert_eq!(started.elapsed(), CODE_TIMEOUT);
        assert!(!broker.is_pending());
        assert!(!broker.submit_code("AB12C"));
    }

    #[tokio::test(start_paused = true)]
    async fn custom_timeout() {
        let timeout = Duration::from_secs(5);
        let broker = TwoFactorBroker::new(RecordingNotifier::default()).with_timeout(timeout);

        let started = Instant::now();
        assert_eq!(broker.request_code().await, Err(BrokerError::Timeout(timeout)));
        assert_eq!(started.elapsed(), timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn late_code_after_timeout_is_ignored() {
        let broker = Arc::new(TwoFactorBroker::new(RecordingNotifier::default()));
        let waiting = tokio::spawn({
            let broker = broker.clone();
            async move { broker.request_code().await }
        });

        sleep(CODE_TIMEOUT + Duration::from_secs(1)).await;
        assert!(!broker.submit_code("AB12C"));
        assert_eq!(
            waiting.await.unwrap(),
            Err(BrokerError::Timeout(CODE_TIMEOUT))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn second_request_is_rejected_while_pending() {
        let broker = Arc::new(TwoFactorBroker::new(RecordingNotifier::default()));
        let first = tokio::spawn({
            let broker = broker.clone();
            async move { broker.request_code().await }
        });
        sleep(Duration::from_secs(1)).await;

        assert_eq!(broker.request_code().await, Err(BrokerError::AlreadyPending));

        assert!(broker.submit_code("QWE12"));
        assert_eq!(first.await.unwrap(), Ok("QWE12".to_string()));

        // the slot is free again once the first request resolved
        let third = tokio::spawn({
            let broker = broker.clone();
            async move { broker.request_code().await }
        });
        sleep(Duration::from_secs(1)).await;
        assert!(broker.submit_code("RTY34"));
        assert_eq!(third.await.unwrap(), Ok("RTY34".to_string()));
    }

    #[tokio::test]
    async fn submit_without_request_has_no_effect() {
        let broker = TwoFactorBroker::new(RecordingNotifier::default());
        assert!(!broker.submit_code("AB12C"));
        assert!(!broker.submit_code("not a code"));
        assert!(!broker.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_answers_keep_the_request_open() {
        let broker = Arc::new(TwoFactorBroker::new(RecordingNotifier::default()));
        let waiting = tokio::spawn({
            let broker = broker.clone();
            async move { broker.request_code().await }
        });
        sleep(Duration::from_secs(1)).await;

        assert!(!broker.submit_code("hello there"));
        assert!(!broker.submit_code("12"));
        assert!(broker.is_pending());
        assert!(broker.submit_code("99ZZ9"));
        assert_eq!(waiting.await.unwrap(), Ok("99ZZ9".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_request_frees_the_slot() {
        let broker = Arc::new(TwoFactorBroker::new(RecordingNotifier::default()));
        let waiting = tokio::spawn({
            let broker = broker.clone();
            async move { broker.request_code().await }
        });
        sleep(Duration::from_secs(1)).await;
        waiting.abort();
        let _ = waiting.await;

        assert!(!broker.is_pending());
    }
}
