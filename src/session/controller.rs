use super::machine::{
    Command, MachineConfig, SessionEvent, SessionMachine, SessionState, SessionStatus,
};
use super::store::SessionStore;
use crate::broker::{OperatorNotifier, TwoFactorBroker};
use crate::provider::{EventReceiver, SessionProvider, WebSessionSink};
use crate::shutdown::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Drives the session state machine: feeds it provider events, timers and api requests
/// and carries out the commands it returns
///
/// All transitions happen on the single task running [`SessionController::run`].
pub struct SessionController<P, N, S> {
    machine: SessionMachine,
    provider: Arc<P>,
    provider_events: EventReceiver,
    broker: Arc<TwoFactorBroker<N>>,
    store: Arc<S>,
    web: Arc<dyn WebSessionSink>,
    inputs: mpsc::UnboundedReceiver<SessionEvent>,
    feedback: mpsc::UnboundedSender<SessionEvent>,
    status: watch::Sender<SessionStatus>,
    shutdown: Shutdown,
}

/// Cheap handle for the http api to talk to the session controller
#[derive(Debug, Clone)]
pub struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    fn send(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            warn!("session controller is not running");
        }
    }

    /// Start a login if none is running, or answer a pending steam guard challenge with `code`
    pub fn trigger_log_on(&self, code: Option<String>) {
        self.send(SessionEvent::LogOnRequested { code })
    }

    /// Get new web cookies, logging on again if needed
    pub fn refresh(&self) {
        self.send(SessionEvent::RefreshRequested)
    }

    /// Terminate the process
    pub fn kill(&self) {
        self.send(SessionEvent::KillRequested)
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }
}

impl<P, N, S> SessionController<P, N, S>
where
    P: SessionProvider,
    N: OperatorNotifier + 'static,
    S: SessionStore,
{
    pub fn new(
        provider: Arc<P>,
        provider_events: EventReceiver,
        broker: Arc<TwoFactorBroker<N>>,
        store: Arc<S>,
        web: Arc<dyn WebSessionSink>,
        config: MachineConfig,
        shutdown: Shutdown,
    ) -> (Self, SessionHandle) {
        let machine = SessionMachine::new(config);
        let (status, status_rx) = watch::channel(machine.status());
        let (events, inputs) = mpsc::unbounded_channel();
        let controller = SessionController {
            machine,
            provider,
            provider_events,
            broker,
            store,
            web,
            inputs,
            feedback: events.clone(),
            status,
            shutdown,
        };
        let handle = SessionHandle {
            events,
            status: status_rx,
        };
        (controller, handle)
    }

    pub async fn run(mut self) {
        info!("session controller started");
        loop {
            let event = select! {
                _ = self.shutdown.cancelled() => break,
                Some(event) = self.inputs.recv() => event,
                Some(event) = self.provider_events.recv() => SessionEvent::Provider(event),
                else => break,
            };
            debug!(?event, "session event");
            let commands = self.machine.handle(event, Instant::now());
            self.status.send_replace(self.machine.status());
            for command in commands {
                self.execute(command).await;
            }
        }
        info!("session controller stopped");
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::LogOn { code } => {
                info!(with_code = code.is_some(), "logging on to steam");
                self.provider.log_on(code)
            }
            Command::WebLogOn => self.provider.web_log_on(),
            Command::SubmitGuardCode(code) => self.provider.submit_guard_code(code),
            Command::RequestGuardCode => {
                let broker = self.broker.clone();
                let feedback = self.feedback.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    select! {
                        _ = shutdown.cancelled() => {}
                        code = broker.request_code() => {
                            let _ = feedback.send(SessionEvent::GuardCode(code));
                        }
                    }
                });
            }
            Command::ApplyCookies(cookies) => {
                if let Err(e) = self.web.set_cookies(cookies) {
                    let _ = self.feedback.send(SessionEvent::CookiesRejected(e.to_string()));
                }
            }
            Command::Notify(message) => {
                let broker = self.broker.clone();
                tokio::spawn(async move { broker.notifier().notify(&message).await });
            }
            Command::PersistContinuation(continuation) => {
                if let Err(e) = self.store.store(&continuation).await {
                    error!(error = %e, "failed to persist session continuation");
                }
            }
            Command::ScheduleRecovery { delay } => self.schedule(delay, SessionEvent::RecoveryDue),
            Command::StartKeepAlive { interval } => self.start_keep_alive(interval),
            Command::Terminate { reason } => {
                error!(%reason, "terminating");
                self.shutdown.terminate(1);
            }
        }
    }

    fn schedule(&self, delay: Duration, event: SessionEvent) {
        let feedback = self.feedback.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            select! {
                _ = shutdown.cancelled() => {}
                _ = sleep(delay) => {
                    let _ = feedback.send(event);
                }
            }
        });
    }

    fn start_keep_alive(&self, period: Duration) {
        let feedback = self.feedback.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticks.tick() => {
                        if feedback.send(SessionEvent::KeepAliveTick).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
impl SessionHandle {
    /// A handle that is not connected to a controller, with the events it receives
    pub(crate) fn detached(
        state: SessionState,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (_, status) = watch::channel(SessionStatus {
            online: true,
            authenticated: state == SessionState::WebSessionActive,
            state,
        });
        (SessionHandle { events, status }, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::CODE_REQUEST_MESSAGE;
    use crate::chats::tests::RecordingChannel;
    use crate::chats::{ChatId, ChatRegistry, MemoryChatStore};
    use crate::provider::{event_channel, CookieError, EventSender, ProviderEvent, WebCookies};
    use crate::session::machine::LOGGED_ON_MESSAGE;
    use crate::session::store::MemorySessionStore;
    use crate::telegram::handle_message;
    use std::sync::Mutex;
    use steamid_ng::SteamID;

    #[derive(Debug, Clone, PartialEq)]
    enum ProviderCall {
        LogOn(Option<String>),
        WebLogOn,
        SubmitGuardCode(String),
    }

    /// Provider recording calls, the test plays the steam side by sending events
    #[derive(Default)]
    struct ScriptedProvider {
        calls: Mutex<Vec<ProviderCall>>,
    }

    impl ScriptedProvider {
        fn calls(&self) -> Vec<ProviderCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SessionProvider for ScriptedProvider {
        fn log_on(&self, code: Option<String>) {
            self.calls.lock().unwrap().push(ProviderCall::LogOn(code));
        }

        fn web_log_on(&self) {
            self.calls.lock().unwrap().push(ProviderCall::WebLogOn);
        }

        fn submit_guard_code(&self, code: String) {
            self.calls
                .lock()
                .unwrap()
                .push(ProviderCall::SubmitGuardCode(code));
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        cookies: Mutex<Vec<WebCookies>>,
        reject: bool,
    }

    impl WebSessionSink for RecordingSink {
        fn set_cookies(&self, cookies: WebCookies) -> Result<(), CookieError> {
            if self.reject {
                return Err(CookieError("no api key".into()));
            }
            self.cookies.lock().unwrap().push(cookies);
            Ok(())
        }
    }

    type Registry = ChatRegistry<MemoryChatStore, RecordingChannel>;

    struct Harness {
        provider: Arc<ScriptedProvider>,
        steam: EventSender,
        registry: Arc<Registry>,
        channel: RecordingChannel,
        broker: Arc<TwoFactorBroker<Arc<Registry>>>,
        store: Arc<MemorySessionStore>,
        sink: Arc<RecordingSink>,
        handle: SessionHandle,
        shutdown: Shutdown,
    }

    async fn start(sink: RecordingSink) -> Harness {
        let channel = RecordingChannel::default();
        let registry = Arc::new(ChatRegistry::new(MemoryChatStore::default(), channel.clone()));
        registry.register(ChatId(1)).await.unwrap();
        registry.register(ChatId(2)).await.unwrap();
        let broker = Arc::new(TwoFactorBroker::new(registry.clone()));
        let provider = Arc::new(ScriptedProvider::default());
        let store = Arc::new(MemorySessionStore::default());
        let sink = Arc::new(sink);
        let shutdown = Shutdown::new();
        let (steam, provider_events) = event_channel();

        let (controller, handle) = SessionController::new(
            provider.clone(),
            provider_events,
            broker.clone(),
            store.clone(),
            sink.clone(),
            MachineConfig::default(),
            shutdown.clone(),
        );
        tokio::spawn(controller.run());

        Harness {
            provider,
            steam,
            registry,
            channel,
            broker,
            store,
            sink,
            handle,
            shutdown,
        }
    }

    /// Let spawned tasks run without moving the clock noticeably
    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    fn steam_id() -> SteamID {
        SteamID::from(76561197960287930)
    }

    fn cookies() -> WebCookies {
        WebCookies {
            steam_id: 76561197960287930,
            session_id: "0123456789abcdef01234567".into(),
            steam_login_secure: "76561197960287930%7C%7Ctoken".into(),
            access_token: "token".into(),
        }
    }

    fn messages_to(channel: &RecordingChannel, text: &str) -> Vec<ChatId> {
        channel
            .messages()
            .into_iter()
            .filter(|(_, message)| message == text)
            .map(|(chat, _)| chat)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn guard_code_from_operator_completes_login() {
        let h = start(RecordingSink::default()).await;

        h.handle.trigger_log_on(None);
        settle().await;
        assert_eq!(h.provider.calls(), vec![ProviderCall::LogOn(None)]);
        assert_eq!(h.handle.status().state, SessionState::LoggingOn);

        h.steam
            .send(ProviderEvent::SteamGuard {
                last_code_wrong: false,
            })
            .unwrap();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(h.handle.status().state, SessionState::AwaitingTwoFactor);
        assert_eq!(
            messages_to(&h.channel, CODE_REQUEST_MESSAGE),
            vec![ChatId(1), ChatId(2)]
        );

        handle_message(&h.registry, &h.broker, ChatId(2), "X7K2M").await;
        settle().await;
        assert_eq!(
            h.provider.calls().last(),
            Some(&ProviderCall::SubmitGuardCode("X7K2M".into()))
        );
        assert_eq!(h.handle.status().state, SessionState::LoggingOn);

        h.steam
            .send(ProviderEvent::LoggedOn {
                steam_id: steam_id(),
            })
            .unwrap();
        settle().await;
        assert_eq!(h.handle.status().state, SessionState::LoggedOn);
        assert_eq!(
            messages_to(&h.channel, LOGGED_ON_MESSAGE),
            vec![ChatId(1), ChatId(2)]
        );
        assert_eq!(h.provider.calls().last(), Some(&ProviderCall::WebLogOn));
    }

    #[tokio::test(start_paused = true)]
    async fn guard_timeout_is_reported_and_login_code_still_accepted() {
        let h = start(RecordingSink::default()).await;
        h.handle.trigger_log_on(None);
        settle().await;
        h.steam
            .send(ProviderEvent::SteamGuard {
                last_code_wrong: false,
            })
            .unwrap();

        sleep(Duration::from_secs(31)).await;
        assert_eq!(h.handle.status().state, SessionState::AwaitingTwoFactor);
        assert!(h
            .channel
            .messages()
            .iter()
            .any(|(_, message)| message.contains("/login?code=")));

        h.handle.trigger_log_on(Some("AB12C".into()));
        settle().await;
        assert_eq!(
            h.provider.calls().last(),
            Some(&ProviderCall::SubmitGuardCode("AB12C".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn web_session_applies_cookies_and_keeps_alive() {
        let h = start(RecordingSink::default()).await;
        h.handle.trigger_log_on(None);
        settle().await;
        h.steam
            .send(ProviderEvent::LoggedOn {
                steam_id: steam_id(),
            })
            .unwrap();
        h.steam
            .send(ProviderEvent::WebSession { cookies: cookies() })
            .unwrap();
        settle().await;
        assert!(h.handle.status().authenticated);
        assert_eq!(*h.sink.cookies.lock().unwrap(), vec![cookies()]);
        let calls = h.provider.calls().len();

        sleep(Duration::from_secs(10 * 60)).await;
        settle().await;
        assert_eq!(h.provider.calls().len(), calls + 1);
        assert_eq!(h.provider.calls().last(), Some(&ProviderCall::WebLogOn));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_recovery_waits_out_the_relogin_window() {
        let h = start(RecordingSink::default()).await;
        h.handle.trigger_log_on(None);
        settle().await;
        h.steam
            .send(ProviderEvent::LoggedOn {
                steam_id: steam_id(),
            })
            .unwrap();
        h.steam
            .send(ProviderEvent::WebSession { cookies: cookies() })
            .unwrap();
        settle().await;
        let calls = h.provider.calls().len();

        sleep(Duration::from_secs(3)).await;
        h.steam.send(ProviderEvent::SessionExpired).unwrap();
        h.steam.send(ProviderEvent::SessionExpired).unwrap();
        settle().await;
        assert_eq!(h.handle.status().state, SessionState::Expired);
        assert_eq!(h.provider.calls().len(), calls);

        sleep(Duration::from_millis(6900)).await;
        assert_eq!(h.provider.calls().len(), calls);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(h.provider.calls().len(), calls + 1);
        assert_eq!(h.provider.calls().last(), Some(&ProviderCall::WebLogOn));
    }

    #[tokio::test(start_paused = true)]
    async fn status_is_stable_between_events() {
        let h = start(RecordingSink::default()).await;
        h.handle.trigger_log_on(None);
        settle().await;
        h.steam
            .send(ProviderEvent::LoggedOn {
                steam_id: steam_id(),
            })
            .unwrap();
        h.steam
            .send(ProviderEvent::WebSession { cookies: cookies() })
            .unwrap();
        settle().await;

        let first = h.handle.status();
        assert_eq!(first.state, SessionState::WebSessionActive);
        for _ in 0..3 {
            settle().await;
            assert_eq!(h.handle.status(), first);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_keep_alive_refresh_keeps_running() {
        let h = start(RecordingSink::default()).await;
        h.handle.trigger_log_on(None);
        settle().await;
        h.steam
            .send(ProviderEvent::LoggedOn {
                steam_id: steam_id(),
            })
            .unwrap();
        h.steam
            .send(ProviderEvent::WebSession { cookies: cookies() })
            .unwrap();
        settle().await;

        sleep(Duration::from_secs(10 * 60)).await;
        settle().await;
        let calls = h.provider.calls().len();
        h.steam
            .send(ProviderEvent::RefreshFailed {
                reason: "429 Too Many Requests".into(),
            })
            .unwrap();
        settle().await;
        assert!(!h.shutdown.is_terminated());
        assert_eq!(h.handle.status().state, SessionState::Expired);
        assert_eq!(h.provider.calls().len(), calls + 1);
        assert_eq!(h.provider.calls().last(), Some(&ProviderCall::WebLogOn));
    }

    #[tokio::test(start_paused = true)]
    async fn continuation_is_written_through() {
        let h = start(RecordingSink::default()).await;
        let continuation = serde_json::json!({ "refresh_token": "r" });
        h.steam
            .send(ProviderEvent::ContinuationChanged(continuation.clone()))
            .unwrap();
        settle().await;
        assert_eq!(h.store.load().await.unwrap(), Some(continuation));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_cookies_terminate() {
        let h = start(RecordingSink {
            reject: true,
            ..RecordingSink::default()
        })
        .await;
        h.handle.trigger_log_on(None);
        settle().await;
        h.steam
            .send(ProviderEvent::WebSession { cookies: cookies() })
            .unwrap();
        settle().await;
        assert!(h.shutdown.is_terminated());
        assert_eq!(h.shutdown.exit_code(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn kill_terminates() {
        let h = start(RecordingSink::default()).await;
        h.handle.kill();
        settle().await;
        assert!(h.shutdown.is_terminated());
        assert_eq!(h.shutdown.exit_code(), 1);
    }
}
