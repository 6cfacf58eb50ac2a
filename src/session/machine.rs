use crate::broker::BrokerError;
use crate::provider::{ProviderEvent, WebCookies};
use serde::Serialize;
use std::time::Duration;
use steamid_ng::SteamID;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Minimum time between two recovery attempts after the session expired
pub const RELOGIN_WINDOW: Duration = Duration::from_secs(10);

/// How often an active web session is refreshed
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub const LOGGED_ON_MESSAGE: &str = "Bot is logged in";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum SessionState {
    LoggedOut,
    LoggingOn,
    AwaitingTwoFactor,
    LoggedOn,
    WebSessionActive,
    Expired,
    Disconnected,
}

/// What to do when steam can't be reached
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DisconnectPolicy {
    /// Exit the process and leave restarting to the supervisor
    #[default]
    Exit,
    /// Log on again, rate limited like session expiry
    Relogin,
}

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub relogin_window: Duration,
    pub keep_alive_interval: Duration,
    pub disconnect_policy: DisconnectPolicy,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            relogin_window: RELOGIN_WINDOW,
            keep_alive_interval: KEEP_ALIVE_INTERVAL,
            disconnect_policy: DisconnectPolicy::default(),
        }
    }
}

/// Inputs of the session state machine
#[derive(Debug, Clone)]
pub enum SessionEvent {
    LogOnRequested { code: Option<String> },
    Provider(ProviderEvent),
    GuardCode(Result<String, BrokerError>),
    KeepAliveTick,
    RecoveryDue,
    RefreshRequested,
    CookiesRejected(String),
    KillRequested,
}

/// Side effects requested by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    LogOn { code: Option<String> },
    WebLogOn,
    SubmitGuardCode(String),
    RequestGuardCode,
    ApplyCookies(WebCookies),
    Notify(String),
    PersistContinuation(serde_json::Value),
    ScheduleRecovery { delay: Duration },
    StartKeepAlive { interval: Duration },
    Terminate { reason: String },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub online: bool,
    pub authenticated: bool,
    pub state: SessionState,
}

/// The steam session lifecycle, free of any io
///
/// Every input is an event, every output a list of commands for the runtime to carry out.
/// Time is passed in so recovery rate limiting can be tested without a clock.
#[derive(Debug)]
pub struct SessionMachine {
    config: MachineConfig,
    state: SessionState,
    steam_id: Option<SteamID>,
    last_attempt: Option<Instant>,
    recovery_pending: bool,
    keep_alive_started: bool,
}

impl SessionMachine {
    pub fn new(config: MachineConfig) -> Self {
        SessionMachine {
            config,
            state: SessionState::LoggedOut,
            steam_id: None,
            last_attempt: None,
            recovery_pending: false,
            keep_alive_started: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            online: true,
            authenticated: self.state == SessionState::WebSessionActive,
            state: self.state,
        }
    }

    pub fn handle(&mut self, event: SessionEvent, now: Instant) -> Vec<Command> {
        let before = self.state;
        let commands = match event {
            SessionEvent::LogOnRequested { code } => self.log_on_requested(code, now),
            SessionEvent::Provider(event) => self.provider_event(event, now),
            SessionEvent::GuardCode(code) => self.guard_code(code),
            SessionEvent::KeepAliveTick => match self.state {
                SessionState::WebSessionActive => {
                    debug!("refreshing web session");
                    vec![Command::WebLogOn]
                }
                state => {
                    debug!(?state, "skipping keep-alive");
                    Vec::new()
                }
            },
            SessionEvent::RecoveryDue => {
                self.recovery_pending = false;
                match self.state {
                    SessionState::Expired | SessionState::Disconnected => {
                        self.last_attempt = Some(now);
                        vec![self.recovery_action()]
                    }
                    state => {
                        debug!(?state, "session recovered before the scheduled attempt");
                        Vec::new()
                    }
                }
            }
            SessionEvent::RefreshRequested => self.refresh(now),
            SessionEvent::CookiesRejected(reason) => vec![Command::Terminate {
                reason: format!("failed to retrieve account cookies: {reason}"),
            }],
            SessionEvent::KillRequested => vec![Command::Terminate {
                reason: "kill requested through the api".into(),
            }],
        };
        if before != self.state {
            info!(from = ?before, to = ?self.state, "session state changed");
        }
        commands
    }

    fn log_on_requested(&mut self, code: Option<String>, now: Instant) -> Vec<Command> {
        match (self.state, code) {
            (SessionState::LoggedOut | SessionState::Expired | SessionState::Disconnected, code) => {
                self.state = SessionState::LoggingOn;
                self.last_attempt = Some(now);
                vec![Command::LogOn { code }]
            }
            (SessionState::AwaitingTwoFactor, Some(code)) => {
                self.state = SessionState::LoggingOn;
                vec![Command::SubmitGuardCode(code)]
            }
            (SessionState::LoggingOn, Some(code)) => {
                debug!("login in progress, passing the code on");
                vec![Command::SubmitGuardCode(code)]
            }
            (state, _) => {
                debug!(?state, "ignoring login request");
                Vec::new()
            }
        }
    }

    fn provider_event(&mut self, event: ProviderEvent, now: Instant) -> Vec<Command> {
        match event {
            ProviderEvent::SteamGuard { last_code_wrong } => {
                self.state = SessionState::AwaitingTwoFactor;
                if last_code_wrong {
                    vec![
                        Command::Notify("Steam rejected the 2FA code".into()),
                        Command::RequestGuardCode,
                    ]
                } else {
                    vec![Command::RequestGuardCode]
                }
            }
            ProviderEvent::LoggedOn { steam_id } => {
                self.state = SessionState::LoggedOn;
                self.steam_id = Some(steam_id);
                let mut commands = vec![
                    Command::Notify(LOGGED_ON_MESSAGE.into()),
                    Command::WebLogOn,
                ];
                if !self.keep_alive_started {
                    self.keep_alive_started = true;
                    commands.push(Command::StartKeepAlive {
                        interval: self.config.keep_alive_interval,
                    });
                }
                commands
            }
            ProviderEvent::WebSession { cookies } => {
                self.state = SessionState::WebSessionActive;
                vec![Command::ApplyCookies(cookies)]
            }
            ProviderEvent::SessionExpired => match self.state {
                SessionState::WebSessionActive | SessionState::LoggedOn | SessionState::Expired => {
                    self.state = SessionState::Expired;
                    self.recover(now)
                }
                state => {
                    debug!(?state, "ignoring session expiry");
                    Vec::new()
                }
            },
            ProviderEvent::IdentityLost { reason } => {
                warn!(%reason, "session identity lost");
                self.steam_id = None;
                self.state = SessionState::Expired;
                self.recover(now)
            }
            ProviderEvent::RefreshFailed { reason } => match self.state {
                SessionState::WebSessionActive | SessionState::LoggedOn | SessionState::Expired => {
                    warn!(%reason, "web session refresh failed");
                    self.state = SessionState::Expired;
                    self.recover(now)
                }
                state => {
                    debug!(?state, %reason, "ignoring failed refresh");
                    Vec::new()
                }
            },
            ProviderEvent::Disconnected { reason } => {
                self.steam_id = None;
                match self.config.disconnect_policy {
                    DisconnectPolicy::Exit => vec![Command::Terminate {
                        reason: format!("disconnected from steam: {reason}"),
                    }],
                    DisconnectPolicy::Relogin => {
                        warn!(%reason, "disconnected from steam");
                        self.state = SessionState::Disconnected;
                        self.recover(now)
                    }
                }
            }
            ProviderEvent::LogOnFailed { reason } => {
                self.state = SessionState::LoggedOut;
                vec![Command::Notify(format!("Login failed: {reason}"))]
            }
            ProviderEvent::ContinuationChanged(continuation) => {
                vec![Command::PersistContinuation(continuation)]
            }
        }
    }

    fn guard_code(&mut self, code: Result<String, BrokerError>) -> Vec<Command> {
        match (self.state, code) {
            (SessionState::AwaitingTwoFactor, Ok(code)) => {
                self.state = SessionState::LoggingOn;
                vec![Command::SubmitGuardCode(code)]
            }
            (SessionState::AwaitingTwoFactor, Err(BrokerError::Timeout(timeout))) => {
                warn!(?timeout, "no 2FA code received, waiting for /login?code=");
                vec![Command::Notify(format!(
                    "No 2FA code received within {} seconds, supply one with /login?code=",
                    timeout.as_secs()
                ))]
            }
            (_, Err(e)) => {
                debug!(error = %e, "2FA code request ended");
                Vec::new()
            }
            (state, Ok(_)) => {
                debug!(?state, "discarding 2FA code, no challenge pending");
                Vec::new()
            }
        }
    }

    fn refresh(&mut self, now: Instant) -> Vec<Command> {
        match (self.state, self.steam_id) {
            (SessionState::WebSessionActive | SessionState::LoggedOn, Some(_)) => {
                vec![Command::WebLogOn]
            }
            (SessionState::Expired, _) => self.recover(now),
            (SessionState::LoggedOut | SessionState::Disconnected, _) => {
                self.state = SessionState::LoggingOn;
                self.last_attempt = Some(now);
                vec![Command::LogOn { code: None }]
            }
            (state, _) => {
                debug!(?state, "login in progress, not refreshing");
                Vec::new()
            }
        }
    }

    /// Recover the session, at most once per relogin window
    fn recover(&mut self, now: Instant) -> Vec<Command> {
        if self.recovery_pending {
            debug!("recovery already scheduled");
            return Vec::new();
        }
        let window = self.config.relogin_window;
        match self.last_attempt.map(|last| now.saturating_duration_since(last)) {
            Some(elapsed) if elapsed < window => {
                let delay = window - elapsed;
                info!(?delay, "session lost, waiting before logging in again");
                self.recovery_pending = true;
                vec![Command::ScheduleRecovery { delay }]
            }
            _ => {
                info!("session lost, logging in again");
                self.last_attempt = Some(now);
                vec![self.recovery_action()]
            }
        }
    }

    fn recovery_action(&mut self) -> Command {
        if self.steam_id.is_some() {
            Command::WebLogOn
        } else {
            self.state = SessionState::LoggingOn;
            Command::LogOn { code: None }
        }
    }
}
