use std::time::Duration;

use tracing::{info, warn};

use crate::backoff::Backoff;
use crate::config::ConnectionConfig;
use crate::dispatch::Dispatcher;
use crate::error::ErrorKind;
use crate::probe::{NetworkProbe, ReadinessMonitor};
use crate::provisioning::{
    ProvisioningConnector, RegistrationEngine, RegistrationStatus, TimeoutChange,
};
use crate::session::{HubConnector, HubSession, SessionSettings, SessionState};

/// Supervisor tick period.
pub const SUPERVISOR_PERIOD: Duration = Duration::from_millis(100);

/// All the capabilities the supervisor needs from a platform.
pub trait Platform: NetworkProbe + ProvisioningConnector + HubConnector {}

impl<T> Platform for T where T: NetworkProbe + ProvisioningConnector + HubConnector {}

/// The externally visible supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Nothing has been attempted yet, or the supervisor has been reset.
    Idle,
    /// The network is not ready.
    NetworkWait,
    /// A registration is in progress.
    Registering,
    /// The registration has failed, waiting for the next attempt.
    RegistrationFailed,
    /// A hub session has been opened and is authenticating.
    HubInitializing,
    /// The hub session is authenticated.
    HubAuthenticated,
    /// The hub session has failed, waiting for the next attempt.
    HubFailed,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => "Idle",
            Self::NetworkWait => "NetworkWait",
            Self::Registering => "Registering",
            Self::RegistrationFailed => "RegistrationFailed",
            Self::HubInitializing => "HubInitializing",
            Self::HubAuthenticated => "HubAuthenticated",
            Self::HubFailed => "HubFailed",
        }
        .fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureCause {
    Registration,
    Hub,
}

// At most one of the provisioning client and the hub client is alive.
#[derive(Debug)]
enum Stage<C, T> {
    Idle,
    NetworkWait,
    Registering(RegistrationEngine<C>),
    Hub(HubSession<T>),
    Backoff {
        cause: FailureCause,
        // `None` waits until the network is lost.
        retry_at: Option<Duration>,
    },
}

/// Sequences network readiness, provisioning and hub sessions, and owns all
/// the retries.
pub struct Supervisor<P: Platform> {
    stage: Stage<P::Client, P::Transport>,
    monitor: ReadinessMonitor,
    backoff: Backoff,
    hub_uri: Option<String>,
    last_attempt: Option<Duration>,
    last_reason: Option<String>,
    configuration_warned: bool,
    timeout_changes: Vec<TimeoutChange>,
}

impl<P: Platform> std::fmt::Debug for Supervisor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state())
            .field("backoff", &self.backoff)
            .field("hub_uri", &self.hub_uri)
            .field("last_attempt", &self.last_attempt)
            .field("last_reason", &self.last_reason)
            .finish_non_exhaustive()
    }
}

impl<P: Platform> Default for Supervisor<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> Supervisor<P> {
    /// Creates an idle [`Supervisor`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            stage: Stage::Idle,
            monitor: ReadinessMonitor::new(),
            backoff: Backoff::new(),
            hub_uri: None,
            last_attempt: None,
            last_reason: None,
            configuration_warned: false,
            timeout_changes: Vec::new(),
        }
    }

    /// Returns the supervisor state.
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        match &self.stage {
            Stage::Idle => SupervisorState::Idle,
            Stage::NetworkWait => SupervisorState::NetworkWait,
            Stage::Registering(_) => SupervisorState::Registering,
            Stage::Hub(session) => match session.state() {
                SessionState::Connected => SupervisorState::HubAuthenticated,
                _ => SupervisorState::HubInitializing,
            },
            Stage::Backoff {
                cause: FailureCause::Registration,
                ..
            } => SupervisorState::RegistrationFailed,
            Stage::Backoff {
                cause: FailureCause::Hub,
                ..
            } => SupervisorState::HubFailed,
        }
    }

    /// Returns the hub URI assigned by the last registration.
    #[must_use]
    pub fn hub_uri(&self) -> Option<&str> {
        self.hub_uri.as_deref()
    }

    /// Returns the instant of the next attempt while backing off.
    #[must_use]
    pub const fn retry_at(&self) -> Option<Duration> {
        match self.stage {
            Stage::Backoff { retry_at, .. } => retry_at,
            _ => None,
        }
    }

    /// Returns the wait which would follow the next failure.
    #[must_use]
    pub fn next_wait(&self) -> Duration {
        self.backoff.next_wait()
    }

    /// Returns the instant of the last registration or session attempt.
    #[must_use]
    pub const fn last_attempt(&self) -> Option<Duration> {
        self.last_attempt
    }

    /// Returns the reason of the last failure.
    #[must_use]
    pub fn last_reason(&self) -> Option<&str> {
        self.last_reason.as_deref()
    }

    /// Checks whether a provisioning client is alive.
    #[must_use]
    pub const fn has_provisioning_client(&self) -> bool {
        matches!(&self.stage, Stage::Registering(engine) if engine.has_client())
    }

    /// Checks whether a hub client is alive.
    #[must_use]
    pub const fn has_hub_client(&self) -> bool {
        matches!(&self.stage, Stage::Hub(session) if session.is_open())
    }

    /// Returns the hub session, if one is open.
    pub fn session_mut(&mut self) -> Option<&mut HubSession<P::Transport>> {
        match &mut self.stage {
            Stage::Hub(session) => Some(session),
            _ => None,
        }
    }

    /// Runs one supervision step at the given loop time.
    pub fn tick(
        &mut self,
        platform: &mut P,
        config: &ConnectionConfig,
        dispatcher: &mut Dispatcher,
        now: Duration,
    ) -> SupervisorState {
        let readiness = self.monitor.check(platform, now);
        if !readiness.is_ready() {
            self.enter_network_wait(dispatcher);
            return self.state();
        }

        if let Stage::Backoff { retry_at, .. } = self.stage {
            match retry_at {
                Some(retry_at) if now >= retry_at => {
                    info!("Retrying the connection");
                    self.hub_uri = None;
                    self.stage = Stage::Idle;
                }
                _ => return self.state(),
            }
        }

        match self.stage {
            Stage::Idle | Stage::NetworkWait => {
                self.begin_registration(platform, config, now);
                // The first registration poll is immediate.
                self.poll_registration(platform, config, now);
            }
            Stage::Registering(_) => self.poll_registration(platform, config, now),
            Stage::Hub(_) => self.tick_session(dispatcher, now),
            Stage::Backoff { .. } => {}
        }

        self.state()
    }

    /// Fires the registration timeout at the given loop time.
    ///
    /// A registration still in progress fails and the supervisor backs off.
    /// Any other stage is left untouched.
    pub fn expire_registration(&mut self, now: Duration) -> SupervisorState {
        let Stage::Registering(engine) = &mut self.stage else {
            return self.state();
        };

        if engine.expire() == RegistrationStatus::Failed {
            let reason = engine
                .failure_reason()
                .unwrap_or("Registration timed out")
                .to_owned();
            self.fail(FailureCause::Registration, reason, now);
        }
        self.state()
    }

    /// Returns the pending changes of the registration timeout timer, in
    /// the order they have to be applied.
    pub fn take_timeout_changes(&mut self) -> Vec<TimeoutChange> {
        std::mem::take(&mut self.timeout_changes)
    }

    /// Ticks the hub session only, to process transport events as soon as
    /// they are available.
    pub fn poll_session(&mut self, dispatcher: &mut Dispatcher, now: Duration) -> SupervisorState {
        if matches!(self.stage, Stage::Hub(_)) {
            self.tick_session(dispatcher, now);
        }
        self.state()
    }

    /// Tears down every client and goes back to idle with a fresh backoff.
    pub fn reset(&mut self, dispatcher: &mut Dispatcher) {
        self.teardown(dispatcher);
        self.stage = Stage::Idle;
        self.hub_uri = None;
        self.backoff.reset();
        self.configuration_warned = false;
        info!("Connection supervisor reset");
    }

    fn teardown(&mut self, dispatcher: &mut Dispatcher) {
        match &mut self.stage {
            Stage::Registering(engine) => {
                engine.cancel();
                self.timeout_changes.extend(engine.take_timeout_changes());
            }
            Stage::Hub(session) => session.close(dispatcher),
            Stage::Idle | Stage::NetworkWait | Stage::Backoff { .. } => {}
        }
    }

    fn enter_network_wait(&mut self, dispatcher: &mut Dispatcher) {
        if matches!(self.stage, Stage::NetworkWait) {
            return;
        }
        self.teardown(dispatcher);
        self.stage = Stage::NetworkWait;
        info!("Network not ready, waiting");
    }

    fn begin_registration(&mut self, platform: &mut P, config: &ConnectionConfig, now: Duration) {
        let mut engine = RegistrationEngine::new();
        self.last_attempt = Some(now);

        match engine.begin(
            platform,
            config.endpoint(),
            config.scope_id(),
            config.model_id(),
            now,
        ) {
            Ok(()) => {
                self.timeout_changes.extend(engine.take_timeout_changes());
                self.stage = Stage::Registering(engine);
            }
            Err(e) if e.kind() == ErrorKind::Configuration => {
                if !self.configuration_warned {
                    warn!("Cannot register the device, no retry until reconfigured: {e}");
                    self.configuration_warned = true;
                }
                self.last_reason = Some(e.info().to_owned());
                self.stage = Stage::Backoff {
                    cause: FailureCause::Registration,
                    retry_at: None,
                };
            }
            Err(e) => self.fail(FailureCause::Registration, e.to_string(), now),
        }
    }

    fn poll_registration(&mut self, platform: &mut P, config: &ConnectionConfig, now: Duration) {
        let Stage::Registering(engine) = &mut self.stage else {
            return;
        };

        let status = engine.poll(now);
        self.timeout_changes.extend(engine.take_timeout_changes());

        match status {
            RegistrationStatus::Completed => {}
            RegistrationStatus::Failed => {
                let reason = engine
                    .failure_reason()
                    .unwrap_or("Registration failed")
                    .to_owned();
                self.fail(FailureCause::Registration, reason, now);
                return;
            }
            RegistrationStatus::NotStarted | RegistrationStatus::Registering => return,
        }

        // Release the provisioning client before creating the hub client.
        let Stage::Registering(engine) = std::mem::replace(&mut self.stage, Stage::Idle) else {
            return;
        };
        self.hub_uri = engine.hub_uri().map(str::to_owned);
        drop(engine);

        self.open_session(platform, config, now);
    }

    fn open_session(&mut self, platform: &mut P, config: &ConnectionConfig, now: Duration) {
        let Some(hub_uri) = self.hub_uri.clone() else {
            self.fail(FailureCause::Hub, "No hub URI assigned".into(), now);
            return;
        };

        let settings = SessionSettings {
            hub_uri: &hub_uri,
            model_id: config.model_id(),
            options: config.session(),
        };

        self.last_attempt = Some(now);
        let mut session = HubSession::new();
        match session.open(platform, &settings) {
            Ok(()) => self.stage = Stage::Hub(session),
            Err(e) => self.fail(FailureCause::Hub, e.to_string(), now),
        }
    }

    fn tick_session(&mut self, dispatcher: &mut Dispatcher, now: Duration) {
        let Stage::Hub(session) = &mut self.stage else {
            return;
        };

        match session.tick(dispatcher) {
            Some(SessionState::Connected) => {
                self.backoff.reset();
                self.last_reason = None;
            }
            Some(SessionState::Failed) => {
                let reason = session
                    .last_reason()
                    .map_or_else(|| "Hub session failed".to_owned(), |r| r.to_string());
                session.close(dispatcher);
                self.fail(FailureCause::Hub, reason, now);
            }
            Some(SessionState::Uninitialized | SessionState::Authenticating) | None => {}
        }
    }

    fn fail(&mut self, cause: FailureCause, reason: String, now: Duration) {
        let wait = self.backoff.record_failure();
        let retry_at = now + wait;
        warn!(
            "{} failed: {reason}, next attempt in {}s",
            match cause {
                FailureCause::Registration => "Registration",
                FailureCause::Hub => "Hub session",
            },
            wait.as_secs()
        );
        self.last_reason = Some(reason);
        // Dropping the previous stage releases its client.
        self.stage = Stage::Backoff {
            cause,
            retry_at: Some(retry_at),
        };
    }
}
