use std::time::Duration;

use serde_json::{Value, json};

use tracing::{debug, info, warn};

use crate::config::{MAX_HUB_URI_LENGTH, ModelId, ScopeId};
use crate::error::{Error, ErrorKind, Result};

/// Interval between two polls of the provisioning client.
pub const POLL_PERIOD: Duration = Duration::from_secs(1);
/// Maximum duration of a registration.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// The registration status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    /// No registration has been started.
    NotStarted,
    /// A registration is in progress.
    Registering,
    /// The device has been assigned to a hub.
    Completed,
    /// The registration has failed.
    Failed,
}

impl RegistrationStatus {
    /// Checks whether the status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A change of the registration timeout, a one-shot timer owned by the
/// event loop the engine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutChange {
    /// Arms the timer to fire after the given delay.
    Arm(Duration),
    /// Disarms the timer.
    Disarm,
}

/// How the device authenticates against the provisioning service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Attestation {
    /// X.509 client certificate. The registration identifier comes from the
    /// certificate.
    #[default]
    X509,
}

/// The data a provisioning client needs to register the device.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationRequest {
    /// Provisioning service endpoint.
    pub endpoint: String,
    /// Scope identifier.
    pub scope_id: ScopeId,
    /// Attestation mechanism.
    pub attestation: Attestation,
    /// Custom provisioning payload.
    pub payload: Option<Value>,
}

impl RegistrationRequest {
    /// Creates a [`RegistrationRequest`].
    ///
    /// When a model identifier is given, the provisioning payload is
    /// `{"modelId":"<model id>"}`.
    #[must_use]
    pub fn new(endpoint: &str, scope_id: &ScopeId, model_id: Option<&ModelId>) -> Self {
        Self {
            endpoint: endpoint.into(),
            scope_id: scope_id.clone(),
            attestation: Attestation::X509,
            payload: model_id.map(|model_id| json!({ "modelId": model_id.as_str() })),
        }
    }
}

/// The outcome of a registration reported by a provisioning client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// The device has been assigned to a hub.
    Assigned {
        /// Hub URI.
        hub_uri: String,
        /// Device identifier on the hub.
        device_id: String,
    },
    /// The registration has failed for the given reason.
    Failed(String),
}

/// A provisioning service client.
pub trait ProvisioningClient {
    /// Starts the registration.
    ///
    /// # Errors
    ///
    /// The registration request cannot be sent.
    fn register(&mut self, request: &RegistrationRequest) -> Result<()>;

    /// Runs the pending client work and returns the outcome once the
    /// registration is over.
    fn do_work(&mut self) -> Option<RegistrationOutcome>;
}

/// Creates [`ProvisioningClient`]s.
pub trait ProvisioningConnector {
    /// The client type.
    type Client: ProvisioningClient;

    /// Creates a client for the given request.
    ///
    /// # Errors
    ///
    /// The client cannot be created.
    fn connect(&mut self, request: &RegistrationRequest) -> Result<Self::Client>;
}

/// Drives a single registration against the provisioning service.
///
/// The engine never retries: a failed registration stays failed until the
/// caller starts a new one.
#[derive(Debug)]
pub struct RegistrationEngine<C> {
    status: RegistrationStatus,
    client: Option<C>,
    hub_uri: Option<String>,
    device_id: Option<String>,
    failure_reason: Option<String>,
    next_poll: Option<Duration>,
    timeout_armed: bool,
    timeout_changes: Vec<TimeoutChange>,
}

impl<C> Default for RegistrationEngine<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> RegistrationEngine<C> {
    /// Creates a [`RegistrationEngine`] with no registration started.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            status: RegistrationStatus::NotStarted,
            client: None,
            hub_uri: None,
            device_id: None,
            failure_reason: None,
            next_poll: None,
            timeout_armed: false,
            timeout_changes: Vec::new(),
        }
    }

    /// Returns the registration status.
    #[must_use]
    pub const fn status(&self) -> RegistrationStatus {
        self.status
    }

    /// Returns the assigned hub URI.
    ///
    /// It is only available once the registration has completed.
    #[must_use]
    pub fn hub_uri(&self) -> Option<&str> {
        match self.status {
            RegistrationStatus::Completed => self.hub_uri.as_deref(),
            _ => None,
        }
    }

    /// Returns the device identifier assigned by the provisioning service.
    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        match self.status {
            RegistrationStatus::Completed => self.device_id.as_deref(),
            _ => None,
        }
    }

    /// Returns the reason of a failed registration.
    #[must_use]
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Checks whether the engine holds a provisioning client.
    #[must_use]
    pub const fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Releases the provisioning client.
    pub fn release(&mut self) {
        if self.client.take().is_some() {
            debug!("Provisioning client released");
        }
    }

    /// Returns the pending changes of the registration timeout timer.
    pub fn take_timeout_changes(&mut self) -> Vec<TimeoutChange> {
        std::mem::take(&mut self.timeout_changes)
    }

    /// Cancels the registration, disarming both timers and releasing the
    /// client.
    ///
    /// Cancelling an engine which has never started is a no-op.
    pub fn cancel(&mut self) {
        if self.status == RegistrationStatus::NotStarted {
            return;
        }
        self.disarm();
        self.release();
    }

    /// Fires the registration timeout.
    ///
    /// A registration still in progress fails. Once the registration is over,
    /// or when the timer has been disarmed, this is a no-op.
    pub fn expire(&mut self) -> RegistrationStatus {
        if self.status == RegistrationStatus::Registering && self.timeout_armed {
            // The one-shot timer is gone once fired.
            self.timeout_armed = false;
            self.fail("Registration timed out");
        }
        self.status
    }

    fn disarm(&mut self) {
        self.next_poll = None;
        if self.timeout_armed {
            self.timeout_armed = false;
            self.timeout_changes.push(TimeoutChange::Disarm);
        }
    }

    fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Registration failed: {reason}");
        self.status = RegistrationStatus::Failed;
        self.failure_reason = Some(reason);
        self.disarm();
    }

    fn complete(&mut self, outcome: RegistrationOutcome) {
        match outcome {
            RegistrationOutcome::Assigned { hub_uri, device_id } => {
                if hub_uri.len() > MAX_HUB_URI_LENGTH {
                    self.fail(format!(
                        "Hub URI is {} bytes long, the limit is {MAX_HUB_URI_LENGTH}",
                        hub_uri.len()
                    ));
                    return;
                }
                info!("Device `{device_id}` assigned to hub `{hub_uri}`");
                self.status = RegistrationStatus::Completed;
                self.hub_uri = Some(hub_uri);
                self.device_id = Some(device_id);
                self.disarm();
            }
            RegistrationOutcome::Failed(reason) => self.fail(reason),
        }
    }
}

impl<C: ProvisioningClient> RegistrationEngine<C> {
    /// Starts a registration.
    ///
    /// The first poll happens at `now`, the following ones every
    /// [`POLL_PERIOD`]. A [`TimeoutChange::Arm`] of [`REGISTRATION_TIMEOUT`]
    /// is queued, and the registration fails if [`RegistrationEngine::expire`]
    /// is called before it is over.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::Configuration`] when the scope identifier is missing
    /// - [`ErrorKind::Provisioning`] when the client cannot be created or
    ///   the registration cannot be sent
    pub fn begin<P>(
        &mut self,
        connector: &mut P,
        endpoint: &str,
        scope_id: Option<&ScopeId>,
        model_id: Option<&ModelId>,
        now: Duration,
    ) -> Result<()>
    where
        P: ProvisioningConnector<Client = C> + ?Sized,
    {
        self.cancel();
        self.hub_uri = None;
        self.device_id = None;
        self.failure_reason = None;

        let Some(scope_id) = scope_id else {
            self.status = RegistrationStatus::NotStarted;
            return Err(Error::configuration("No scope id configured"));
        };

        let request = RegistrationRequest::new(endpoint, scope_id, model_id);

        let mut client = connector.connect(&request).map_err(|e| {
            self.fail(e.info().to_owned());
            Error::new(
                ErrorKind::Provisioning,
                format!("Cannot create the provisioning client: {}", e.info()),
            )
        })?;

        if let Err(e) = client.register(&request) {
            self.fail(e.info().to_owned());
            return Err(Error::new(
                ErrorKind::Provisioning,
                format!("Cannot start the registration: {}", e.info()),
            ));
        }

        info!("Registering with scope id `{scope_id}` at `{endpoint}`");
        self.client = Some(client);
        self.status = RegistrationStatus::Registering;
        self.next_poll = Some(now);
        self.timeout_armed = true;
        self.timeout_changes.push(TimeoutChange::Arm(REGISTRATION_TIMEOUT));

        Ok(())
    }

    /// Advances the registration at the given loop time.
    ///
    /// A client left behind by a terminal registration is released first.
    pub fn poll(&mut self, now: Duration) -> RegistrationStatus {
        if self.status.is_terminal() {
            self.release();
            return self.status;
        }

        if self.status != RegistrationStatus::Registering {
            return self.status;
        }

        if self.next_poll.is_some_and(|deadline| now >= deadline) {
            self.next_poll = Some(now + POLL_PERIOD);
            let outcome = self.client.as_mut().and_then(ProvisioningClient::do_work);
            if let Some(outcome) = outcome {
                // The client is not released here, only on the next poll.
                self.complete(outcome);
            }
        }

        self.status
    }
}
