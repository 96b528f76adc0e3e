use tracing::{debug, info, warn};

use crate::config::{ModelId, SessionOptions};
use crate::dispatch::Dispatcher;
use crate::error::{Error, ErrorKind, Result};
use crate::message::{InboundMessage, Message, MessageId};
use crate::method::MethodRequest;
use crate::twin::TwinUpdateKind;

/// The reason of a connection status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionReason {
    /// The connection is up.
    Ok,
    /// The authentication token has expired.
    ExpiredSasToken,
    /// The device is disabled on the hub.
    DeviceDisabled,
    /// The hub has rejected the credential.
    BadCredential,
    /// The transport has given up reconnecting.
    RetryExpired,
    /// The network is unavailable.
    NoNetwork,
    /// A communication error has occurred.
    CommunicationError,
    /// The hub has not answered a keep-alive.
    NoPingResponse,
    /// The hub quota has been exceeded.
    QuotaExceeded,
}

impl ConnectionReason {
    /// Returns the stable textual form of the reason.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "IOTHUB_CLIENT_CONNECTION_OK",
            Self::ExpiredSasToken => "IOTHUB_CLIENT_CONNECTION_EXPIRED_SAS_TOKEN",
            Self::DeviceDisabled => "IOTHUB_CLIENT_CONNECTION_DEVICE_DISABLED",
            Self::BadCredential => "IOTHUB_CLIENT_CONNECTION_BAD_CREDENTIAL",
            Self::RetryExpired => "IOTHUB_CLIENT_CONNECTION_RETRY_EXPIRED",
            Self::NoNetwork => "IOTHUB_CLIENT_CONNECTION_NO_NETWORK",
            Self::CommunicationError => "IOTHUB_CLIENT_CONNECTION_COMMUNICATION_ERROR",
            Self::NoPingResponse => "IOTHUB_CLIENT_CONNECTION_NO_PING_RESPONSE",
            Self::QuotaExceeded => "IOTHUB_CLIENT_CONNECTION_QUOTA_EXCEEDED",
        }
    }
}

impl std::fmt::Display for ConnectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

/// Handles connection status changes.
pub trait ConnectionStatusHandler {
    /// Receives whether the session is connected and why.
    fn on_status(&mut self, connected: bool, reason: ConnectionReason);
}

impl<F> ConnectionStatusHandler for F
where
    F: FnMut(bool, ConnectionReason),
{
    fn on_status(&mut self, connected: bool, reason: ConnectionReason) {
        self(connected, reason);
    }
}

/// An event produced by a [`HubTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection status has changed.
    ConnectionStatus {
        /// Whether the session is authenticated.
        authenticated: bool,
        /// The reason of the change.
        reason: ConnectionReason,
    },
    /// An outbound message has been acknowledged or has failed.
    EventConfirmation {
        /// The message identifier.
        message_id: MessageId,
        /// Whether the message has been delivered.
        delivered: bool,
    },
    /// A reported properties update has been answered.
    ReportedState {
        /// The request identifier returned by [`HubTransport::report_twin`].
        request_id: u32,
        /// HTTP-like status.
        status: u16,
    },
    /// A cloud-to-device message.
    Message(InboundMessage),
    /// A twin document.
    Twin {
        /// Whether the document is the full twin or a delta.
        kind: TwinUpdateKind,
        /// The raw document.
        document: Vec<u8>,
    },
    /// A direct method invocation.
    Method(MethodRequest),
}

/// Settings used to open a hub session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings<'a> {
    /// Hub URI.
    pub hub_uri: &'a str,
    /// Model identifier advertised to the hub.
    pub model_id: Option<&'a ModelId>,
    /// Session options.
    pub options: &'a SessionOptions,
}

/// A hub transport.
///
/// Every operation is non-blocking: outbound requests are queued and their
/// outcomes, as well as inbound traffic, are returned by
/// [`HubTransport::do_work`].
pub trait HubTransport {
    /// Queues a message.
    ///
    /// # Errors
    ///
    /// The message cannot be queued.
    fn send_event(&mut self, message: &Message) -> Result<()>;

    /// Queues a reported properties update.
    ///
    /// # Errors
    ///
    /// The update cannot be queued.
    fn report_twin(&mut self, request_id: u32, document: &[u8]) -> Result<()>;

    /// Queues the response to a direct method.
    ///
    /// # Errors
    ///
    /// The response cannot be queued.
    fn respond_method(&mut self, request_id: &str, status: u16, body: Vec<u8>) -> Result<()>;

    /// Runs the pending transport work and returns the events produced since
    /// the last call, in transport order.
    fn do_work(&mut self) -> Vec<TransportEvent>;
}

/// Creates [`HubTransport`]s.
pub trait HubConnector {
    /// The transport type.
    type Transport: HubTransport;

    /// Creates a transport configured with the given settings.
    ///
    /// # Errors
    ///
    /// The transport cannot be created.
    fn connect(&mut self, settings: &SessionSettings<'_>) -> Result<Self::Transport>;
}

/// The hub session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session is open.
    Uninitialized,
    /// The session is open and waiting for authentication.
    Authenticating,
    /// The session is authenticated.
    Connected,
    /// The session has been disconnected.
    Failed,
}

/// A hub session.
#[derive(Debug)]
pub struct HubSession<T> {
    state: SessionState,
    transport: Option<T>,
    last_reason: Option<ConnectionReason>,
    next_request_id: u32,
}

impl<T> Default for HubSession<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HubSession<T> {
    /// Creates an unopened [`HubSession`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: SessionState::Uninitialized,
            transport: None,
            last_reason: None,
            next_request_id: 0,
        }
    }

    /// Returns the session state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the reason of the last connection status change.
    #[must_use]
    pub const fn last_reason(&self) -> Option<ConnectionReason> {
        self.last_reason
    }

    /// Checks whether the session holds a transport.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Closes the session.
    ///
    /// When the session was connected, the connection status handler is
    /// notified. Pending confirmations are discarded and never delivered.
    /// Closing an unopened session is a no-op.
    pub fn close(&mut self, dispatcher: &mut Dispatcher) {
        if self.state == SessionState::Uninitialized && self.transport.is_none() {
            return;
        }

        let was_connected = self.state == SessionState::Connected;
        self.transport = None;
        self.state = SessionState::Uninitialized;

        let discarded = dispatcher.discard_outstanding();
        if discarded > 0 {
            debug!("{discarded} pending confirmations discarded");
        }
        info!("Hub session closed");

        if was_connected {
            self.last_reason = Some(ConnectionReason::NoNetwork);
            dispatcher.connection_status(false, ConnectionReason::NoNetwork);
        }
    }
}

impl<T: HubTransport> HubSession<T> {
    /// Opens the session.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::Session`] when the session is already open or the
    ///   transport cannot be created
    pub fn open<H>(&mut self, connector: &mut H, settings: &SessionSettings<'_>) -> Result<()>
    where
        H: HubConnector<Transport = T> + ?Sized,
    {
        if self.state != SessionState::Uninitialized {
            return Err(Error::new(ErrorKind::Session, "The session is already open"));
        }

        let transport = connector.connect(settings).map_err(|e| {
            Error::new(
                ErrorKind::Session,
                format!("Cannot open the session to `{}`: {}", settings.hub_uri, e.info()),
            )
        })?;

        info!("Opening hub session to `{}`", settings.hub_uri);
        self.transport = Some(transport);
        self.state = SessionState::Authenticating;
        self.last_reason = None;

        Ok(())
    }

    /// Queues a message.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::NotInitialized`] when the session is not open
    /// - any error returned by the transport
    pub fn send_event(&mut self, message: &Message) -> Result<()> {
        self.transport_mut()?.send_event(message)
    }

    /// Queues a reported properties update and returns its request
    /// identifier.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::NotInitialized`] when the session is not open
    /// - any error returned by the transport
    pub fn report_twin(&mut self, document: &[u8]) -> Result<u32> {
        let request_id = self.next_request_id;
        self.transport_mut()?.report_twin(request_id, document)?;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        Ok(request_id)
    }

    /// Runs the transport work and routes its events to the dispatcher.
    ///
    /// Only an authenticating or connected session is ticked. Returns the
    /// last state change, if any.
    pub fn tick(&mut self, dispatcher: &mut Dispatcher) -> Option<SessionState> {
        if !matches!(
            self.state,
            SessionState::Authenticating | SessionState::Connected
        ) {
            return None;
        }

        let transport = self.transport.as_mut()?;

        let mut change = None;
        for event in transport.do_work() {
            match event {
                TransportEvent::ConnectionStatus {
                    authenticated,
                    reason,
                } => {
                    let state = if authenticated {
                        SessionState::Connected
                    } else {
                        SessionState::Failed
                    };
                    if authenticated {
                        info!("Hub session connected: {reason}");
                    } else {
                        warn!("Hub session disconnected: {reason}");
                    }
                    self.state = state;
                    self.last_reason = Some(reason);
                    change = Some(state);
                    dispatcher.connection_status(authenticated, reason);

                    // Later events belong to a session which is gone.
                    if !authenticated {
                        break;
                    }
                }
                TransportEvent::EventConfirmation {
                    message_id,
                    delivered,
                } => dispatcher.confirm(message_id, delivered),
                TransportEvent::ReportedState { request_id, status } => {
                    debug!("Reported state {request_id} answered with {status}");
                    dispatcher.reported_state(status);
                }
                TransportEvent::Message(message) => dispatcher.inbound_message(&message),
                TransportEvent::Twin { kind, document } => dispatcher.twin_update(kind, &document),
                TransportEvent::Method(request) => {
                    let response = dispatcher.invoke_method(&request);
                    let body = response.body_bytes();
                    if let Err(e) = transport.respond_method(&request.request_id, response.status, body) {
                        warn!("Cannot respond to method `{}`: {e}", request.name);
                    }
                }
            }
        }

        change
    }

    fn transport_mut(&mut self) -> Result<&mut T> {
        self.transport
            .as_mut()
            .ok_or_else(|| Error::not_initialized("The hub session is not open"))
    }
}
