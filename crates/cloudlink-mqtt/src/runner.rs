use std::time::Duration;

use cloudlink::config::RetryPolicy;
use cloudlink::error::{Error, ErrorKind};
use cloudlink::event_loop::{Interest, IoSource};
use cloudlink::session::ConnectionReason;

use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    StateError,
};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use tokio_util::sync::CancellationToken;

use tracing::{debug, warn};

// The capacity of the requests channel between the client and its event loop.
const REQUESTS_CAPACITY: usize = 32;

// First wait of a transport reconnection.
const RETRY_BASE: Duration = Duration::from_secs(1);

// Upper bound of the random part of a transport reconnection wait.
const MAX_RETRY_JITTER: Duration = Duration::from_millis(1000);

/// An event forwarded by the pump to the owner of the connection.
#[derive(Debug)]
pub(crate) enum PumpEvent {
    /// A packet has been received or sent.
    Packet(Event),
    /// The connection has been lost.
    Disconnected(ConnectionReason),
}

/// Converts a [`ClientError`] into an [`Error`].
pub(crate) fn client_error(error: ClientError) -> Error {
    match error {
        ClientError::TryRequest(_) => {
            Error::new(ErrorKind::QueueFull, "The MQTT outbound queue is full")
        }
        ClientError::Request(_) => {
            Error::new(ErrorKind::Transport, "The MQTT event loop has stopped")
        }
    }
}

/// Maps a connection error to the reason reported to the application.
pub(crate) fn reason_for(error: &ConnectionError) -> ConnectionReason {
    match error {
        ConnectionError::ConnectionRefused(code) => refused_reason(*code),
        ConnectionError::MqttState(StateError::AwaitPingResp) => ConnectionReason::NoPingResponse,
        ConnectionError::Io(_) | ConnectionError::NetworkTimeout => ConnectionReason::NoNetwork,
        _ => ConnectionReason::CommunicationError,
    }
}

// Maps the return code of a refused connection.
pub(crate) const fn refused_reason(code: ConnectReturnCode) -> ConnectionReason {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            ConnectionReason::BadCredential
        }
        _ => ConnectionReason::CommunicationError,
    }
}

/// Returns how long to wait before the next reconnection, or `None` when
/// the policy forbids reconnecting.
pub(crate) fn retry_wait(policy: RetryPolicy, failures: u32) -> Option<Duration> {
    match policy {
        RetryPolicy::ExponentialBackoffWithJitter { cap } => {
            let base = 1u32
                .checked_shl(failures)
                .map_or(cap, |factor| RETRY_BASE.saturating_mul(factor));
            let jitter_ms = fastrand::u64(0..=MAX_RETRY_JITTER.as_millis() as u64);
            Some(
                base.saturating_add(Duration::from_millis(jitter_ms))
                    .min(cap),
            )
        }
        RetryPolicy::None => None,
    }
}

async fn run_event_pump(
    mut eventloop: EventLoop,
    retry_policy: RetryPolicy,
    cancellation_token: CancellationToken,
    sender: flume::Sender<PumpEvent>,
    io: IoSource,
) {
    let mut failures = 0;
    loop {
        let event = tokio::select! {
            // Use the cancellation token to stop the loop
            () = cancellation_token.cancelled() => { break; }
            // Poll the `MQTT` event coming from the network
            event = eventloop.poll() => event,
        };

        let event = match event {
            Ok(event) => {
                if matches!(event, Event::Incoming(rumqttc::Packet::ConnAck(_))) {
                    failures = 0;
                }
                PumpEvent::Packet(event)
            }
            Err(e) => {
                warn!("MQTT connection error: {e}");
                PumpEvent::Disconnected(reason_for(&e))
            }
        };
        let disconnected = matches!(event, PumpEvent::Disconnected(_));

        if sender.send(event).is_err() {
            debug!("Event receiver dropped, stop the pump");
            break;
        }
        io.signal(Interest::READABLE);

        if !disconnected {
            continue;
        }

        let Some(wait) = retry_wait(retry_policy, failures) else {
            debug!("Reconnection disabled, stop the pump");
            break;
        };
        failures += 1;
        debug!("Reconnecting in {wait:?}");

        tokio::select! {
            () = cancellation_token.cancelled() => { break; }
            () = tokio::time::sleep(wait) => {}
        }
    }
    drop(sender);
    drop(eventloop);
}

/// An MQTT client whose network event loop runs on a background task.
///
/// Events are queued on a channel and the [`IoSource`] is signalled for each
/// of them. Dropping the pump stops the task.
#[derive(Debug)]
pub(crate) struct EventPump {
    client: AsyncClient,
    receiver: flume::Receiver<PumpEvent>,
    cancellation_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl EventPump {
    pub(crate) fn start(
        runtime: &Handle,
        options: MqttOptions,
        retry_policy: RetryPolicy,
        io: IoSource,
    ) -> Self {
        let (client, eventloop) = AsyncClient::new(options, REQUESTS_CAPACITY);
        let (sender, receiver) = flume::unbounded();
        let cancellation_token = CancellationToken::new();

        let handle = runtime.spawn(run_event_pump(
            eventloop,
            retry_policy,
            cancellation_token.clone(),
            sender,
            io,
        ));

        Self {
            client,
            receiver,
            cancellation_token,
            handle,
        }
    }

    pub(crate) const fn client(&self) -> &AsyncClient {
        &self.client
    }

    /// Returns the events received so far without blocking.
    pub(crate) fn drain(&self) -> Vec<PumpEvent> {
        self.receiver.try_iter().collect()
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
        self.handle.abort();
    }
}
