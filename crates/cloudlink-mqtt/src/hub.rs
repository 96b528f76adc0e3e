use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;

use cloudlink::config::SessionOptions;
use cloudlink::error::Result;
use cloudlink::event_loop::IoSource;
use cloudlink::message::{InboundMessage, Message, MessageId};
use cloudlink::method::MethodRequest;
use cloudlink::session::{ConnectionReason, HubTransport, SessionSettings, TransportEvent};
use cloudlink::twin::TwinUpdateKind;

use rumqttc::{ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, QoS};

use tokio::runtime::Handle;

use tracing::{debug, info, trace, warn};

use crate::credentials::CredentialMaterial;
use crate::runner::{EventPump, PumpEvent, client_error, refused_reason};
use crate::topics::{
    METHODS_SUBSCRIPTION, MQTT_TLS_PORT, TWIN_DESIRED_SUBSCRIPTION, TWIN_RESPONSES, TwinTopic,
    c2d_subscription, hub_username, method_response, parse_c2d, parse_method, parse_twin,
    telemetry, twin_get, twin_reported,
};

// Largest packet exchanged with the hub.
const MAX_PACKET_SIZE: usize = 256 * 1024;

// Prefix of the full twin request identifiers. Reported properties updates
// use bare numbers.
const TWIN_GET_PREFIX: &str = "get";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Publication {
    Telemetry(MessageId),
    Untracked,
}

/// Hub protocol state, fed with the events of the MQTT connection.
#[derive(Debug)]
pub(crate) struct HubState {
    device_id: String,
    url_encode_decode: bool,
    log_trace: bool,
    // Publishes handed to the client, waiting for their packet identifier.
    queued: VecDeque<Publication>,
    // Telemetry on the wire, by packet identifier.
    in_flight: BTreeMap<u16, MessageId>,
    next_twin_get: u32,
    // The failure status has already been reported by a refused ConnAck.
    refused: bool,
}

impl HubState {
    pub(crate) fn new(device_id: &str, options: &SessionOptions) -> Self {
        Self {
            device_id: device_id.into(),
            url_encode_decode: options.auto_url_encode_decode,
            log_trace: options.log_trace,
            queued: VecDeque::new(),
            in_flight: BTreeMap::new(),
            next_twin_get: 0,
            refused: false,
        }
    }

    fn queue(&mut self, publication: Publication) {
        self.queued.push_back(publication);
    }

    fn twin_get_request_id(&mut self) -> String {
        let request_id = format!("{TWIN_GET_PREFIX}{}", self.next_twin_get);
        self.next_twin_get = self.next_twin_get.wrapping_add(1);
        request_id
    }

    // Routes an event and returns whether the connection has just been
    // accepted.
    pub(crate) fn on_event(&mut self, event: PumpEvent, events: &mut Vec<TransportEvent>) -> bool {
        if self.log_trace {
            debug!("Hub event: {event:?}");
        } else {
            trace!("Hub event: {event:?}");
        }

        match event {
            PumpEvent::Packet(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    let reason = refused_reason(ack.code);
                    warn!("Hub connection refused: {:?}", ack.code);
                    self.refused = true;
                    events.push(TransportEvent::ConnectionStatus {
                        authenticated: false,
                        reason,
                    });
                    return false;
                }
                self.refused = false;
                events.push(TransportEvent::ConnectionStatus {
                    authenticated: true,
                    reason: ConnectionReason::Ok,
                });
                return true;
            }
            PumpEvent::Packet(Event::Incoming(Packet::Publish(publish))) => {
                if let Some(event) = self.on_publish(&publish.topic, publish.payload) {
                    events.push(event);
                }
            }
            PumpEvent::Packet(Event::Incoming(Packet::PubAck(ack))) => {
                if let Some(message_id) = self.in_flight.remove(&ack.pkid) {
                    events.push(TransportEvent::EventConfirmation {
                        message_id,
                        delivered: true,
                    });
                }
            }
            PumpEvent::Packet(Event::Outgoing(Outgoing::Publish(pkid))) => {
                match self.queued.pop_front() {
                    Some(Publication::Telemetry(message_id)) => {
                        let _ = self.in_flight.insert(pkid, message_id);
                    }
                    Some(Publication::Untracked) => {}
                    None => warn!("Unexpected outgoing publish {pkid}"),
                }
            }
            PumpEvent::Packet(_) => {}
            PumpEvent::Disconnected(reason) => {
                let pending = std::mem::take(&mut self.in_flight)
                    .into_values()
                    .chain(self.queued.drain(..).filter_map(|publication| match publication {
                        Publication::Telemetry(message_id) => Some(message_id),
                        Publication::Untracked => None,
                    }));
                for message_id in pending {
                    events.push(TransportEvent::EventConfirmation {
                        message_id,
                        delivered: false,
                    });
                }
                if !std::mem::take(&mut self.refused) {
                    events.push(TransportEvent::ConnectionStatus {
                        authenticated: false,
                        reason,
                    });
                }
            }
        }

        false
    }

    fn on_publish(&self, topic: &str, payload: Bytes) -> Option<TransportEvent> {
        if let Some(twin) = parse_twin(topic) {
            return Self::on_twin(twin, payload);
        }

        if let Some((name, request_id)) = parse_method(topic) {
            return Some(TransportEvent::Method(MethodRequest::new(
                request_id, name, &payload,
            )));
        }

        if let Some(properties) = parse_c2d(&self.device_id, topic, self.url_encode_decode) {
            let message = properties
                .into_iter()
                .fold(InboundMessage::new(&payload), |message, (key, value)| {
                    message.property(key, value)
                });
            return Some(TransportEvent::Message(message));
        }

        debug!("Ignored publish on `{topic}`");
        None
    }

    fn on_twin(twin: TwinTopic, payload: Bytes) -> Option<TransportEvent> {
        let TwinTopic::Response { status, request_id } = twin else {
            return Some(TransportEvent::Twin {
                kind: TwinUpdateKind::Partial,
                document: payload.to_vec(),
            });
        };

        if request_id.starts_with(TWIN_GET_PREFIX) {
            if status != 200 {
                warn!("Twin request `{request_id}` answered with {status}");
                return None;
            }
            return Some(TransportEvent::Twin {
                kind: TwinUpdateKind::Complete,
                document: payload.to_vec(),
            });
        }

        match request_id.parse() {
            Ok(request_id) => Some(TransportEvent::ReportedState { request_id, status }),
            Err(_) => {
                debug!("Unknown twin request `{request_id}`");
                None
            }
        }
    }
}

/// A hub transport over MQTT.
///
/// On every accepted connection the transport subscribes to the device
/// topics and requests the full twin.
#[derive(Debug)]
pub struct MqttHubTransport {
    pump: EventPump,
    state: HubState,
}

impl MqttHubTransport {
    pub(crate) fn connect(
        runtime: &Handle,
        device_id: &str,
        material: CredentialMaterial,
        settings: &SessionSettings<'_>,
        io: IoSource,
    ) -> Result<Self> {
        let keep_alive = if settings.options.keep_alive.is_zero() {
            Duration::ZERO
        } else {
            settings.options.keep_alive.max(Duration::from_secs(1))
        };

        let mut options = MqttOptions::new(device_id, settings.hub_uri, MQTT_TLS_PORT);
        let _ = options
            .set_credentials(
                hub_username(
                    settings.hub_uri,
                    device_id,
                    settings.model_id.map(|model_id| model_id.as_str()),
                ),
                "",
            )
            .set_keep_alive(keep_alive)
            .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE)
            .set_transport(material.into_transport());

        let pump = EventPump::start(runtime, options, settings.options.retry_policy, io);
        info!("Hub transport created for `{device_id}` on `{}`", settings.hub_uri);

        Ok(Self {
            pump,
            state: HubState::new(device_id, settings.options),
        })
    }

    fn publish(
        &mut self,
        topic: String,
        qos: QoS,
        payload: Vec<u8>,
        publication: Publication,
    ) -> Result<()> {
        self.pump
            .client()
            .try_publish(topic, qos, false, payload)
            .map_err(client_error)?;
        self.state.queue(publication);
        Ok(())
    }

    fn on_connected(&mut self) -> Result<()> {
        let client = self.pump.client();
        client
            .try_subscribe(c2d_subscription(&self.state.device_id), QoS::AtLeastOnce)
            .map_err(client_error)?;
        for topic in [
            METHODS_SUBSCRIPTION,
            TWIN_RESPONSES,
            TWIN_DESIRED_SUBSCRIPTION,
        ] {
            client
                .try_subscribe(topic, QoS::AtMostOnce)
                .map_err(client_error)?;
        }

        let request_id = self.state.twin_get_request_id();
        self.publish(
            twin_get(&request_id),
            QoS::AtMostOnce,
            Vec::new(),
            Publication::Untracked,
        )
    }
}

impl HubTransport for MqttHubTransport {
    fn send_event(&mut self, message: &Message) -> Result<()> {
        let topic = telemetry(&self.state.device_id, message, self.state.url_encode_decode);
        self.publish(
            topic,
            QoS::AtLeastOnce,
            message.payload().to_vec(),
            Publication::Telemetry(message.id()),
        )
    }

    fn report_twin(&mut self, request_id: u32, document: &[u8]) -> Result<()> {
        self.publish(
            twin_reported(&request_id.to_string()),
            QoS::AtMostOnce,
            document.to_vec(),
            Publication::Untracked,
        )
    }

    fn respond_method(&mut self, request_id: &str, status: u16, body: Vec<u8>) -> Result<()> {
        self.publish(
            method_response(status, request_id),
            QoS::AtMostOnce,
            body,
            Publication::Untracked,
        )
    }

    fn do_work(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        for event in self.pump.drain() {
            if self.state.on_event(event, &mut events)
                && let Err(e) = self.on_connected()
            {
                warn!("Cannot set the hub subscriptions up: {e}");
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use cloudlink::config::SessionOptions;
    use cloudlink::dispatch::Dispatcher;
    use cloudlink::message::InboundMessage;
    use cloudlink::method::MethodRequest;
    use cloudlink::session::{ConnectionReason, TransportEvent};
    use cloudlink::twin::TwinUpdateKind;

    use rumqttc::{ConnAck, ConnectReturnCode, Event, Outgoing, Packet, PubAck, Publish, QoS};

    use crate::runner::PumpEvent;

    use super::{HubState, Publication};

    fn incoming(packet: Packet) -> PumpEvent {
        PumpEvent::Packet(Event::Incoming(packet))
    }

    fn publish(topic: &str, payload: &[u8]) -> PumpEvent {
        incoming(Packet::Publish(Publish::new(
            topic,
            QoS::AtMostOnce,
            payload.to_vec(),
        )))
    }

    fn route(state: &mut HubState, event: PumpEvent) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        let _ = state.on_event(event, &mut events);
        events
    }

    #[test]
    fn connection_refused() {
        let mut state = HubState::new("sensor-7", &SessionOptions::default());

        assert_eq!(
            route(
                &mut state,
                incoming(Packet::ConnAck(ConnAck::new(
                    ConnectReturnCode::NotAuthorized,
                    false
                )))
            ),
            vec![TransportEvent::ConnectionStatus {
                authenticated: false,
                reason: ConnectionReason::BadCredential,
            }]
        );
        // The following disconnection reports no second status.
        assert!(
            route(
                &mut state,
                PumpEvent::Disconnected(ConnectionReason::BadCredential)
            )
            .is_empty()
        );

        // Other refusals are communication errors.
        assert_eq!(
            route(
                &mut state,
                incoming(Packet::ConnAck(ConnAck::new(
                    ConnectReturnCode::ServiceUnavailable,
                    false
                )))
            ),
            vec![TransportEvent::ConnectionStatus {
                authenticated: false,
                reason: ConnectionReason::CommunicationError,
            }]
        );
    }

    #[test]
    fn connection_accepted() {
        let mut state = HubState::new("sensor-7", &SessionOptions::default());
        let mut events = Vec::new();

        assert!(state.on_event(
            incoming(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false))),
            &mut events
        ));
        assert_eq!(
            events,
            vec![TransportEvent::ConnectionStatus {
                authenticated: true,
                reason: ConnectionReason::Ok,
            }]
        );
        assert_eq!(state.twin_get_request_id(), "get0");
        assert_eq!(state.twin_get_request_id(), "get1");
    }

    #[test]
    fn telemetry_confirmations() {
        let mut dispatcher = Dispatcher::new();
        let first = dispatcher.build_message("1", None, None).id();
        let second = dispatcher.build_message("2", None, None).id();

        let mut state = HubState::new("sensor-7", &SessionOptions::default());
        state.queue(Publication::Untracked);
        state.queue(Publication::Telemetry(first));
        state.queue(Publication::Telemetry(second));

        for pkid in [0, 1, 2] {
            assert!(route(&mut state, PumpEvent::Packet(Event::Outgoing(Outgoing::Publish(pkid)))).is_empty());
        }

        assert_eq!(
            route(&mut state, incoming(Packet::PubAck(PubAck::new(1)))),
            vec![TransportEvent::EventConfirmation {
                message_id: first,
                delivered: true,
            }]
        );
        // Duplicated acknowledgements are ignored.
        assert!(route(&mut state, incoming(Packet::PubAck(PubAck::new(1)))).is_empty());

        let third = dispatcher.build_message("3", None, None).id();
        state.queue(Publication::Telemetry(third));

        assert_eq!(
            route(&mut state, PumpEvent::Disconnected(ConnectionReason::NoNetwork)),
            vec![
                TransportEvent::EventConfirmation {
                    message_id: second,
                    delivered: false,
                },
                TransportEvent::EventConfirmation {
                    message_id: third,
                    delivered: false,
                },
                TransportEvent::ConnectionStatus {
                    authenticated: false,
                    reason: ConnectionReason::NoNetwork,
                },
            ]
        );
    }

    #[test]
    fn twin_documents() {
        let mut state = HubState::new("sensor-7", &SessionOptions::default());

        assert_eq!(
            route(&mut state, publish("$iothub/twin/res/200/?$rid=get0", br#"{"desired":{}}"#)),
            vec![TransportEvent::Twin {
                kind: TwinUpdateKind::Complete,
                document: br#"{"desired":{}}"#.to_vec(),
            }]
        );
        assert!(route(&mut state, publish("$iothub/twin/res/429/?$rid=get1", b"")).is_empty());
        assert_eq!(
            route(
                &mut state,
                publish("$iothub/twin/PATCH/properties/desired/?$version=4", br#"{"fan":1}"#)
            ),
            vec![TransportEvent::Twin {
                kind: TwinUpdateKind::Partial,
                document: br#"{"fan":1}"#.to_vec(),
            }]
        );
        assert_eq!(
            route(&mut state, publish("$iothub/twin/res/204/?$rid=7&$version=5", b"")),
            vec![TransportEvent::ReportedState {
                request_id: 7,
                status: 204,
            }]
        );
    }

    #[test]
    fn methods_and_messages() {
        let mut state = HubState::new("sensor-7", &SessionOptions::default());

        assert_eq!(
            route(&mut state, publish("$iothub/methods/POST/reboot/?$rid=1", b"{}")),
            vec![TransportEvent::Method(MethodRequest::new("1", "reboot", b"{}"))]
        );
        assert_eq!(
            route(
                &mut state,
                publish("devices/sensor-7/messages/devicebound/%24.mid=9&led=on", b"hi")
            ),
            vec![TransportEvent::Message(
                InboundMessage::new(b"hi")
                    .property("$.mid", "9")
                    .property("led", "on")
            )]
        );
        assert!(route(&mut state, publish("devices/other/messages/devicebound/", b"")).is_empty());
    }
}
