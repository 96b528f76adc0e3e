use std::time::Duration;

use cloudlink::config::RetryPolicy;
use cloudlink::error::Result;
use cloudlink::event_loop::IoSource;
use cloudlink::provisioning::{ProvisioningClient, RegistrationOutcome, RegistrationRequest};

use rumqttc::{Event, MqttOptions, Packet, QoS};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tokio::runtime::Handle;
use tokio::time::Instant;

use tracing::{debug, info, warn};

use crate::credentials::CredentialMaterial;
use crate::runner::{EventPump, PumpEvent, client_error};
use crate::topics::{
    DPS_RESPONSES, DpsResponse, MQTT_TLS_PORT, dps_operation_status, dps_register, dps_username,
    parse_dps_response,
};

// Keep alive of a provisioning connection.
const DPS_KEEP_ALIVE: Duration = Duration::from_secs(30);

// Wait between two operation status requests when the service gives none.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(3);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationBody<'a> {
    registration_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationResponse {
    operation_id: Option<String>,
    status: Option<String>,
    registration_state: Option<RegistrationState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationState {
    assigned_hub: Option<String>,
    device_id: Option<String>,
    error_message: Option<String>,
}

/// The progress of a registration, driven by the provisioning responses.
#[derive(Debug, Default)]
pub(crate) struct RegistrationFlow {
    next_request_id: u32,
    // Operation to poll and when.
    operation: Option<(String, Instant)>,
}

impl RegistrationFlow {
    pub(crate) fn next_request_id(&mut self) -> u32 {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        request_id
    }

    pub(crate) fn on_response(
        &mut self,
        response: &DpsResponse,
        payload: &[u8],
        now: Instant,
    ) -> Option<RegistrationOutcome> {
        let body: RegistrationResponse = match serde_json::from_slice(payload) {
            Ok(body) => body,
            Err(e) => {
                return Some(RegistrationOutcome::Failed(format!(
                    "Invalid provisioning response: {e}"
                )));
            }
        };

        let assigning = body.status.as_deref() == Some("assigning");
        if response.status == 202 || (response.status == 200 && assigning) {
            let Some(operation_id) = body.operation_id else {
                return Some(RegistrationOutcome::Failed(
                    "Provisioning response without operation".into(),
                ));
            };
            let wait = response
                .retry_after
                .map_or(DEFAULT_RETRY_AFTER, Duration::from_secs);
            debug!("Registration `{operation_id}` pending, polling in {wait:?}");
            self.operation = Some((operation_id, now + wait));
            return None;
        }

        self.operation = None;
        let state = body.registration_state;
        if response.status == 200
            && let Some(RegistrationState {
                assigned_hub: Some(hub_uri),
                device_id: Some(device_id),
                ..
            }) = &state
        {
            return Some(RegistrationOutcome::Assigned {
                hub_uri: hub_uri.clone(),
                device_id: device_id.clone(),
            });
        }

        let reason = state
            .and_then(|state| state.error_message)
            .or(body.status)
            .unwrap_or_else(|| "no details".into());
        Some(RegistrationOutcome::Failed(format!(
            "Provisioning service answered {}: {reason}",
            response.status
        )))
    }

    // Returns the operation to poll once its wait is over.
    pub(crate) fn due_poll(&mut self, now: Instant) -> Option<String> {
        match &self.operation {
            Some((_, poll_at)) if *poll_at <= now => self.operation.take().map(|(id, _)| id),
            _ => None,
        }
    }
}

/// A provisioning client over MQTT.
#[derive(Debug)]
pub struct DpsClient {
    pump: EventPump,
    registration_id: String,
    flow: RegistrationFlow,
}

impl DpsClient {
    pub(crate) fn connect(
        runtime: &Handle,
        registration_id: &str,
        material: CredentialMaterial,
        request: &RegistrationRequest,
        io: IoSource,
    ) -> Result<Self> {
        let mut options = MqttOptions::new(registration_id, &request.endpoint, MQTT_TLS_PORT);
        let _ = options
            .set_credentials(
                dps_username(request.scope_id.as_str(), registration_id),
                "",
            )
            .set_keep_alive(DPS_KEEP_ALIVE)
            .set_transport(material.into_transport());

        let pump = EventPump::start(runtime, options, RetryPolicy::None, io);
        pump.client()
            .try_subscribe(DPS_RESPONSES, QoS::AtLeastOnce)
            .map_err(client_error)?;

        info!("Provisioning client created for `{}`", request.endpoint);

        Ok(Self {
            pump,
            registration_id: registration_id.into(),
            flow: RegistrationFlow::default(),
        })
    }

    fn publish(&self, topic: String, payload: Vec<u8>) -> Result<()> {
        self.pump
            .client()
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(client_error)
    }
}

impl ProvisioningClient for DpsClient {
    fn register(&mut self, request: &RegistrationRequest) -> Result<()> {
        let body = serde_json::to_vec(&RegistrationBody {
            registration_id: &self.registration_id,
            payload: request.payload.as_ref(),
        })?;

        let request_id = self.flow.next_request_id();
        self.publish(dps_register(request_id), body)
    }

    fn do_work(&mut self) -> Option<RegistrationOutcome> {
        for event in self.pump.drain() {
            match event {
                PumpEvent::Packet(Event::Incoming(Packet::Publish(publish))) => {
                    let Some(response) = parse_dps_response(&publish.topic) else {
                        debug!("Unexpected provisioning topic `{}`", publish.topic);
                        continue;
                    };
                    let outcome = self
                        .flow
                        .on_response(&response, &publish.payload, Instant::now());
                    if outcome.is_some() {
                        return outcome;
                    }
                }
                PumpEvent::Packet(Event::Incoming(Packet::ConnAck(_))) => {
                    debug!("Connected to the provisioning service");
                }
                PumpEvent::Packet(_) => {}
                PumpEvent::Disconnected(reason) => {
                    return Some(RegistrationOutcome::Failed(format!(
                        "Provisioning connection lost: {reason}"
                    )));
                }
            }
        }

        let operation_id = self.flow.due_poll(Instant::now())?;
        let request_id = self.flow.next_request_id();
        if let Err(e) = self.publish(dps_operation_status(request_id, &operation_id), Vec::new()) {
            warn!("Cannot poll the registration status: {e}");
            return Some(RegistrationOutcome::Failed(e.info().into()));
        }

        None
    }
}
