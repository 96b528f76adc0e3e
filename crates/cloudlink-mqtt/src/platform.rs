use cloudlink::config::DeviceIdSource;
use cloudlink::error::{Error, ErrorKind, Result};
use cloudlink::event_loop::IoSource;
use cloudlink::probe::NetworkProbe;
use cloudlink::provisioning::{ProvisioningConnector, RegistrationRequest};
use cloudlink::session::{HubConnector, SessionSettings};

use tokio::runtime::Handle;

use crate::credentials::X509Credentials;
use crate::dps::DpsClient;
use crate::hub::MqttHubTransport;
use crate::net::SysfsProbe;

/// A platform which provisions the device and talks to its hub over MQTT
/// with X.509 client authentication.
///
/// Network I/O runs on tasks of the Tokio runtime the platform has been
/// created in. Each received packet signals the [`IoSource`] given on
/// construction, so that the event loop can process it.
#[derive(Debug)]
pub struct MqttPlatform {
    credentials: X509Credentials,
    probe: SysfsProbe,
    io: IoSource,
    runtime: Handle,
}

impl MqttPlatform {
    /// Creates a [`MqttPlatform`].
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::Configuration`] when called outside a Tokio runtime
    pub fn new(credentials: X509Credentials, io: IoSource) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            Error::new(
                ErrorKind::Configuration,
                format!("The MQTT platform needs a Tokio runtime: {e}"),
            )
        })?;

        Ok(Self {
            credentials,
            probe: SysfsProbe::new(),
            io,
            runtime,
        })
    }

    /// Sets the network probe.
    #[must_use]
    pub fn network_probe(mut self, probe: SysfsProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Returns the device credentials.
    #[must_use]
    pub const fn credentials(&self) -> &X509Credentials {
        &self.credentials
    }
}

impl NetworkProbe for MqttPlatform {
    fn networking_ready(&mut self) -> Result<bool> {
        self.probe.networking_ready()
    }

    fn device_auth_ready(&mut self) -> Result<bool> {
        Ok(self.credentials.is_ready())
    }
}

impl ProvisioningConnector for MqttPlatform {
    type Client = DpsClient;

    fn connect(&mut self, request: &RegistrationRequest) -> Result<DpsClient> {
        let material = self.credentials.load(None)?;
        DpsClient::connect(
            &self.runtime,
            self.credentials.registration_id(),
            material,
            request,
            self.io.clone(),
        )
    }
}

impl HubConnector for MqttPlatform {
    type Transport = MqttHubTransport;

    fn connect(&mut self, settings: &SessionSettings<'_>) -> Result<MqttHubTransport> {
        let device_id = match settings.options.device_id_source {
            DeviceIdSource::Credential => self.credentials.registration_id(),
        };
        let material = self
            .credentials
            .load(settings.options.trusted_ca.as_deref())?;

        MqttHubTransport::connect(&self.runtime, device_id, material, settings, self.io.clone())
    }
}
