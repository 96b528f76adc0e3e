use std::time::Duration;

use crate::error::{Error, Result};

/// Maximum length, in bytes, of a scope identifier.
pub const MAX_SCOPE_ID_LENGTH: usize = 31;
/// Maximum length, in bytes, of a model identifier.
pub const MAX_MODEL_ID_LENGTH: usize = 511;
/// Maximum length, in bytes, of a hub URI returned by the provisioning
/// service.
pub const MAX_HUB_URI_LENGTH: usize = 511;

/// Default global endpoint of the provisioning service.
pub const DEFAULT_PROVISIONING_ENDPOINT: &str = "global.azure-devices-provisioning.net";

// MQTT keep-alive interval.
const KEEP_ALIVE: Duration = Duration::from_secs(20);
// Upper bound of the transport reconnection policy.
const TRANSPORT_RETRY_CAP: Duration = Duration::from_secs(240);

/// The identifier of a provisioning service tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeId(String);

impl ScopeId {
    /// Creates a [`ScopeId`].
    ///
    /// # Errors
    ///
    /// The value is empty or longer than [`MAX_SCOPE_ID_LENGTH`] bytes.
    pub fn new(value: &str) -> Result<Self> {
        if value.is_empty() {
            return Err(Error::configuration("The scope id is empty"));
        }
        if value.len() > MAX_SCOPE_ID_LENGTH {
            return Err(Error::configuration(format!(
                "The scope id is {} bytes long, the limit is {MAX_SCOPE_ID_LENGTH}",
                value.len()
            )));
        }
        Ok(Self(value.into()))
    }

    /// Returns the [`ScopeId`] as a [`&str`].
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The model identifier advertised to the provisioning service and to the
/// hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelId(String);

impl ModelId {
    /// Creates a [`ModelId`].
    ///
    /// # Errors
    ///
    /// The value is empty or longer than [`MAX_MODEL_ID_LENGTH`] bytes.
    pub fn new(value: &str) -> Result<Self> {
        if value.is_empty() {
            return Err(Error::configuration("The model id is empty"));
        }
        if value.len() > MAX_MODEL_ID_LENGTH {
            return Err(Error::configuration(format!(
                "The model id is {} bytes long, the limit is {MAX_MODEL_ID_LENGTH}",
                value.len()
            )));
        }
        Ok(Self(value.into()))
    }

    /// Returns the [`ModelId`] as a [`&str`].
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Where the device identifier comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeviceIdSource {
    /// The identifier is extracted from the device credential.
    #[default]
    Credential,
}

/// The reconnection policy applied by the transport inside an open session.
///
/// This policy is distinct from the supervisor backoff, which sequences
/// provisioning and hub sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Exponential backoff with random jitter, capped at the given duration.
    ExponentialBackoffWithJitter {
        /// Upper bound of a single wait.
        cap: Duration,
    },
    /// No reconnection attempts.
    None,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::ExponentialBackoffWithJitter {
            cap: TRANSPORT_RETRY_CAP,
        }
    }
}

/// Options applied to every hub session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Source of the device identifier.
    pub device_id_source: DeviceIdSource,
    /// MQTT keep-alive interval.
    pub keep_alive: Duration,
    /// URL encoding and decoding of topic properties.
    pub auto_url_encode_decode: bool,
    /// Verbose transport tracing.
    pub log_trace: bool,
    /// Transport reconnection policy.
    pub retry_policy: RetryPolicy,
    /// PEM bundle which overrides the platform trusted certificate
    /// authorities.
    pub trusted_ca: Option<Vec<u8>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            device_id_source: DeviceIdSource::Credential,
            keep_alive: KEEP_ALIVE,
            auto_url_encode_decode: true,
            log_trace: false,
            retry_policy: RetryPolicy::default(),
            trusted_ca: None,
        }
    }
}

impl SessionOptions {
    /// Enables or disables verbose transport tracing.
    #[must_use]
    pub const fn log_trace(mut self, enabled: bool) -> Self {
        self.log_trace = enabled;
        self
    }

    /// Overrides the trusted certificate authorities with a PEM bundle.
    #[must_use]
    pub fn trusted_ca(mut self, pem: Vec<u8>) -> Self {
        self.trusted_ca = Some(pem);
        self
    }

    /// Sets the transport reconnection policy.
    #[must_use]
    pub const fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

/// Connection configuration.
///
/// It is built once at startup and moved into the connection, which only
/// reads it afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    scope_id: Option<ScopeId>,
    model_id: Option<ModelId>,
    provisioning_endpoint: String,
    session: SessionOptions,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionConfig {
    /// Creates an empty [`ConnectionConfig`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            scope_id: None,
            model_id: None,
            provisioning_endpoint: DEFAULT_PROVISIONING_ENDPOINT.into(),
            session: SessionOptions::default(),
        }
    }

    /// Sets the scope identifier while constructing a [`ConnectionConfig`].
    ///
    /// # Errors
    ///
    /// The scope identifier is empty or too long.
    pub fn with_scope_id(mut self, scope_id: &str) -> Result<Self> {
        self.set_scope_id(Some(scope_id))?;
        Ok(self)
    }

    /// Sets the model identifier while constructing a [`ConnectionConfig`].
    ///
    /// # Errors
    ///
    /// The model identifier is empty or too long.
    pub fn with_model_id(mut self, model_id: &str) -> Result<Self> {
        self.set_model_id(Some(model_id))?;
        Ok(self)
    }

    /// Sets the provisioning service endpoint.
    #[must_use]
    pub fn provisioning_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.provisioning_endpoint = endpoint.into();
        self
    }

    /// Sets the hub [`SessionOptions`].
    #[must_use]
    pub fn session_options(mut self, session: SessionOptions) -> Self {
        self.session = session;
        self
    }

    /// Sets or clears the scope identifier.
    ///
    /// Setting the same value twice has no further effect.
    ///
    /// # Errors
    ///
    /// The scope identifier is empty or too long. The previous value is kept.
    pub fn set_scope_id(&mut self, scope_id: Option<&str>) -> Result<()> {
        self.scope_id = scope_id.map(ScopeId::new).transpose()?;
        Ok(())
    }

    /// Sets or clears the model identifier.
    ///
    /// # Errors
    ///
    /// The model identifier is empty or too long. The previous value is kept.
    pub fn set_model_id(&mut self, model_id: Option<&str>) -> Result<()> {
        self.model_id = model_id.map(ModelId::new).transpose()?;
        Ok(())
    }

    /// Returns the scope identifier.
    #[must_use]
    pub const fn scope_id(&self) -> Option<&ScopeId> {
        self.scope_id.as_ref()
    }

    /// Returns the model identifier.
    #[must_use]
    pub const fn model_id(&self) -> Option<&ModelId> {
        self.model_id.as_ref()
    }

    /// Returns the provisioning service endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.provisioning_endpoint
    }

    /// Returns the hub [`SessionOptions`].
    #[must_use]
    pub const fn session(&self) -> &SessionOptions {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::error::ErrorKind;

    use super::{ConnectionConfig, ModelId, RetryPolicy, ScopeId, SessionOptions};

    #[test]
    fn scope_id_length_limit() {
        let accepted = "a".repeat(31);
        assert_eq!(ScopeId::new(&accepted).unwrap().as_str(), accepted);

        let rejected = "a".repeat(32);
        assert_eq!(
            ScopeId::new(&rejected).unwrap_err().kind(),
            ErrorKind::Configuration
        );

        assert!(ScopeId::new("").is_err());
    }

    #[test]
    fn model_id_length_limit() {
        assert!(ModelId::new(&"m".repeat(511)).is_ok());
        assert!(ModelId::new(&"m".repeat(512)).is_err());
    }

    #[test]
    fn set_scope_id() {
        let mut config = ConnectionConfig::new();
        assert_eq!(config.scope_id(), None);

        // Setting the same value twice is idempotent.
        config.set_scope_id(Some("abcd1234")).unwrap();
        let first = config.clone();
        config.set_scope_id(Some("abcd1234")).unwrap();
        assert_eq!(config, first);
        assert_eq!(config.scope_id().map(ScopeId::as_str), Some("abcd1234"));

        // An overlong value keeps the previous one.
        assert!(config.set_scope_id(Some(&"x".repeat(32))).is_err());
        assert_eq!(config.scope_id().map(ScopeId::as_str), Some("abcd1234"));

        // None clears it.
        config.set_scope_id(None).unwrap();
        assert_eq!(config.scope_id(), None);
    }

    #[test]
    fn default_session_options() {
        let options = SessionOptions::default();
        assert_eq!(options.keep_alive, Duration::from_secs(20));
        assert!(options.auto_url_encode_decode);
        assert!(!options.log_trace);
        assert_eq!(
            options.retry_policy,
            RetryPolicy::ExponentialBackoffWithJitter {
                cap: Duration::from_secs(240)
            }
        );
        assert_eq!(options.trusted_ca, None);
    }
}
