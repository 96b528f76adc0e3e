use std::fs;
use std::path::{Path, PathBuf};

use cloudlink::error::{Error, ErrorKind, Result};

use rumqttc::{TlsConfiguration, Transport};

/// Default bundle of trusted certificate authorities.
pub const DEFAULT_TRUSTED_CA: &str = "/etc/ssl/certs/ca-certificates.crt";

fn is_readable(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|metadata| metadata.is_file())
}

fn read(path: &Path, what: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| {
        Error::new(
            ErrorKind::Io,
            format!("Unable to read the {what} `{}`: {e}", path.display()),
        )
    })
}

/// The X.509 identity of the device.
///
/// The registration identifier must match the common name of the device
/// certificate. It is also the device identifier on the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X509Credentials {
    registration_id: String,
    certificate: PathBuf,
    private_key: PathBuf,
    trusted_ca: PathBuf,
}

/// The PEM contents of [`X509Credentials`].
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialMaterial {
    /// Device certificate chain.
    pub certificate: Vec<u8>,
    /// Device private key.
    pub private_key: Vec<u8>,
    /// Trusted certificate authorities.
    pub trusted_ca: Vec<u8>,
}

impl std::fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialMaterial")
            .field("certificate", &self.certificate.len())
            .field("private_key", &"<redacted>")
            .field("trusted_ca", &self.trusted_ca.len())
            .finish()
    }
}

impl CredentialMaterial {
    /// Builds a TLS transport authenticating with the device certificate.
    pub(crate) fn into_transport(self) -> Transport {
        Transport::tls_with_config(TlsConfiguration::Simple {
            ca: self.trusted_ca,
            alpn: None,
            client_auth: Some((self.certificate, self.private_key)),
        })
    }
}

impl X509Credentials {
    /// Creates [`X509Credentials`] from PEM files.
    #[must_use]
    pub fn new(
        registration_id: impl Into<String>,
        certificate: impl Into<PathBuf>,
        private_key: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registration_id: registration_id.into(),
            certificate: certificate.into(),
            private_key: private_key.into(),
            trusted_ca: PathBuf::from(DEFAULT_TRUSTED_CA),
        }
    }

    /// Sets the bundle of trusted certificate authorities.
    #[must_use]
    pub fn trusted_ca(mut self, trusted_ca: impl Into<PathBuf>) -> Self {
        self.trusted_ca = trusted_ca.into();
        self
    }

    /// Returns the registration identifier.
    #[must_use]
    pub fn registration_id(&self) -> &str {
        &self.registration_id
    }

    /// Checks whether the certificate and the private key are readable.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        !self.registration_id.is_empty()
            && is_readable(&self.certificate)
            && is_readable(&self.private_key)
    }

    /// Reads the credential files.
    ///
    /// A `trusted_ca` bundle, when given, replaces the configured one.
    ///
    /// # Errors
    ///
    /// A file cannot be read.
    pub fn load(&self, trusted_ca: Option<&[u8]>) -> Result<CredentialMaterial> {
        let trusted_ca = match trusted_ca {
            Some(pem) => pem.to_vec(),
            None => read(&self.trusted_ca, "trusted certificate authorities")?,
        };

        Ok(CredentialMaterial {
            certificate: read(&self.certificate, "device certificate")?,
            private_key: read(&self.private_key, "device private key")?,
            trusted_ca,
        })
    }
}
