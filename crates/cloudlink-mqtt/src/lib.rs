//! The `cloudlink-mqtt` library crate implements the `cloudlink` platform
//! traits over MQTT.
//!
//! Devices authenticate with an X.509 client certificate, both against the
//! provisioning service and against the hub they are assigned to. Network
//! readiness is read from the Linux `sysfs` interfaces metadata.
//!
//! The MQTT connections run on background Tokio tasks. Their events are
//! handed to the `cloudlink` event loop through an I/O readiness source, so
//! that every application handler still runs on the loop thread.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Device credentials.
pub mod credentials;
/// Provisioning client.
pub mod dps;
/// Hub transport.
pub mod hub;
/// Network readiness from `sysfs`.
pub mod net;
/// The MQTT platform.
pub mod platform;
/// MQTT topics of the provisioning service and of the hub.
pub mod topics;

mod runner;

pub use credentials::X509Credentials;
pub use net::SysfsProbe;
pub use platform::MqttPlatform;
