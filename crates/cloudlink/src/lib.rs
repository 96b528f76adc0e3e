//! The `cloudlink` library crate is the cloud connection core of a
//! constrained IoT device.
//!
//! It provisions the device against a provisioning service, opens an
//! authenticated session to the hub the device has been assigned to and keeps
//! that session alive with a bounded exponential backoff.
//!
//! Core functionalities of this crate include:
//!
//! - A single-threaded cooperative event loop with periodic timers, one-shot
//!   timers and I/O readiness sources
//! - A connection supervisor which sequences network readiness,
//!   provisioning and hub sessions, never keeping a provisioning client and a
//!   hub client alive at the same time
//! - A dispatch plane which multiplexes telemetry, cloud-to-device messages,
//!   twin synchronisation and direct methods over the hub session
//!
//! The crate is transport-agnostic: the network probe, the provisioning
//! client and the hub transport are traits implemented by a platform crate.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Exponential backoff between two connection attempts.
pub mod backoff;
/// Connection configuration.
pub mod config;
/// The connection context which owns all the other components.
pub mod connection;
/// Dispatch of transport events to the application handlers.
pub mod dispatch;
/// Error management.
pub mod error;
/// A single-threaded cooperative event loop.
pub mod event_loop;
/// Outbound and inbound messages.
pub mod message;
/// Direct methods.
pub mod method;
/// Network readiness probe.
pub mod probe;
/// Device registration against the provisioning service.
pub mod provisioning;
/// Hub session management.
pub mod session;
/// The connection supervisor.
pub mod supervisor;
/// Twin documents and their handlers.
pub mod twin;

#[cfg(test)]
mod tests;
