use serde_json::Value;

/// The kind of an inbound twin document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinUpdateKind {
    /// The full twin, sent when a session starts.
    Complete,
    /// A desired properties delta.
    Partial,
}

impl std::fmt::Display for TwinUpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
        }
        .fmt(f)
    }
}

/// Extracts the desired properties from a twin document.
///
/// A full twin carries them under a top-level `desired` object, while a
/// delta is the desired object itself.
#[must_use]
pub fn desired_properties(document: Value) -> Value {
    match document {
        Value::Object(mut map) => match map.remove("desired") {
            Some(desired) => desired,
            None => Value::Object(map),
        },
        other => other,
    }
}

/// Handles inbound twin documents in their byte form.
pub trait TwinHandler {
    /// Receives a twin document.
    fn on_twin(&mut self, kind: TwinUpdateKind, document: &[u8]);
}

impl<F> TwinHandler for F
where
    F: FnMut(TwinUpdateKind, &[u8]),
{
    fn on_twin(&mut self, kind: TwinUpdateKind, document: &[u8]) {
        self(kind, document);
    }
}

/// Handles the desired properties of inbound twin documents.
pub trait DesiredPropertiesHandler {
    /// Receives the desired properties.
    fn on_desired(&mut self, kind: TwinUpdateKind, desired: &Value);
}

impl<F> DesiredPropertiesHandler for F
where
    F: FnMut(TwinUpdateKind, &Value),
{
    fn on_desired(&mut self, kind: TwinUpdateKind, desired: &Value) {
        self(kind, desired);
    }
}

/// Handles the status of a reported properties update.
pub trait ReportedStateHandler {
    /// Receives the HTTP-like status returned by the hub.
    fn on_reported(&mut self, status: u16);
}

impl<F> ReportedStateHandler for F
where
    F: FnMut(u16),
{
    fn on_reported(&mut self, status: u16) {
        self(status);
    }
}
