use std::any::Any;

use indexmap::IndexMap;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use serde_json::Value;

use crate::error::Result;

/// Message identifier property.
pub const MESSAGE_ID_PROPERTY: &str = "$.mid";
/// Content type property.
pub const CONTENT_TYPE_PROPERTY: &str = "$.ct";
/// Content encoding property.
pub const CONTENT_ENCODING_PROPERTY: &str = "$.ce";
/// Subject property, used to route a message to a logical component.
pub const SUBJECT_PROPERTY: &str = "$.sub";

// Every character but the unreserved ones of RFC 3986.
const PROPERTY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encodes a property key or value for the wire.
///
/// Spaces become `%20` and every reserved character, `&` and `=`
/// included, is escaped.
#[must_use]
pub fn encode_property(value: &str) -> String {
    utf8_percent_encode(value, PROPERTY_ENCODE_SET).to_string()
}

/// An opaque application value returned by the confirmation of a message.
pub type UserContext = Box<dyn Any>;

/// A message identifier.
///
/// Identifiers are assigned from a zero-based counter and strictly increase
/// for the whole process lifetime. On the wire they are the decimal
/// representation of the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl MessageId {
    pub(crate) const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the counter value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A message content type.
///
/// The wire form is percent-encoded, so `application/json` travels as
/// `application%2Fjson`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    decoded: String,
    encoded: String,
}

impl ContentType {
    /// Creates a [`ContentType`].
    #[must_use]
    pub fn new(value: &str) -> Self {
        Self {
            decoded: value.into(),
            encoded: encode_property(value),
        }
    }

    /// Creates the `application/json` [`ContentType`].
    #[must_use]
    pub fn json() -> Self {
        Self::new("application/json")
    }

    /// Creates the `text/plain` [`ContentType`].
    #[must_use]
    pub fn plain_text() -> Self {
        Self::new("text/plain")
    }

    /// Returns the percent-encoded wire form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// Returns the content type as given on construction.
    #[must_use]
    pub fn decoded(&self) -> &str {
        &self.decoded
    }
}

/// A message content encoding, stored as a lowercase label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEncoding(String);

impl ContentEncoding {
    /// Creates a [`ContentEncoding`].
    #[must_use]
    pub fn new(value: &str) -> Self {
        Self(value.to_ascii_lowercase())
    }

    /// Creates the `utf-8` [`ContentEncoding`].
    #[must_use]
    pub fn utf8() -> Self {
        Self::new("utf-8")
    }

    /// Creates the `utf-16` [`ContentEncoding`].
    #[must_use]
    pub fn utf16() -> Self {
        Self::new("utf-16")
    }

    /// Returns the encoding label.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An outbound message.
///
/// A message is built by the dispatch plane, which assigns its identifier,
/// and is owned by the core from a successful enqueue until its
/// confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: MessageId,
    payload: Vec<u8>,
    content_type: Option<ContentType>,
    content_encoding: Option<ContentEncoding>,
    subject: Option<String>,
    properties: IndexMap<String, String>,
}

impl Message {
    pub(crate) fn new(
        id: MessageId,
        payload: Vec<u8>,
        content_type: Option<ContentType>,
        content_encoding: Option<ContentEncoding>,
    ) -> Self {
        Self {
            id,
            payload,
            content_type,
            content_encoding,
            subject: None,
            properties: IndexMap::new(),
        }
    }

    /// Sets the subject, the logical component a message is addressed to.
    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Adds an application property.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.properties.insert(key.into(), value.into());
        self
    }

    /// Returns the message identifier.
    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.id
    }

    /// Returns the payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the content type.
    #[must_use]
    pub const fn content_type(&self) -> Option<&ContentType> {
        self.content_type.as_ref()
    }

    /// Returns the content encoding.
    #[must_use]
    pub const fn content_encoding(&self) -> Option<&ContentEncoding> {
        self.content_encoding.as_ref()
    }

    /// Returns the subject.
    #[must_use]
    pub fn subject_hint(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Returns the application properties in insertion order.
    #[must_use]
    pub const fn properties(&self) -> &IndexMap<String, String> {
        &self.properties
    }

    /// Returns the system properties carried on the wire.
    ///
    /// The identifier is always present, the other properties only when they
    /// have been supplied. Values are percent-encoded, so none of them can
    /// add a property of its own.
    #[must_use]
    pub fn system_properties(&self) -> Vec<(&'static str, String)> {
        let mut properties = vec![(MESSAGE_ID_PROPERTY, self.id.to_string())];
        if let Some(content_type) = &self.content_type {
            properties.push((CONTENT_TYPE_PROPERTY, content_type.as_str().into()));
        }
        if let Some(content_encoding) = &self.content_encoding {
            properties.push((
                CONTENT_ENCODING_PROPERTY,
                encode_property(content_encoding.as_str()),
            ));
        }
        if let Some(subject) = &self.subject {
            properties.push((SUBJECT_PROPERTY, encode_property(subject)));
        }
        properties
    }
}

/// A cloud-to-device message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    payload: Vec<u8>,
    properties: IndexMap<String, String>,
}

impl InboundMessage {
    /// Creates an [`InboundMessage`] copying the payload handed over by the
    /// transport.
    #[must_use]
    pub fn new(payload: &[u8]) -> Self {
        Self {
            payload: payload.to_vec(),
            properties: IndexMap::new(),
        }
    }

    /// Adds a property.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.properties.insert(key.into(), value.into());
        self
    }

    /// Returns the payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the value of a property.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Returns all properties.
    #[must_use]
    pub const fn properties(&self) -> &IndexMap<String, String> {
        &self.properties
    }

    /// Parses the payload as JSON.
    ///
    /// # Errors
    ///
    /// The payload is not a valid JSON document.
    pub fn json(&self) -> Result<Value> {
        serde_json::from_slice(&self.payload).map_err(Into::into)
    }
}

/// Handles cloud-to-device messages in their byte form.
pub trait MessageHandler {
    /// Receives a message.
    fn on_message(&mut self, message: &InboundMessage);
}

impl<F> MessageHandler for F
where
    F: FnMut(&InboundMessage),
{
    fn on_message(&mut self, message: &InboundMessage) {
        self(message);
    }
}

/// Handles cloud-to-device messages whose payload is a JSON document.
pub trait JsonMessageHandler {
    /// Receives the parsed payload of a message.
    fn on_json(&mut self, payload: &Value);
}

impl<F> JsonMessageHandler for F
where
    F: FnMut(&Value),
{
    fn on_json(&mut self, payload: &Value) {
        self(payload);
    }
}

/// Handles the confirmation of an outbound message.
pub trait ConfirmationHandler {
    /// Receives the context passed when the message was sent and whether the
    /// message has been delivered.
    fn on_confirmation(&mut self, context: Option<UserContext>, delivered: bool);
}

impl<F> ConfirmationHandler for F
where
    F: FnMut(Option<UserContext>, bool),
{
    fn on_confirmation(&mut self, context: Option<UserContext>, delivered: bool) {
        self(context, delivered);
    }
}
