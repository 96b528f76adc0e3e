use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;

use serde_json::Value;

use tracing::{debug, warn};

use crate::error::Result;
use crate::message::{
    ConfirmationHandler, ContentEncoding, ContentType, InboundMessage, JsonMessageHandler, Message,
    MessageHandler, MessageId, UserContext,
};
use crate::method::{MethodHandler, MethodRequest, MethodResponse, MethodTable};
use crate::session::{ConnectionReason, ConnectionStatusHandler, HubSession, HubTransport};
use crate::twin::{
    DesiredPropertiesHandler, ReportedStateHandler, TwinHandler, TwinUpdateKind,
    desired_properties,
};

// A message waiting for its confirmation.
struct Outstanding {
    context: Option<UserContext>,
    // Kept alive until the confirmation.
    _message: Message,
}

// Message identifiers are unique for the whole process lifetime.
static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(0);

/// Routes transport events to the application handlers and tracks the
/// messages waiting for a confirmation.
///
/// Message identifiers come from a counter shared by every dispatcher of
/// the process.
#[derive(Default)]
pub struct Dispatcher {
    outstanding: IndexMap<MessageId, Outstanding>,
    message_handler: Option<Box<dyn MessageHandler>>,
    json_message_handler: Option<Box<dyn JsonMessageHandler>>,
    confirmation_handler: Option<Box<dyn ConfirmationHandler>>,
    twin_handler: Option<Box<dyn TwinHandler>>,
    desired_handler: Option<Box<dyn DesiredPropertiesHandler>>,
    reported_handler: Option<Box<dyn ReportedStateHandler>>,
    status_handler: Option<Box<dyn ConnectionStatusHandler>>,
    methods: MethodTable,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("outstanding", &self.outstanding.len())
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a [`Dispatcher`] with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the handler of cloud-to-device messages in byte form.
    pub fn set_message_handler(&mut self, handler: impl MessageHandler + 'static) {
        self.message_handler = Some(Box::new(handler));
    }

    /// Sets the handler of cloud-to-device messages in parsed JSON form.
    pub fn set_json_message_handler(&mut self, handler: impl JsonMessageHandler + 'static) {
        self.json_message_handler = Some(Box::new(handler));
    }

    /// Sets the handler of message confirmations.
    pub fn set_confirmation_handler(&mut self, handler: impl ConfirmationHandler + 'static) {
        self.confirmation_handler = Some(Box::new(handler));
    }

    /// Sets the handler of twin documents in byte form.
    pub fn set_twin_handler(&mut self, handler: impl TwinHandler + 'static) {
        self.twin_handler = Some(Box::new(handler));
    }

    /// Sets the handler of desired properties.
    pub fn set_desired_properties_handler(
        &mut self,
        handler: impl DesiredPropertiesHandler + 'static,
    ) {
        self.desired_handler = Some(Box::new(handler));
    }

    /// Sets the handler of reported properties confirmations.
    pub fn set_reported_state_handler(&mut self, handler: impl ReportedStateHandler + 'static) {
        self.reported_handler = Some(Box::new(handler));
    }

    /// Sets the handler of connection status changes.
    pub fn set_connection_status_handler(
        &mut self,
        handler: impl ConnectionStatusHandler + 'static,
    ) {
        self.status_handler = Some(Box::new(handler));
    }

    /// Replaces the direct methods table.
    pub fn set_methods(&mut self, methods: MethodTable) {
        self.methods = methods;
    }

    /// Adds a direct method to the current table.
    pub fn add_method(&mut self, name: impl Into<String>, handler: impl MethodHandler + 'static) {
        self.methods = std::mem::take(&mut self.methods).method(name, handler);
    }

    /// Builds a message, assigning it the next identifier.
    pub fn build_message(
        &mut self,
        payload: impl Into<Vec<u8>>,
        content_type: Option<&str>,
        content_encoding: Option<&str>,
    ) -> Message {
        let id = MessageId::new(NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed));
        Message::new(
            id,
            payload.into(),
            content_type.map(ContentType::new),
            content_encoding.map(ContentEncoding::new),
        )
    }

    /// Returns the number of messages waiting for a confirmation.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Queues a message on the session.
    ///
    /// The message and its context are kept until the confirmation.
    ///
    /// # Errors
    ///
    /// The session is not open or rejects the message.
    pub fn send_event<T: HubTransport>(
        &mut self,
        session: &mut HubSession<T>,
        message: Message,
        context: Option<UserContext>,
    ) -> Result<MessageId> {
        session.send_event(&message)?;

        let id = message.id();
        let _ = self.outstanding.insert(
            id,
            Outstanding {
                context,
                _message: message,
            },
        );
        Ok(id)
    }

    /// Queues a reported properties update on the session.
    ///
    /// An empty document succeeds without any traffic.
    ///
    /// # Errors
    ///
    /// The session is not open or rejects the update.
    pub fn report_twin<T: HubTransport>(
        &mut self,
        session: &mut HubSession<T>,
        document: &[u8],
    ) -> Result<()> {
        if document.is_empty() {
            debug!("Empty reported state, nothing to send");
            return Ok(());
        }
        let _ = session.report_twin(document)?;
        Ok(())
    }

    pub(crate) fn confirm(&mut self, message_id: MessageId, delivered: bool) {
        let Some(outstanding) = self.outstanding.shift_remove(&message_id) else {
            warn!("Confirmation for unknown message {message_id}, ignored");
            return;
        };

        if !delivered {
            warn!("Message {message_id} not delivered");
        }

        if let Some(handler) = self.confirmation_handler.as_mut() {
            handler.on_confirmation(outstanding.context, delivered);
        }
    }

    pub(crate) fn discard_outstanding(&mut self) -> usize {
        let discarded = self.outstanding.len();
        self.outstanding.clear();
        discarded
    }

    pub(crate) fn connection_status(&mut self, connected: bool, reason: ConnectionReason) {
        if let Some(handler) = self.status_handler.as_mut() {
            handler.on_status(connected, reason);
        }
    }

    pub(crate) fn reported_state(&mut self, status: u16) {
        if let Some(handler) = self.reported_handler.as_mut() {
            handler.on_reported(status);
        }
    }

    pub(crate) fn inbound_message(&mut self, message: &InboundMessage) {
        if let Some(handler) = self.message_handler.as_mut() {
            handler.on_message(message);
        }

        if let Some(handler) = self.json_message_handler.as_mut() {
            match message.json() {
                Ok(payload) => handler.on_json(&payload),
                Err(e) => warn!("Message payload is not JSON, dropped: {e}"),
            }
        }
    }

    pub(crate) fn twin_update(&mut self, kind: TwinUpdateKind, document: &[u8]) {
        if let Some(handler) = self.twin_handler.as_mut() {
            handler.on_twin(kind, document);
        }

        if let Some(handler) = self.desired_handler.as_mut() {
            match serde_json::from_slice::<Value>(document) {
                Ok(twin) => handler.on_desired(kind, &desired_properties(twin)),
                Err(e) => warn!("Invalid {kind} twin document, dropped: {e}"),
            }
        }
    }

    pub(crate) fn invoke_method(&mut self, request: &MethodRequest) -> MethodResponse {
        debug!("Invoking method `{}`", request.name);
        self.methods.invoke(request)
    }
}
