use std::time::Duration;

use serde::Serialize;

use tracing::info;

use crate::config::ConnectionConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, Scheduler, SourceHandle};
use crate::message::{
    ConfirmationHandler, JsonMessageHandler, Message, MessageHandler, MessageId, UserContext,
};
use crate::method::MethodTable;
use crate::provisioning::TimeoutChange;
use crate::session::ConnectionStatusHandler;
use crate::supervisor::{Platform, SUPERVISOR_PERIOD, Supervisor, SupervisorState};
use crate::twin::{DesiredPropertiesHandler, ReportedStateHandler, TwinHandler};

/// Builds a [`CloudConnection`].
///
/// Every handler is registered here, before the first session can be
/// opened.
pub struct ConnectionBuilder<P: Platform> {
    config: ConnectionConfig,
    platform: P,
    dispatcher: Dispatcher,
}

impl<P: Platform> ConnectionBuilder<P> {
    /// Creates a [`ConnectionBuilder`].
    #[must_use]
    pub fn new(config: ConnectionConfig, platform: P) -> Self {
        Self {
            config,
            platform,
            dispatcher: Dispatcher::new(),
        }
    }

    /// Sets the handler of cloud-to-device messages in byte form.
    #[must_use]
    pub fn on_message(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.dispatcher.set_message_handler(handler);
        self
    }

    /// Sets the handler of cloud-to-device messages in parsed JSON form.
    #[must_use]
    pub fn on_json_message(mut self, handler: impl JsonMessageHandler + 'static) -> Self {
        self.dispatcher.set_json_message_handler(handler);
        self
    }

    /// Sets the handler of message confirmations.
    #[must_use]
    pub fn on_confirmation(mut self, handler: impl ConfirmationHandler + 'static) -> Self {
        self.dispatcher.set_confirmation_handler(handler);
        self
    }

    /// Sets the handler of twin documents in byte form.
    #[must_use]
    pub fn on_twin(mut self, handler: impl TwinHandler + 'static) -> Self {
        self.dispatcher.set_twin_handler(handler);
        self
    }

    /// Sets the handler of desired properties.
    #[must_use]
    pub fn on_desired_properties(
        mut self,
        handler: impl DesiredPropertiesHandler + 'static,
    ) -> Self {
        self.dispatcher.set_desired_properties_handler(handler);
        self
    }

    /// Sets the handler of reported properties confirmations.
    #[must_use]
    pub fn on_reported_state(mut self, handler: impl ReportedStateHandler + 'static) -> Self {
        self.dispatcher.set_reported_state_handler(handler);
        self
    }

    /// Sets the handler of connection status changes.
    #[must_use]
    pub fn on_connection_status(
        mut self,
        handler: impl ConnectionStatusHandler + 'static,
    ) -> Self {
        self.dispatcher.set_connection_status_handler(handler);
        self
    }

    /// Sets the direct methods table.
    #[must_use]
    pub fn methods(mut self, methods: MethodTable) -> Self {
        self.dispatcher.set_methods(methods);
        self
    }

    /// Builds the [`CloudConnection`].
    #[must_use]
    pub fn build(self) -> CloudConnection<P> {
        CloudConnection {
            config: self.config,
            platform: self.platform,
            supervisor: Supervisor::new(),
            dispatcher: self.dispatcher,
        }
    }
}

/// The cloud connection.
///
/// It owns the configuration, the platform, the supervisor and the
/// dispatcher, and is driven by [`CloudConnection::tick`].
pub struct CloudConnection<P: Platform> {
    config: ConnectionConfig,
    platform: P,
    supervisor: Supervisor<P>,
    dispatcher: Dispatcher,
}

impl<P: Platform> std::fmt::Debug for CloudConnection<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudConnection")
            .field("config", &self.config)
            .field("supervisor", &self.supervisor)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl<P: Platform> CloudConnection<P> {
    /// Creates a [`ConnectionBuilder`].
    #[must_use]
    pub fn builder(config: ConnectionConfig, platform: P) -> ConnectionBuilder<P> {
        ConnectionBuilder::new(config, platform)
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Returns the platform.
    #[must_use]
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    /// Returns the platform as mutable.
    pub const fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Returns the supervisor.
    #[must_use]
    pub const fn supervisor(&self) -> &Supervisor<P> {
        &self.supervisor
    }

    /// Returns the supervisor state.
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.supervisor.state()
    }

    /// Runs one supervision step at the given loop time.
    pub fn tick(&mut self, now: Duration) -> SupervisorState {
        self.supervisor
            .tick(&mut self.platform, &self.config, &mut self.dispatcher, now)
    }

    /// Fires the registration timeout at the given loop time.
    pub fn expire_registration(&mut self, now: Duration) -> SupervisorState {
        self.supervisor.expire_registration(now)
    }

    /// Processes the pending transport events of the hub session.
    pub fn poll_transport(&mut self, now: Duration) -> SupervisorState {
        self.supervisor.poll_session(&mut self.dispatcher, now)
    }

    /// Tears every client down and restarts from idle.
    pub fn reset(&mut self) {
        self.supervisor.reset(&mut self.dispatcher);
    }

    /// Replaces the direct methods table.
    pub fn register_methods(&mut self, methods: MethodTable) {
        info!("Registering {} direct methods", methods.len());
        self.dispatcher.set_methods(methods);
    }

    /// Builds a message, assigning it the next identifier.
    pub fn build_message(
        &mut self,
        payload: impl Into<Vec<u8>>,
        content_type: Option<&str>,
        content_encoding: Option<&str>,
    ) -> Message {
        self.dispatcher
            .build_message(payload, content_type, content_encoding)
    }

    /// Sends a message.
    ///
    /// The context is handed back to the confirmation handler.
    ///
    /// # Errors
    ///
    /// - [`crate::error::ErrorKind::NotInitialized`] when no hub session is
    ///   open
    /// - any error returned by the transport
    pub fn send_event(&mut self, message: Message, context: Option<UserContext>) -> Result<MessageId> {
        let session = self
            .supervisor
            .session_mut()
            .ok_or_else(|| Error::not_initialized("No hub session"))?;
        self.dispatcher.send_event(session, message, context)
    }

    /// Sends a plain text message encoded as `utf-8`.
    ///
    /// # Errors
    ///
    /// The same errors of [`CloudConnection::send_event`].
    pub fn send_plain_text(&mut self, text: &str, context: Option<UserContext>) -> Result<MessageId> {
        let message = self.build_message(text, Some("text/plain"), Some("utf-8"));
        self.send_event(message, context)
    }

    /// Sends a reported properties document.
    ///
    /// An empty document succeeds without any traffic.
    ///
    /// # Errors
    ///
    /// - [`crate::error::ErrorKind::NotInitialized`] when no hub session is
    ///   open
    /// - any error returned by the transport
    pub fn report_twin(&mut self, document: &[u8]) -> Result<()> {
        if document.is_empty() {
            return Ok(());
        }
        let session = self
            .supervisor
            .session_mut()
            .ok_or_else(|| Error::not_initialized("No hub session"))?;
        self.dispatcher.report_twin(session, document)
    }

    /// Serializes reported properties and sends them.
    ///
    /// # Errors
    ///
    /// - [`crate::error::ErrorKind::Json`] when the properties cannot be
    ///   serialized
    /// - the same errors of [`CloudConnection::report_twin`]
    pub fn report_properties<T: Serialize>(&mut self, properties: &T) -> Result<()> {
        let document = serde_json::to_vec(properties)?;
        self.report_twin(&document)
    }
}

impl<P: Platform + 'static> CloudConnection<P> {
    /// Registers the supervision timer on an [`EventLoop`].
    ///
    /// The registration timeout runs as a separate one-shot timer, armed
    /// when a registration begins and removed once it is over.
    ///
    /// The `select` function returns the connection stored in the loop
    /// context.
    pub fn attach<C: 'static>(event_loop: &mut EventLoop<C>, select: fn(&mut C) -> &mut Self) -> SourceHandle {
        let mut timeout = None;
        event_loop.periodic(SUPERVISOR_PERIOD, move |ctx, scheduler| {
            let connection = select(ctx);
            let _ = connection.tick(scheduler.now());
            connection.apply_timeout_changes(scheduler, &mut timeout, select);
            Ok(())
        })
    }

    fn apply_timeout_changes<C: 'static>(
        &mut self,
        scheduler: &mut Scheduler<C>,
        timeout: &mut Option<SourceHandle>,
        select: fn(&mut C) -> &mut Self,
    ) {
        for change in self.supervisor.take_timeout_changes() {
            if let Some(handle) = timeout.take() {
                scheduler.unregister(handle);
            }
            if let TimeoutChange::Arm(delay) = change {
                *timeout = Some(scheduler.once(delay, move |ctx, scheduler| {
                    let _ = select(ctx).expire_registration(scheduler.now());
                    Ok(())
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use serde::Serialize;
    use serde_json::Value;

    use crate::config::ConnectionConfig;
    use crate::error::ErrorKind;
    use crate::event_loop::EventLoop;
    use crate::message::{ContentEncoding, ContentType, UserContext};
    use crate::method::{MethodRequest, MethodResponse, MethodTable};
    use crate::session::{ConnectionReason, TransportEvent};
    use crate::supervisor::SupervisorState;
    use crate::tests::{MockPlatform, ProvisioningScript, logs};

    use super::CloudConnection;

    fn connected() -> (CloudConnection<MockPlatform>, MockPlatform) {
        connected_with(|builder| builder)
    }

    fn connected_with(
        configure: impl FnOnce(
            super::ConnectionBuilder<MockPlatform>,
        ) -> super::ConnectionBuilder<MockPlatform>,
    ) -> (CloudConnection<MockPlatform>, MockPlatform) {
        logs();
        let platform = MockPlatform::default();
        platform.state().provisioning = ProvisioningScript::assign_after(1, "my-hub.example.net");
        let config = ConnectionConfig::new().with_scope_id("abcd1234").unwrap();

        let mut connection = configure(CloudConnection::builder(config, platform.clone())).build();
        assert_eq!(connection.tick(Duration::ZERO), SupervisorState::HubInitializing);
        platform.push_event(TransportEvent::ConnectionStatus {
            authenticated: true,
            reason: ConnectionReason::Ok,
        });
        assert_eq!(
            connection.tick(Duration::from_millis(100)),
            SupervisorState::HubAuthenticated
        );
        (connection, platform)
    }

    #[test]
    fn telemetry_round_trip() {
        let confirmations = Rc::new(RefCell::new(Vec::new()));
        let recorded = Rc::clone(&confirmations);
        let (mut connection, platform) = connected_with(|builder| {
            builder.on_confirmation(move |context: Option<UserContext>, delivered: bool| {
                let tag = context.and_then(|c| c.downcast::<u32>().ok()).map(|c| *c);
                recorded.borrow_mut().push((tag, delivered));
            })
        });

        let id = connection.send_plain_text("hello", Some(Box::new(42u32))).unwrap();
        {
            let state = platform.state();
            let message = &state.sent[0];
            assert_eq!(message.id(), id);
            assert_eq!(message.payload(), b"hello");
            assert_eq!(
                message.content_type().map(ContentType::as_str),
                Some("text%2Fplain")
            );
            assert_eq!(
                message.content_encoding().map(ContentEncoding::as_str),
                Some("utf-8")
            );
        }

        platform.push_event(TransportEvent::EventConfirmation {
            message_id: id,
            delivered: true,
        });
        let _ = connection.tick(Duration::from_millis(200));
        assert_eq!(*confirmations.borrow(), [(Some(42), true)]);

        let next = connection.send_plain_text("hello", None).unwrap();
        assert!(next > id);
        assert_eq!(platform.state().sent[1].id(), next);
    }

    #[test]
    fn send_without_session() {
        let platform = MockPlatform::default();
        let mut connection = CloudConnection::builder(ConnectionConfig::new(), platform).build();

        let error = connection.send_plain_text("hello", None).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotInitialized);
        assert_eq!(
            connection.report_twin(b"{}").unwrap_err().kind(),
            ErrorKind::NotInitialized
        );
        // An empty report never fails.
        connection.report_twin(b"").unwrap();
    }

    #[test]
    fn method_not_found_with_empty_table() {
        let (mut connection, platform) = connected();
        platform.push_event(TransportEvent::Method(MethodRequest::new(
            "1", "doThing", b"{}",
        )));
        let _ = connection.poll_transport(Duration::from_millis(150));

        assert_eq!(
            platform.state().method_responses,
            [("1".to_owned(), 404, br#""method not found""#.to_vec())]
        );
    }

    #[test]
    fn register_methods_at_runtime() {
        let (mut connection, platform) = connected();
        connection.register_methods(
            MethodTable::new().method("blink", |params: Option<&Value>| {
                MethodResponse::ok(params.cloned().unwrap_or(Value::Null))
            }),
        );
        platform.push_event(TransportEvent::Method(MethodRequest::new(
            "2", "blink", br#"{"rate":2}"#,
        )));
        let _ = connection.tick(Duration::from_millis(200));

        assert_eq!(
            platform.state().method_responses,
            [("2".to_owned(), 200, br#"{"rate":2}"#.to_vec())]
        );
    }

    #[test]
    fn report_properties() {
        #[derive(Serialize)]
        struct Reported {
            #[serde(rename = "blinkRateProperty")]
            blink_rate: u32,
        }

        let statuses = Rc::new(RefCell::new(Vec::new()));
        let recorded = Rc::clone(&statuses);
        let (mut connection, platform) = connected_with(|builder| {
            builder.on_reported_state(move |status: u16| recorded.borrow_mut().push(status))
        });

        connection
            .report_properties(&Reported { blink_rate: 2 })
            .unwrap();
        assert_eq!(
            platform.state().reports,
            [(0, br#"{"blinkRateProperty":2}"#.to_vec())]
        );

        platform.push_event(TransportEvent::ReportedState {
            request_id: 0,
            status: 204,
        });
        let _ = connection.tick(Duration::from_millis(200));
        assert_eq!(*statuses.borrow(), [204]);
    }

    struct Context {
        connection: CloudConnection<MockPlatform>,
    }

    fn select(ctx: &mut Context) -> &mut CloudConnection<MockPlatform> {
        &mut ctx.connection
    }

    fn attached(script: ProvisioningScript) -> (EventLoop<Context>, Context) {
        logs();
        let platform = MockPlatform::default();
        platform.state().provisioning = script;
        let config = ConnectionConfig::new().with_scope_id("abcd1234").unwrap();
        let context = Context {
            connection: CloudConnection::builder(config, platform).build(),
        };

        let mut event_loop = EventLoop::new();
        let _ = CloudConnection::attach(&mut event_loop, select);
        (event_loop, context)
    }

    #[test]
    fn attach_to_event_loop() {
        let (mut event_loop, mut context) =
            attached(ProvisioningScript::assign_after(1, "my-hub.example.net"));

        let _ = event_loop.turn(&mut context, Duration::from_millis(50));
        assert_eq!(context.connection.state(), SupervisorState::Idle);
        let _ = event_loop.turn(&mut context, Duration::from_millis(100));
        assert_eq!(
            context.connection.state(),
            SupervisorState::HubInitializing
        );
        // The registration is over, its timeout timer is gone.
        assert_eq!(event_loop.len(), 1);
    }

    #[test]
    fn registration_timeout_timer() {
        let (mut event_loop, mut context) = attached(ProvisioningScript::Never);

        let _ = event_loop.turn(&mut context, Duration::from_millis(100));
        assert_eq!(context.connection.state(), SupervisorState::Registering);
        assert_eq!(event_loop.len(), 2);

        for millis in (200..30_100).step_by(100) {
            let _ = event_loop.turn(&mut context, Duration::from_millis(millis));
        }
        assert_eq!(context.connection.state(), SupervisorState::Registering);

        // Armed at 100ms, the one-shot fires 30s later.
        let _ = event_loop.turn(&mut context, Duration::from_millis(30_100));
        assert_eq!(
            context.connection.state(),
            SupervisorState::RegistrationFailed
        );
        assert_eq!(
            context.connection.supervisor().last_reason(),
            Some("Registration timed out")
        );
        assert_eq!(
            context.connection.supervisor().retry_at(),
            Some(Duration::from_millis(35_100))
        );
        assert_eq!(event_loop.len(), 1);
    }
}
