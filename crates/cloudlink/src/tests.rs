use std::cell::{RefCell, RefMut};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::{Error, ErrorKind, Result};
use crate::message::Message;
use crate::probe::NetworkProbe;
use crate::provisioning::{
    ProvisioningClient, ProvisioningConnector, RegistrationOutcome, RegistrationRequest,
};
use crate::session::{HubConnector, HubTransport, SessionSettings, TransportEvent};

// How the mock provisioning service answers.
#[derive(Debug, Clone, Default)]
pub(crate) enum ProvisioningScript {
    // Never answers.
    #[default]
    Never,
    // Assigns a hub on the given poll.
    Assign { after_polls: u32, hub_uri: String },
    // Fails on the given poll.
    Fail { after_polls: u32, reason: String },
    // The client cannot be created.
    ConnectError,
}

impl ProvisioningScript {
    pub(crate) fn assign_after(after_polls: u32, hub_uri: &str) -> Self {
        Self::Assign {
            after_polls,
            hub_uri: hub_uri.into(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct MockState {
    pub(crate) networking: bool,
    pub(crate) auth: bool,
    pub(crate) provisioning: ProvisioningScript,
    pub(crate) requests: Vec<RegistrationRequest>,
    pub(crate) polls: u32,
    pub(crate) live_dps: u32,
    pub(crate) live_hub: u32,
    // Set when a hub client is created while a provisioning client is alive.
    pub(crate) overlap: bool,
    pub(crate) hub_connect_fails: bool,
    pub(crate) opened: Vec<String>,
    pub(crate) hub_events: VecDeque<TransportEvent>,
    pub(crate) send_fails: bool,
    pub(crate) sent: Vec<Message>,
    pub(crate) reports: Vec<(u32, Vec<u8>)>,
    pub(crate) method_responses: Vec<(String, u16, Vec<u8>)>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            networking: true,
            auth: true,
            provisioning: ProvisioningScript::Never,
            requests: Vec::new(),
            polls: 0,
            live_dps: 0,
            live_hub: 0,
            overlap: false,
            hub_connect_fails: false,
            opened: Vec::new(),
            hub_events: VecDeque::new(),
            send_fails: false,
            sent: Vec::new(),
            reports: Vec::new(),
            method_responses: Vec::new(),
        }
    }
}

// Prints the crate logs of a failing test.
pub(crate) fn logs() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

// A scripted platform, shared between the test and the clients it creates.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockPlatform(Rc<RefCell<MockState>>);

impl MockPlatform {
    pub(crate) fn state(&self) -> RefMut<'_, MockState> {
        self.0.borrow_mut()
    }

    pub(crate) fn set_networking(&self, ready: bool) {
        self.state().networking = ready;
    }

    pub(crate) fn push_event(&self, event: TransportEvent) {
        self.state().hub_events.push_back(event);
    }
}

impl NetworkProbe for MockPlatform {
    fn networking_ready(&mut self) -> Result<bool> {
        Ok(self.state().networking)
    }

    fn device_auth_ready(&mut self) -> Result<bool> {
        Ok(self.state().auth)
    }
}

#[derive(Debug)]
pub(crate) struct MockDps(Rc<RefCell<MockState>>);

impl ProvisioningClient for MockDps {
    fn register(&mut self, _request: &RegistrationRequest) -> Result<()> {
        Ok(())
    }

    fn do_work(&mut self) -> Option<RegistrationOutcome> {
        let mut state = self.0.borrow_mut();
        state.polls += 1;
        match state.provisioning.clone() {
            ProvisioningScript::Assign {
                after_polls,
                hub_uri,
            } if state.polls >= after_polls => Some(RegistrationOutcome::Assigned {
                hub_uri,
                device_id: "device-1".into(),
            }),
            ProvisioningScript::Fail {
                after_polls,
                reason,
            } if state.polls >= after_polls => Some(RegistrationOutcome::Failed(reason)),
            _ => None,
        }
    }
}

impl Drop for MockDps {
    fn drop(&mut self) {
        self.0.borrow_mut().live_dps -= 1;
    }
}

impl ProvisioningConnector for MockPlatform {
    type Client = MockDps;

    fn connect(&mut self, request: &RegistrationRequest) -> Result<MockDps> {
        let mut state = self.state();
        if matches!(state.provisioning, ProvisioningScript::ConnectError) {
            return Err(Error::new(ErrorKind::Provisioning, "No provisioning client"));
        }
        state.requests.push(request.clone());
        state.polls = 0;
        state.live_dps += 1;
        Ok(MockDps(Rc::clone(&self.0)))
    }
}

#[derive(Debug)]
pub(crate) struct MockHub(Rc<RefCell<MockState>>);

impl HubTransport for MockHub {
    fn send_event(&mut self, message: &Message) -> Result<()> {
        let mut state = self.0.borrow_mut();
        if state.send_fails {
            return Err(Error::new(ErrorKind::QueueFull, "Outbound queue full"));
        }
        state.sent.push(message.clone());
        Ok(())
    }

    fn report_twin(&mut self, request_id: u32, document: &[u8]) -> Result<()> {
        self.0
            .borrow_mut()
            .reports
            .push((request_id, document.to_vec()));
        Ok(())
    }

    fn respond_method(&mut self, request_id: &str, status: u16, body: Vec<u8>) -> Result<()> {
        self.0
            .borrow_mut()
            .method_responses
            .push((request_id.into(), status, body));
        Ok(())
    }

    fn do_work(&mut self) -> Vec<TransportEvent> {
        self.0.borrow_mut().hub_events.drain(..).collect()
    }
}

impl Drop for MockHub {
    fn drop(&mut self) {
        self.0.borrow_mut().live_hub -= 1;
    }
}

impl HubConnector for MockPlatform {
    type Transport = MockHub;

    fn connect(&mut self, settings: &SessionSettings<'_>) -> Result<MockHub> {
        let mut state = self.state();
        if state.hub_connect_fails {
            return Err(Error::new(ErrorKind::Transport, "TLS setup failed"));
        }
        if state.live_dps > 0 {
            state.overlap = true;
        }
        state.opened.push(settings.hub_uri.into());
        state.live_hub += 1;
        Ok(MockHub(Rc::clone(&self.0)))
    }
}
