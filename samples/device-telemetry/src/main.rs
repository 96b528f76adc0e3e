//! A device which provisions itself, connects to its hub and sends periodic
//! telemetry.
//!
//! The telemetry interval follows the `telemetryInterval` desired property
//! and the `setTelemetryInterval` direct method.

use std::cell::Cell;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Duration;

use cloudlink::config::{ConnectionConfig, SessionOptions};
use cloudlink::connection::CloudConnection;
use cloudlink::error::Result;
use cloudlink::event_loop::{EventLoop, Interest, SourceHandle};
use cloudlink::message::{InboundMessage, UserContext};
use cloudlink::method::{MethodResponse, MethodTable};
use cloudlink::session::ConnectionReason;
use cloudlink::supervisor::SupervisorState;
use cloudlink::twin::TwinUpdateKind;

use cloudlink_mqtt::{MqttPlatform, X509Credentials};

use clap::Parser;

use serde_json::{Value, json};

use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;

// Default model identifier.
const MODEL_ID: &str = "dtmi:cloudlink:sample:thermostat;1";

// Default registration identifier.
const REGISTRATION_ID: &str = "cloudlink-device";

// Default telemetry interval, in seconds.
const TELEMETRY_INTERVAL: u64 = 10;

// Shortest accepted telemetry interval, in seconds.
const MIN_TELEMETRY_INTERVAL: u64 = 1;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Scope identifier of the provisioning service.
    #[arg(long = "ScopeId")]
    scope_id: Option<String>,

    /// Model identifier advertised to the hub.
    #[arg(long, default_value_t = MODEL_ID.into())]
    model_id: String,

    /// Registration identifier, the common name of the device certificate.
    #[arg(long, default_value_t = REGISTRATION_ID.into())]
    registration_id: String,

    /// Device certificate in PEM format.
    #[arg(long, default_value = "device.pem")]
    cert: PathBuf,

    /// Device private key in PEM format.
    #[arg(long, default_value = "device.key")]
    key: PathBuf,

    /// Bundle of trusted certificate authorities in PEM format.
    #[arg(long)]
    trusted_ca: Option<PathBuf>,

    /// Telemetry interval, in seconds.
    #[arg(long, default_value_t = TELEMETRY_INTERVAL)]
    telemetry_interval: u64,

    /// Verbose logs.
    #[arg(short, long)]
    verbose: bool,
}

// Requests raised by the cloud and served by the loop.
#[derive(Debug, Default)]
struct Requests {
    interval: Cell<Option<Duration>>,
    reboot: Cell<bool>,
}

struct Device {
    connection: CloudConnection<MqttPlatform>,
    telemetry: Option<SourceHandle>,
    sent: u64,
}

fn select(device: &mut Device) -> &mut CloudConnection<MqttPlatform> {
    &mut device.connection
}

fn interval_from(value: &Value) -> Option<Duration> {
    value
        .as_u64()
        .filter(|seconds| *seconds >= MIN_TELEMETRY_INTERVAL)
        .map(Duration::from_secs)
}

fn methods(requests: &Rc<Requests>) -> MethodTable {
    let interval = Rc::clone(requests);
    let reboot = Rc::clone(requests);

    MethodTable::new()
        .method("setTelemetryInterval", move |params: Option<&Value>| {
            let Some(period) = params.and_then(|p| p.get("interval")).and_then(interval_from)
            else {
                return MethodResponse::new(400, Some(json!("expected {\"interval\": seconds}")));
            };
            interval.interval.set(Some(period));
            MethodResponse::ok(json!({ "interval": period.as_secs() }))
        })
        .method("reboot", move |_params: Option<&Value>| {
            reboot.reboot.set(true);
            MethodResponse::empty(200)
        })
}

fn send_telemetry(device: &mut Device) -> Result<()> {
    device.sent += 1;

    // A slow sawtooth between 20 and 25 degrees.
    let temperature = 20.0 + (device.sent % 10) as f64 * 0.5;
    let payload = serde_json::to_vec(&json!({ "temperature": temperature }))?;

    let message = device
        .connection
        .build_message(payload, Some("application/json"), Some("utf-8"))
        .subject("thermostat")
        .property("counter", device.sent.to_string());

    let context: UserContext = Box::new(device.sent);
    let _ = device.connection.send_event(message, Some(context))?;
    Ok(())
}

// An invalid scope identifier leaves the device unprovisioned: the
// connection stays in its failed state until reconfigured.
fn apply_scope_id(config: &mut ConnectionConfig, scope_id: Option<&str>) {
    if scope_id.is_none() {
        warn!("No `--ScopeId` given, the device cannot be provisioned");
    }
    if let Err(e) = config.set_scope_id(scope_id) {
        error!("Ignoring `--ScopeId`, the device cannot be provisioned: {e}");
    }
}

fn build_connection(
    cli: &Cli,
    platform: MqttPlatform,
    requests: &Rc<Requests>,
) -> Result<CloudConnection<MqttPlatform>> {
    let mut config = ConnectionConfig::new()
        .with_model_id(&cli.model_id)?
        .session_options(SessionOptions::default().log_trace(cli.verbose));
    apply_scope_id(&mut config, cli.scope_id.as_deref());

    let desired = Rc::clone(requests);

    Ok(CloudConnection::builder(config, platform)
        .on_connection_status(|connected: bool, reason: ConnectionReason| {
            info!("Hub connection status: connected = {connected}, reason = {reason}");
        })
        .on_confirmation(|context: Option<UserContext>, delivered: bool| {
            let counter = context
                .and_then(|context| context.downcast::<u64>().ok())
                .map_or(0, |counter| *counter);
            if delivered {
                info!("Telemetry {counter} delivered");
            } else {
                warn!("Telemetry {counter} not delivered");
            }
        })
        .on_message(|message: &InboundMessage| {
            info!(
                "Message received: {} ({} properties)",
                String::from_utf8_lossy(message.payload()),
                message.properties().len()
            );
        })
        .on_desired_properties(move |kind: TwinUpdateKind, properties: &Value| {
            info!("Desired properties ({kind:?}): {properties}");
            if let Some(period) = properties.get("telemetryInterval").and_then(interval_from) {
                desired.interval.set(Some(period));
            }
        })
        .on_reported_state(|status: u16| {
            info!("Reported properties answered with {status}");
        })
        .methods(methods(requests))
        .build())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut event_loop = EventLoop::<Device>::new();
    let io = event_loop.io_source();

    let mut credentials = X509Credentials::new(&cli.registration_id, &cli.cert, &cli.key);
    if let Some(trusted_ca) = &cli.trusted_ca {
        credentials = credentials.trusted_ca(trusted_ca);
    }

    let requests = Rc::new(Requests::default());
    let connection = match MqttPlatform::new(credentials, io.clone())
        .and_then(|platform| build_connection(&cli, platform, &requests))
    {
        Ok(connection) => connection,
        Err(e) => {
            error!("Initialization failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut device = Device {
        connection,
        telemetry: None,
        sent: 0,
    };

    let _ = CloudConnection::attach(&mut event_loop, select);
    let _ = event_loop.register_io(&io, Interest::READABLE, |device, scheduler| {
        let _ = device.connection.poll_transport(scheduler.now());
        Ok(())
    });

    let telemetry_interval =
        Duration::from_secs(cli.telemetry_interval.max(MIN_TELEMETRY_INTERVAL));
    device.telemetry = Some(event_loop.periodic(telemetry_interval, move |device, scheduler| {
        if let (Some(period), Some(handle)) = (requests.interval.take(), device.telemetry) {
            info!("Telemetry interval set to {period:?}");
            scheduler.set_period(handle, period);
        }

        if requests.reboot.replace(false) {
            info!("Reboot requested, restarting the connection");
            device.connection.reset();
            return Ok(());
        }

        if device.connection.state() != SupervisorState::HubAuthenticated {
            return Ok(());
        }
        send_telemetry(device)
    }));

    let stop = event_loop.stop_token();
    tokio::select! {
        () = event_loop.run(&mut device) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Unable to listen for the shutdown signal: {e}");
            }
            info!("Shutting down");
            stop.cancel();
        }
    }

    device.connection.reset();
    ExitCode::SUCCESS
}
