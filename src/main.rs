use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cable_protocol::SubscriptionIdentifier;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use printer_agent::aggregator::{self, MonitoredPrinter};
use printer_agent::cable::{Acknowledge, AcknowledgeError, CableClient, CableClientConfig, WithMessageId};
use printer_agent::config::Config;
use printer_agent::driver::{Driver, DriverConfig, PrintControl, PrintJobConfig, run_print_job, TokioSerialOpener};
use printer_agent::gcode::GcodeReader;
use printer_agent::transport::TungsteniteConnector;

/// One printer this process has connected and is tracking active jobs for.
struct PrinterRuntime {
    driver: Arc<Driver>,
    active_job: Mutex<Option<Arc<PrintControl>>>,
}

#[derive(Debug, Deserialize)]
struct StartPrintPayload {
    message_id: String,
    unique_id: String,
    gcode_path: String,
}
impl WithMessageId for StartPrintPayload {
    fn message_id(&self) -> &str {
        &self.message_id
    }
}

#[derive(Debug, Deserialize)]
struct CancelPrintPayload {
    message_id: String,
    unique_id: String,
}
impl WithMessageId for CancelPrintPayload {
    fn message_id(&self) -> &str {
        &self.message_id
    }
}

#[derive(Debug, Deserialize)]
struct SendCommandPayload {
    message_id: String,
    unique_id: String,
    command: String,
}
impl WithMessageId for SendCommandPayload {
    fn message_id(&self) -> &str {
        &self.message_id
    }
}

/// Ultimaker-flavor material/print settings, applied as a batch of raw
/// G-code lines before a print begins.
#[derive(Debug, Deserialize)]
struct UltigcodeSettingsPayload {
    message_id: String,
    unique_id: String,
    commands: Vec<String>,
}
impl WithMessageId for UltigcodeSettingsPayload {
    fn message_id(&self) -> &str {
        &self.message_id
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "printer-agent starting");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_owned());
    let config_text = match std::fs::read_to_string(&config_path) {
        Ok(text) => text,
        Err(e) => {
            error!(path = %config_path, error = %e, "FATAL: failed to read config file");
            std::process::exit(1);
        }
    };
    let config = match Config::from_json_str(&config_text) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "FATAL: failed to parse config");
            std::process::exit(1);
        }
    };
    info!(printers = config.printers.len(), "config loaded");

    let mut printers = HashMap::new();
    for printer_config in &config.printers {
        let driver_config = DriverConfig { baud_rate: printer_config.baud_rate, ..Default::default() };
        match Driver::connect(&TokioSerialOpener, &printer_config.port, driver_config).await {
            Ok(driver) => {
                info!(unique_id = %printer_config.unique_id, port = %printer_config.port, "printer connected");
                printers.insert(
                    printer_config.unique_id.clone(),
                    Arc::new(PrinterRuntime { driver: Arc::new(driver), active_job: Mutex::new(None) }),
                );
            }
            Err(e) => {
                warn!(unique_id = %printer_config.unique_id, port = %printer_config.port, error = %e, "failed to connect to printer, skipping");
            }
        }
    }
    let printers = Arc::new(printers);

    let cable_config = CableClientConfig::new(
        format!("wss://{}/cable", config.server_host),
        format!("https://{}", config.server_host),
    );
    let client = Arc::new(CableClient::spawn(cable_config, Arc::new(TungsteniteConnector)));
    if let Err(e) = client.connect().await {
        warn!(error = %e, "initial connect failed; the client will keep retrying in the background");
    }

    let client_channel_identifier =
        SubscriptionIdentifier::new("ClientChannel").param("ClientId", config.client_id.clone()).param("Secret", config.secret.clone());
    let client_channel = match client.subscribe(client_channel_identifier).await {
        Ok(sub) => sub,
        Err(e) => {
            error!(error = %e, "FATAL: failed to subscribe to the client channel");
            std::process::exit(1);
        }
    };

    register_callbacks(&client_channel, printers.clone());

    let monitored: Vec<MonitoredPrinter> = printers
        .iter()
        .map(|(unique_id, runtime)| MonitoredPrinter { unique_id: unique_id.clone(), driver: runtime.driver.clone() })
        .collect();
    let aggregator_cancel = CancellationToken::new();
    let aggregator_task = tokio::spawn(aggregator::run_aggregator(
        monitored,
        client.clone(),
        client_channel.clone(),
        Duration::from_secs(1),
        aggregator_cancel.clone(),
    ));

    shutdown_signal().await;
    info!("shutdown signal received, stopping");
    aggregator_cancel.cancel();
    let _ = aggregator_task.await;
    let _ = client.disconnect().await;
}

fn register_callbacks(
    client_channel: &Arc<printer_agent::cable::Subscription>,
    printers: Arc<HashMap<String, Arc<PrinterRuntime>>>,
) {
    let printers_for_start = printers.clone();
    client_channel.register_acknowledgeable_callback::<StartPrintPayload, _, _>("start_print", move |payload, ack| {
        let printers = printers_for_start.clone();
        async move { handle_start_print(printers, payload, ack).await }
    });

    let printers_for_cancel = printers.clone();
    client_channel.register_acknowledgeable_callback::<CancelPrintPayload, _, _>("cancel_print", move |payload, ack| {
        let printers = printers_for_cancel.clone();
        async move {
            match printers.get(&payload.unique_id) {
                Some(runtime) => {
                    if let Some(control) = runtime.active_job.lock().await.as_ref() {
                        control.cancel();
                    }
                    ack.acknowledge(None).await;
                }
                None => ack.acknowledge(Some(unknown_printer(&payload.unique_id))).await,
            }
        }
    });

    let printers_for_command = printers.clone();
    client_channel.register_acknowledgeable_callback::<SendCommandPayload, _, _>("send_command", move |payload, ack| {
        let printers = printers_for_command.clone();
        async move {
            match printers.get(&payload.unique_id) {
                Some(runtime) => {
                    let result = runtime.driver.send_command(&payload.command, CancellationToken::new()).await;
                    match result {
                        Ok(()) => ack.acknowledge(None).await,
                        Err(e) => {
                            ack.acknowledge(Some(AcknowledgeError { message: e.to_string(), stack_trace: None })).await
                        }
                    }
                }
                None => ack.acknowledge(Some(unknown_printer(&payload.unique_id))).await,
            }
        }
    });

    let printers_for_settings = printers.clone();
    client_channel.register_acknowledgeable_callback::<UltigcodeSettingsPayload, _, _>(
        "ultigcode_settings",
        move |payload, ack| {
            let printers = printers_for_settings.clone();
            async move {
                let Some(runtime) = printers.get(&payload.unique_id) else {
                    ack.acknowledge(Some(unknown_printer(&payload.unique_id))).await;
                    return;
                };
                for command in &payload.commands {
                    if let Err(e) = runtime.driver.send_command(command, CancellationToken::new()).await {
                        ack.acknowledge(Some(AcknowledgeError { message: e.to_string(), stack_trace: None })).await;
                        return;
                    }
                }
                ack.acknowledge(None).await;
            }
        },
    );
}

async fn handle_start_print(
    printers: Arc<HashMap<String, Arc<PrinterRuntime>>>,
    payload: StartPrintPayload,
    ack: Acknowledge,
) {
    let Some(runtime) = printers.get(&payload.unique_id).cloned() else {
        ack.acknowledge(Some(unknown_printer(&payload.unique_id))).await;
        return;
    };

    let file = match std::fs::File::open(&payload.gcode_path) {
        Ok(f) => f,
        Err(e) => {
            ack.acknowledge(Some(AcknowledgeError { message: e.to_string(), stack_trace: None })).await;
            return;
        }
    };
    let mut reader = GcodeReader::new(std::io::BufReader::new(file));
    if let Err(e) = reader.preprocess() {
        ack.acknowledge(Some(AcknowledgeError { message: e.to_string(), stack_trace: None })).await;
        return;
    }

    let control = Arc::new(PrintControl::new());
    *runtime.active_job.lock().await = Some(control.clone());
    ack.acknowledge(None).await;

    let job_config = PrintJobConfig::default();
    let result =
        run_print_job(&runtime.driver, reader, &control, &job_config, |event| {
            tracing::debug!(?event, unique_id = %payload.unique_id, "print job event");
        })
        .await;
    *runtime.active_job.lock().await = None;

    if let Err(e) = result {
        warn!(unique_id = %payload.unique_id, error = %e, "print job ended with an error");
    }
}

fn unknown_printer(unique_id: &str) -> AcknowledgeError {
    AcknowledgeError { message: format!("no printer with unique_id `{unique_id}`"), stack_trace: None }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
