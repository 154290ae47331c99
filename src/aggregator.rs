//! Printer State Aggregator: on a periodic tick, snapshots every configured
//! printer's state and temperatures and publishes them as one
//! `printer_states` message on the client channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::cable::{CableClient, ClientState, Subscription};
use crate::driver::{Driver, PrinterState};

#[derive(Debug, Serialize)]
struct PrinterStateWithTemperatures {
    state: &'static str,
    temperature: marlin_protocol::TemperatureSnapshot,
}

fn state_label(state: PrinterState) -> &'static str {
    match state {
        PrinterState::Disconnected => "disconnected",
        PrinterState::Connecting => "connecting",
        PrinterState::Ready => "ready",
        PrinterState::Printing => "printing",
        PrinterState::Paused => "paused",
        PrinterState::Errored => "errored",
    }
}

/// One printer the aggregator reports on, keyed by the id the control plane
/// uses to identify it.
pub struct MonitoredPrinter {
    pub unique_id: String,
    pub driver: Arc<Driver>,
}

/// Runs until `cancel` fires; intended to be `tokio::spawn`ed once at
/// startup alongside the Cable client and every printer's driver task.
pub async fn run_aggregator(
    printers: Vec<MonitoredPrinter>,
    client: Arc<CableClient>,
    client_channel: Arc<Subscription>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => tick(&printers, &client, &client_channel).await,
        }
    }
}

async fn tick(printers: &[MonitoredPrinter], client: &Arc<CableClient>, client_channel: &Arc<Subscription>) {
    if client.state() != ClientState::Connected {
        return;
    }

    let mut states = HashMap::with_capacity(printers.len());
    for printer in printers {
        let temperature = printer.driver.watch_temperature().borrow().clone();
        states.insert(
            printer.unique_id.clone(),
            PrinterStateWithTemperatures { state: state_label(printer.driver.state()), temperature },
        );
    }

    if let Err(e) = client_channel.perform("printer_states", &json!({ "printers": states })).await {
        tracing::warn!(error = %e, "failed to publish printer_states");
    }
}
