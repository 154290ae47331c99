//! Streaming a G-code file through a connected [`Driver`], with external
//! pause/resume/cancel control layered on top of the acknowledged-send
//! primitive in `connection.rs`.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::gcode::GcodeReader;

use super::connection::{Driver, DriverError, PrinterState};

/// Surfaced back to the control plane as the job progresses.
#[derive(Debug, Clone)]
pub enum PrintEvent {
    Running,
    Errored(String),
    Canceled,
    Success,
}

#[derive(Debug, Clone)]
pub struct PrintJobConfig {
    pub temperature_poll_interval_secs: u32,
    pub abort_sequence: Vec<String>,
}

impl Default for PrintJobConfig {
    fn default() -> Self {
        PrintJobConfig {
            temperature_poll_interval_secs: 2,
            abort_sequence: vec!["M104 S0".to_owned(), "M140 S0".to_owned(), "M84".to_owned()],
        }
    }
}

/// External handle a caller uses to pause, resume, or cancel a running job.
/// `run_print_job` polls this at the top of every loop iteration and between
/// lines — it never inspects the printer's internal state to decide this.
pub struct PrintControl {
    cancel: CancellationToken,
    paused: AtomicBool,
    resume_notify: Notify,
}

impl PrintControl {
    pub fn new() -> Self {
        PrintControl { cancel: CancellationToken::new(), paused: AtomicBool::new(false), resume_notify: Notify::new() }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
        self.resume_notify.notify_waiters();
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resume_notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn wait_while_paused(&self) {
        while self.is_paused() && !self.is_canceled() {
            self.resume_notify.notified().await;
        }
    }
}

impl Default for PrintControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Streams every sanitized line of `reader` through `driver`, awaiting each
/// acknowledgement before sending the next. Returns once the file is fully
/// drained and acknowledged, or as soon as cancellation or a printer error
/// ends the job — either way `on_event` has already been told which.
pub async fn run_print_job<R: BufRead>(
    driver: &Driver,
    mut reader: GcodeReader<R>,
    control: &PrintControl,
    config: &PrintJobConfig,
    mut on_event: impl FnMut(PrintEvent),
) -> Result<(), DriverError> {
    driver.set_state(PrinterState::Printing);
    on_event(PrintEvent::Running);

    let poll_command = format!("M155 S{}", config.temperature_poll_interval_secs);
    if let Err(e) = driver.send_command(&poll_command, control.token()).await {
        tracing::warn!(error = %e, "failed to enable temperature polling for this job");
    }

    loop {
        if control.is_canceled() {
            return cancel_job(driver, config, &mut on_event).await;
        }

        if control.is_paused() {
            driver.set_state(PrinterState::Paused);
            control.wait_while_paused().await;
            if control.is_canceled() {
                return cancel_job(driver, config, &mut on_event).await;
            }
            driver.set_state(PrinterState::Printing);
        }

        let Some(line) = reader.next() else { break };
        let line = line.map_err(|e| DriverError::Io(e.to_string()))?;

        match driver.send_command(&line, control.token()).await {
            Ok(()) => {}
            Err(DriverError::Canceled) => return cancel_job(driver, config, &mut on_event).await,
            Err(e) => {
                driver.set_state(PrinterState::Errored);
                on_event(PrintEvent::Errored(e.to_string()));
                return Err(e);
            }
        }
    }

    driver.set_state(PrinterState::Ready);
    on_event(PrintEvent::Success);
    Ok(())
}

async fn cancel_job(
    driver: &Driver,
    config: &PrintJobConfig,
    on_event: &mut impl FnMut(PrintEvent),
) -> Result<(), DriverError> {
    for command in &config.abort_sequence {
        let _ = driver.send_command(command, CancellationToken::new()).await;
    }
    driver.set_state(PrinterState::Ready);
    on_event(PrintEvent::Canceled);
    Err(DriverError::Canceled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::connection::DriverConfig;
    use crate::driver::serial_port::mock::opener_pair;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn successful_print_streams_commands_in_order_and_reports_success() {
        let (opener, inject, mut sent) = opener_pair();
        let config = DriverConfig { boot_timeout: Duration::from_millis(20), ..Default::default() };
        let driver = Driver::connect(&opener, "mock", config).await.unwrap();

        let handshake = sent.recv().await.unwrap();
        assert!(handshake.starts_with("N0 M110 N0"));

        let ack_task = tokio::spawn(async move {
            // M155, G28, G1 X10
            for _ in 0..3u32 {
                sent.recv().await.unwrap();
                inject.send("ok".to_owned()).unwrap();
            }
        });

        let mut reader = GcodeReader::new(Cursor::new("G28\nG1 X10\n"));
        reader.preprocess().unwrap();

        let control = PrintControl::new();
        let job_config = PrintJobConfig::default();
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_for_job = events.clone();

        let result = run_print_job(&driver, reader, &control, &job_config, move |event| {
            events_for_job.lock().unwrap().push(event);
        })
        .await;

        ack_task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(driver.state(), PrinterState::Ready);

        let events = events.lock().unwrap();
        assert!(matches!(events[0], PrintEvent::Running));
        assert!(matches!(events.last().unwrap(), PrintEvent::Success));
    }

    #[tokio::test]
    async fn cancel_mid_stream_sends_abort_sequence_and_returns_to_ready() {
        let (opener, inject, mut sent) = opener_pair();
        let config = DriverConfig { boot_timeout: Duration::from_millis(20), ..Default::default() };
        let driver = Driver::connect(&opener, "mock", config).await.unwrap();
        sent.recv().await.unwrap(); // handshake

        let control = Arc::new(PrintControl::new());
        let control_for_canceler = control.clone();

        let ack_task = tokio::spawn(async move {
            sent.recv().await.unwrap(); // M155
            inject.send("ok".to_owned()).unwrap();
            sent.recv().await.unwrap(); // G28, left pending to force cancellation mid-flight
            control_for_canceler.cancel();
            // Drain the three abort-sequence commands so the canceled job's
            // FIFO-drain step doesn't hang on the test's own mock.
            for _ in 0..3u32 {
                sent.recv().await.unwrap();
                inject.send("ok".to_owned()).unwrap();
            }
        });

        let mut reader = GcodeReader::new(Cursor::new("G28\nG1 X10\n"));
        reader.preprocess().unwrap();
        let job_config = PrintJobConfig::default();
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_for_job = events.clone();

        let result = run_print_job(&driver, reader, &control, &job_config, move |event| {
            events_for_job.lock().unwrap().push(event);
        })
        .await;

        ack_task.await.unwrap();
        assert!(matches!(result, Err(DriverError::Canceled)));
        assert_eq!(driver.state(), PrinterState::Ready);
        assert!(matches!(events.lock().unwrap().last().unwrap(), PrintEvent::Canceled));
    }
}
