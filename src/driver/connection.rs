//! The Marlin serial connection: handshake, the pending-acknowledgement
//! FIFO, and the response reader loop. Printing a job is layered on top in
//! `job.rs`; this module only knows about individual acknowledged sends.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use marlin_protocol::{ResponseLine, TemperatureSnapshot};
use sequential_runner::SequentialRunner;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::serial_port::{SerialPortOpener, SerialReader, SerialWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrinterState {
    Disconnected,
    Connecting,
    Ready,
    Printing,
    Paused,
    Errored,
}

#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("serial I/O error: {0}")]
    Io(String),
    #[error("resend limit exceeded")]
    ResendExhausted,
    #[error("command timed out")]
    Timeout,
    #[error("printer error: {0}")]
    PrinterError(String),
    #[error("operation canceled")]
    Canceled,
    #[error("driver is not ready")]
    NotReady,
}

impl From<sequential_runner::RunnerError> for DriverError {
    fn from(e: sequential_runner::RunnerError) -> Self {
        match e {
            sequential_runner::RunnerError::Canceled => DriverError::Canceled,
            sequential_runner::RunnerError::Stopped => DriverError::Io("writer loop stopped".to_owned()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    pub baud_rate: u32,
    pub boot_timeout: Duration,
    pub command_timeout: Duration,
    pub heater_timeout: Duration,
    pub max_resends: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            baud_rate: 115_200,
            boot_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
            heater_timeout: Duration::from_secs(300),
            max_resends: 5,
        }
    }
}

struct PendingCommand {
    line_number: u32,
    wire: String,
    deadline: Instant,
    completion: oneshot::Sender<Result<(), DriverError>>,
    resends: u32,
}

/// The FIFO of sent-but-unacknowledged commands. Pushed to (and rewound) by
/// the writer-loop task running on the `SequentialRunner`; popped by the
/// reader loop — two distinct tasks, so every access is a single locked
/// push/pop/rewind.
struct Fifo {
    entries: Mutex<VecDeque<PendingCommand>>,
}

impl Fifo {
    fn new() -> Self {
        Fifo { entries: Mutex::new(VecDeque::new()) }
    }

    fn push(&self, entry: PendingCommand) {
        self.entries.lock().unwrap().push_back(entry);
    }

    fn pop_front(&self) -> Option<PendingCommand> {
        self.entries.lock().unwrap().pop_front()
    }

    fn pop_through(&self, line_number: u32) -> Vec<PendingCommand> {
        let mut guard = self.entries.lock().unwrap();
        let mut popped = Vec::new();
        while guard.front().is_some_and(|e| e.line_number <= line_number) {
            popped.push(guard.pop_front().unwrap());
        }
        popped
    }

    fn extend_head_deadline(&self, new_deadline: Instant) {
        if let Some(front) = self.entries.lock().unwrap().front_mut() {
            front.deadline = new_deadline;
        }
    }

    fn drain_all(&self) -> Vec<PendingCommand> {
        std::mem::take(&mut *self.entries.lock().unwrap()).into_iter().collect()
    }

    fn check_and_pop_expired_head(&self, now: Instant) -> Option<PendingCommand> {
        let mut guard = self.entries.lock().unwrap();
        if guard.front().is_some_and(|e| e.deadline <= now) {
            guard.pop_front()
        } else {
            None
        }
    }

    /// Drops the entry for `line_number`, if still present, without
    /// resolving its completion — the caller already knows how it ended.
    fn remove(&self, line_number: u32) {
        self.entries.lock().unwrap().retain(|e| e.line_number != line_number);
    }

    fn bump_resend_count(&self, from_line: u32, max_resends: u32) -> bool {
        let mut guard = self.entries.lock().unwrap();
        match guard.iter_mut().find(|e| e.line_number == from_line) {
            Some(entry) => {
                entry.resends += 1;
                entry.resends <= max_resends
            }
            None => false,
        }
    }

    fn fail_all(&self, error: DriverError) {
        for entry in self.drain_all() {
            let _ = entry.completion.send(Err(error.clone()));
        }
    }
}

struct SharedWriter {
    inner: AsyncMutex<Box<dyn SerialWriter>>,
}

impl SharedWriter {
    fn new(writer: Box<dyn SerialWriter>) -> Self {
        SharedWriter { inner: AsyncMutex::new(writer) }
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), DriverError> {
        self.inner.lock().await.write_line(bytes).await.map_err(|e| DriverError::Io(e.to_string()))
    }
}

/// A live connection to one Marlin-family printer.
pub struct Driver {
    runner: SequentialRunner,
    writer: Arc<SharedWriter>,
    fifo: Arc<Fifo>,
    next_line: AtomicU32,
    state_tx: watch::Sender<PrinterState>,
    state_rx: watch::Receiver<PrinterState>,
    temperature_rx: watch::Receiver<TemperatureSnapshot>,
    config: DriverConfig,
    reader_task: JoinHandle<()>,
}

impl Driver {
    /// Open the port, wait for the boot banner, and reset line numbering
    /// with `M110 N0`. State transitions `Disconnected -> Connecting ->
    /// Ready`.
    pub async fn connect(
        opener: &dyn SerialPortOpener,
        path: &str,
        config: DriverConfig,
    ) -> Result<Self, DriverError> {
        let (mut writer, mut reader) =
            opener.open(path, config.baud_rate).await.map_err(|e| DriverError::Io(e.to_string()))?;

        let boot_deadline = Instant::now() + config.boot_timeout;
        loop {
            let remaining = boot_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, reader.read_line()).await {
                Ok(Ok(Some(line))) => {
                    let trimmed = line.trim();
                    if trimmed == "start" || trimmed.starts_with("echo:") {
                        break;
                    }
                }
                Ok(Ok(None)) => return Err(DriverError::Io("serial port closed during boot".to_owned())),
                Ok(Err(e)) => return Err(DriverError::Io(e.to_string())),
                Err(_) => break,
            }
        }

        writer
            .write_line(marlin_protocol::frame_command(0, "M110 N0").as_bytes())
            .await
            .map_err(|e| DriverError::Io(e.to_string()))?;

        let writer = Arc::new(SharedWriter::new(writer));
        let fifo = Arc::new(Fifo::new());
        let runner = SequentialRunner::new();
        let (state_tx, state_rx) = watch::channel(PrinterState::Ready);
        let (temperature_tx, temperature_rx) = watch::channel(TemperatureSnapshot::default());

        let reader_task = tokio::spawn(reader_loop(
            reader,
            fifo.clone(),
            runner.clone(),
            writer.clone(),
            state_tx.clone(),
            temperature_tx,
            config,
        ));

        Ok(Driver {
            runner,
            writer,
            fifo,
            next_line: AtomicU32::new(1),
            state_tx,
            state_rx,
            temperature_rx,
            config,
            reader_task,
        })
    }

    pub fn state(&self) -> PrinterState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PrinterState> {
        self.state_rx.clone()
    }

    pub fn watch_temperature(&self) -> watch::Receiver<TemperatureSnapshot> {
        self.temperature_rx.clone()
    }

    pub(crate) fn set_state(&self, state: PrinterState) {
        let _ = self.state_tx.send(state);
    }

    fn command_deadline(&self, sanitized: &str) -> Duration {
        match marlin_protocol::command_code(sanitized).as_str() {
            "M109" | "M190" => self.config.heater_timeout,
            _ => self.config.command_timeout,
        }
    }

    /// Sanitizes, frames, and sends one command; resolves once the
    /// matching `ok` is seen, or fails with `ResendExhausted`/`Timeout`/
    /// `Canceled`. Empty lines (after sanitization) are dropped.
    pub async fn send_command(&self, text: &str, cancel: CancellationToken) -> Result<(), DriverError> {
        let sanitized = marlin_protocol::sanitize(text);
        if sanitized.is_empty() {
            return Ok(());
        }
        let code = marlin_protocol::command_code(&sanitized);
        if self.state() == PrinterState::Errored && code != "M999" {
            return Err(DriverError::NotReady);
        }

        let line_number = self.next_line.fetch_add(1, Ordering::SeqCst);
        let wire = marlin_protocol::frame_command(line_number, &sanitized);
        let deadline_duration = self.command_deadline(&sanitized);
        let (tx, rx) = oneshot::channel();

        let fifo = self.fifo.clone();
        let writer = self.writer.clone();
        let wire_to_send = wire.clone();

        let enqueued = self
            .runner
            .enqueue(cancel.clone(), move || async move {
                fifo.push(PendingCommand {
                    line_number,
                    wire: wire_to_send.clone(),
                    deadline: Instant::now() + deadline_duration,
                    completion: tx,
                    resends: 0,
                });
                writer.write(wire_to_send.as_bytes()).await
            })
            .await;

        match enqueued {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(DriverError::Canceled),
        }

        if code == "M999" {
            self.set_state(PrinterState::Ready);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                self.fifo.remove(line_number);
                Err(DriverError::Canceled)
            }
            result = rx => result.unwrap_or(Err(DriverError::Canceled)),
        }
    }

    pub async fn disconnect(&mut self) {
        self.reader_task.abort();
        self.set_state(PrinterState::Disconnected);
    }
}

async fn reader_loop(
    mut reader: Box<dyn SerialReader>,
    fifo: Arc<Fifo>,
    runner: SequentialRunner,
    writer: Arc<SharedWriter>,
    state: watch::Sender<PrinterState>,
    temperature: watch::Sender<TemperatureSnapshot>,
    config: DriverConfig,
) {
    let mut deadline_check = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            biased;
            line = reader.read_line() => {
                match line {
                    Ok(Some(text)) => {
                        handle_response_line(&text, &fifo, &runner, &writer, &state, &temperature, config);
                    }
                    Ok(None) => {
                        let _ = state.send(PrinterState::Disconnected);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "serial read failed");
                        let _ = state.send(PrinterState::Disconnected);
                        break;
                    }
                }
            }
            _ = deadline_check.tick() => {
                if let Some(entry) = fifo.check_and_pop_expired_head(Instant::now()) {
                    let _ = entry.completion.send(Err(DriverError::Timeout));
                }
            }
        }
    }
}

fn handle_response_line(
    text: &str,
    fifo: &Arc<Fifo>,
    runner: &SequentialRunner,
    writer: &Arc<SharedWriter>,
    state: &watch::Sender<PrinterState>,
    temperature: &watch::Sender<TemperatureSnapshot>,
    config: DriverConfig,
) {
    match marlin_protocol::parse_response_line(text) {
        ResponseLine::Ok => {
            if let Some(entry) = fifo.pop_front() {
                let _ = entry.completion.send(Ok(()));
            }
        }
        ResponseLine::OkThrough(n) => {
            for entry in fifo.pop_through(n) {
                let _ = entry.completion.send(Ok(()));
            }
        }
        ResponseLine::Resend(n) => {
            resend_from(fifo, runner, writer, state, n, config.max_resends);
        }
        ResponseLine::Busy => {
            fifo.extend_head_deadline(Instant::now() + config.command_timeout);
        }
        ResponseLine::Error(message) => {
            let _ = state.send(PrinterState::Errored);
            fifo.fail_all(DriverError::PrinterError(message));
        }
        ResponseLine::Temperature(snapshot) => {
            let _ = temperature.send(snapshot);
        }
        ResponseLine::Echo(line) => tracing::debug!(line = %line, "printer echo"),
        ResponseLine::Unknown(line) => tracing::debug!(line = %line, "unrecognized printer response"),
    }
}

fn resend_from(
    fifo: &Arc<Fifo>,
    runner: &SequentialRunner,
    writer: &Arc<SharedWriter>,
    state: &watch::Sender<PrinterState>,
    from_line: u32,
    max_resends: u32,
) {
    let to_resend: Vec<(u32, String)> = fifo
        .entries
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.line_number >= from_line)
        .map(|e| (e.line_number, e.wire.clone()))
        .collect();
    if to_resend.is_empty() {
        return;
    }
    let fifo = fifo.clone();
    let writer = writer.clone();
    let state = state.clone();
    let _ = runner.enqueue_detached(move || async move {
        if fifo.bump_resend_count(from_line, max_resends) {
            for (_, wire) in to_resend {
                if let Err(e) = writer.write(wire.as_bytes()).await {
                    tracing::warn!(error = %e, "failed to retransmit resend batch");
                    return;
                }
            }
        } else {
            fifo.fail_all(DriverError::ResendExhausted);
            let _ = state.send(PrinterState::Errored);
        }
    });
}
