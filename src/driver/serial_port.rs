//! Serial transport adapter, the Driver's analogue of `transport::WsSender`/
//! `WsReceiver`: a split writer/reader pair behind a trait, built for the
//! same reason — the reader loop and the writer need independent `&mut`
//! access without a lock held across an `.await`.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[async_trait]
pub trait SerialWriter: Send {
    async fn write_line(&mut self, bytes: &[u8]) -> std::io::Result<()>;
}

#[async_trait]
pub trait SerialReader: Send {
    /// Reads up to and including the next `\n`, trimmed of the trailing
    /// newline. `None` means the port closed with no further data.
    async fn read_line(&mut self) -> std::io::Result<Option<String>>;
}

/// Opens a path at a baud rate and returns an already-split pair, performing
/// the DTR assertion and buffer flush the handshake needs before the first
/// byte is read.
#[async_trait]
pub trait SerialPortOpener: Send + Sync {
    async fn open(
        &self,
        path: &str,
        baud_rate: u32,
    ) -> std::io::Result<(Box<dyn SerialWriter>, Box<dyn SerialReader>)>;
}

/// The real opener, backed by `tokio-serial`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSerialOpener;

#[async_trait]
impl SerialPortOpener for TokioSerialOpener {
    async fn open(
        &self,
        path: &str,
        baud_rate: u32,
    ) -> std::io::Result<(Box<dyn SerialWriter>, Box<dyn SerialReader>)> {
        use tokio_serial::SerialPortBuilderExt;

        let mut stream = tokio_serial::new(path, baud_rate).open_native_async()?;
        stream.write_data_terminal_ready(true)?;
        stream.clear(tokio_serial::ClearBuffer::All)?;

        let (read_half, write_half) = tokio::io::split(stream);
        Ok((
            Box::new(TokioSerialWriter { write_half }),
            Box::new(TokioSerialReader { lines: BufReader::new(read_half) }),
        ))
    }
}

struct TokioSerialWriter {
    write_half: tokio::io::WriteHalf<tokio_serial::SerialStream>,
}

#[async_trait]
impl SerialWriter for TokioSerialWriter {
    async fn write_line(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.write_half.write_all(bytes).await?;
        self.write_half.flush().await
    }
}

struct TokioSerialReader {
    lines: BufReader<tokio::io::ReadHalf<tokio_serial::SerialStream>>,
}

#[async_trait]
impl SerialReader for TokioSerialReader {
    async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut line = String::new();
        let n = self.lines.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_owned()))
    }
}

#[cfg(test)]
pub mod mock {
    //! Byte-pipe mock for exercising the Driver without a real port: two
    //! unbounded channels, written lines on one side and injected response
    //! lines on the other — the same shape as `transport::mock`.

    use super::{SerialPortOpener, SerialReader, SerialWriter};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    pub struct MockSerialOpener {
        handles: std::sync::Mutex<Option<(mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<String>)>>,
    }

    impl MockSerialOpener {
        fn new(
            firmware_to_driver: mpsc::UnboundedReceiver<String>,
            driver_to_firmware: mpsc::UnboundedSender<String>,
        ) -> Self {
            MockSerialOpener { handles: std::sync::Mutex::new(Some((firmware_to_driver, driver_to_firmware))) }
        }
    }

    #[async_trait]
    impl SerialPortOpener for MockSerialOpener {
        async fn open(
            &self,
            _path: &str,
            _baud_rate: u32,
        ) -> std::io::Result<(Box<dyn SerialWriter>, Box<dyn SerialReader>)> {
            let (inbound, outbound) = self.handles.lock().unwrap().take().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, "mock serial port already opened")
            })?;
            Ok((Box::new(MockSerialWriter { outbound }), Box::new(MockSerialReader { inbound })))
        }
    }

    struct MockSerialWriter {
        outbound: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl SerialWriter for MockSerialWriter {
        async fn write_line(&mut self, bytes: &[u8]) -> std::io::Result<()> {
            let text = String::from_utf8_lossy(bytes).into_owned();
            self.outbound
                .send(text)
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "firmware side dropped"))
        }
    }

    struct MockSerialReader {
        inbound: mpsc::UnboundedReceiver<String>,
    }

    #[async_trait]
    impl SerialReader for MockSerialReader {
        async fn read_line(&mut self) -> std::io::Result<Option<String>> {
            Ok(self.inbound.recv().await)
        }
    }

    /// `inject` feeds lines the driver will read (as if from firmware);
    /// `sent` drains whole framed lines the driver wrote.
    pub fn opener_pair() -> (MockSerialOpener, mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>) {
        let (inject, firmware_to_driver) = mpsc::unbounded_channel();
        let (driver_to_firmware, sent) = mpsc::unbounded_channel();
        (MockSerialOpener::new(firmware_to_driver, driver_to_firmware), inject, sent)
    }
}
