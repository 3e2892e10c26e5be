//! USB serial link.
//!
//! A radio on USB exposes one serial port that carries the framed packet
//! stream interleaved with the firmware's console output. On open the
//! console backlog is discarded and the radio's frame parser is woken
//! with a run of marker bytes before the first real frame goes out.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::error::{Error, Result};
use crate::protocol::frame::START2;
use crate::protocol::{FrameDecoder, encode_frame};
use crate::transport::{Transport, run_stream_reader};

/// Baud rate radios use on their USB console.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Time the radio needs after the port opens (many boards reset on DTR).
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(300);

/// How long console output is discarded after settling.
const DRAIN_WINDOW: Duration = Duration::from_millis(200);

/// Marker bytes written on open so the radio resynchronizes its parser.
const WAKE_LEN: usize = 32;

/// USB serial link settings.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Device path (e.g. "/dev/ttyUSB0" or "COM3").
    pub path: String,
    /// Line speed.
    pub baud: u32,
    /// Wait after opening before the port is used.
    pub settle_delay: Duration,
    /// Send the wake sequence after opening.
    pub wake: bool,
}

impl SerialConfig {
    /// Creates a configuration for `path` with default settings.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud: DEFAULT_BAUD,
            settle_delay: DEFAULT_SETTLE_DELAY,
            wake: true,
        }
    }

    /// Sets the line speed.
    #[must_use]
    pub const fn baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    /// Sets the settle delay.
    #[must_use]
    pub const fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Enables or disables the wake sequence.
    #[must_use]
    pub const fn wake(mut self, wake: bool) -> Self {
        self.wake = wake;
        self
    }
}

/// Serial link to a radio.
pub struct SerialTransport {
    config: SerialConfig,
    writer: Option<Arc<Mutex<WriteHalf<SerialStream>>>>,
    reader: Option<ReadHalf<SerialStream>>,
}

impl SerialTransport {
    /// Creates a transport; the port is not touched until `open`.
    #[must_use]
    pub const fn new(config: SerialConfig) -> Self {
        Self {
            config,
            writer: None,
            reader: None,
        }
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.config.path
    }

    fn open(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.writer.is_some() {
                return Ok(());
            }
            if !port_present(&self.config.path) {
                return Err(Error::transport(format!(
                    "serial device {} not present",
                    self.config.path
                )));
            }

            tracing::info!(path = %self.config.path, baud = self.config.baud, "opening serial link");
            let mut stream = tokio_serial::new(&self.config.path, self.config.baud)
                .open_native_async()
                .map_err(Error::Serial)?;

            tokio::time::sleep(self.config.settle_delay).await;
            let discarded = drain_console(&mut stream, DRAIN_WINDOW).await;
            if discarded > 0 {
                tracing::debug!(discarded, "discarded radio console output");
            }

            if self.config.wake {
                stream
                    .write_all(&[START2; WAKE_LEN])
                    .await
                    .map_err(Error::Io)?;
                stream.flush().await.map_err(Error::Io)?;
            }

            let (reader, writer) = tokio::io::split(stream);
            self.reader = Some(reader);
            self.writer = Some(Arc::new(Mutex::new(writer)));
            Ok(())
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.writer.take().is_some() {
                tracing::info!(path = %self.config.path, "serial link closed");
            }
            self.reader = None;
            Ok(())
        })
    }

    fn write(&mut self, data: Bytes) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let writer = self.writer.clone();
        Box::pin(async move {
            let writer = writer.ok_or(Error::NotConnected)?;
            let frame = encode_frame(&data)?;
            let mut port = writer.lock().await;
            port.write_all(&frame).await.map_err(Error::Io)?;
            port.flush().await.map_err(Error::Io)
        })
    }

    fn start_reader(&mut self, packet_tx: mpsc::Sender<Bytes>) -> Result<JoinHandle<Result<()>>> {
        let reader = self.reader.take().ok_or(Error::NotConnected)?;
        Ok(tokio::spawn(run_stream_reader(
            reader,
            FrameDecoder::new(),
            packet_tx,
        )))
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }
}

/// Reads and discards whatever arrives within `window`. Returns the number
/// of bytes discarded.
async fn drain_console<R>(stream: &mut R, window: Duration) -> usize
where
    R: AsyncRead + Unpin,
{
    let deadline = Instant::now() + window;
    let mut buf = [0u8; 256];
    let mut discarded = 0;
    loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => discarded += n,
            _ => return discarded,
        }
    }
}

/// Ports that cannot be enumerated (sandboxes, some virtual ports) count as
/// present and are left for the open call to reject.
fn port_present(path: &str) -> bool {
    match list_ports() {
        Ok(ports) if !ports.is_empty() => ports.iter().any(|p| p == path),
        _ => true,
    }
}

/// Lists the serial devices the system knows about.
///
/// # Errors
///
/// Returns an error if the port list cannot be retrieved.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports().map_err(Error::Serial)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
