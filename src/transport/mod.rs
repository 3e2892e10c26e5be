//! Transport layer for radio communication.
//!
//! This module provides the abstraction over the three link types a radio
//! can be reached through:
//!
//! - [`SerialTransport`] - USB/serial
//! - [`TcpTransport`] - network socket
//! - `BleTransport` - Bluetooth Low Energy (requires the `ble` feature)
//!
//! Serial and TCP carry a byte stream and share the framing in
//! [`crate::protocol::frame`]; BLE delivers whole packets. Either way the
//! read side hands complete packet payloads to an `mpsc` channel.

#[cfg(feature = "ble")]
pub mod ble;
pub mod serial;
pub mod tcp;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::FrameDecoder;

#[cfg(feature = "ble")]
pub use ble::BleTransport;
pub use serial::{SerialConfig, SerialTransport};
pub use tcp::{TcpConfig, TcpTransport};

/// Trait for transport implementations.
///
/// A transport holds at most one open session. The read side runs as its
/// own task: it returns `Err` when the link drops and `Ok(())` when the
/// packet receiver goes away.
pub trait Transport: Send + Sync {
    /// Short description for logs (port, address).
    fn name(&self) -> &str;

    /// Opens a session. Opening an open transport is a no-op.
    fn open(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Closes the session, if any.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Writes one packet payload to the radio.
    fn write(&mut self, data: Bytes) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Spawns the read side of the current session.
    ///
    /// Can be called once per successful `open`.
    fn start_reader(&mut self, packet_tx: mpsc::Sender<Bytes>) -> Result<JoinHandle<Result<()>>>;

    /// Returns true if a session is open.
    fn is_open(&self) -> bool;

    /// Returns true if the link itself reports disconnection as it happens.
    ///
    /// Such links never get the periodic health probe.
    fn reports_disconnect(&self) -> bool {
        false
    }
}

/// Bluetooth LE link settings.
///
/// Available without the `ble` feature so configurations can be validated
/// anywhere; building the transport needs the feature.
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Device MAC address or advertised name.
    pub address: String,
    /// How long to scan before giving up on finding the device.
    pub scan_duration: Duration,
}

impl BleConfig {
    /// Creates a BLE configuration with default settings.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            scan_duration: Duration::from_secs(5),
        }
    }

    /// Sets the scan duration.
    #[must_use]
    pub const fn scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }
}

/// Which link the relay uses and how to reach it.
#[derive(Debug, Clone)]
pub enum ConnectionConfig {
    /// USB/serial port.
    Serial(SerialConfig),
    /// TCP socket.
    Tcp(TcpConfig),
    /// Bluetooth LE.
    Ble(BleConfig),
}

impl ConnectionConfig {
    /// Returns true if this link type reports disconnection in real time.
    #[must_use]
    pub const fn reports_disconnect(&self) -> bool {
        matches!(self, Self::Ble(_))
    }

    /// Short name of the link type.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Serial(_) => "serial",
            Self::Tcp(_) => "tcp",
            Self::Ble(_) => "ble",
        }
    }

    /// Builds the transport for this configuration.
    pub fn build(&self) -> Result<Box<dyn Transport>> {
        match self {
            Self::Serial(config) => Ok(Box::new(SerialTransport::new(config.clone()))),
            Self::Tcp(config) => Ok(Box::new(TcpTransport::new(config.clone()))),
            #[cfg(feature = "ble")]
            Self::Ble(config) => Ok(Box::new(BleTransport::new(config.clone()))),
            #[cfg(not(feature = "ble"))]
            Self::Ble(_) => Err(Error::InvalidConfig {
                reason: "BLE connections need the `ble` feature".into(),
            }),
        }
    }
}

/// Runs the read loop for a framed byte stream.
///
/// Decoded frame payloads are sent to `packet_tx`.
///
/// # Errors
///
/// Returns an error if reading fails or the stream is closed.
pub async fn run_stream_reader<R>(
    mut reader: R,
    mut decoder: FrameDecoder,
    packet_tx: mpsc::Sender<Bytes>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("radio stream closed");
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "radio stream closed",
                )));
            }
            Ok(n) => n,
            Err(e) => {
                tracing::error!("radio read error: {}", e);
                return Err(Error::Io(e));
            }
        };

        tracing::trace!("received {} bytes", n);
        decoder.feed(&buf[..n]);

        loop {
            match decoder.decode() {
                Ok(Some(frame)) => {
                    tracing::trace!(frame = %hex::encode(&frame), "decoded frame");
                    if packet_tx.send(frame).await.is_err() {
                        tracing::debug!("packet receiver dropped");
                        return Ok(());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // The decoder has already skipped past the bad header
                    tracing::warn!("frame decode error: {}", e);
                }
            }
        }
    }
}
