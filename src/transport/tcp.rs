//! TCP transport for radios reachable over the network.
//!
//! Network-attached radios serve the same framed stream as the serial
//! port, by default on port 4403.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::{FrameDecoder, encode_frame};
use crate::transport::{Transport, run_stream_reader};

/// Default TCP port served by network-attached radios.
pub const DEFAULT_PORT: u16 = 4403;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for TCP transport.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// How long to wait for the connection to be accepted.
    pub connect_timeout: Duration,
}

impl TcpConfig {
    /// Creates a TCP configuration for a host on the default port.
    ///
    /// A `host:port` string sets the port as well.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        let host = host.into();
        let (host, port) = match host.rsplit_once(':') {
            Some((h, p)) if !h.contains(':') => match p.parse() {
                Ok(port) => (h.to_string(), port),
                Err(_) => (host, DEFAULT_PORT),
            },
            _ => (host, DEFAULT_PORT),
        };
        Self {
            host,
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// TCP transport.
pub struct TcpTransport {
    config: TcpConfig,
    label: String,
    writer: Option<Arc<Mutex<OwnedWriteHalf>>>,
    reader: Option<OwnedReadHalf>,
}

impl TcpTransport {
    /// Creates a new TCP transport.
    #[must_use]
    pub fn new(config: TcpConfig) -> Self {
        let label = format!("{}:{}", config.host, config.port);
        Self {
            config,
            label,
            writer: None,
            reader: None,
        }
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &str {
        &self.label
    }

    fn open(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.writer.is_some() {
                return Ok(());
            }

            tracing::info!("connecting to radio at {}", self.label);

            let connect = TcpStream::connect((self.config.host.as_str(), self.config.port));
            let stream = tokio::time::timeout(self.config.connect_timeout, connect)
                .await
                .map_err(|_| {
                    Error::transport(format!(
                        "connect to {} timed out after {:?}",
                        self.label, self.config.connect_timeout
                    ))
                })??;
            stream.set_nodelay(true)?;

            let (reader, writer) = stream.into_split();
            self.reader = Some(reader);
            self.writer = Some(Arc::new(Mutex::new(writer)));

            tracing::info!("connected to radio at {}", self.label);
            Ok(())
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.reader = None;
            if let Some(writer) = self.writer.take() {
                tracing::info!("closing connection to {}", self.label);
                if let Err(e) = writer.lock().await.shutdown().await {
                    tracing::debug!("tcp shutdown: {}", e);
                }
            }
            Ok(())
        })
    }

    fn write(&mut self, data: Bytes) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let writer = self.writer.clone();
        Box::pin(async move {
            let writer = writer.ok_or(Error::NotConnected)?;
            let mut writer = writer.lock().await;

            let frame = encode_frame(&data)?;
            tracing::trace!("sending frame: {} bytes", frame.len());

            writer.write_all(&frame).await?;
            writer.flush().await?;
            Ok(())
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
