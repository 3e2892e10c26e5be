//! Error types for the meshrelay library.

use thiserror::Error;

/// The main error type for relay operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encoding/decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The radio link failed. Recoverable: triggers reconnection.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The periodic health probe got no usable answer in time.
    #[error("health check timed out after {timeout_ms}ms")]
    HealthCheckTimeout { timeout_ms: u64 },

    /// Connection is not established.
    #[error("not connected")]
    NotConnected,

    /// The retry cap was reached without re-establishing the link.
    #[error("gave up after {attempts} connection attempts")]
    RetriesExhausted { attempts: u32 },

    /// The component is shutting down and refuses new work.
    #[error("shutting down")]
    ShuttingDown,

    /// The outbound queue has no room for the message.
    #[error("queue full: {depth}/{capacity} messages")]
    QueueFull { depth: usize, capacity: usize },

    /// A payload exceeded the radio limit before truncation.
    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// An inbound packet could not be decoded.
    #[error("malformed packet: {reason}")]
    MalformedPacket { reason: String },

    /// A command handler failed, panicked or timed out.
    #[error("handler {handler} failed: {reason}")]
    PluginDispatch { handler: String, reason: String },

    /// The chat side rejected a message.
    #[error("chat error: {message}")]
    Chat { message: String },

    /// A prefix template could not be parsed.
    #[error("invalid template {template:?}: {reason}")]
    InvalidTemplate { template: String, reason: String },

    /// The configuration is inconsistent.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

impl Error {
    /// Builds a [`Error::Transport`] from anything printable.
    pub fn transport(message: impl std::fmt::Display) -> Self {
        Self::Transport {
            message: message.to_string(),
        }
    }

    /// Builds a [`Error::MalformedPacket`].
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPacket {
            reason: reason.into(),
        }
    }

    /// Returns true for errors that mean the radio link is gone.
    ///
    /// Health-check timeouts count as link failures.
    #[must_use]
    pub const fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::Serial(_) | Self::Io(_) | Self::Transport { .. } | Self::HealthCheckTimeout { .. }
        )
    }
}

/// Frame-specific errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame payload exceeds maximum size.
    #[error("frame too large: {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;
