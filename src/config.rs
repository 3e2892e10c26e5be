//! Relay configuration.
//!
//! Everything is built in code. Loading from files is left to the
//! embedding application; [`RelayConfig::validate`] checks the result
//! before any component is started.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::{MAX_FRAME_SIZE, PACKET_HEADER_LEN};
use crate::store::DEFAULT_MAP_CAPACITY;
use crate::transport::ConnectionConfig;
use crate::translate::template::{CHAT_TOKENS, MESH_TOKENS, Template};

/// Minimum spacing between transmissions that the radio firmware accepts.
pub const FIRMWARE_MIN_SEND_DELAY: Duration = Duration::from_secs(2);

/// Largest text payload that fits in one packet.
pub const MAX_PACKET_PAYLOAD: usize = MAX_FRAME_SIZE - PACKET_HEADER_LEN;

/// Default text payload limit.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 227;

/// Default mesh-bound prefix.
pub const DEFAULT_MESH_PREFIX: &str = "{display5}[M]: ";

/// Default chat-bound prefix.
pub const DEFAULT_CHAT_PREFIX: &str = "[{long}/{mesh}]: ";

/// Maps a chat room to a mesh channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMapping {
    /// Chat room id.
    pub room_id: String,
    /// Mesh channel index.
    pub channel: u8,
}

/// Reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for the doubling delay.
    pub max_backoff: Duration,
    /// Give up after this many failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the first retry delay.
    #[must_use]
    pub const fn initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub const fn max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    /// Sets the retry cap.
    #[must_use]
    pub const fn max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay after the given failed attempt (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << shift)
            .min(self.max_backoff)
    }
}

/// Periodic health probing.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Whether probing is wanted. Links that report disconnects themselves
    /// never probe regardless.
    pub enabled: bool,
    /// Time between probes.
    pub interval: Duration,
    /// How long to wait for the radio to answer.
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
        }
    }
}

impl HealthCheckConfig {
    /// Creates the default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables probing.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the probe interval.
    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the response timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Outbound queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of queued messages.
    pub capacity: usize,
    /// Depth (percent of capacity) logged at info.
    pub medium_watermark_pct: u8,
    /// Depth (percent of capacity) logged at warn.
    pub high_watermark_pct: u8,
    /// Minimum time between send attempts.
    pub min_send_delay: Duration,
    /// Send attempts per message before it is dropped.
    pub max_attempts: u32,
    /// Reject normal-priority messages at or above the high watermark.
    pub shed_above_high_watermark: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            medium_watermark_pct: 50,
            high_watermark_pct: 75,
            min_send_delay: FIRMWARE_MIN_SEND_DELAY,
            max_attempts: 3,
            shed_above_high_watermark: false,
        }
    }
}

impl QueueConfig {
    /// Creates the default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the capacity.
    #[must_use]
    pub const fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the minimum send delay.
    #[must_use]
    pub const fn min_send_delay(mut self, delay: Duration) -> Self {
        self.min_send_delay = delay;
        self
    }

    /// Sets the per-message attempt limit.
    #[must_use]
    pub const fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the watermark percentages.
    #[must_use]
    pub const fn watermarks(mut self, medium_pct: u8, high_pct: u8) -> Self {
        self.medium_watermark_pct = medium_pct;
        self.high_watermark_pct = high_pct;
        self
    }

    /// Enables load shedding above the high watermark.
    #[must_use]
    pub const fn shed_above_high_watermark(mut self, shed: bool) -> Self {
        self.shed_above_high_watermark = shed;
        self
    }

    /// Send delay actually used, never below the firmware minimum.
    #[must_use]
    pub fn effective_send_delay(&self) -> Duration {
        self.min_send_delay.max(FIRMWARE_MIN_SEND_DELAY)
    }

    /// Depth at which the medium watermark is reached.
    #[must_use]
    pub fn medium_watermark(&self) -> usize {
        self.capacity * usize::from(self.medium_watermark_pct) / 100
    }

    /// Depth at which the high watermark is reached.
    #[must_use]
    pub fn high_watermark(&self) -> usize {
        self.capacity * usize::from(self.high_watermark_pct) / 100
    }
}

/// Message prefix settings.
#[derive(Debug, Clone)]
pub struct PrefixConfig {
    /// Prefix chat messages sent to the mesh.
    pub mesh_enabled: bool,
    /// Mesh-bound template (`display`, `user`, `username`, `server`).
    pub mesh_format: String,
    /// Prefix mesh messages sent to chat.
    pub chat_enabled: bool,
    /// Chat-bound template (`long`, `short`, `mesh`).
    pub chat_format: String,
    /// Appended to messages cut to fit the payload limit.
    pub truncation_marker: String,
}

impl Default for PrefixConfig {
    fn default() -> Self {
        Self {
            mesh_enabled: true,
            mesh_format: DEFAULT_MESH_PREFIX.to_string(),
            chat_enabled: true,
            chat_format: DEFAULT_CHAT_PREFIX.to_string(),
            truncation_marker: "…".to_string(),
        }
    }
}

impl PrefixConfig {
    /// Creates the default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the mesh-bound template.
    #[must_use]
    pub fn mesh_format(mut self, format: impl Into<String>) -> Self {
        self.mesh_format = format.into();
        self
    }

    /// Sets the chat-bound template.
    #[must_use]
    pub fn chat_format(mut self, format: impl Into<String>) -> Self {
        self.chat_format = format.into();
        self
    }

    /// Enables or disables the mesh-bound prefix.
    #[must_use]
    pub const fn mesh_enabled(mut self, enabled: bool) -> Self {
        self.mesh_enabled = enabled;
        self
    }

    /// Enables or disables the chat-bound prefix.
    #[must_use]
    pub const fn chat_enabled(mut self, enabled: bool) -> Self {
        self.chat_enabled = enabled;
        self
    }

    /// Sets the truncation marker.
    #[must_use]
    pub fn truncation_marker(mut self, marker: impl Into<String>) -> Self {
        self.truncation_marker = marker.into();
        self
    }
}

/// Reaction and reply relaying.
///
/// Both need the message map, which is only written while at least one of
/// them is on.
#[derive(Debug, Clone)]
pub struct InteractionsConfig {
    /// Relay emoji reactions in both directions.
    pub reactions: bool,
    /// Relay replies as replies rather than as plain messages.
    pub replies: bool,
    /// Relayed messages remembered for resolving reactions and replies.
    pub map_capacity: usize,
}

impl Default for InteractionsConfig {
    fn default() -> Self {
        Self {
            reactions: false,
            replies: false,
            map_capacity: DEFAULT_MAP_CAPACITY,
        }
    }
}

impl InteractionsConfig {
    /// Creates the default settings (both off).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables reactions.
    #[must_use]
    pub const fn reactions(mut self, enabled: bool) -> Self {
        self.reactions = enabled;
        self
    }

    /// Enables or disables replies.
    #[must_use]
    pub const fn replies(mut self, enabled: bool) -> Self {
        self.replies = enabled;
        self
    }

    /// Sets how many relayed messages are remembered.
    #[must_use]
    pub const fn map_capacity(mut self, capacity: usize) -> Self {
        self.map_capacity = capacity;
        self
    }

    /// Returns true if the message map needs to be written.
    #[must_use]
    pub const fn any_enabled(&self) -> bool {
        self.reactions || self.replies
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Name of the local meshnet, used for loop prevention.
    pub meshnet_name: String,
    /// Radio link.
    pub connection: ConnectionConfig,
    /// Room to channel mappings.
    pub rooms: Vec<RoomMapping>,
    /// Reconnection policy.
    pub reconnect: ReconnectConfig,
    /// Health probing.
    pub health_check: HealthCheckConfig,
    /// Outbound queue.
    pub queue: QueueConfig,
    /// Message prefixes.
    pub prefix: PrefixConfig,
    /// Reactions and replies.
    pub interactions: InteractionsConfig,
    /// Hard limit for a mesh-bound text payload.
    pub max_payload_bytes: usize,
    /// Relay detection sensor packets.
    pub detection_sensor: bool,
    /// Relay chat messages to the mesh.
    pub broadcast_enabled: bool,
    /// Time a command handler may take per event.
    pub handler_timeout: Duration,
    /// Time allowed for flushing and closing on shutdown.
    pub shutdown_grace: Duration,
}

impl RelayConfig {
    /// Creates a configuration with defaults and no room mappings.
    #[must_use]
    pub fn new(meshnet_name: impl Into<String>, connection: ConnectionConfig) -> Self {
        Self {
            meshnet_name: meshnet_name.into(),
            connection,
            rooms: Vec::new(),
            reconnect: ReconnectConfig::default(),
            health_check: HealthCheckConfig::default(),
            queue: QueueConfig::default(),
            prefix: PrefixConfig::default(),
            interactions: InteractionsConfig::default(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            detection_sensor: true,
            broadcast_enabled: true,
            handler_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    /// Adds a room mapping.
    #[must_use]
    pub fn room(mut self, room_id: impl Into<String>, channel: u8) -> Self {
        self.rooms.push(RoomMapping {
            room_id: room_id.into(),
            channel,
        });
        self
    }

    /// Sets the reconnection policy.
    #[must_use]
    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the health probe settings.
    #[must_use]
    pub fn health_check(mut self, health_check: HealthCheckConfig) -> Self {
        self.health_check = health_check;
        self
    }

    /// Sets the queue settings.
    #[must_use]
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the prefix settings.
    #[must_use]
    pub fn prefix(mut self, prefix: PrefixConfig) -> Self {
        self.prefix = prefix;
        self
    }

    /// Sets the reaction and reply settings.
    #[must_use]
    pub fn interactions(mut self, interactions: InteractionsConfig) -> Self {
        self.interactions = interactions;
        self
    }

    /// Sets the payload limit.
    #[must_use]
    pub const fn max_payload_bytes(mut self, max: usize) -> Self {
        self.max_payload_bytes = max;
        self
    }

    /// Enables or disables detection sensor relaying.
    #[must_use]
    pub const fn detection_sensor(mut self, enabled: bool) -> Self {
        self.detection_sensor = enabled;
        self
    }

    /// Enables or disables chat to mesh relaying.
    #[must_use]
    pub const fn broadcast_enabled(mut self, enabled: bool) -> Self {
        self.broadcast_enabled = enabled;
        self
    }

    /// Sets the command handler timeout.
    #[must_use]
    pub const fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub const fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Checks the configuration for inconsistencies.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(Error::InvalidConfig { reason });

        if self.meshnet_name.trim().is_empty() {
            return invalid("meshnet name must not be empty".into());
        }

        let mut seen: HashMap<&str, u8> = HashMap::new();
        for mapping in &self.rooms {
            if mapping.room_id.is_empty() {
                return invalid("room id must not be empty".into());
            }
            match seen.insert(&mapping.room_id, mapping.channel) {
                Some(previous) if previous != mapping.channel => {
                    return invalid(format!(
                        "room {} mapped to channels {} and {}",
                        mapping.room_id, previous, mapping.channel
                    ));
                }
                _ => {}
            }
        }

        if self.max_payload_bytes == 0 || self.max_payload_bytes > MAX_PACKET_PAYLOAD {
            return invalid(format!(
                "max payload {} outside 1..={MAX_PACKET_PAYLOAD}",
                self.max_payload_bytes
            ));
        }
        if self.prefix.truncation_marker.len() >= self.max_payload_bytes {
            return invalid("truncation marker does not fit the payload limit".into());
        }

        let queue = &self.queue;
        if queue.capacity == 0 {
            return invalid("queue capacity must be positive".into());
        }
        if queue.max_attempts == 0 {
            return invalid("queue max attempts must be positive".into());
        }
        if queue.medium_watermark_pct == 0
            || queue.medium_watermark_pct > queue.high_watermark_pct
            || queue.high_watermark_pct > 100
        {
            return invalid(format!(
                "watermarks {}%/{}% must satisfy 0 < medium <= high <= 100",
                queue.medium_watermark_pct, queue.high_watermark_pct
            ));
        }

        let reconnect = &self.reconnect;
        if reconnect.initial_backoff.is_zero() || reconnect.initial_backoff > reconnect.max_backoff
        {
            return invalid("backoff must satisfy 0 < initial <= max".into());
        }
        if reconnect.max_attempts == Some(0) {
            return invalid("reconnect retry cap must be positive".into());
        }

        if self.health_check.enabled
            && (self.health_check.interval.is_zero() || self.health_check.timeout.is_zero())
        {
            return invalid("health check interval and timeout must be positive".into());
        }

        if self.interactions.any_enabled() && self.interactions.map_capacity == 0 {
            return invalid("reactions and replies need a message map capacity".into());
        }

        for (format, tokens) in [
            (&self.prefix.mesh_format, MESH_TOKENS),
            (&self.prefix.chat_format, CHAT_TOKENS),
        ] {
            if let Err(e) = Template::parse(format, tokens) {
                return invalid(e.to_string());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpConfig;

    fn config() -> RelayConfig {
        RelayConfig::new("home", ConnectionConfig::Tcp(TcpConfig::new("radio.local")))
            .room("!r1:example.org", 0)
    }

    #[test]
    fn test_defaults_validate() {
        let config = config();
        config.validate().unwrap();
        assert_eq!(config.max_payload_bytes, 227);
        assert_eq!(config.queue.capacity, 500);
        assert_eq!(config.queue.medium_watermark(), 250);
        assert_eq!(config.queue.high_watermark(), 375);
        assert!(!config.interactions.any_enabled());
        assert_eq!(config.interactions.map_capacity, 500);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectConfig::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(16));
        assert_eq!(policy.backoff(5), Duration::from_secs(30));
        assert_eq!(policy.backoff(1000), Duration::from_secs(30));
    }

    #[test]
    fn test_send_delay_floor() {
        let queue = QueueConfig::new().min_send_delay(Duration::from_millis(500));
        assert_eq!(queue.effective_send_delay(), FIRMWARE_MIN_SEND_DELAY);

        let queue = QueueConfig::new().min_send_delay(Duration::from_secs(5));
        assert_eq!(queue.effective_send_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_room_mapped_twice_rejected() {
        let err = config().room("!r1:example.org", 1).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));

        // Same mapping repeated, and fan-in to one channel, are fine
        config()
            .room("!r1:example.org", 0)
            .room("!r2:example.org", 0)
            .validate()
            .unwrap();
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(config().max_payload_bytes(0).validate().is_err());
        assert!(config().max_payload_bytes(4096).validate().is_err());
        assert!(config().queue(QueueConfig::new().capacity(0)).validate().is_err());
        assert!(
            config()
                .queue(QueueConfig::new().watermarks(80, 60))
                .validate()
                .is_err()
        );
        assert!(
            config()
                .reconnect(ReconnectConfig::new().max_attempts(Some(0)))
                .validate()
                .is_err()
        );
        assert!(
            config()
                .prefix(PrefixConfig::new().chat_format("[{bogus}]"))
                .validate()
                .is_err()
        );
        assert!(
            config()
                .interactions(InteractionsConfig::new().replies(true).map_capacity(0))
                .validate()
                .is_err()
        );
        assert!(
            RelayConfig::new(" ", ConnectionConfig::Tcp(TcpConfig::new("radio")))
                .validate()
                .is_err()
        );
    }
}
