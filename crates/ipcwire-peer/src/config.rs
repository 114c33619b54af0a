use std::path::Path;
use std::time::Duration;

use ipcwire_frame::{FrameConfig, DEFAULT_READ_BUFFER, DEFAULT_WRITE_BUFFER, MAX_PAYLOAD};
use serde::{Deserialize, Serialize};

use crate::error::{PeerError, Result};

/// Acknowledgment timing and retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolConfig {
    /// How long to wait for an Ack before retrying.
    pub ack_timeout_ms: u64,
    /// How long an acked request waits for its Reply before retrying.
    pub reply_timeout_ms: u64,
    /// Report Ack/Nak/Reply frames nobody asked for to the error handler.
    pub throw_on_unsolicited_response: bool,
    /// Retry with an empty query frame instead of the full frame.
    pub retry_with_query: bool,
    /// Retry limit. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl ProtocolConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 5_000,
            reply_timeout_ms: 15_000,
            throw_on_unsolicited_response: true,
            retry_with_query: false,
            max_retries: None,
        }
    }
}

/// Per-connection settings.
///
/// Every field has a default, so a JSON document only needs the keys it
/// overrides:
///
/// ```json
/// { "protocol": { "max_retries": 3 }, "gc_expiry_ms": 60000 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    pub protocol: ProtocolConfig,
    /// Period of the ledger sweep while open.
    pub gc_interval_ms: u64,
    /// Entries idle longer than this are evicted.
    pub gc_expiry_ms: u64,
    /// Period of the ledger sweep while closing.
    pub drain_interval_ms: u64,
    /// Budget a listener gives its connections to close.
    pub drain_timeout_ms: u64,
    /// Default timeout for establishing an outbound connection.
    pub connect_timeout_ms: u64,
    /// Automatic reconnects allowed after an outbound transport fails.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect; doubles per attempt.
    pub reconnect_backoff_ms: u64,
    /// Upper bound on the reconnect delay.
    pub max_reconnect_backoff_ms: u64,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub max_payload_size: usize,
}

impl ConnectionConfig {
    /// Load a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            PeerError::Config(format!("failed reading {}: {err}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the connection cannot run with.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("gc_interval_ms", self.gc_interval_ms),
            ("drain_interval_ms", self.drain_interval_ms),
            ("protocol.ack_timeout_ms", self.protocol.ack_timeout_ms),
            ("protocol.reply_timeout_ms", self.protocol.reply_timeout_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(PeerError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.max_payload_size > MAX_PAYLOAD {
            return Err(PeerError::Config(format!(
                "max_payload_size must not exceed {MAX_PAYLOAD}"
            )));
        }
        Ok(())
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    pub fn gc_expiry(&self) -> Duration {
        Duration::from_millis(self.gc_expiry_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Delay before reconnect attempt number `attempt` (zero-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.reconnect_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_reconnect_backoff_ms))
    }

    pub(crate) fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_payload_size: self.max_payload_size,
            read_buffer_size: self.read_buffer_size,
            write_buffer_size: self.write_buffer_size,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            gc_interval_ms: 1_000,
            gc_expiry_ms: 5 * 60 * 1_000,
            drain_interval_ms: 500,
            drain_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            max_reconnect_attempts: 5,
            reconnect_backoff_ms: 100,
            max_reconnect_backoff_ms: 5_000,
            read_buffer_size: DEFAULT_READ_BUFFER,
            write_buffer_size: DEFAULT_WRITE_BUFFER,
            max_payload_size: MAX_PAYLOAD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_defaults() {
        let cfg = ProtocolConfig::default();
        assert_eq!(cfg.ack_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.reply_timeout(), Duration::from_secs(15));
        assert!(cfg.throw_on_unsolicited_response);
        assert!(!cfg.retry_with_query);
        assert_eq!(cfg.max_retries, None);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = ConnectionConfig::from_json_str(
            r#"{ "protocol": { "max_retries": 3 }, "gc_expiry_ms": 60000 }"#,
        )
        .expect("config should parse");
        assert_eq!(cfg.protocol.max_retries, Some(3));
        assert_eq!(cfg.protocol.ack_timeout_ms, 5_000);
        assert_eq!(cfg.gc_expiry(), Duration::from_secs(60));
        assert_eq!(cfg.gc_interval(), Duration::from_secs(1));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ConnectionConfig::from_json_str(r#"{ "gc_expiry": 5 }"#).unwrap_err();
        assert!(matches!(err, PeerError::Json(_)));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let err = ConnectionConfig::from_json_str(r#"{ "gc_interval_ms": 0 }"#).unwrap_err();
        assert!(matches!(err, PeerError::Config(_)));
    }

    #[test]
    fn reconnect_delay_doubles_and_caps() {
        let cfg = ConnectionConfig::default();
        assert_eq!(cfg.reconnect_delay(0), Duration::from_millis(100));
        assert_eq!(cfg.reconnect_delay(1), Duration::from_millis(200));
        assert_eq!(cfg.reconnect_delay(4), Duration::from_millis(1_600));
        assert_eq!(cfg.reconnect_delay(6), Duration::from_millis(5_000));
        assert_eq!(cfg.reconnect_delay(80), Duration::from_millis(5_000));
    }
}
