//! Error taxonomy surfaced by every public operation.
//!
//! Each variant maps to one recovery strategy for callers:
//!
//! | Variant | Caller action |
//! |---------|---------------|
//! | `CryptoUnavailable` | fatal, nothing to retry |
//! | `InvalidKeyEncoding`, `DecryptionFailed` | discard, re-handshake from scratch |
//! | `InvalidSession` | re-handshake |
//! | `Timeout`, `Cancelled` | request gone, channel still usable |
//! | `UserClosedChannel`, `ChannelClosed` | transport torn down, reconnect |
//! | `ProtocolFailure` | peer refused, payload is propagated verbatim |

// Rust guideline compliant 2026-02

use serde_json::Value;

/// Errors produced by the session, envelope, correlator and channel layers.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkError {
    /// The platform cannot generate keys or random material.
    CryptoUnavailable(String),
    /// Peer key bytes could not be decoded as a P-256 public key.
    InvalidKeyEncoding(String),
    /// Ciphertext was tampered with, encrypted under another key, or replayed.
    DecryptionFailed,
    /// No shared secret exists yet for an encrypted request.
    InvalidSession,
    /// No matching response arrived within the configured bound.
    Timeout,
    /// The request was cancelled by its caller.
    Cancelled,
    /// The popup window was closed by the user.
    UserClosedChannel,
    /// The transport was torn down (disconnect or exhausted reconnects).
    ChannelClosed,
    /// The peer answered with an explicit failure, or sent an envelope this
    /// side cannot accept (unknown tag, unsupported version).
    ProtocolFailure(Value),
    /// The transport could not be opened or written to.
    ConnectionFailed(String),
    /// Reading or writing persisted state failed.
    Storage(String),
}

impl LinkError {
    /// Build a `ProtocolFailure` carrying a plain message.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolFailure(Value::String(message.into()))
    }

    /// Whether this error tears down every pending request on the channel.
    #[must_use]
    pub fn is_channel_teardown(&self) -> bool {
        matches!(self, Self::UserClosedChannel | Self::ChannelClosed)
    }
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CryptoUnavailable(msg) => write!(f, "Crypto unavailable: {msg}"),
            Self::InvalidKeyEncoding(msg) => write!(f, "Invalid key encoding: {msg}"),
            Self::DecryptionFailed => write!(f, "Decryption failed"),
            Self::InvalidSession => write!(f, "Invalid session"),
            Self::Timeout => write!(f, "Request timed out"),
            Self::Cancelled => write!(f, "Request cancelled"),
            Self::UserClosedChannel => write!(f, "User closed the channel"),
            Self::ChannelClosed => write!(f, "Channel closed"),
            Self::ProtocolFailure(Value::String(msg)) => write!(f, "Protocol failure: {msg}"),
            Self::ProtocolFailure(payload) => write!(f, "Protocol failure: {payload}"),
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::Storage(msg) => write!(f, "Storage error: {msg}"),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<anyhow::Error> for LinkError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = LinkError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_failure_string_display() {
        let err = LinkError::protocol("unsupported version 2.0.0");
        assert_eq!(err.to_string(), "Protocol failure: unsupported version 2.0.0");
    }

    #[test]
    fn test_protocol_failure_json_display() {
        let err = LinkError::ProtocolFailure(serde_json::json!({"code": 4001}));
        assert_eq!(err.to_string(), r#"Protocol failure: {"code":4001}"#);
    }

    #[test]
    fn test_teardown_classification() {
        assert!(LinkError::ChannelClosed.is_channel_teardown());
        assert!(LinkError::UserClosedChannel.is_channel_teardown());
        assert!(!LinkError::Timeout.is_channel_teardown());
        assert!(!LinkError::Cancelled.is_channel_teardown());
    }

    #[test]
    fn test_anyhow_maps_to_storage() {
        let err: LinkError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, LinkError::Storage(ref msg) if msg.contains("disk full")));
    }
}
