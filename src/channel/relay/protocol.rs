//! Relay server wire messages.
//!
//! Every frame is a JSON object tagged by `type`, except the heartbeat,
//! which is the bare text `h` in both directions.
//!
//! ```text
//! client → server   HostSession | IsLinked | GetSessionConfig | PublishEvent
//! server → client   OK | Fail | IsLinkedOK | Linked | GetSessionConfigOK
//!                   | SessionConfigUpdated | PublishEventOK | Event
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Heartbeat frame (and its echo).
pub const HEARTBEAT: &str = "h";

/// Event name for envelopes sent to the wallet.
pub const EVENT_WEB3_REQUEST: &str = "Web3Request";

/// Event name for envelopes coming back from the wallet.
pub const EVENT_WEB3_RESPONSE: &str = "Web3Response";

/// Session metadata key set when the wallet destroys the session.
pub const METADATA_DESTROYED: &str = "__destroyed";

/// Frames sent by the dapp.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Claim the session on this socket.
    HostSession {
        /// Request id.
        id: u64,
        /// Session being hosted.
        session_id: String,
        /// Derived session key proving ownership.
        session_key: String,
    },
    /// Ask whether a wallet has joined.
    IsLinked {
        /// Request id.
        id: u64,
        /// Session asked about.
        session_id: String,
    },
    /// Fetch the session metadata.
    GetSessionConfig {
        /// Request id.
        id: u64,
        /// Session asked about.
        session_id: String,
    },
    /// Deliver a sealed envelope to the wallet.
    PublishEvent {
        /// Request id.
        id: u64,
        /// Session to publish on.
        session_id: String,
        /// Event name, `Web3Request`.
        event: String,
        /// Sealed envelope JSON, hex.
        data: String,
        /// Ask the relay to push-notify the wallet.
        call_webhook: bool,
    },
}

impl ClientMessage {
    /// Request id, echoed by the server's `OK`/`Fail`.
    pub fn id(&self) -> u64 {
        match self {
            Self::HostSession { id, .. }
            | Self::IsLinked { id, .. }
            | Self::GetSessionConfig { id, .. }
            | Self::PublishEvent { id, .. } => *id,
        }
    }

    /// Wire text.
    pub fn to_text(&self) -> String {
        // Plain strings and integers only; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Frames sent by the relay server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Acknowledges a request.
    #[serde(rename = "OK")]
    Ok {
        /// Id of the acknowledged request.
        #[serde(default)]
        id: Option<u64>,
    },
    /// Refuses a request.
    Fail {
        /// Id of the refused request.
        #[serde(default)]
        id: Option<u64>,
        /// Reason given by the relay.
        #[serde(default)]
        error: Option<String>,
    },
    /// Answer to [`ClientMessage::IsLinked`].
    #[serde(rename = "IsLinkedOK")]
    IsLinkedOk {
        /// Id of the `IsLinked` request.
        #[serde(default)]
        id: Option<u64>,
        /// Whether a wallet has joined.
        linked: bool,
        /// Wallets currently connected.
        #[serde(default)]
        online_guests: u32,
    },
    /// A wallet joined the session.
    Linked {
        /// Wallets currently connected.
        #[serde(default)]
        online_guests: u32,
    },
    /// Answer to [`ClientMessage::GetSessionConfig`].
    #[serde(rename = "GetSessionConfigOK")]
    GetSessionConfigOk {
        /// Session metadata.
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    /// The wallet changed the session metadata.
    SessionConfigUpdated {
        /// Session metadata after the change.
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    /// Answer to [`ClientMessage::PublishEvent`].
    #[serde(rename = "PublishEventOK")]
    PublishEventOk {
        /// Id of the `PublishEvent` request.
        #[serde(default)]
        id: Option<u64>,
        /// Relay-assigned event id.
        #[serde(default)]
        event_id: Option<String>,
    },
    /// An event published by the wallet.
    Event {
        /// Event name, `Web3Response` for envelopes.
        event: String,
        /// Sealed envelope JSON, hex.
        data: String,
        /// Relay-assigned event id.
        #[serde(default)]
        event_id: Option<String>,
    },
    /// Any frame type this client does not handle.
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Whether session metadata marks the session as destroyed.
    pub fn is_destroyed(&self) -> bool {
        let metadata = match self {
            Self::GetSessionConfigOk { metadata } | Self::SessionConfigUpdated { metadata } => {
                metadata
            }
            _ => return false,
        };
        metadata.get(METADATA_DESTROYED).and_then(Value::as_str) == Some("1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_host_session_wire_shape() {
        let msg = ClientMessage::HostSession {
            id: 1,
            session_id: "abc".into(),
            session_key: "def".into(),
        };
        let wire: Value = serde_json::from_str(&msg.to_text()).unwrap();
        assert_eq!(
            wire,
            json!({"type": "HostSession", "id": 1, "sessionId": "abc", "sessionKey": "def"})
        );
    }

    #[test]
    fn test_publish_event_wire_shape() {
        let msg = ClientMessage::PublishEvent {
            id: 7,
            session_id: "abc".into(),
            event: EVENT_WEB3_REQUEST.into(),
            data: "00ff".into(),
            call_webhook: true,
        };
        let wire: Value = serde_json::from_str(&msg.to_text()).unwrap();
        assert_eq!(wire["type"], "PublishEvent");
        assert_eq!(wire["callWebhook"], true);
        assert_eq!(wire["event"], "Web3Request");
        assert_eq!(msg.id(), 7);
    }

    #[test]
    fn test_parse_server_messages() {
        let ok: ServerMessage = serde_json::from_value(json!({"type": "OK", "id": 1, "sessionId": "s"})).unwrap();
        assert_eq!(ok, ServerMessage::Ok { id: Some(1) });

        let linked: ServerMessage = serde_json::from_value(
            json!({"type": "IsLinkedOK", "id": 2, "sessionId": "s", "linked": true, "onlineGuests": 1}),
        )
        .unwrap();
        assert_eq!(
            linked,
            ServerMessage::IsLinkedOk { id: Some(2), linked: true, online_guests: 1 }
        );

        let event: ServerMessage = serde_json::from_value(json!({
            "type": "Event", "sessionId": "s", "eventId": "e1",
            "event": "Web3Response", "data": "abcd"
        }))
        .unwrap();
        assert!(matches!(event, ServerMessage::Event { ref event, .. } if event == EVENT_WEB3_RESPONSE));
    }

    #[test]
    fn test_unknown_type_parses_as_unknown() {
        let msg: ServerMessage = serde_json::from_value(json!({"type": "Brand new", "x": 1})).unwrap();
        assert_eq!(msg, ServerMessage::Unknown);
    }

    #[test]
    fn test_destroyed_metadata() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "type": "SessionConfigUpdated", "sessionId": "s",
            "metadata": {"__destroyed": "1"}
        }))
        .unwrap();
        assert!(msg.is_destroyed());

        let alive: ServerMessage = serde_json::from_value(
            json!({"type": "SessionConfigUpdated", "metadata": {"ChainId": "x"}}),
        )
        .unwrap();
        assert!(!alive.is_destroyed());
    }
}
