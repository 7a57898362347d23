//! Versioned, correlatable message envelopes and their encrypted payloads.
//!
//! Every message exchanged with a wallet surface is an `scw` envelope:
//!
//! ```text
//! request  {type:"scw", id, sender, content, version, timestamp}
//! response {type:"scw", id, requestId, sender, content}
//!
//! request content   {handshake:{method, params}} | {encrypted:{ciphertext, nonce}}
//! response content  {encrypted:{ciphertext, nonce}} | {failure:<json>}
//! ```
//!
//! Only the handshake travels in clear. Everything after it is an
//! [`EncryptedContent`] produced by a [`SecureEnvelope`] under the ECDH
//! shared secret. The decrypted payload of a request is an
//! [`EncryptedRequest`]; of a response, a [`DecryptedResponse`].

// Rust guideline compliant 2026-02

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::crypto::{self, NONCE_SIZE};
use crate::error::{LinkError, Result};
use crate::key_exchange::SharedSecret;

/// Protocol version stamped on outgoing envelopes.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Method carried by the clear-text handshake request.
pub const HANDSHAKE_METHOD: &str = "eth_requestAccounts";

/// Nonces remembered per shared secret before the oldest are forgotten.
const NONCE_REGISTRY_CAPACITY: usize = 4096;

/// The only envelope type tag this side speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeType {
    /// Smart-contract-wallet message.
    #[serde(rename = "scw")]
    Scw,
}

/// AES-256-GCM ciphertext and nonce, both lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedContent {
    /// `ciphertext ‖ tag`, hex.
    pub ciphertext: String,
    /// 96-bit nonce, hex.
    pub nonce: String,
}

/// Clear-text handshake body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeContent {
    /// Always `eth_requestAccounts`.
    pub method: String,
    /// Dapp name and logo.
    pub params: Value,
}

impl HandshakeContent {
    /// The `eth_requestAccounts` handshake announcing the dapp.
    #[must_use]
    pub fn request_accounts(dapp_name: &str, dapp_logo_url: Option<&str>) -> Self {
        Self {
            method: HANDSHAKE_METHOD.to_string(),
            params: serde_json::json!({
                "dappName": dapp_name,
                "dappLogoUrl": dapp_logo_url,
            }),
        }
    }
}

/// Body of a request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestContent {
    /// Clear-text handshake, sent before a secret exists.
    Handshake(HandshakeContent),
    /// An [`EncryptedRequest`] under the shared secret.
    Encrypted(EncryptedContent),
}

/// Body of a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseContent {
    /// A [`DecryptedResponse`] under the shared secret.
    Encrypted(EncryptedContent),
    /// The peer refused the request; the payload is propagated verbatim.
    Failure(Value),
}

/// Envelope sent to the wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    /// Always `scw`.
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    /// Correlation id echoed back as `request_id`.
    pub id: Uuid,
    /// Sender public key, SPKI DER hex.
    pub sender: String,
    /// Handshake or encrypted body.
    pub content: RequestContent,
    /// Protocol version the sender speaks.
    pub version: String,
    /// Send time.
    pub timestamp: DateTime<Utc>,
}

impl RequestEnvelope {
    /// Stamp a fresh id, the protocol version and the current time.
    pub fn new(sender: impl Into<String>, content: RequestContent) -> Self {
        Self {
            kind: EnvelopeType::Scw,
            id: Uuid::new_v4(),
            sender: sender.into(),
            content,
            version: PROTOCOL_VERSION.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Decode and validate an inbound request.
    pub fn from_value(value: Value) -> Result<Self> {
        let envelope: Self = decode_envelope(value)?;
        check_version(&envelope.version)?;
        Ok(envelope)
    }

    /// [`Self::from_value`] over raw JSON text.
    pub fn parse(raw: &str) -> Result<Self> {
        Self::from_value(parse_json(raw)?)
    }

    /// Wire form.
    pub fn to_value(&self) -> Result<Value> {
        to_value(self)
    }
}

/// Envelope received from the wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    /// Always `scw`.
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    /// Id of this response.
    pub id: Uuid,
    /// Id of the request being answered.
    pub request_id: Uuid,
    /// Responder public key, SPKI DER hex.
    pub sender: String,
    /// Encrypted body or a failure.
    pub content: ResponseContent,
    /// Protocol version; older wallets omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Send time, when present.
    pub timestamp: Option<DateTime<Utc>>,
}

impl ResponseEnvelope {
    /// Build a response to `request_id`.
    pub fn new(sender: impl Into<String>, request_id: Uuid, content: ResponseContent) -> Self {
        Self {
            kind: EnvelopeType::Scw,
            id: Uuid::new_v4(),
            request_id,
            sender: sender.into(),
            content,
            version: Some(PROTOCOL_VERSION.to_string()),
            timestamp: Some(Utc::now()),
        }
    }

    /// Decode and validate an inbound response.
    pub fn from_value(value: Value) -> Result<Self> {
        let envelope: Self = decode_envelope(value)?;
        if let Some(version) = &envelope.version {
            check_version(version)?;
        }
        Ok(envelope)
    }

    /// [`Self::from_value`] over raw JSON text.
    pub fn parse(raw: &str) -> Result<Self> {
        Self::from_value(parse_json(raw)?)
    }

    /// Wire form.
    pub fn to_value(&self) -> Result<Value> {
        to_value(self)
    }
}

/// JSON-RPC action forwarded to the wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcAction {
    /// JSON-RPC method name.
    pub method: String,
    /// Method parameters, usually an array.
    #[serde(default)]
    pub params: Value,
}

impl RpcAction {
    /// Action calling `method` with `params`.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Plaintext of an encrypted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedRequest {
    /// The call to make.
    pub action: RpcAction,
    /// Chain the call targets.
    pub chain_id: u64,
}

/// Outcome carried inside a decrypted response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RpcResult {
    /// The call succeeded.
    Value(Value),
    /// The wallet's JSON-RPC error object.
    Error(Value),
}

/// Plaintext of an encrypted response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecryptedResponse {
    /// Outcome of the call.
    pub result: RpcResult,
    /// Side-channel data such as supported chains, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl DecryptedResponse {
    /// Success value, or the wallet's error as `ProtocolFailure`.
    pub fn into_result(self) -> Result<Value> {
        match self.result {
            RpcResult::Value(value) => Ok(value),
            RpcResult::Error(error) => Err(LinkError::ProtocolFailure(error)),
        }
    }
}

/// Stateless encryption of any serializable payload under `secret`.
pub fn encrypt_content<T: Serialize>(payload: &T, secret: &SharedSecret) -> Result<EncryptedContent> {
    let plaintext = serde_json::to_vec(payload)
        .map_err(|e| LinkError::protocol(format!("payload is not serializable: {e}")))?;
    let nonce = crypto::random_nonce();
    let ciphertext = crypto::encrypt(secret.as_bytes(), &nonce, &plaintext)?;
    Ok(EncryptedContent {
        ciphertext: data_encoding::HEXLOWER.encode(&ciphertext),
        nonce: data_encoding::HEXLOWER.encode(&nonce),
    })
}

/// Stateless decryption. Does not track nonces; see [`SecureEnvelope`].
pub fn decrypt_content<T: DeserializeOwned>(
    content: &EncryptedContent,
    secret: &SharedSecret,
) -> Result<T> {
    let (_, payload) = open(content, secret)?;
    Ok(payload)
}

fn open<T: DeserializeOwned>(
    content: &EncryptedContent,
    secret: &SharedSecret,
) -> Result<([u8; NONCE_SIZE], T)> {
    let nonce: [u8; NONCE_SIZE] = decode_hex(&content.nonce)?
        .try_into()
        .map_err(|_| LinkError::DecryptionFailed)?;
    let ciphertext = decode_hex(&content.ciphertext)?;
    let plaintext = crypto::decrypt(secret.as_bytes(), &nonce, &ciphertext)?;
    let payload = serde_json::from_slice(&plaintext)
        .map_err(|e| LinkError::protocol(format!("undecodable payload: {e}")))?;
    Ok((nonce, payload))
}

/// Encryption context bound to one shared secret.
///
/// Remembers the nonces it has accepted and refuses to decrypt any of them
/// a second time. Built fresh for every handshake, so the registry never
/// outlives its secret.
#[derive(Debug)]
pub struct SecureEnvelope {
    secret: SharedSecret,
    nonces: NonceRegistry,
}

impl SecureEnvelope {
    /// Context with an empty nonce registry.
    pub fn new(secret: SharedSecret) -> Self {
        Self {
            secret,
            nonces: NonceRegistry::new(NONCE_REGISTRY_CAPACITY),
        }
    }

    /// Encrypt under a fresh random nonce.
    pub fn encrypt<T: Serialize>(&self, payload: &T) -> Result<EncryptedContent> {
        encrypt_content(payload, &self.secret)
    }

    /// Decrypt, failing with `DecryptionFailed` on a replayed nonce.
    pub fn decrypt<T: DeserializeOwned>(&self, content: &EncryptedContent) -> Result<T> {
        let (nonce, payload) = open(content, &self.secret)?;
        if !self.nonces.insert(nonce) {
            log::warn!("[Envelope] Rejected replayed nonce");
            return Err(LinkError::DecryptionFailed);
        }
        Ok(payload)
    }

    /// The bound secret.
    pub fn secret(&self) -> &SharedSecret {
        &self.secret
    }
}

/// Bounded set of consumed nonces, oldest evicted first.
#[derive(Debug)]
struct NonceRegistry {
    capacity: usize,
    seen: Mutex<(HashSet<[u8; NONCE_SIZE]>, VecDeque<[u8; NONCE_SIZE]>)>,
}

impl NonceRegistry {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: Mutex::new((HashSet::new(), VecDeque::new())),
        }
    }

    /// Record `nonce`; `false` if it was already consumed.
    fn insert(&self, nonce: [u8; NONCE_SIZE]) -> bool {
        let mut guard = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let (set, order) = &mut *guard;
        if !set.insert(nonce) {
            return false;
        }
        order.push_back(nonce);
        if order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                set.remove(&oldest);
            }
        }
        true
    }
}

/// Accept any version sharing our semver major.
pub fn check_version(version: &str) -> Result<()> {
    let theirs = semver::Version::parse(version)
        .map_err(|e| LinkError::protocol(format!("invalid envelope version {version:?}: {e}")))?;
    let ours = semver::Version::parse(PROTOCOL_VERSION)
        .map_err(|e| LinkError::protocol(format!("invalid local version: {e}")))?;
    if theirs.major != ours.major {
        return Err(LinkError::protocol(format!(
            "unsupported envelope version {theirs} (local {ours})"
        )));
    }
    Ok(())
}

fn decode_envelope<T: DeserializeOwned>(value: Value) -> Result<T> {
    match value.get("type").and_then(Value::as_str) {
        Some("scw") => {}
        Some(other) => return Err(LinkError::protocol(format!("unknown envelope type {other:?}"))),
        None => return Err(LinkError::protocol("envelope has no type")),
    }
    serde_json::from_value(value).map_err(|e| LinkError::protocol(format!("malformed envelope: {e}")))
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| LinkError::protocol(format!("invalid JSON: {e}")))
}

fn to_value<T: Serialize>(envelope: &T) -> Result<Value> {
    serde_json::to_value(envelope).map_err(|e| LinkError::protocol(format!("encode failed: {e}")))
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    data_encoding::HEXLOWER_PERMISSIVE
        .decode(hex.as_bytes())
        .map_err(|_| LinkError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn secret(byte: u8) -> SharedSecret {
        SharedSecret::from_bytes([byte; 32])
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let payload = json!({"action": {"method": "eth_chainId", "params": []}, "chainId": 1});
        let content = encrypt_content(&payload, &secret(1)).unwrap();
        let back: Value = decrypt_content(&content, &secret(1)).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_wrong_secret_fails() {
        let content = encrypt_content(&json!("hi"), &secret(1)).unwrap();
        assert_eq!(
            decrypt_content::<Value>(&content, &secret(2)),
            Err(LinkError::DecryptionFailed)
        );
    }

    #[test]
    fn test_nonces_are_fresh() {
        let a = encrypt_content(&json!(1), &secret(1)).unwrap();
        let b = encrypt_content(&json!(1), &secret(1)).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_eq!(a.nonce.len(), NONCE_SIZE * 2);
    }

    #[test]
    fn test_replayed_nonce_is_rejected() {
        let envelope = SecureEnvelope::new(secret(3));
        let content = envelope.encrypt(&json!({"n": 1})).unwrap();

        let first: Value = envelope.decrypt(&content).unwrap();
        assert_eq!(first, json!({"n": 1}));
        assert_eq!(envelope.decrypt::<Value>(&content), Err(LinkError::DecryptionFailed));
    }

    #[test]
    fn test_failed_decrypt_does_not_consume_nonce() {
        let envelope = SecureEnvelope::new(secret(3));
        let content = envelope.encrypt(&json!(7)).unwrap();
        let mut tampered = content.clone();
        tampered.ciphertext.replace_range(0..2, "00");
        if tampered.ciphertext == content.ciphertext {
            tampered.ciphertext.replace_range(0..2, "ff");
        }

        assert!(envelope.decrypt::<Value>(&tampered).is_err());
        assert_eq!(envelope.decrypt::<Value>(&content).unwrap(), json!(7));
    }

    #[test]
    fn test_nonce_registry_evicts_oldest() {
        let registry = NonceRegistry::new(2);
        assert!(registry.insert([1; NONCE_SIZE]));
        assert!(registry.insert([2; NONCE_SIZE]));
        assert!(!registry.insert([2; NONCE_SIZE]));
        assert!(registry.insert([3; NONCE_SIZE]));
        // [1] fell out of the window
        assert!(registry.insert([1; NONCE_SIZE]));
    }

    #[test]
    fn test_handshake_request_wire_shape() {
        let content = RequestContent::Handshake(HandshakeContent::request_accounts("Dapp", None));
        let envelope = RequestEnvelope::new("04ab", content);
        let wire = envelope.to_value().unwrap();

        assert_eq!(wire["type"], "scw");
        assert_eq!(wire["sender"], "04ab");
        assert_eq!(wire["version"], PROTOCOL_VERSION);
        assert_eq!(wire["content"]["handshake"]["method"], "eth_requestAccounts");
        assert_eq!(wire["content"]["handshake"]["params"]["dappName"], "Dapp");
        assert!(wire["timestamp"].is_string());

        let back = RequestEnvelope::from_value(wire).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_envelope_ids_are_unique() {
        let content = RequestContent::Handshake(HandshakeContent::request_accounts("Dapp", None));
        let a = RequestEnvelope::new("k", content.clone());
        let b = RequestEnvelope::new("k", content);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_response_wire_shape() {
        let request_id = Uuid::new_v4();
        let envelope =
            ResponseEnvelope::new("peer", request_id, ResponseContent::Failure(json!({"code": 4001})));
        let wire = envelope.to_value().unwrap();
        assert_eq!(wire["requestId"], request_id.to_string());
        assert_eq!(wire["content"]["failure"]["code"], 4001);
    }

    #[test]
    fn test_unknown_type_is_protocol_failure() {
        let raw = json!({"type": "ecdh", "id": Uuid::new_v4(), "requestId": Uuid::new_v4(),
            "sender": "x", "content": {"failure": null}});
        assert!(matches!(
            ResponseEnvelope::from_value(raw),
            Err(LinkError::ProtocolFailure(_))
        ));
    }

    #[test]
    fn test_unknown_content_tag_is_protocol_failure() {
        let raw = json!({"type": "scw", "id": Uuid::new_v4(), "requestId": Uuid::new_v4(),
            "sender": "x", "content": {"surprise": {}}});
        assert!(matches!(
            ResponseEnvelope::from_value(raw),
            Err(LinkError::ProtocolFailure(_))
        ));
    }

    #[test]
    fn test_version_major_mismatch_is_rejected() {
        let mut wire = ResponseEnvelope::new("p", Uuid::new_v4(), ResponseContent::Failure(json!(null)))
            .to_value()
            .unwrap();
        wire["version"] = json!("99.0.0");
        assert!(matches!(
            ResponseEnvelope::from_value(wire),
            Err(LinkError::ProtocolFailure(_))
        ));
    }

    #[test]
    fn test_same_major_is_accepted() {
        let ours = semver::Version::parse(PROTOCOL_VERSION).unwrap();
        let peer = format!("{}.{}.{}", ours.major, ours.minor + 7, 0);
        assert!(check_version(&peer).is_ok());
        assert!(check_version("not-a-version").is_err());
    }

    #[test]
    fn test_decrypted_response_results() {
        let ok: DecryptedResponse =
            serde_json::from_value(json!({"result": {"value": ["0xabc"]}})).unwrap();
        assert_eq!(ok.into_result().unwrap(), json!(["0xabc"]));

        let err: DecryptedResponse = serde_json::from_value(
            json!({"result": {"error": {"code": 4001, "message": "User rejected"}}}),
        )
        .unwrap();
        assert_eq!(
            err.into_result(),
            Err(LinkError::ProtocolFailure(json!({"code": 4001, "message": "User rejected"})))
        );
    }

    #[test]
    fn test_encrypted_request_uses_camel_case() {
        let request = EncryptedRequest {
            action: RpcAction::new("eth_sendTransaction", json!([{"to": "0x1"}])),
            chain_id: 8453,
        };
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["chainId"], 8453);
        assert_eq!(wire["action"]["method"], "eth_sendTransaction");
    }
}
