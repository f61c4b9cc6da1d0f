#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **concord-message-security** – HMAC-SHA256 signing, verification,
//! freshness checks, replay defence and field sanitization for inter-tab
//! messages.
//!
//! Outbound messages are stamped by `concord-clock`, then signed here;
//! inbound messages are verified, freshness-checked and nonce-checked here
//! before `concord-clock::LamportClock::update` folds in the remote
//! timestamp.

use chrono::Utc;
use concord_types::TabId;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

mod canonical;
mod nonce;
mod sanitize;

pub use canonical::canonicalize;
pub use nonce::NonceCache;
pub use sanitize::{sanitize, SENSITIVE_FIELDS};

type HmacSha256 = Hmac<Sha256>;

/// A process-local, non-exportable HMAC signing key.
///
/// The key material is zeroed on drop; there is no accessor that returns the
/// raw bytes, mirroring the "non-exportable key" contract of the host
/// environment's HMAC primitive.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SigningKey(Vec<u8>);

impl SigningKey {
    /// Derive a fresh random key at process start.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Construct a key from raw bytes (for tests and deterministic
    /// deployments that inject a key via configuration).
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.0).expect("HMAC accepts keys of any length")
    }
}

/// A stamped, signable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// The sender's Lamport logical timestamp at send time.
    pub logical_timestamp: u64,
    /// The sender's stable tab id.
    pub sender_id: TabId,
    /// `senderId_seq_wallTime`, unique per message from a given sender.
    pub nonce: String,
    /// Wall-clock send time, Unix seconds. Added automatically by [`sign`]
    /// if absent.
    pub timestamp: Option<i64>,
    /// The typed payload.
    pub payload: Value,
}

/// A [`Message`] plus its base64-encoded HMAC-SHA256 signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedMessage {
    /// The signed message.
    pub message: Message,
    /// Base64 (standard) encoding of the HMAC-SHA256 signature over the
    /// canonical form of `message`.
    pub signature: String,
}

/// Sign `message` with `key`, filling in a wall-clock timestamp if absent.
pub fn sign(mut message: Message, key: &SigningKey) -> SignedMessage {
    if message.timestamp.is_none() {
        message.timestamp = Some(Utc::now().timestamp());
    }
    let signature = compute_signature(&message, key);
    SignedMessage { message, signature }
}

/// Recompute the signature and compare. Never panics or propagates: a
/// malformed signature (bad base64, wrong length) returns `false`.
pub fn verify(signed: &SignedMessage, key: &SigningKey) -> bool {
    use base64::Engine;
    let expected = match base64::engine::general_purpose::STANDARD.decode(&signed.signature) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let mut mac = key.mac();
    mac.update(canonicalize(&to_value(&signed.message)).as_bytes());
    mac.verify_slice(&expected).is_ok()
}

fn compute_signature(message: &Message, key: &SigningKey) -> String {
    use base64::Engine;
    let mut mac = key.mac();
    mac.update(canonicalize(&to_value(message)).as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

fn to_value(message: &Message) -> Value {
    serde_json::to_value(message).expect("Message always serializes to JSON")
}

/// `now - message.timestamp <= max_age`. A message with no timestamp is
/// never fresh.
pub fn validate_timestamp(message: &Message, max_age: std::time::Duration) -> bool {
    match message.timestamp {
        Some(ts) => {
            let now = Utc::now().timestamp();
            let age = now.saturating_sub(ts);
            age >= 0 && age as u64 <= max_age.as_secs()
        }
        None => false,
    }
}

/// Default freshness window: balances clock skew tolerance against
/// replay-window exposure.
pub const DEFAULT_MAX_AGE_SECS: u64 = 5;

/// Full inbound processing pipeline: verify signature, check freshness,
/// check-and-record the nonce. Returns `Ok(())` only if every step passes;
/// the caller should drop the message and log on `Err`.
pub fn process_inbound(
    signed: &SignedMessage,
    key: &SigningKey,
    nonces: &NonceCache,
    max_age: std::time::Duration,
) -> Result<(), InboundError> {
    if !verify(signed, key) {
        warn!(sender = %signed.message.sender_id, "message failed signature verification");
        return Err(InboundError::VerificationFailed);
    }
    if !validate_timestamp(&signed.message, max_age) {
        warn!(sender = %signed.message.sender_id, "message failed freshness check");
        return Err(InboundError::Stale);
    }
    if !nonces.mark_nonce_used(&signed.message.nonce) {
        warn!(sender = %signed.message.sender_id, nonce = %signed.message.nonce, "replayed nonce rejected");
        return Err(InboundError::ReplayedNonce);
    }
    Ok(())
}

/// Reasons inbound message processing may reject a message. All are
/// silent-drop at the call site: no retry, only a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InboundError {
    /// HMAC verification failed.
    #[error("signature verification failed")]
    VerificationFailed,
    /// The message is older than the configured freshness window.
    #[error("message is stale")]
    Stale,
    /// The nonce has already been seen.
    #[error("nonce was already used")]
    ReplayedNonce,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn sample_message() -> Message {
        Message {
            logical_timestamp: 1,
            sender_id: TabId::from("tab-a"),
            nonce: "tab-a_1_1000".to_string(),
            timestamp: None,
            payload: json!({"b": 1, "a": 2}),
        }
    }

    #[test]
    fn sign_then_verify_round_trips_regardless_of_property_order() {
        let key = SigningKey::from_bytes(b"test-key".to_vec());
        let signed = sign(sample_message(), &key);
        assert!(verify(&signed, &key));
    }

    #[test]
    fn verify_fails_with_wrong_key() {
        let key = SigningKey::from_bytes(b"key-a".to_vec());
        let other = SigningKey::from_bytes(b"key-b".to_vec());
        let signed = sign(sample_message(), &key);
        assert!(!verify(&signed, &other));
    }

    #[test]
    fn verify_fails_on_tampered_payload() {
        let key = SigningKey::from_bytes(b"test-key".to_vec());
        let mut signed = sign(sample_message(), &key);
        signed.message.payload = json!({"a": 999});
        assert!(!verify(&signed, &key));
    }

    #[test]
    fn verify_never_panics_on_malformed_signature() {
        let key = SigningKey::from_bytes(b"test-key".to_vec());
        let mut signed = sign(sample_message(), &key);
        signed.signature = "not valid base64!!".to_string();
        assert!(!verify(&signed, &key));
    }

    #[test]
    fn sign_fills_in_missing_timestamp() {
        let key = SigningKey::from_bytes(b"test-key".to_vec());
        let signed = sign(sample_message(), &key);
        assert!(signed.message.timestamp.is_some());
    }

    #[test]
    fn freshness_window_rejects_old_timestamp() {
        let mut message = sample_message();
        message.timestamp = Some(Utc::now().timestamp() - 100);
        assert!(!validate_timestamp(&message, Duration::from_secs(5)));
    }

    #[test]
    fn freshness_window_accepts_recent_timestamp() {
        let mut message = sample_message();
        message.timestamp = Some(Utc::now().timestamp());
        assert!(validate_timestamp(&message, Duration::from_secs(5)));
    }

    #[test]
    fn process_inbound_rejects_replay() {
        let key = SigningKey::from_bytes(b"test-key".to_vec());
        let signed = sign(sample_message(), &key);
        let nonces = NonceCache::new(10);

        assert!(process_inbound(&signed, &key, &nonces, Duration::from_secs(5)).is_ok());
        assert_eq!(
            process_inbound(&signed, &key, &nonces, Duration::from_secs(5)),
            Err(InboundError::ReplayedNonce)
        );
    }

    proptest::proptest! {
        #[test]
        fn canonicalization_round_trip_holds_for_shuffled_keys(a in 0i64..1000, b in 0i64..1000) {
            let key = SigningKey::from_bytes(b"prop-key".to_vec());
            let m1 = Message {
                logical_timestamp: 1,
                sender_id: TabId::from("t"),
                nonce: "t_1_1".to_string(),
                timestamp: Some(1),
                payload: json!({"a": a, "b": b}),
            };
            let signed = sign(m1, &key);
            proptest::prop_assert!(verify(&signed, &key));
        }
    }
}
