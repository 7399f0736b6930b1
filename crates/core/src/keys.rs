//! Key material and event signing.
//!
//! Secret keys are accepted in raw hex or bech32 `nsec` form; public keys are
//! x-only, exposed as lowercase hex with bech32 `npub` helpers. Signing uses
//! schnorr over the event-id digest.

use crate::event::{event_digest, Event, EventError, EventTemplate};
use bech32::{Bech32, Hrp};
use bitcoin::secp256k1::{schnorr, Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey};
use rand::RngCore;
use thiserror::Error;

/// Errors that can occur when parsing or using keys.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid bech32: {0}")]
    InvalidBech32(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error(transparent)]
    Event(#[from] EventError),
}

/// Generate a fresh secret key, returned as lowercase hex.
pub fn generate_secret_key() -> String {
    let mut rng = rand::thread_rng();
    loop {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        if let Ok(sk) = SecretKey::from_slice(&bytes) {
            return hex::encode(sk.secret_bytes());
        }
    }
}

/// Parse a secret key from raw hex or bech32 `nsec` form.
pub fn parse_secret_key(input: &str) -> Result<SecretKey, KeyError> {
    let input = input.trim();
    let bytes = if input.starts_with("nsec1") {
        decode_nsec(input)?
    } else {
        hex::decode(input).map_err(|e| KeyError::InvalidSecretKey(e.to_string()))?
    };
    SecretKey::from_slice(&bytes).map_err(|e| KeyError::InvalidSecretKey(e.to_string()))
}

/// Derive the x-only public key for a secret key, as lowercase hex.
pub fn derive_public_key(secret_key: &SecretKey) -> String {
    let secp = Secp256k1::new();
    let keypair = Keypair::from_secret_key(&secp, secret_key);
    let (xonly, _parity) = keypair.x_only_public_key();
    hex::encode(xonly.serialize())
}

/// Decode a bech32 `nsec` string into the raw 32 secret-key bytes.
pub fn decode_nsec(input: &str) -> Result<Vec<u8>, KeyError> {
    decode_bech32(input, "nsec")
}

/// Decode a bech32 `npub` string into a lowercase hex public key.
pub fn decode_npub(input: &str) -> Result<String, KeyError> {
    decode_bech32(input, "npub").map(hex::encode)
}

/// Encode a hex public key as bech32 `npub`.
pub fn encode_npub(pubkey_hex: &str) -> Result<String, KeyError> {
    encode_bech32(pubkey_hex, "npub")
}

/// Encode a hex secret key as bech32 `nsec`.
pub fn encode_nsec(seckey_hex: &str) -> Result<String, KeyError> {
    encode_bech32(seckey_hex, "nsec")
}

fn decode_bech32(input: &str, expected_hrp: &str) -> Result<Vec<u8>, KeyError> {
    let (hrp, data) = bech32::decode(input).map_err(|e| KeyError::InvalidBech32(e.to_string()))?;
    if hrp.as_str() != expected_hrp {
        return Err(KeyError::InvalidBech32(format!(
            "expected hrp {expected_hrp}, got {}",
            hrp.as_str()
        )));
    }
    if data.len() != 32 {
        return Err(KeyError::InvalidBech32(format!(
            "expected 32 bytes, got {}",
            data.len()
        )));
    }
    Ok(data)
}

fn encode_bech32(hex_input: &str, hrp: &str) -> Result<String, KeyError> {
    let bytes = hex::decode(hex_input).map_err(|e| KeyError::InvalidBech32(e.to_string()))?;
    let hrp = Hrp::parse(hrp).map_err(|e| KeyError::InvalidBech32(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, &bytes).map_err(|e| KeyError::InvalidBech32(e.to_string()))
}

/// Compute the id of a template, sign it, and return the finished event.
pub fn finalize_event(template: &EventTemplate, secret_key: &SecretKey) -> Result<Event, KeyError> {
    let secp = Secp256k1::new();
    let keypair = Keypair::from_secret_key(&secp, secret_key);
    let (xonly, _parity) = keypair.x_only_public_key();
    let pubkey = hex::encode(xonly.serialize());

    let digest = event_digest(&pubkey, template)?;
    let sig = secp.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &keypair);

    Ok(Event {
        id: hex::encode(digest),
        pubkey,
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
        sig: hex::encode(sig.as_ref()),
    })
}

/// Verify an event's id and signature. Returns `Ok(false)` when the id or
/// signature do not match; `Err` when the fields are not even well-formed.
pub fn verify_event(event: &Event) -> Result<bool, KeyError> {
    let template = EventTemplate {
        created_at: event.created_at,
        kind: event.kind,
        tags: event.tags.clone(),
        content: event.content.clone(),
    };
    let digest = event_digest(&event.pubkey, &template)?;
    if hex::encode(digest) != event.id {
        return Ok(false);
    }

    let pubkey_bytes =
        hex::decode(&event.pubkey).map_err(|e| KeyError::InvalidPublicKey(e.to_string()))?;
    let xonly = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| KeyError::InvalidPublicKey(e.to_string()))?;
    let sig_bytes = hex::decode(&event.sig).map_err(|e| KeyError::InvalidSignature(e.to_string()))?;
    let sig = schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|e| KeyError::InvalidSignature(e.to_string()))?;

    let secp = Secp256k1::new();
    Ok(secp
        .verify_schnorr(&sig, &Message::from_digest(digest), &xonly)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::now_timestamp;

    fn template(content: &str) -> EventTemplate {
        EventTemplate {
            created_at: now_timestamp(),
            kind: 1,
            tags: vec![],
            content: content.to_string(),
        }
    }

    #[test]
    fn sign_verify_round_trip() {
        let sk = parse_secret_key(&generate_secret_key()).unwrap();
        let event = finalize_event(&template("hello"), &sk).unwrap();
        assert!(verify_event(&event).unwrap());
    }

    #[test]
    fn tampered_content_fails_verification() {
        let sk = parse_secret_key(&generate_secret_key()).unwrap();
        let mut event = finalize_event(&template("hello"), &sk).unwrap();
        event.content = "tampered".to_string();
        assert!(!verify_event(&event).unwrap());
    }

    #[test]
    fn wrong_pubkey_fails_verification() {
        let sk = parse_secret_key(&generate_secret_key()).unwrap();
        let other = parse_secret_key(&generate_secret_key()).unwrap();
        let mut event = finalize_event(&template("hello"), &sk).unwrap();
        event.pubkey = derive_public_key(&other);
        assert!(!verify_event(&event).unwrap());
    }

    #[test]
    fn hex_and_nsec_decode_to_same_key() {
        let hex_key = generate_secret_key();
        let nsec = encode_nsec(&hex_key).unwrap();
        let from_hex = parse_secret_key(&hex_key).unwrap();
        let from_nsec = parse_secret_key(&nsec).unwrap();
        assert_eq!(from_hex.secret_bytes(), from_nsec.secret_bytes());
    }

    #[test]
    fn npub_encoding_is_stable() {
        let sk = parse_secret_key(&generate_secret_key()).unwrap();
        let pubkey = derive_public_key(&sk);
        let npub1 = encode_npub(&pubkey).unwrap();
        let npub2 = encode_npub(&pubkey).unwrap();
        assert_eq!(npub1, npub2);
        assert_eq!(decode_npub(&npub1).unwrap(), pubkey);
    }

    #[test]
    fn rejects_wrong_hrp() {
        let hex_key = generate_secret_key();
        let nsec = encode_nsec(&hex_key).unwrap();
        assert!(decode_npub(&nsec).is_err());
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!(parse_secret_key("not-hex").is_err());
        assert!(parse_secret_key("").is_err());
    }
}
