//! Node identity and the conversions between its derived forms.
//!
//! Each node owns a secp256k1 private key. Two identifiers are derived from
//! the public key and used everywhere else in the crate: the bech32 account
//! pub key string (stable node identifier in requests and blame) and the
//! peer-ID used by the transport. The mapping between the two is a
//! deterministic bijection, so either form can be recovered from the other.

use core::fmt;

use bech32::{FromBase32, ToBase32, Variant};
use ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConversionError;

/// Human readable part of every account pub key this crate emits.
pub const PUBKEY_HRP: &str = "tsspub";

/// Transport-level identifier of a node, derived from its public key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The secp256k1 key pair a node runs with.
pub struct NodeKeys {
    signing: SigningKey,
}

impl NodeKeys {
    pub fn new(signing: SigningKey) -> Self {
        Self { signing }
    }

    /// Parse a node key from its 32 raw private key bytes.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ConversionError> {
        let signing =
            SigningKey::from_slice(raw).map_err(|e| ConversionError::InvalidKey(e.to_string()))?;
        Ok(Self { signing })
    }

    /// The SEC1 compressed public key, 33 bytes.
    pub fn pub_key_bytes(&self) -> Vec<u8> {
        self.signing
            .verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    /// The bech32 account pub key string for this node.
    pub fn account_pub_key(&self) -> String {
        pub_key_to_bech32(&self.pub_key_bytes())
    }

    pub fn peer_id(&self) -> PeerId {
        peer_id_from_pub_key_bytes(&self.pub_key_bytes())
    }

    /// Sign an outgoing wire message over `payload || message-ID`.
    ///
    /// ECDSA hashes its input with SHA-256, so this is a signature over
    /// `SHA256(payload || message-ID)`. Returns the fixed 64-byte `r || s`
    /// encoding.
    pub fn sign_envelope(&self, payload: &[u8], msg_id: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(payload.len() + msg_id.len());
        buf.extend_from_slice(payload);
        buf.extend_from_slice(msg_id.as_bytes());
        let sig: Signature = self.signing.sign(&buf);
        sig.to_bytes().to_vec()
    }
}

/// Verify a wire message envelope against the claimed sender's public key.
pub fn verify_envelope(pub_key: &[u8], payload: &[u8], msg_id: &str, sig: &[u8]) -> bool {
    let verifying = match VerifyingKey::from_sec1_bytes(pub_key) {
        Ok(vk) => vk,
        Err(_) => return false,
    };
    let signature = match Signature::from_slice(sig) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let mut buf = Vec::with_capacity(payload.len() + msg_id.len());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(msg_id.as_bytes());
    verifying.verify(&buf, &signature).is_ok()
}

/// Encode a compressed public key as a bech32 account pub key string.
pub fn pub_key_to_bech32(pub_key: &[u8]) -> String {
    // Encoding our own 33 bytes cannot fail.
    bech32::encode(PUBKEY_HRP, pub_key.to_base32(), Variant::Bech32)
        .expect("failed to bech32 encode pub key")
}

/// Decode a bech32 account pub key back into compressed public key bytes.
///
/// The key is checked to be a valid secp256k1 point, not just well-formed
/// bech32.
pub fn bech32_to_pub_key(key: &str) -> Result<Vec<u8>, ConversionError> {
    let (hrp, data, _) = bech32::decode(key).map_err(|e| ConversionError::InvalidPubKey {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    if hrp != PUBKEY_HRP {
        return Err(ConversionError::InvalidPubKey {
            key: key.to_string(),
            reason: format!("unexpected prefix {hrp}"),
        });
    }
    let raw = Vec::<u8>::from_base32(&data).map_err(|e| ConversionError::InvalidPubKey {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    VerifyingKey::from_sec1_bytes(&raw).map_err(|e| ConversionError::InvalidPubKey {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    Ok(raw)
}

/// Derive the transport peer-ID from compressed public key bytes.
pub fn peer_id_from_pub_key_bytes(pub_key: &[u8]) -> PeerId {
    PeerId(hex::encode(Sha256::digest(pub_key)))
}

/// A chain-agnostic address for a pool key: the first 20 bytes of the
/// hash of the compressed public key, hex encoded.
pub fn address_from_pub_key(pub_key: &[u8]) -> String {
    hex::encode(&Sha256::digest(pub_key)[..20])
}

/// Derive the transport peer-ID from a bech32 account pub key.
pub fn peer_id_from_bech32(key: &str) -> Result<PeerId, ConversionError> {
    Ok(peer_id_from_pub_key_bytes(&bech32_to_pub_key(key)?))
}

#[cfg(test)]
mod test {
    use rand_core::OsRng;

    use super::*;

    #[test]
    fn test_pub_key_round_trip() {
        let keys = NodeKeys::new(SigningKey::random(&mut OsRng));
        let acc = keys.account_pub_key();
        assert!(acc.starts_with(PUBKEY_HRP));
        let raw = bech32_to_pub_key(&acc).unwrap();
        assert_eq!(raw, keys.pub_key_bytes());
        assert_eq!(peer_id_from_bech32(&acc).unwrap(), keys.peer_id());
    }

    #[test]
    fn test_reject_foreign_prefix() {
        let encoded = bech32::encode("other", [1u8; 33].to_base32(), Variant::Bech32).unwrap();
        assert!(bech32_to_pub_key(&encoded).is_err());
    }

    #[test]
    fn test_envelope_round_trip() {
        let keys = NodeKeys::new(SigningKey::random(&mut OsRng));
        let sig = keys.sign_envelope(b"payload", "msg-id");
        assert!(verify_envelope(&keys.pub_key_bytes(), b"payload", "msg-id", &sig));
        // Tampering with any input must invalidate the envelope.
        assert!(!verify_envelope(&keys.pub_key_bytes(), b"payloae", "msg-id", &sig));
        assert!(!verify_envelope(&keys.pub_key_bytes(), b"payload", "msg-ie", &sig));
        let other = NodeKeys::new(SigningKey::random(&mut OsRng));
        assert!(!verify_envelope(&other.pub_key_bytes(), b"payload", "msg-id", &sig));
    }
}
