//! Keysign result gate: produced signatures are verified against the pool
//! public key before they are released to the caller.

use ecdsa::signature::Verifier;
use k256::ecdsa::{Signature, VerifyingKey};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{ConversionError, TssError};
use crate::identity;
use crate::messages::SignatureData;

/// Serialize a signature as 64 bytes `R || S`, each left-padded to 32
/// bytes, with S canonicalized to the low-S form.
pub fn signature_bytes(data: &SignatureData) -> Option<[u8; 64]> {
    if data.r.len() > 32 || data.s.len() > 32 {
        return None;
    }
    let mut buf = [0u8; 64];
    buf[32 - data.r.len()..32].copy_from_slice(&data.r);
    buf[64 - data.s.len()..64].copy_from_slice(&data.s);
    let sig = Signature::from_slice(&buf).ok()?;
    let sig = sig.normalize_s().unwrap_or(sig);
    Some(sig.to_bytes().into())
}

/// Verifies one keysign ceremony's signature batch and hands the result
/// to whoever holds the response channel. The channel has room for one
/// batch; later submissions find it closed.
pub struct Notifier {
    message_id: String,
    messages: Vec<Vec<u8>>,
    pool_pub_key: String,
    resp_tx: Mutex<Option<oneshot::Sender<Vec<SignatureData>>>>,
    resp_rx: Mutex<Option<oneshot::Receiver<Vec<SignatureData>>>>,
}

impl Notifier {
    pub fn new(
        message_id: String,
        messages: Vec<Vec<u8>>,
        pool_pub_key: String,
    ) -> Result<Self, TssError> {
        if message_id.is_empty() {
            return Err(TssError::InvalidRequest("message id is empty".to_string()));
        }
        if messages.is_empty() {
            return Err(TssError::InvalidRequest("messages are empty".to_string()));
        }
        if pool_pub_key.is_empty() {
            return Err(TssError::InvalidRequest("pool pubkey is empty".to_string()));
        }
        let (tx, rx) = oneshot::channel();
        Ok(Self {
            message_id,
            messages,
            pool_pub_key,
            resp_tx: Mutex::new(Some(tx)),
            resp_rx: Mutex::new(Some(rx)),
        })
    }

    /// Check a signature batch: one valid signature per requested message.
    fn verify_signature(&self, sigs: &[SignatureData]) -> Result<bool, ConversionError> {
        let pub_key = identity::bech32_to_pub_key(&self.pool_pub_key)?;
        let verifying = VerifyingKey::from_sec1_bytes(&pub_key)
            .map_err(|e| ConversionError::InvalidKey(e.to_string()))?;
        if sigs.len() != self.messages.len() {
            return Ok(false);
        }
        for message in &self.messages {
            let Some(data) = sigs.iter().find(|s| s.m == *message) else {
                return Ok(false);
            };
            let Some(raw) = signature_bytes(data) else {
                return Ok(false);
            };
            let Ok(signature) = Signature::from_slice(&raw) else {
                return Ok(false);
            };
            if verifying.verify(message, &signature).is_err() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Accept a signature batch from the ceremony.
    ///
    /// Returns true when the batch is complete and valid and has been
    /// released on the response channel; false means we keep waiting.
    pub fn process_signature(&self, sigs: Vec<SignatureData>) -> Result<bool, ConversionError> {
        if !self.verify_signature(&sigs)? {
            return Ok(false);
        }
        match self.resp_tx.lock().take() {
            Some(tx) => {
                let _ = tx.send(sigs);
            }
            None => debug!(msg_id = %self.message_id, "signature already delivered"),
        }
        Ok(true)
    }

    /// The receiving half; taken once by the keysign driver.
    pub fn take_response(&self) -> Option<oneshot::Receiver<Vec<SignatureData>>> {
        self.resp_rx.lock().take()
    }
}

#[cfg(test)]
mod test {
    use ecdsa::signature::Signer;
    use k256::ecdsa::SigningKey;
    use rand_core::OsRng;
    use sha2::{Digest, Sha256};

    use crate::identity::pub_key_to_bech32;

    use super::*;

    fn signed_fixture() -> (Notifier, Vec<SignatureData>) {
        let key = SigningKey::random(&mut OsRng);
        let pool_pub_key = pub_key_to_bech32(key.verifying_key().to_encoded_point(true).as_bytes());
        let digest = Sha256::digest(b"helloworld").to_vec();
        let sig: Signature = key.sign(&digest);
        let data = SignatureData {
            r: sig.r().to_bytes().to_vec(),
            s: sig.s().to_bytes().to_vec(),
            m: digest.clone(),
        };
        let notifier = Notifier::new("msg-1".to_string(), vec![digest], pool_pub_key).unwrap();
        (notifier, vec![data])
    }

    #[test]
    fn test_round_trip() {
        let (notifier, sigs) = signed_fixture();
        assert!(notifier.process_signature(sigs).unwrap());
        let mut rx = notifier.take_response().unwrap();
        assert_eq!(rx.try_recv().unwrap().len(), 1);
    }

    #[test]
    fn test_bit_flip_rejected() {
        let (notifier, mut sigs) = signed_fixture();
        sigs[0].r[0] ^= 1;
        assert!(!notifier.process_signature(sigs).unwrap());
    }

    #[test]
    fn test_count_mismatch_rejected() {
        let (notifier, sigs) = signed_fixture();
        let mut doubled = sigs.clone();
        doubled.extend(sigs);
        assert!(!notifier.process_signature(doubled).unwrap());
    }

    #[test]
    fn test_low_s_canonicalization() {
        // Whatever the primitive emits, the serialized S stays in the low
        // half of the order.
        let key = SigningKey::random(&mut OsRng);
        let digest = Sha256::digest(b"low-s").to_vec();
        let sig: Signature = key.sign(&digest);
        let data = SignatureData {
            r: sig.r().to_bytes().to_vec(),
            s: sig.s().to_bytes().to_vec(),
            m: digest,
        };
        let raw = signature_bytes(&data).unwrap();
        let parsed = Signature::from_slice(&raw).unwrap();
        assert!(parsed.normalize_s().is_none());
    }

    #[test]
    fn test_second_submission_finds_channel_closed() {
        let (notifier, sigs) = signed_fixture();
        assert!(notifier.process_signature(sigs.clone()).unwrap());
        let _ = notifier.take_response().unwrap();
        // Accepted but quietly dropped.
        assert!(notifier.process_signature(sigs).unwrap());
    }

    #[test]
    fn test_empty_inputs_rejected() {
        assert!(Notifier::new(String::new(), vec![vec![1]], "pk".to_string()).is_err());
        assert!(Notifier::new("id".to_string(), vec![], "pk".to_string()).is_err());
        assert!(Notifier::new("id".to_string(), vec![vec![1]], String::new()).is_err());
    }
}
