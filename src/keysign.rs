//! The keysign driver: select the signers, run the signing ceremony, and
//! release the signatures only after the notifier verified them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::blame::{self, Blame};
use crate::bridge::TssCommon;
use crate::coordinator::CeremonyState;
use crate::error::{JoinPartyError, TssError};
use crate::identity::{self, PeerId};
use crate::messages::SignatureData;
use crate::notifier::Notifier;
use crate::participants::{self, PartyId};
use crate::party::{KeysignSetup, PartyFactory};
use crate::server::{Status, TssServer};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysignRequest {
    /// The pool key generated by a previous keygen.
    pub pool_pub_key: String,
    /// Base64-encoded digests to sign.
    pub messages: Vec<String>,
    /// Account pub keys eligible to sign.
    pub signer_pub_keys: Vec<String>,
    /// Peers this caller believes offline; pruned from its candidate
    /// signer list before selection.
    pub excluded_peers: Vec<PeerId>,
}

impl KeysignRequest {
    /// Message ID over the pool key, the full signer set and the digests,
    /// so peers with different exclusion lists still meet in the same
    /// ceremony.
    pub fn msg_id(&self) -> Result<String, TssError> {
        let mut signers = self.signer_pub_keys.clone();
        signers.sort();
        let mut hasher = Sha256::new();
        hasher.update(b"keysign");
        hasher.update(self.pool_pub_key.as_bytes());
        for key in &signers {
            hasher.update(key.as_bytes());
        }
        for message in &self.decoded_messages()? {
            hasher.update(message);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn decoded_messages(&self) -> Result<Vec<Vec<u8>>, TssError> {
        self.messages
            .iter()
            .map(|m| {
                base64::decode(m)
                    .map_err(|e| TssError::InvalidRequest(format!("invalid message digest: {e}")))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysignResponse {
    pub signatures: Vec<SignatureData>,
    pub status: Status,
    pub blame: Blame,
}

impl KeysignResponse {
    pub fn new(signatures: Vec<SignatureData>, status: Status, blame: Blame) -> Self {
        Self {
            signatures,
            status,
            blame,
        }
    }

    fn fail(blame: Blame) -> Self {
        Self::new(vec![], Status::Fail, blame)
    }
}

impl<F: PartyFactory> TssServer<F> {
    /// Run one keysign ceremony. Nodes outside the selected signer set
    /// answer immediately with an empty success.
    pub async fn keysign(&self, req: KeysignRequest) -> Result<KeysignResponse, TssError> {
        let _flight = self.keysign_lock().lock().await;
        // Bad inputs fail before any network activity.
        if req.signer_pub_keys.is_empty() || req.messages.is_empty() {
            warn!("keysign request with no signers or no messages");
            return Ok(KeysignResponse::fail(Blame::new(
                blame::INTERNAL_ERROR,
                vec![],
            )));
        }
        let digests = match req.decoded_messages() {
            Ok(digests) => digests,
            Err(e) => {
                warn!(error = %e, "keysign request carries undecodable messages");
                return Ok(KeysignResponse::fail(Blame::new(
                    blame::INTERNAL_ERROR,
                    vec![],
                )));
            }
        };
        let msg_id = req.msg_id()?;
        info!(msg_id = %msg_id, pool = %req.pool_pub_key, "keysign request received");

        let Some(signers) = self.select_signers(&req)? else {
            // We are not among the selected signers; nothing to do.
            info!(msg_id = %msg_id, "we are not part of the signing party");
            return Ok(KeysignResponse::new(vec![], Status::Success, Blame::default()));
        };

        let channels = self.subscribe_ceremony(&msg_id);
        let result = self.keysign_inner(&req, &msg_id, digests, signers, channels).await;
        self.unsubscribe_ceremony(&msg_id);
        result
    }

    /// Deterministic signer selection: sort the candidate keys (the
    /// request's signer set minus the caller's exclusions) and take the
    /// first `threshold + 1`. Returns `None` when this node is not among
    /// them.
    fn select_signers(&self, req: &KeysignRequest) -> Result<Option<Vec<PartyId>>, TssError> {
        let mut candidates = Vec::with_capacity(req.signer_pub_keys.len());
        for key in &req.signer_pub_keys {
            let peer = identity::peer_id_from_bech32(key)?;
            if !req.excluded_peers.contains(&peer) {
                candidates.push(key.clone());
            }
        }
        let threshold = participants::threshold(req.signer_pub_keys.len())?;
        if candidates.len() <= threshold {
            return Err(TssError::InvalidRequest(format!(
                "not enough signers: {} candidates for threshold {}",
                candidates.len(),
                threshold
            )));
        }
        let local_key = self.node_keys().account_pub_key();
        if !candidates.contains(&local_key) {
            return Ok(None);
        }
        let (parties, local_party) = participants::get_parties(&candidates, &local_key)?;
        // Shares are selected on the sorted party list, not on the
        // request order.
        let signers: Vec<PartyId> = parties.into_iter().take(threshold + 1).collect();
        if !signers.contains(&local_party) {
            return Ok(None);
        }
        Ok(Some(signers))
    }

    async fn keysign_inner(
        &self,
        req: &KeysignRequest,
        msg_id: &str,
        digests: Vec<Vec<u8>>,
        signers: Vec<PartyId>,
        channels: crate::bridge::CeremonyChannels,
    ) -> Result<KeysignResponse, TssError> {
        let local_key = self.node_keys().account_pub_key();
        let local_party = signers
            .iter()
            .find(|p| p.pub_key() == local_key)
            .cloned()
            .expect("local party is a selected signer");
        let threshold = participants::threshold(req.signer_pub_keys.len())?;
        let local_state = self.storage().load(&req.pool_pub_key)?;
        let notifier = Notifier::new(
            msg_id.to_string(),
            digests.clone(),
            req.pool_pub_key.clone(),
        )?;

        let mut state = CeremonyState::GatheringParties;
        let common = TssCommon::new(
            msg_id.to_string(),
            self.node_keys_arc(),
            self.transport().clone(),
            &signers,
            local_party.clone(),
            self.stop_signal(),
        );

        let signer_keys: Vec<String> = signers.iter().map(|p| p.pub_key()).collect();
        let leader_peer = signers[0].peer_id();
        let signer_peers: Vec<PeerId> = signers.iter().map(|p| p.peer_id()).collect();
        match self
            .coordinator()
            .join_party_with_leader(
                msg_id,
                &signer_peers,
                &leader_peer,
                threshold,
                self.config().key_sign_timeout,
            )
            .await
        {
            Ok(_) => {}
            Err(JoinPartyError::Timeout(online)) => {
                error!(msg_id = %msg_id, online = ?online, "fail to form keysign party");
                let blame = blame::Manager::node_sync_blame(&signer_keys, &online)
                    .unwrap_or_else(|_| Blame::new(blame::INTERNAL_ERROR, vec![]));
                return Ok(KeysignResponse::fail(blame));
            }
            Err(e) => {
                error!(msg_id = %msg_id, error = %e, "error before we start join party");
                return Ok(KeysignResponse::fail(Blame::new(
                    blame::INTERNAL_ERROR,
                    vec![],
                )));
            }
        }
        state.advance(CeremonyState::Ready);
        info!(msg_id = %msg_id, "keysign party formed");

        let setup = KeysignSetup {
            parties: signers.clone(),
            local_party,
            threshold,
            msg_id: msg_id.to_string(),
            messages: digests,
            local_state,
        };
        let mut party = match self.factory().keysign_party(setup) {
            Ok(party) => party,
            Err(e) => {
                error!(error = %e, "fail to construct the keysign party");
                return Ok(KeysignResponse::fail(Blame::new(
                    blame::INTERNAL_ERROR,
                    vec![],
                )));
            }
        };

        state.advance(CeremonyState::Running);
        match common
            .run(party.as_mut(), channels, self.config().key_sign_timeout)
            .await
        {
            Ok(signatures) => {
                // The notifier gates the release: a batch that does not
                // verify against the pool key never reaches the caller.
                let verified = notifier
                    .process_signature(signatures)
                    .map_err(TssError::Conversion)?;
                if !verified {
                    state.advance(CeremonyState::Faulted);
                    self.count_keysign(false);
                    error!(msg_id = %msg_id, "produced signatures failed verification");
                    return Ok(KeysignResponse::fail(Blame::new(
                        blame::INTERNAL_ERROR,
                        vec![],
                    )));
                }
                let mut rx = notifier.take_response().expect("response not yet taken");
                let signatures = rx
                    .try_recv()
                    .map_err(|_| TssError::Internal("notifier released no batch".to_string()))?;
                state.advance(CeremonyState::Finished);
                self.count_keysign(true);
                info!(msg_id = %msg_id, "keysign finished");
                Ok(KeysignResponse::new(
                    signatures,
                    Status::Success,
                    common.get_blame(),
                ))
            }
            Err(e) => {
                state.advance(CeremonyState::Faulted);
                self.count_keysign(false);
                error!(msg_id = %msg_id, error = %e, "err in keysign");
                Ok(KeysignResponse::fail(common.get_blame()))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_msg_id_ignores_request_order_and_exclusions() {
        let req = KeysignRequest {
            pool_pub_key: "pool".to_string(),
            messages: vec![base64::encode(b"digest-one")],
            signer_pub_keys: vec!["b".to_string(), "a".to_string()],
            excluded_peers: vec![],
        };
        let mut shuffled = req.clone();
        shuffled.signer_pub_keys.reverse();
        shuffled.excluded_peers = vec![crate::identity::peer_id_from_pub_key_bytes(&[7; 33])];
        // Peers with different exclusion lists still meet in the same
        // ceremony.
        assert_eq!(req.msg_id().unwrap(), shuffled.msg_id().unwrap());

        let mut other = req.clone();
        other.messages = vec![base64::encode(b"digest-two")];
        assert_ne!(req.msg_id().unwrap(), other.msg_id().unwrap());
    }

    #[test]
    fn test_undecodable_messages_are_rejected() {
        let req = KeysignRequest {
            pool_pub_key: "pool".to_string(),
            messages: vec!["not base64!!".to_string()],
            signer_pub_keys: vec!["a".to_string()],
            excluded_peers: vec![],
        };
        assert!(req.decoded_messages().is_err());
    }
}
