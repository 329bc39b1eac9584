//! The keygen driver: one distributed key generation from join-party to
//! a persisted share, or a blame record.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info};

use crate::blame::{self, Blame};
use crate::bridge::TssCommon;
use crate::coordinator::CeremonyState;
use crate::error::{JoinPartyError, TssError};
use crate::identity::{self, PeerId};
use crate::participants;
use crate::party::{KeygenSetup, PartyFactory};
use crate::server::{Status, TssServer};
use crate::storage::KeygenLocalState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenRequest {
    /// Account pub keys of every requested participant.
    pub keys: Vec<String>,
    /// Protocol identifiers the caller accepts.
    pub protos: Vec<String>,
    /// Pre-computed parameters for the primitive, if the caller has them.
    pub pre_params: Option<Vec<u8>>,
}

impl KeygenRequest {
    /// The ceremony-unique message ID: all honest peers derive the same
    /// value from the same request.
    pub fn msg_id(&self) -> String {
        let mut keys = self.keys.clone();
        keys.sort();
        let mut protos = self.protos.clone();
        protos.sort();
        let mut hasher = Sha256::new();
        hasher.update(b"keygen");
        for key in &keys {
            hasher.update(key.as_bytes());
        }
        for proto in &protos {
            hasher.update(proto.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenResponse {
    pub pub_key: String,
    pub address: String,
    pub status: Status,
    pub blame: Blame,
}

impl KeygenResponse {
    pub fn new(pub_key: String, address: String, status: Status, blame: Blame) -> Self {
        Self {
            pub_key,
            address,
            status,
            blame,
        }
    }

    fn fail(blame: Blame) -> Self {
        Self::new(String::new(), String::new(), Status::Fail, blame)
    }
}

impl<F: PartyFactory> TssServer<F> {
    /// Run one keygen ceremony. Runtime failures come back as
    /// `Status::Fail` with blame; an `Err` means the request itself was
    /// unusable.
    pub async fn keygen(&self, req: KeygenRequest) -> Result<KeygenResponse, TssError> {
        let _flight = self.keygen_lock().lock().await;
        if req.keys.len() < 2 {
            return Err(TssError::InvalidRequest(
                "keygen needs at least two participants".to_string(),
            ));
        }
        let msg_id = req.msg_id();
        info!(msg_id = %msg_id, "keygen request received");

        let channels = self.subscribe_ceremony(&msg_id);
        let result = self.keygen_inner(&req, &msg_id, channels).await;
        self.unsubscribe_ceremony(&msg_id);
        result
    }

    async fn keygen_inner(
        &self,
        req: &KeygenRequest,
        msg_id: &str,
        channels: crate::bridge::CeremonyChannels,
    ) -> Result<KeygenResponse, TssError> {
        let local_key = self.node_keys().account_pub_key();
        let (parties, local_party) = participants::get_parties(&req.keys, &local_key)?;
        let threshold = participants::threshold(parties.len())?;

        let mut state = CeremonyState::GatheringParties;
        let common = TssCommon::new(
            msg_id.to_string(),
            self.node_keys_arc(),
            self.transport().clone(),
            &parties,
            local_party.clone(),
            self.stop_signal(),
        );

        // The leader owns the lexically lowest pub key; parties are
        // already sorted, so that is the first entry.
        let leader_peer = parties[0].peer_id();
        let all_peers: Vec<PeerId> = parties.iter().map(|p| p.peer_id()).collect();
        match self
            .coordinator()
            .join_party_with_leader(
                msg_id,
                &all_peers,
                &leader_peer,
                threshold,
                self.config().key_gen_timeout,
            )
            .await
        {
            Ok(_) => {}
            Err(JoinPartyError::Timeout(online)) => {
                error!(msg_id = %msg_id, online = ?online, "fail to form keygen party");
                let blame = blame::Manager::node_sync_blame(&req.keys, &online)
                    .unwrap_or_else(|_| Blame::new(blame::INTERNAL_ERROR, vec![]));
                return Ok(KeygenResponse::fail(blame));
            }
            Err(e) => {
                error!(msg_id = %msg_id, error = %e, "error before we start join party");
                return Ok(KeygenResponse::fail(Blame::new(
                    blame::INTERNAL_ERROR,
                    vec![],
                )));
            }
        }
        state.advance(CeremonyState::Ready);

        if !req
            .protos
            .iter()
            .any(|p| p == &self.config().supported_protocol)
        {
            error!(
                protocol = %self.config().supported_protocol,
                "the negotiated protocol is not accepted by this request",
            );
            return Ok(KeygenResponse::fail(Blame::new(
                blame::UNSUPPORTED_PROTOCOL,
                vec![],
            )));
        }
        info!(msg_id = %msg_id, "keygen party formed");

        let setup = KeygenSetup {
            parties: parties.clone(),
            local_party,
            threshold,
            msg_id: msg_id.to_string(),
            pre_params: req.pre_params.clone().or_else(|| self.pre_params()),
        };
        let mut party = match self.factory().keygen_party(setup) {
            Ok(party) => party,
            Err(e) => {
                error!(error = %e, "fail to construct the keygen party");
                return Ok(KeygenResponse::fail(Blame::new(
                    blame::INTERNAL_ERROR,
                    vec![],
                )));
            }
        };

        state.advance(CeremonyState::Running);
        match common
            .run(party.as_mut(), channels, self.config().key_gen_timeout)
            .await
        {
            Ok(out) => {
                state.advance(CeremonyState::Finished);
                self.count_keygen(true);
                let pool_pub_key = identity::pub_key_to_bech32(&out.pub_key);
                let address = identity::address_from_pub_key(&out.pub_key);
                let mut participant_keys = req.keys.clone();
                participant_keys.sort();
                self.storage().save(&KeygenLocalState {
                    pub_key: pool_pub_key.clone(),
                    local_data: out.local_data,
                    participant_keys,
                    local_party_key: local_key,
                })?;
                info!(msg_id = %msg_id, pub_key = %pool_pub_key, "keygen finished");
                Ok(KeygenResponse::new(
                    pool_pub_key,
                    address,
                    Status::Success,
                    common.get_blame(),
                ))
            }
            Err(e) => {
                state.advance(CeremonyState::Faulted);
                self.count_keygen(false);
                error!(msg_id = %msg_id, error = %e, "err in keygen");
                Ok(KeygenResponse::fail(common.get_blame()))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_msg_id_is_order_independent() {
        let req = KeygenRequest {
            keys: vec!["b".to_string(), "a".to_string(), "c".to_string()],
            protos: vec!["p2".to_string(), "p1".to_string()],
            pre_params: None,
        };
        let mut shuffled = req.clone();
        shuffled.keys.rotate_left(1);
        shuffled.protos.reverse();
        assert_eq!(req.msg_id(), shuffled.msg_id());

        let mut other = req.clone();
        other.keys.push("d".to_string());
        assert_ne!(req.msg_id(), other.msg_id());
    }
}
