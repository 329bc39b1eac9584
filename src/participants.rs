//! This module holds the utilities for working with ceremony participants.
//!
//! Participants are referred to in three ways: by bech32 account pub key in
//! requests and blame, by party ID inside the crypto primitive, and by
//! peer-ID on the transport. Everything here is deterministic so that all
//! honest nodes compute the same assignment from the same request.

use core::fmt;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ConversionError;
use crate::identity::{self, PeerId};

/// Identifies one participant of a ceremony.
///
/// The `id` is the participant's index in the lexically sorted list of
/// account pub keys, as a decimal string. `key` holds the raw compressed
/// public key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartyId {
    pub id: String,
    pub key: Vec<u8>,
}

impl PartyId {
    /// The participant's index within the sorted party list.
    pub fn index(&self) -> PartyIndex {
        // The id is always produced from an enumerate() index.
        PartyIndex(self.id.parse().expect("party id is not numeric"))
    }

    pub fn pub_key(&self) -> String {
        identity::pub_key_to_bech32(&self.key)
    }

    pub fn peer_id(&self) -> PeerId {
        identity::peer_id_from_pub_key_bytes(&self.key)
    }
}

/// Represents a participant position inside the crypto primitive.
///
/// Each participant is uniquely identified by its index in the sorted
/// party list; a `u32` is enough for any realistic quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartyIndex(pub u32);

impl PartyIndex {
    pub fn party_id_str(&self) -> String {
        self.0.to_string()
    }
}

impl From<u32> for PartyIndex {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl fmt::Display for PartyIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sort the requested account pub keys and assign party IDs.
///
/// Returns the sorted party list together with the local node's entry.
/// Fails if any key does not decode or the local key is not in the list.
pub fn get_parties(
    keys: &[String],
    local_party_key: &str,
) -> Result<(Vec<PartyId>, PartyId), ConversionError> {
    let mut sorted = keys.to_owned();
    sorted.sort();
    sorted.dedup();

    let mut parties = Vec::with_capacity(sorted.len());
    let mut local_party = None;
    for (idx, item) in sorted.iter().enumerate() {
        let key = identity::bech32_to_pub_key(item)?;
        let party = PartyId {
            id: idx.to_string(),
            key,
        };
        if item == local_party_key {
            local_party = Some(party.clone());
        }
        parties.push(party);
    }

    let local_party = local_party.ok_or(ConversionError::LocalPartyMissing)?;
    Ok((parties, local_party))
}

/// `threshold(n) = ceil(2n/3) - 1`; a ceremony is ready with `threshold+1`
/// parties present.
pub fn threshold(parties: usize) -> Result<usize, ConversionError> {
    if parties == 0 {
        return Err(ConversionError::EmptyParties);
    }
    Ok((parties * 2).div_ceil(3) - 1)
}

/// Map each party ID string to its full [`PartyId`].
pub fn setup_party_id_map(parties: &[PartyId]) -> HashMap<String, PartyId> {
    parties.iter().map(|p| (p.id.clone(), p.clone())).collect()
}

/// Map each party ID string to the transport peer-ID of its owner.
pub fn setup_id_maps(party_id_map: &HashMap<String, PartyId>) -> HashMap<String, PeerId> {
    party_id_map
        .iter()
        .map(|(id, party)| (id.clone(), party.peer_id()))
        .collect()
}

/// All peer-IDs in the map except our own.
pub fn peers_excluding_self(
    party_id_to_peer_id: &HashMap<String, PeerId>,
    local_peer_id: &PeerId,
) -> Vec<PeerId> {
    party_id_to_peer_id
        .values()
        .filter(|p| *p != local_peer_id)
        .cloned()
        .collect()
}

/// Translate party ID strings into bech32 account pub keys.
pub fn acc_pub_keys_from_party_ids(
    party_ids: &[String],
    party_id_map: &HashMap<String, PartyId>,
) -> Result<Vec<String>, ConversionError> {
    let mut pub_keys = Vec::with_capacity(party_ids.len());
    for id in party_ids {
        let party = party_id_map
            .get(id)
            .ok_or_else(|| ConversionError::UnknownParty(id.clone()))?;
        pub_keys.push(party.pub_key());
    }
    Ok(pub_keys)
}
