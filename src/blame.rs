//! Fault attribution: classify ceremony failures and map them to the
//! account pub keys of the peers responsible.
//!
//! Whatever goes wrong mid-ceremony, the caller receives a `Blame` record
//! naming a fail reason from a closed set and the public keys held
//! responsible, with optional evidence attached per node.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::cache::LocalCacheItem;
use crate::error::ConversionError;
use crate::identity::{self, PeerId};
use crate::messages::WireMessage;
use crate::participants::{self, PartyId};

pub const HASH_CHECK_FAIL: &str = "hash-check-failed";
pub const TSS_TIMEOUT: &str = "tss-timeout";
pub const TSS_SYNC_FAIL: &str = "tss-sync-failed";
pub const INTERNAL_ERROR: &str = "internal-error";
pub const WRONG_SHARE: &str = "wrong-share";
pub const UNSUPPORTED_PROTOCOL: &str = "unsupported-protocol";

/// Which side an inconsistent broadcast hash was traced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashCheckKind {
    /// The mismatching confirmation came from the message owner itself.
    FromOwner,
    /// The mismatch was reported by other confirmers.
    FromPeer,
}

/// One blamed node, with optional evidence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlameNode {
    pub pubkey: String,
    pub blame_data: Option<Vec<u8>>,
    pub blame_signature: Option<Vec<u8>>,
}

impl BlameNode {
    pub fn new(pubkey: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
            blame_data: None,
            blame_signature: None,
        }
    }

    /// Nodes are deduplicated by pubkey and evidence signature.
    fn same(&self, other: &BlameNode) -> bool {
        self.pubkey == other.pubkey && self.blame_signature == other.blame_signature
    }
}

/// A fail reason and the set of public keys held responsible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blame {
    pub fail_reason: String,
    pub blame_nodes: Vec<BlameNode>,
}

impl Blame {
    pub fn new(reason: &str, blame_nodes: Vec<BlameNode>) -> Self {
        Self {
            fail_reason: reason.to_string(),
            blame_nodes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fail_reason.is_empty()
    }

    pub fn set_blame(&mut self, reason: &str, nodes: Vec<BlameNode>) {
        self.fail_reason = reason.to_string();
        self.add_blame_nodes(nodes);
    }

    /// Add nodes to the blame list, skipping duplicates.
    pub fn add_blame_nodes(&mut self, nodes: Vec<BlameNode>) {
        for node in nodes {
            if !self.blame_nodes.iter().any(|el| el.same(&node)) {
                self.blame_nodes.push(node);
            }
        }
    }

    pub fn pubkeys(&self) -> Vec<String> {
        self.blame_nodes.iter().map(|n| n.pubkey.clone()).collect()
    }
}

/// Per-ceremony blame bookkeeping and attribution policies.
///
/// The manager learns the party maps after join-party resolves, tracks
/// evidence as the ceremony runs (last round seen, unicast senders per
/// round), and turns failures into [`Blame`] records.
pub struct Manager {
    blame: Mutex<Blame>,
    party_id_map: Mutex<HashMap<String, PartyId>>,
    party_id_to_peer_id: Mutex<HashMap<String, PeerId>>,
    local_party_id: Mutex<Option<String>>,
    last_unicast_peer: Mutex<HashMap<String, Vec<PeerId>>>,
    last_msg_round: Mutex<Option<String>>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self {
            blame: Mutex::new(Blame::default()),
            party_id_map: Mutex::new(HashMap::new()),
            party_id_to_peer_id: Mutex::new(HashMap::new()),
            local_party_id: Mutex::new(None),
            last_unicast_peer: Mutex::new(HashMap::new()),
            last_msg_round: Mutex::new(None),
        }
    }

    /// Install the ceremony's party maps once the participant set is known.
    pub fn set_party_info(&self, party_id_map: HashMap<String, PartyId>, local_party_id: String) {
        *self.party_id_to_peer_id.lock() = participants::setup_id_maps(&party_id_map);
        *self.party_id_map.lock() = party_id_map;
        *self.local_party_id.lock() = Some(local_party_id);
    }

    pub fn update_last_msg_round(&self, round: &str) {
        *self.last_msg_round.lock() = Some(round.to_string());
    }

    pub fn last_msg_round(&self) -> Option<String> {
        self.last_msg_round.lock().clone()
    }

    /// Remember that `peer` sent us a unicast message in `round`.
    pub fn record_unicast(&self, round: &str, peer: PeerId) {
        let mut rounds = self.last_unicast_peer.lock();
        let peers = rounds.entry(round.to_string()).or_default();
        if !peers.contains(&peer) {
            peers.push(peer);
        }
    }

    pub fn has_unicast_round(&self, round: &str) -> bool {
        self.last_unicast_peer.lock().contains_key(round)
    }

    pub fn get_blame(&self) -> Blame {
        self.blame.lock().clone()
    }

    pub fn set_blame(&self, reason: &str, nodes: Vec<BlameNode>) {
        self.blame.lock().set_blame(reason, nodes);
    }

    pub fn add_blame_nodes(&self, nodes: Vec<BlameNode>) {
        self.blame.lock().add_blame_nodes(nodes);
    }

    /// Blame for a failed node sync: every requested key whose peer never
    /// became reachable during join-party.
    pub fn node_sync_blame(keys: &[String], online: &[PeerId]) -> Result<Blame, ConversionError> {
        let mut blame = Blame::new(TSS_SYNC_FAIL, vec![]);
        for key in keys {
            let peer = identity::peer_id_from_bech32(key)?;
            if !online.contains(&peer) {
                blame.add_blame_nodes(vec![BlameNode::new(key.clone())]);
            }
        }
        Ok(blame)
    }

    /// Blame for a broadcast-round timeout.
    ///
    /// Peers that confirmed some still-incomplete cache item were alive
    /// and standing by; everyone else (except ourselves) is blamed.
    pub fn get_broadcast_blame(
        &self,
        cache_items: &[LocalCacheItem],
        p2p_peer_count: usize,
    ) -> Result<Vec<BlameNode>, ConversionError> {
        let mut standby: Vec<PeerId> = Vec::new();
        for item in cache_items {
            if item.total_confirm_party() == p2p_peer_count {
                continue;
            }
            standby.extend(item.peers());
        }
        let pubkeys = self.pub_keys_by_peer_membership(&standby, false)?;
        Ok(pubkeys.into_iter().map(BlameNode::new).collect())
    }

    /// Blame for a unicast-round timeout: the parties that should have
    /// sent in `round` but did not.
    pub fn get_unicast_blame(&self, round: &str) -> Result<Vec<BlameNode>, ConversionError> {
        let senders = self
            .last_unicast_peer
            .lock()
            .get(round)
            .cloned()
            .unwrap_or_default();
        let pubkeys = self.pub_keys_by_peer_membership(&senders, false)?;
        Ok(pubkeys.into_iter().map(BlameNode::new).collect())
    }

    /// Blame for an inconsistent broadcast hash.
    ///
    /// The message owner is always blamed. When the mismatch came from
    /// other confirmers, the confirmations are partitioned by hash: if our
    /// hash has a 2/3 majority we blame every non-matching confirmer,
    /// otherwise only the other minority buckets (the majority may well be
    /// the honest one, and we the victim).
    pub fn hash_check_blame(
        &self,
        item: &LocalCacheItem,
        kind: HashCheckKind,
    ) -> Result<Vec<BlameNode>, ConversionError> {
        let owner_party = item
            .msg
            .as_ref()
            .map(|m| m.routing.from.clone())
            .ok_or_else(|| ConversionError::UnknownParty("<missing message>".to_string()))?;
        let owner_peer = self
            .party_id_to_peer_id
            .lock()
            .get(&owner_party)
            .cloned()
            .ok_or_else(|| ConversionError::UnknownParty(owner_party.clone()))?;

        let blamed_peers = match kind {
            HashCheckKind::FromOwner => vec![owner_peer],
            HashCheckKind::FromPeer => {
                let mut peers = self.find_blame_peers(item)?;
                peers.push(owner_peer);
                peers
            }
        };
        let pubkeys = self.pub_keys_by_peer_membership(&blamed_peers, true)?;
        Ok(pubkeys.into_iter().map(BlameNode::new).collect())
    }

    fn find_blame_peers(&self, item: &LocalCacheItem) -> Result<Vec<PeerId>, ConversionError> {
        let buckets = item.hash_to_peers();
        let threshold = participants::threshold(self.party_id_map.lock().len())?;
        let our_members = buckets.get(&item.hash).map_or(0, |b| b.len());

        let mut blamed = Vec::new();
        for (hash, peers) in &buckets {
            if *hash == item.hash {
                continue;
            }
            if our_members >= threshold || peers.len() < threshold {
                blamed.extend(peers.iter().cloned());
            }
        }
        Ok(blamed)
    }

    /// Blame for a share the crypto primitive rejected: the sender alone.
    pub fn wrong_share_blame(&self, wire_msg: &WireMessage) -> Result<String, ConversionError> {
        let map = self.party_id_map.lock();
        let owner = map
            .get(&wire_msg.routing.from)
            .ok_or_else(|| ConversionError::UnknownParty(wire_msg.routing.from.clone()))?;
        Ok(owner.pub_key())
    }

    /// Translate peers to account pub keys by membership in `peers`:
    /// `in_list` selects the parties whose peer is in the list, otherwise
    /// those missing from it. The local party is never blamed.
    fn pub_keys_by_peer_membership(
        &self,
        peers: &[PeerId],
        in_list: bool,
    ) -> Result<Vec<String>, ConversionError> {
        let local = self.local_party_id.lock().clone();
        let id_map = self.party_id_to_peer_id.lock();
        let mut party_ids: Vec<String> = id_map
            .iter()
            .filter(|(party_id, peer)| {
                Some(party_id.as_str()) != local.as_deref() && peers.contains(peer) == in_list
            })
            .map(|(party_id, _)| party_id.clone())
            .collect();
        party_ids.sort();
        participants::acc_pub_keys_from_party_ids(&party_ids, &self.party_id_map.lock())
    }
}

/// Log and fold a conversion failure into an internal-error blame; used
/// on paths where attribution itself fails.
pub fn blame_or_internal(result: Result<Vec<BlameNode>, ConversionError>, reason: &str) -> Blame {
    match result {
        Ok(nodes) => Blame::new(reason, nodes),
        Err(e) => {
            error!(error = %e, "fail to derive blame nodes");
            Blame::new(INTERNAL_ERROR, vec![])
        }
    }
}
