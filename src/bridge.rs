//! The bridge between the transport and the crypto primitive.
//!
//! One `TssCommon` exists per ceremony. Outgoing: it drains the party's
//! actions, wraps and signs each payload, and unicasts or broadcasts it.
//! Incoming: it demultiplexes wrapped messages by type, runs the hash-echo
//! confirm engine for broadcasts, and feeds confirmed payloads to the
//! party. It also keeps the evidence the blame engine needs (round store,
//! unicast senders) and holds teardown until the other participants have
//! reported their own completion.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::blame::{self, HashCheckKind};
use crate::cache::LocalCacheItem;
use crate::error::TssError;
use crate::identity::{verify_envelope, NodeKeys, PeerId};
use crate::messages::{
    BroadcastConfirmMessage, ControlRequestType, MessageType, Routing, TssControl,
    TssTaskNotifier, WireMessage, WrappedMessage, TSS_CONTROL_PROTOCOL, TSS_PROTOCOL,
};
use crate::participants::{self, PartyId, PartyIndex};
use crate::party::{Action, Party};
use crate::serde::{decode, encode};
use crate::transport::{InboundMessage, Transport};

/// How long we wait for the other participants' task-done notices after
/// our own party finished.
const TASK_DONE_GRACE: Duration = Duration::from_secs(5);

/// The four subscription channels of one ceremony.
pub struct CeremonyChannels {
    pub tss: mpsc::Receiver<InboundMessage>,
    pub ver: mpsc::Receiver<InboundMessage>,
    pub control: mpsc::Receiver<InboundMessage>,
    pub task_done: mpsc::Receiver<InboundMessage>,
}

pub struct TssCommon {
    msg_id: String,
    node_keys: Arc<NodeKeys>,
    transport: Arc<Transport>,
    local_party: PartyId,
    party_id_map: HashMap<String, PartyId>,
    party_id_to_peer_id: HashMap<String, PeerId>,
    p2p_peers: Vec<PeerId>,
    /// Broadcast messages awaiting their confirmation quorum.
    unconfirmed: Mutex<HashMap<String, Arc<Mutex<LocalCacheItem>>>>,
    /// Cache keys already fed to the party; late traffic for them is
    /// dropped, which is what makes delivery at-most-once.
    delivered: Mutex<HashSet<String>>,
    /// Round store: every broadcast we sent or accepted, for replay and
    /// blame evidence.
    msg_stored: Mutex<HashMap<String, WireMessage>>,
    /// Keys we already asked the owner to replay.
    replay_requested: Mutex<HashSet<String>>,
    task_done_peers: Mutex<HashSet<PeerId>>,
    blame_mgr: Arc<blame::Manager>,
    stop: watch::Receiver<bool>,
}

impl TssCommon {
    pub fn new(
        msg_id: String,
        node_keys: Arc<NodeKeys>,
        transport: Arc<Transport>,
        parties: &[PartyId],
        local_party: PartyId,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let party_id_map = participants::setup_party_id_map(parties);
        let party_id_to_peer_id = participants::setup_id_maps(&party_id_map);
        let p2p_peers =
            participants::peers_excluding_self(&party_id_to_peer_id, transport.local_peer_id());
        let blame_mgr = Arc::new(blame::Manager::new());
        blame_mgr.set_party_info(party_id_map.clone(), local_party.id.clone());
        Self {
            msg_id,
            node_keys,
            transport,
            local_party,
            party_id_map,
            party_id_to_peer_id,
            p2p_peers,
            unconfirmed: Mutex::new(HashMap::new()),
            delivered: Mutex::new(HashSet::new()),
            msg_stored: Mutex::new(HashMap::new()),
            replay_requested: Mutex::new(HashSet::new()),
            task_done_peers: Mutex::new(HashSet::new()),
            blame_mgr,
            stop,
        }
    }

    pub fn blame_manager(&self) -> &Arc<blame::Manager> {
        &self.blame_mgr
    }

    pub fn get_blame(&self) -> blame::Blame {
        self.blame_mgr.get_blame()
    }

    /// Drive the party until it returns its output or the ceremony times
    /// out. This is the message pump of a ceremony: everything the party
    /// sends and receives flows through here.
    pub async fn run<O>(
        &self,
        party: &mut dyn Party<Output = O>,
        mut channels: CeremonyChannels,
        op_timeout: Duration,
    ) -> Result<O, TssError> {
        let deadline = tokio::time::sleep(op_timeout);
        tokio::pin!(deadline);
        let mut stop = self.stop.clone();

        let mut output = self.pump_party(party).await?;
        while output.is_none() {
            tokio::select! {
                _ = &mut deadline => return Err(self.timeout_error()),
                _ = stop.changed() => return Err(TssError::Stopped),
                m = channels.tss.recv() => {
                    let m = m.ok_or(TssError::Stopped)?;
                    self.process_one_message(m, party).await?;
                }
                m = channels.ver.recv() => {
                    let m = m.ok_or(TssError::Stopped)?;
                    self.process_one_message(m, party).await?;
                }
                m = channels.control.recv() => {
                    let m = m.ok_or(TssError::Stopped)?;
                    self.process_one_message(m, party).await?;
                }
                m = channels.task_done.recv() => {
                    let m = m.ok_or(TssError::Stopped)?;
                    self.process_one_message(m, party).await?;
                }
            }
            output = self.pump_party(party).await?;
        }
        let output = output.expect("party output present");

        // Tell the others we are done, and give their final messages and
        // their own task-done notices a moment before tearing down, so
        // our teardown cannot race their last round.
        self.broadcast_task_done().await;
        self.wait_for_peers_done(&mut channels.task_done).await;
        Ok(output)
    }

    /// Drain the party's pending actions until it wants to wait or is
    /// finished.
    async fn pump_party<O>(
        &self,
        party: &mut dyn Party<Output = O>,
    ) -> Result<Option<O>, TssError> {
        loop {
            let action = party
                .poke()
                .map_err(|e| TssError::Internal(format!("party failed to advance: {e}")))?;
            match action {
                Action::Wait => return Ok(None),
                Action::Return(out) => return Ok(Some(out)),
                Action::SendMany { round, data } => self.broadcast_wire(&round, data).await,
                Action::SendPrivate { round, to, data } => {
                    self.unicast_wire(&round, &to, data).await
                }
            }
        }
    }

    /// Send one broadcast round message: store it, self-confirm, and send
    /// both the wire message and the immediate hash echo.
    async fn broadcast_wire(&self, round: &str, data: Vec<u8>) {
        let sig = self.node_keys.sign_envelope(&data, &self.msg_id);
        let wire = WireMessage {
            routing: Routing {
                from: self.local_party.id.clone(),
                to: None,
                is_broadcast: true,
            },
            round_info: round.to_string(),
            message: data,
            sig,
        };
        let key = wire.cache_key();
        let hash = hash_to_hex(&wire.message);
        self.blame_mgr.update_last_msg_round(round);
        self.msg_stored.lock().insert(key.clone(), wire.clone());

        {
            let item = self.get_or_create_cache_item(&key, Some(wire.clone()), &hash);
            item.lock()
                .update_confirm_list(self.transport.local_peer_id().clone(), hash.clone());
        }

        debug!(msg_id = %self.msg_id, round, "broadcast round message to all parties");
        self.transport
            .broadcast(&self.p2p_peers, TSS_PROTOCOL, &self.wrap(MessageType::TssMsg, &wire))
            .await;
        let confirm = BroadcastConfirmMessage {
            party_id: self.local_party.id.clone(),
            key,
            hash,
        };
        self.transport
            .broadcast(
                &self.p2p_peers,
                TSS_PROTOCOL,
                &self.wrap(MessageType::VerMsg, &confirm),
            )
            .await;
    }

    /// Send one unicast round message to the named parties.
    async fn unicast_wire(&self, round: &str, to: &[PartyIndex], data: Vec<u8>) {
        let sig = self.node_keys.sign_envelope(&data, &self.msg_id);
        let to_ids: Vec<String> = to.iter().map(|p| p.party_id_str()).collect();
        let wire = WireMessage {
            routing: Routing {
                from: self.local_party.id.clone(),
                to: Some(to_ids.clone()),
                is_broadcast: false,
            },
            round_info: round.to_string(),
            message: data,
            sig,
        };
        self.blame_mgr.update_last_msg_round(round);
        let wrapped = self.wrap(MessageType::TssMsg, &wire);
        for id in &to_ids {
            let Some(peer) = self.party_id_to_peer_id.get(id) else {
                warn!(party = %id, "unicast recipient is not part of this ceremony");
                continue;
            };
            if let Err(e) = self.transport.send_to_peer(peer, TSS_PROTOCOL, &wrapped).await {
                warn!(peer = %peer, error = %e, "fail to send unicast round message");
            }
        }
    }

    fn wrap<T: serde::Serialize>(&self, message_type: MessageType, payload: &T) -> WrappedMessage {
        WrappedMessage {
            message_type,
            msg_id: self.msg_id.clone(),
            payload: encode(payload),
        }
    }

    async fn process_one_message<O>(
        &self,
        inbound: InboundMessage,
        party: &mut dyn Party<Output = O>,
    ) -> Result<(), TssError> {
        match inbound.wrapped.message_type {
            MessageType::TssMsg => {
                let Ok(wire) = decode::<WireMessage>(&inbound.wrapped.payload) else {
                    debug!(peer = %inbound.from, "fail to decode wire message, dropping");
                    return Ok(());
                };
                self.process_tss_msg(inbound.from, wire, party).await
            }
            MessageType::VerMsg => {
                let Ok(confirm) = decode::<BroadcastConfirmMessage>(&inbound.wrapped.payload)
                else {
                    debug!(peer = %inbound.from, "fail to decode confirm message, dropping");
                    return Ok(());
                };
                self.process_ver_msg(inbound.from, confirm, party).await
            }
            MessageType::ControlMsg => {
                let Ok(control) = decode::<TssControl>(&inbound.wrapped.payload) else {
                    debug!(peer = %inbound.from, "fail to decode control message, dropping");
                    return Ok(());
                };
                self.process_control_msg(inbound.from, control, party)
            }
            MessageType::TaskDone => {
                self.task_done_peers.lock().insert(inbound.from);
                Ok(())
            }
        }
    }

    async fn process_tss_msg<O>(
        &self,
        from: PeerId,
        wire: WireMessage,
        party: &mut dyn Party<Output = O>,
    ) -> Result<(), TssError> {
        let Some(sender) = self.party_id_map.get(&wire.routing.from) else {
            debug!(party = %wire.routing.from, "wire message from unknown party, dropping");
            return Ok(());
        };
        if !verify_envelope(&sender.key, &wire.message, &self.msg_id, &wire.sig) {
            // Forged or replayed frame; remember the claimed sender in
            // case the ceremony ends in blame.
            warn!(party = %wire.routing.from, peer = %from, "invalid message signature, dropping");
            self.blame_mgr
                .add_blame_nodes(vec![blame::BlameNode::new(sender.pub_key())]);
            return Ok(());
        }
        self.blame_mgr.update_last_msg_round(&wire.round_info);

        if !wire.routing.is_broadcast {
            self.blame_mgr.record_unicast(&wire.round_info, from);
            return self.update_local(party, &wire);
        }

        let key = wire.cache_key();
        if self.delivered.lock().contains(&key) {
            debug!(key = %key, "broadcast message already delivered, dropping");
            return Ok(());
        }
        let hash = hash_to_hex(&wire.message);
        self.msg_stored.lock().insert(key.clone(), wire.clone());
        {
            let item = self.get_or_create_cache_item(&key, Some(wire), &hash);
            item.lock()
                .update_confirm_list(self.transport.local_peer_id().clone(), hash.clone());
        }

        let confirm = BroadcastConfirmMessage {
            party_id: self.local_party.id.clone(),
            key: key.clone(),
            hash,
        };
        self.transport
            .broadcast(
                &self.p2p_peers,
                TSS_PROTOCOL,
                &self.wrap(MessageType::VerMsg, &confirm),
            )
            .await;
        self.check_and_deliver(&key, party)
    }

    async fn process_ver_msg<O>(
        &self,
        from: PeerId,
        confirm: BroadcastConfirmMessage,
        party: &mut dyn Party<Output = O>,
    ) -> Result<(), TssError> {
        if self.delivered.lock().contains(&confirm.key) {
            return Ok(());
        }
        let needs_replay = {
            let item = self.get_or_create_cache_item(&confirm.key, None, &confirm.hash);
            let mut item = item.lock();
            item.update_confirm_list(from, confirm.hash.clone());
            item.msg.is_none() && item.total_confirm_party() >= self.p2p_peers.len()
        };
        if needs_replay {
            // Everyone else has the payload; ask its owner to replay it.
            self.request_round_replay(&confirm.key, &confirm.hash).await;
        }
        self.check_and_deliver(&confirm.key, party)
    }

    fn process_control_msg<O>(
        &self,
        from: PeerId,
        control: TssControl,
        party: &mut dyn Party<Output = O>,
    ) -> Result<(), TssError> {
        match control.msg {
            None => {
                // A replay request addressed to us; answer only if we own
                // the message, silence otherwise.
                let stored = self.msg_stored.lock().get(&control.req_key).cloned();
                let Some(stored) = stored else {
                    debug!(key = %control.req_key, "no stored message for replay request");
                    return Ok(());
                };
                if stored.routing.from != self.local_party.id {
                    return Ok(());
                }
                let reply = TssControl {
                    req_hash: control.req_hash,
                    req_key: control.req_key,
                    request_type: control.request_type,
                    msg: Some(stored),
                };
                let transport = Arc::clone(&self.transport);
                let wrapped = self.wrap(MessageType::ControlMsg, &reply);
                tokio::spawn(async move {
                    if let Err(e) = transport
                        .send_to_peer(&from, TSS_CONTROL_PROTOCOL, &wrapped)
                        .await
                    {
                        warn!(peer = %from, error = %e, "fail to answer replay request");
                    }
                });
                Ok(())
            }
            Some(wire) => {
                // A replayed message; accept it only when it matches the
                // hash we asked for and carries a valid envelope.
                if hash_to_hex(&wire.message) != control.req_hash {
                    debug!(key = %control.req_key, "replayed message does not match requested hash");
                    return Ok(());
                }
                let Some(sender) = self.party_id_map.get(&wire.routing.from) else {
                    return Ok(());
                };
                if !verify_envelope(&sender.key, &wire.message, &self.msg_id, &wire.sig) {
                    warn!(peer = %from, "replayed message carries an invalid signature");
                    return Ok(());
                }
                let key = wire.cache_key();
                if !self.delivered.lock().insert(key.clone()) {
                    return Ok(());
                }
                self.unconfirmed.lock().remove(&key);
                info!(key = %key, "recovered a missing round message via replay");
                self.update_local(party, &wire)
            }
        }
    }

    /// Ask the owner of a cache key to replay the payload we are missing.
    async fn request_round_replay(&self, key: &str, hash: &str) {
        if !self.replay_requested.lock().insert(key.to_string()) {
            return;
        }
        let Some((_, owner_party)) = key.rsplit_once('-') else {
            return;
        };
        let Some(owner_peer) = self.party_id_to_peer_id.get(owner_party) else {
            return;
        };
        let request = TssControl {
            req_hash: hash.to_string(),
            req_key: key.to_string(),
            request_type: ControlRequestType::Replay,
            msg: None,
        };
        debug!(key = %key, owner = %owner_peer, "requesting round replay");
        if let Err(e) = self
            .transport
            .send_to_peer(
                owner_peer,
                TSS_CONTROL_PROTOCOL,
                &self.wrap(MessageType::ControlMsg, &request),
            )
            .await
        {
            warn!(peer = %owner_peer, error = %e, "fail to request round replay");
        }
    }

    /// Deliver a cache item to the party once it is complete: message
    /// present, confirmations from all other participants, all hashes
    /// equal. Inconsistent hashes abort the ceremony with hash-check
    /// blame instead.
    fn check_and_deliver<O>(
        &self,
        key: &str,
        party: &mut dyn Party<Output = O>,
    ) -> Result<(), TssError> {
        let Some(item) = self.unconfirmed.lock().get(key).cloned() else {
            return Ok(());
        };
        let item = item.lock();
        if item.total_confirm_party() < self.party_id_map.len() - 1 || item.msg.is_none() {
            return Ok(());
        }
        if !item.consistent() {
            let owner_party = item.msg.as_ref().map(|m| m.routing.from.clone());
            let kind = self.classify_hash_mismatch(&item, owner_party.as_deref());
            let nodes = self.blame_mgr.hash_check_blame(&item, kind);
            let blame = blame::blame_or_internal(nodes, blame::HASH_CHECK_FAIL);
            self.blame_mgr
                .set_blame(&blame.fail_reason, blame.blame_nodes);
            warn!(key = %key, "broadcast hash check failed");
            return Err(TssError::HashCheck {
                key: key.to_string(),
            });
        }
        let wire = item.msg.clone().expect("message present");
        drop(item);

        self.delivered.lock().insert(key.to_string());
        self.unconfirmed.lock().remove(key);

        if wire.routing.from == self.local_party.id {
            // Our own broadcast came back confirmed; nothing to feed.
            return Ok(());
        }
        self.update_local(party, &wire)
    }

    /// Whether the inconsistent hash was reported by the data owner
    /// itself or by other confirmers.
    fn classify_hash_mismatch(&self, item: &LocalCacheItem, owner_party: Option<&str>) -> HashCheckKind {
        let owner_peer = owner_party.and_then(|p| self.party_id_to_peer_id.get(p));
        if let Some(owner_peer) = owner_peer {
            if item.mismatched_peers().contains(owner_peer) {
                return HashCheckKind::FromOwner;
            }
        }
        HashCheckKind::FromPeer
    }

    /// Apply one wire message to the local party. A rejected share aborts
    /// the ceremony and blames the sender, with the message attached as
    /// evidence.
    fn update_local<O>(
        &self,
        party: &mut dyn Party<Output = O>,
        wire: &WireMessage,
    ) -> Result<(), TssError> {
        let Some(sender) = self.party_id_map.get(&wire.routing.from) else {
            debug!(party = %wire.routing.from, "message from party outside the ceremony");
            return Ok(());
        };
        match party.message(
            sender.index(),
            &wire.round_info,
            &wire.message,
            wire.routing.is_broadcast,
        ) {
            Ok(()) => Ok(()),
            Err(e) => {
                let node = match self.blame_mgr.wrong_share_blame(wire) {
                    Ok(pubkey) => blame::BlameNode {
                        pubkey,
                        blame_data: Some(wire.message.clone()),
                        blame_signature: Some(wire.sig.clone()),
                    },
                    Err(_) => blame::BlameNode::new(sender.pub_key()),
                };
                self.blame_mgr.set_blame(blame::WRONG_SHARE, vec![node]);
                Err(TssError::WrongShare {
                    party_id: wire.routing.from.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn get_or_create_cache_item(
        &self,
        key: &str,
        msg: Option<WireMessage>,
        hash: &str,
    ) -> Arc<Mutex<LocalCacheItem>> {
        let mut unconfirmed = self.unconfirmed.lock();
        let item = unconfirmed
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(LocalCacheItem::new(None, hash.to_string()))))
            .clone();
        drop(unconfirmed);
        if let Some(msg) = msg {
            let mut guard = item.lock();
            if guard.msg.is_none() {
                guard.hash = hash.to_string();
                guard.msg = Some(msg);
            }
        }
        item
    }

    /// Translate a ceremony timeout into blame for the round that stalled.
    fn timeout_error(&self) -> TssError {
        let last_round = self.blame_mgr.last_msg_round();
        let nodes = match last_round.as_deref() {
            Some(round) if self.blame_mgr.has_unicast_round(round) => {
                self.blame_mgr.get_unicast_blame(round)
            }
            _ => {
                let items: Vec<LocalCacheItem> = self
                    .unconfirmed
                    .lock()
                    .values()
                    .map(|item| item.lock().clone())
                    .collect();
                self.blame_mgr
                    .get_broadcast_blame(&items, self.p2p_peers.len())
            }
        };
        let blame = blame::blame_or_internal(nodes, blame::TSS_TIMEOUT);
        self.blame_mgr
            .set_blame(&blame.fail_reason, blame.blame_nodes);
        warn!(msg_id = %self.msg_id, round = ?last_round, "ceremony timed out");
        TssError::Timeout { last_round }
    }

    async fn broadcast_task_done(&self) {
        let notifier = TssTaskNotifier { task_done: true };
        self.transport
            .broadcast(
                &self.p2p_peers,
                TSS_PROTOCOL,
                &self.wrap(MessageType::TaskDone, &notifier),
            )
            .await;
    }

    /// Wait for the other participants to report completion, bounded by a
    /// small grace period.
    async fn wait_for_peers_done(&self, task_done: &mut mpsc::Receiver<InboundMessage>) {
        let deadline = tokio::time::sleep(TASK_DONE_GRACE);
        tokio::pin!(deadline);
        loop {
            if self.task_done_peers.lock().len() >= self.p2p_peers.len() {
                info!(msg_id = %self.msg_id, "all parties reported task done");
                return;
            }
            tokio::select! {
                _ = &mut deadline => {
                    debug!(msg_id = %self.msg_id, "gave up waiting for task done notices");
                    return;
                }
                m = task_done.recv() => {
                    let Some(m) = m else { return };
                    if m.wrapped.message_type == MessageType::TaskDone {
                        self.task_done_peers.lock().insert(m.from);
                    }
                }
            }
        }
    }
}

fn hash_to_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod test {
    use k256::ecdsa::SigningKey;
    use rand_core::OsRng;

    use crate::participants::{get_parties, PartyIndex};

    use super::*;

    /// A party that records every message it is fed.
    #[derive(Default)]
    struct RecordingParty {
        received: Vec<(PartyIndex, String, Vec<u8>)>,
    }

    impl Party for RecordingParty {
        type Output = ();

        fn poke(&mut self) -> Result<Action<()>, crate::party::PartyError> {
            Ok(Action::Wait)
        }

        fn message(
            &mut self,
            from: PartyIndex,
            round: &str,
            data: &[u8],
            _is_broadcast: bool,
        ) -> Result<(), crate::party::PartyError> {
            self.received.push((from, round.to_string(), data.to_vec()));
            Ok(())
        }
    }

    struct Fixture {
        common: TssCommon,
        node_keys: Vec<Arc<NodeKeys>>,
        parties: Vec<PartyId>,
        local_index: usize,
        _stops: Vec<watch::Sender<bool>>,
    }

    /// Three nodes with live transports; the common instance under test
    /// runs on the node owning the lexically first pub key.
    async fn fixture() -> Fixture {
        let node_keys: Vec<Arc<NodeKeys>> = (0..3)
            .map(|_| Arc::new(NodeKeys::new(SigningKey::random(&mut OsRng))))
            .collect();
        let pub_keys: Vec<String> = node_keys.iter().map(|k| k.account_pub_key()).collect();

        let mut stops = Vec::new();
        let mut transports = Vec::new();
        for keys in &node_keys {
            let (tx, rx) = watch::channel(false);
            let transport =
                Transport::new("127.0.0.1:0".parse().unwrap(), keys.peer_id(), false, rx)
                    .await
                    .unwrap();
            stops.push(tx);
            transports.push(transport);
        }
        for a in &transports {
            for b in &transports {
                a.add_peer(b.local_peer_id().clone(), b.local_addr());
            }
        }

        let local_index = 0;
        let local_key = &node_keys[local_index];
        let (parties, local_party) =
            get_parties(&pub_keys, &local_key.account_pub_key()).unwrap();
        let common = TssCommon::new(
            "msg-test".to_string(),
            Arc::clone(local_key),
            Arc::clone(&transports[local_index]),
            &parties,
            local_party,
            stops[local_index].subscribe(),
        );
        Fixture {
            common,
            node_keys,
            parties,
            local_index,
            _stops: stops,
        }
    }

    impl Fixture {
        /// A signed broadcast wire message from the node holding `keys`.
        fn broadcast_from(&self, keys: &NodeKeys, round: &str, data: &[u8]) -> WireMessage {
            let party = self
                .parties
                .iter()
                .find(|p| p.pub_key() == keys.account_pub_key())
                .unwrap();
            WireMessage {
                routing: Routing {
                    from: party.id.clone(),
                    to: None,
                    is_broadcast: true,
                },
                round_info: round.to_string(),
                message: data.to_vec(),
                sig: keys.sign_envelope(data, "msg-test"),
            }
        }

        fn other_keys(&self) -> Vec<&Arc<NodeKeys>> {
            self.node_keys
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != self.local_index)
                .map(|(_, k)| k)
                .collect()
        }
    }

    #[tokio::test]
    async fn test_confirm_before_deliver_and_at_most_once() {
        let fx = fixture().await;
        let mut party = RecordingParty::default();
        let others = fx.other_keys();
        let sender = others[0];
        let observer = others[1];

        let wire = fx.broadcast_from(sender, "round-1", b"payload");
        let key = wire.cache_key();
        let hash = hash_to_hex(&wire.message);

        // Message + our own confirmation is not a quorum yet.
        fx.common
            .process_tss_msg(sender.peer_id(), wire, &mut party)
            .await
            .unwrap();
        assert!(party.received.is_empty());

        // The second confirmation completes the quorum.
        let confirm = BroadcastConfirmMessage {
            party_id: "x".to_string(),
            key: key.clone(),
            hash: hash.clone(),
        };
        fx.common
            .process_ver_msg(observer.peer_id(), confirm.clone(), &mut party)
            .await
            .unwrap();
        assert_eq!(party.received.len(), 1);
        assert_eq!(party.received[0].1, "round-1");

        // Late confirms for an evicted key change nothing.
        fx.common
            .process_ver_msg(observer.peer_id(), confirm, &mut party)
            .await
            .unwrap();
        assert_eq!(party.received.len(), 1);
    }

    #[tokio::test]
    async fn test_equivocation_raises_hash_check_blame() {
        let fx = fixture().await;
        let mut party = RecordingParty::default();
        let others = fx.other_keys();
        let sender = others[0];
        let observer = others[1];

        let wire = fx.broadcast_from(sender, "round-1", b"payload-to-us");
        let key = wire.cache_key();
        fx.common
            .process_tss_msg(sender.peer_id(), wire, &mut party)
            .await
            .unwrap();

        // The observer saw a different payload from the same sender.
        let confirm = BroadcastConfirmMessage {
            party_id: "x".to_string(),
            key,
            hash: hash_to_hex(b"payload-to-them"),
        };
        let err = fx
            .common
            .process_ver_msg(observer.peer_id(), confirm, &mut party)
            .await
            .unwrap_err();
        assert!(matches!(err, TssError::HashCheck { .. }));
        assert!(party.received.is_empty());

        let blame = fx.common.get_blame();
        assert_eq!(blame.fail_reason, blame::HASH_CHECK_FAIL);
        assert!(blame.pubkeys().contains(&sender.account_pub_key()));
    }

    #[tokio::test]
    async fn test_forged_envelope_is_dropped() {
        let fx = fixture().await;
        let mut party = RecordingParty::default();
        let others = fx.other_keys();
        let sender = others[0];

        let mut wire = fx.broadcast_from(sender, "round-1", b"payload");
        wire.sig[10] ^= 0xff;
        fx.common
            .process_tss_msg(sender.peer_id(), wire, &mut party)
            .await
            .unwrap();
        assert!(party.received.is_empty());
        // No cache item was even created.
        assert!(fx.common.unconfirmed.lock().is_empty());
        // The claimed sender is remembered as a blame candidate.
        assert!(fx
            .common
            .get_blame()
            .pubkeys()
            .contains(&sender.account_pub_key()));
    }

    #[tokio::test]
    async fn test_unicast_bypasses_cache() {
        let fx = fixture().await;
        let mut party = RecordingParty::default();
        let others = fx.other_keys();
        let sender = others[0];

        let data = b"secret share".to_vec();
        let sender_party = fx
            .parties
            .iter()
            .find(|p| p.pub_key() == sender.account_pub_key())
            .unwrap();
        let wire = WireMessage {
            routing: Routing {
                from: sender_party.id.clone(),
                to: Some(vec![fx.common.local_party.id.clone()]),
                is_broadcast: false,
            },
            round_info: "round-2".to_string(),
            message: data.clone(),
            sig: sender.sign_envelope(&data, "msg-test"),
        };
        fx.common
            .process_tss_msg(sender.peer_id(), wire, &mut party)
            .await
            .unwrap();
        // Delivered immediately, no confirmation quorum involved.
        assert_eq!(party.received.len(), 1);
        assert!(fx.common.unconfirmed.lock().is_empty());
        assert!(fx.common.blame_mgr.has_unicast_round("round-2"));
    }

    #[tokio::test]
    async fn test_replay_request_answered_from_round_store() {
        let fx = fixture().await;
        let mut party = RecordingParty::default();

        // Our own broadcast is stored for replay.
        fx.common.broadcast_wire("round-1", b"own payload".to_vec()).await;
        let key = crate::messages::cache_key("round-1", &fx.common.local_party.id);
        assert!(fx.common.msg_stored.lock().contains_key(&key));

        // A replay request for someone else's message stays unanswered;
        // for our own it must not error.
        let request = TssControl {
            req_hash: hash_to_hex(b"own payload"),
            req_key: key,
            request_type: ControlRequestType::Replay,
            msg: None,
        };
        fx.common
            .process_control_msg(fx.other_keys()[0].peer_id(), request, &mut party)
            .unwrap();
    }
}
