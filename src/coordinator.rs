//! The party coordinator: agree on the exact participant set of a
//! ceremony before any crypto runs.
//!
//! One peer acts as leader: the one whose account pub key sorts lowest in
//! the requested set, so every honest node picks the same leader without
//! communication. The leader keeps a [`Ceremony`] record per message ID;
//! followers send it a join request and block on the response. Once every
//! allowed peer has joined, the leader answers all of them with the agreed
//! set; otherwise the ceremony times out and the waiters learn which peers
//! were reachable, which is what blame is derived from.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::{JoinPartyError, TransportError};
use crate::identity::PeerId;
use crate::messages::{
    JoinPartyRequest, JoinPartyResponse, JoinPartyResponseType, JOIN_PARTY_PROTOCOL,
};
use crate::serde::{decode, encode};
use crate::transport::{JoinPartyStream, Transport};

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Lifecycle of one ceremony. Transitions are monotone; a ceremony that
/// reached a terminal state ignores later events, so a `Finished` ceremony
/// ignores a timeout landing in the same scheduling quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CeremonyState {
    GatheringParties,
    Ready,
    Running,
    Finished,
    TimedOut,
    Faulted,
}

impl CeremonyState {
    fn rank(self) -> u8 {
        match self {
            CeremonyState::GatheringParties => 0,
            CeremonyState::Ready => 1,
            CeremonyState::Running => 2,
            CeremonyState::Finished | CeremonyState::TimedOut | CeremonyState::Faulted => 3,
        }
    }

    /// Try to advance to `next`; returns false when the transition is not
    /// monotone and must be ignored.
    pub fn advance(&mut self, next: CeremonyState) -> bool {
        if next.rank() <= self.rank() {
            return false;
        }
        *self = next;
        true
    }
}

struct JoinWaiter {
    peer: PeerId,
    resp: oneshot::Sender<JoinPartyResponse>,
}

/// Leader-side record of one ceremony being gathered.
struct Ceremony {
    id: String,
    allowed: Vec<PeerId>,
    threshold: usize,
    state: CeremonyState,
    joined: Vec<JoinWaiter>,
}

impl Ceremony {
    fn valid_peer(&self, peer: &PeerId) -> bool {
        self.allowed.contains(peer)
    }

    /// Ready once every allowed peer joined; the allowed set is never
    /// smaller than `threshold + 1`.
    fn is_ready(&self) -> bool {
        self.joined.len() > self.threshold && self.joined.len() == self.allowed.len()
    }

    fn parties(&self) -> Vec<PeerId> {
        self.joined.iter().map(|w| w.peer.clone()).collect()
    }
}

pub struct PartyCoordinator {
    transport: Arc<Transport>,
    ceremonies: Mutex<HashMap<String, Ceremony>>,
    stop: watch::Receiver<bool>,
}

impl PartyCoordinator {
    /// Create the coordinator and start consuming inbound join-party
    /// streams from the transport.
    pub fn new(transport: Arc<Transport>, stop: watch::Receiver<bool>) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            transport: Arc::clone(&transport),
            ceremonies: Mutex::new(HashMap::new()),
            stop,
        });
        if let Some(rx) = transport.take_join_party_streams() {
            tokio::spawn(Arc::clone(&coordinator).dispatch(rx));
        }
        coordinator
    }

    /// Join a ceremony, as leader or follower depending on who sorts
    /// lowest. Returns the agreed participant set.
    pub async fn join_party_with_leader(
        self: &Arc<Self>,
        msg_id: &str,
        peers: &[PeerId],
        leader: &PeerId,
        threshold: usize,
        ceremony_timeout: Duration,
    ) -> Result<Vec<PeerId>, JoinPartyError> {
        let request = JoinPartyRequest {
            id: msg_id.to_string(),
        };
        if leader == self.transport.local_peer_id() {
            info!(msg_id, threshold, "we are the leader, create ceremony");
            self.create_ceremony(msg_id, peers.to_vec(), threshold, ceremony_timeout);
            let resp = self
                .process_join_party(self.transport.local_peer_id().clone(), &request)
                .await;
            response_to_result(resp)
        } else {
            self.join_as_follower(leader, &request, ceremony_timeout).await
        }
    }

    /// Register a new ceremony and arm its timeout.
    fn create_ceremony(
        self: &Arc<Self>,
        msg_id: &str,
        allowed: Vec<PeerId>,
        threshold: usize,
        ceremony_timeout: Duration,
    ) {
        let ceremony = Ceremony {
            id: msg_id.to_string(),
            allowed,
            threshold,
            state: CeremonyState::GatheringParties,
            joined: Vec::new(),
        };
        self.ceremonies.lock().insert(msg_id.to_string(), ceremony);

        let msg_id = msg_id.to_string();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut stop = this.stop.clone();
            tokio::select! {
                _ = tokio::time::sleep(ceremony_timeout) => {
                    this.expire_ceremony(&msg_id, JoinPartyResponseType::Timeout);
                }
                _ = stop.changed() => {
                    this.expire_ceremony(&msg_id, JoinPartyResponseType::Unknown);
                }
            }
        });
    }

    /// Resolve a ceremony that did not form: answer every waiter with the
    /// reachable set and remove the record.
    fn expire_ceremony(&self, msg_id: &str, kind: JoinPartyResponseType) {
        let mut ceremonies = self.ceremonies.lock();
        let Some(ceremony) = ceremonies.get_mut(msg_id) else {
            return;
        };
        if !ceremony.state.advance(CeremonyState::TimedOut) {
            return;
        }
        let online = ceremony.parties();
        let resp = JoinPartyResponse {
            id: msg_id.to_string(),
            response_type: kind,
            peer_ids: online,
        };
        warn!(msg_id, peers = ?resp.peer_ids, "ceremony did not form in time");
        let ceremony = ceremonies.remove(msg_id).expect("ceremony present");
        for waiter in ceremony.joined {
            let _ = waiter.resp.send(resp.clone());
        }
    }

    async fn dispatch(self: Arc<Self>, mut rx: tokio::sync::mpsc::Receiver<JoinPartyStream>) {
        let mut stop = self.stop.clone();
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    debug!("party coordinator stopping");
                    return;
                }
                join = rx.recv() => {
                    let Some(join) = join else { return };
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.handle_join_stream(join).await });
                }
            }
        }
    }

    async fn handle_join_stream(&self, join: JoinPartyStream) {
        let from = join.from.clone();
        let resp = self.process_join_party(from.clone(), &join.request).await;
        if let Err(e) = join.respond(&resp).await {
            debug!(peer = %from, error = %e, "fail to write join party response");
        }
    }

    /// The leader algorithm: look the ceremony up, admit or reject the
    /// peer, and answer immediately when its arrival completes the set.
    /// Otherwise the caller blocks on the response channel until the
    /// ceremony is ready or times out.
    async fn process_join_party(
        &self,
        from: PeerId,
        request: &JoinPartyRequest,
    ) -> JoinPartyResponse {
        debug!(msg_id = %request.id, peer = %from, "get join party request");
        let rx = {
            let mut ceremonies = self.ceremonies.lock();
            let Some(ceremony) = ceremonies.get_mut(&request.id) else {
                // Leader node doesn't have the request yet.
                return JoinPartyResponse {
                    id: request.id.clone(),
                    response_type: JoinPartyResponseType::LeaderNotReady,
                    peer_ids: vec![],
                };
            };
            if !ceremony.valid_peer(&from) {
                return JoinPartyResponse {
                    id: request.id.clone(),
                    response_type: JoinPartyResponseType::UnknownPeer,
                    peer_ids: vec![],
                };
            }
            // A follower that withdrew before the ceremony resolved just
            // drops out of the join list.
            ceremony.joined.retain(|w| !w.resp.is_closed());
            let (tx, rx) = oneshot::channel();
            match ceremony.joined.iter_mut().find(|w| w.peer == from) {
                // A duplicate join is idempotent: the list does not grow,
                // the new request just takes over as the peer's waiter.
                Some(waiter) => waiter.resp = tx,
                None => ceremony.joined.push(JoinWaiter {
                    peer: from.clone(),
                    resp: tx,
                }),
            }
            if ceremony.is_ready() {
                ceremony.state.advance(CeremonyState::Ready);
                let resp = JoinPartyResponse {
                    id: ceremony.id.clone(),
                    response_type: JoinPartyResponseType::Success,
                    peer_ids: ceremony.parties(),
                };
                info!(msg_id = %request.id, peers = ?resp.peer_ids, "party formed");
                ceremony.state.advance(CeremonyState::Finished);
                let ceremony = ceremonies.remove(&request.id).expect("ceremony present");
                for waiter in ceremony.joined {
                    let _ = waiter.resp.send(resp.clone());
                }
            }
            rx
        };
        match rx.await {
            Ok(resp) => resp,
            // Ceremony dropped without an answer; only happens on shutdown.
            Err(_) => JoinPartyResponse {
                id: request.id.clone(),
                response_type: JoinPartyResponseType::Unknown,
                peer_ids: vec![],
            },
        }
    }

    /// Send the join request to the leader, retrying with exponential
    /// backoff while the leader is not ready, bounded by the ceremony
    /// timeout.
    async fn join_as_follower(
        &self,
        leader: &PeerId,
        request: &JoinPartyRequest,
        ceremony_timeout: Duration,
    ) -> Result<Vec<PeerId>, JoinPartyError> {
        let deadline = tokio::time::Instant::now() + ceremony_timeout;
        let mut backoff = BACKOFF_BASE;
        let mut leader_reachable = false;
        loop {
            match self.request_once(leader, request, ceremony_timeout).await {
                Ok(resp) => match resp.response_type {
                    JoinPartyResponseType::LeaderNotReady | JoinPartyResponseType::Unknown => {
                        debug!(msg_id = %request.id, "leader is not ready, will retry");
                        leader_reachable = true;
                    }
                    _ => return response_to_result(resp),
                },
                Err(e) => {
                    debug!(msg_id = %request.id, error = %e, "join party attempt failed");
                }
            }
            if tokio::time::Instant::now() + backoff >= deadline {
                // Budget exhausted; report whoever we know was reachable.
                let mut online = vec![self.transport.local_peer_id().clone()];
                if leader_reachable {
                    online.push(leader.clone());
                }
                return Err(JoinPartyError::Timeout(online));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    /// One request/response exchange with the leader on a fresh stream.
    async fn request_once(
        &self,
        leader: &PeerId,
        request: &JoinPartyRequest,
        ceremony_timeout: Duration,
    ) -> Result<JoinPartyResponse, JoinPartyError> {
        let mut stream = self
            .transport
            .open_stream(leader, JOIN_PARTY_PROTOCOL)
            .await?;
        codec::write_frame(
            &mut stream,
            &encode(request),
            self.transport.apply_deadline(),
        )
        .await
        .map_err(|source| TransportError::Stream {
            peer: leader.clone(),
            source,
        })?;

        // The leader blocks us until the ceremony resolves, so the read
        // deadline is the ceremony timeout plus slack, not the wire one.
        let read_deadline = ceremony_timeout + Duration::from_secs(1);
        let raw = timeout(read_deadline, codec::read_frame(&mut stream, false))
            .await
            .map_err(|_| TransportError::Stream {
                peer: leader.clone(),
                source: crate::error::CodecError::Deadline(read_deadline),
            })?
            .map_err(|source| TransportError::Stream {
                peer: leader.clone(),
                source,
            })?;
        let resp: JoinPartyResponse = decode(&raw).map_err(|e| TransportError::Decode {
            peer: leader.clone(),
            reason: e.to_string(),
        })?;
        Ok(resp)
    }
}

fn response_to_result(resp: JoinPartyResponse) -> Result<Vec<PeerId>, JoinPartyError> {
    match resp.response_type {
        JoinPartyResponseType::Success => Ok(resp.peer_ids),
        JoinPartyResponseType::Timeout => Err(JoinPartyError::Timeout(resp.peer_ids)),
        JoinPartyResponseType::UnknownPeer => Err(JoinPartyError::UnknownPeer),
        JoinPartyResponseType::LeaderNotReady | JoinPartyResponseType::Unknown => Err(
            JoinPartyError::Aborted("leader never became ready".to_string()),
        ),
    }
}
