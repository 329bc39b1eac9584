//! The TSS server: one running node.
//!
//! Owns the transport, the party coordinator and the node identity, and
//! serializes ceremonies: at most one keygen and one keysign run at a
//! time, concurrent callers of the same operation queue on the
//! per-operation lock.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::info;

use crate::bridge::CeremonyChannels;
use crate::config::TssConfig;
use crate::coordinator::PartyCoordinator;
use crate::error::TssError;
use crate::identity::{NodeKeys, PeerId};
use crate::messages::MessageType;
use crate::party::PartyFactory;
use crate::storage::LocalStateManager;
use crate::transport::Transport;

/// Outcome of a ceremony as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    Fail,
}

/// Counters since server start. Invalid requests rejected before a
/// ceremony begins are not counted as failures.
#[derive(Debug, Clone, Serialize)]
pub struct TssStatus {
    pub start_time: SystemTime,
    pub suc_key_gen: u64,
    pub failed_key_gen: u64,
    pub suc_key_sign: u64,
    pub failed_key_sign: u64,
}

pub struct TssServer<F: PartyFactory> {
    conf: TssConfig,
    node_keys: Arc<NodeKeys>,
    transport: Arc<Transport>,
    coordinator: Arc<PartyCoordinator>,
    storage: LocalStateManager,
    factory: F,
    pre_params: Option<Vec<u8>>,
    keygen_lock: Mutex<()>,
    keysign_lock: Mutex<()>,
    start_time: SystemTime,
    suc_key_gen: AtomicU64,
    failed_key_gen: AtomicU64,
    suc_key_sign: AtomicU64,
    failed_key_sign: AtomicU64,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl<F: PartyFactory> TssServer<F> {
    /// Start a node: bind the transport, wire up the coordinator, and get
    /// ready to serve ceremonies. Peers are added to the address book
    /// with [`TssServer::add_peer`].
    pub async fn new(
        conf: TssConfig,
        node_keys: NodeKeys,
        listen_addr: SocketAddr,
        base_folder: impl Into<PathBuf>,
        factory: F,
        pre_params: Option<Vec<u8>>,
    ) -> Result<Arc<Self>, TssError> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let transport = Transport::new(
            listen_addr,
            node_keys.peer_id(),
            conf.apply_deadline,
            stop_rx.clone(),
        )
        .await
        .map_err(|e| TssError::Internal(format!("fail to start the transport: {e}")))?;
        let coordinator = PartyCoordinator::new(Arc::clone(&transport), stop_rx.clone());
        let storage = LocalStateManager::new(base_folder, transport.local_addr().port());
        info!(
            peer_id = %transport.local_peer_id(),
            addr = %transport.local_addr(),
            "tss server started",
        );
        Ok(Arc::new(Self {
            conf,
            node_keys: Arc::new(node_keys),
            transport,
            coordinator,
            storage,
            factory,
            pre_params,
            keygen_lock: Mutex::new(()),
            keysign_lock: Mutex::new(()),
            start_time: SystemTime::now(),
            suc_key_gen: AtomicU64::new(0),
            failed_key_gen: AtomicU64::new(0),
            suc_key_sign: AtomicU64::new(0),
            failed_key_sign: AtomicU64::new(0),
            stop_tx,
            stop_rx,
        }))
    }

    /// Abort every running ceremony and stop the transport workers.
    pub fn stop(&self) {
        info!(peer_id = %self.transport.local_peer_id(), "stopping tss server");
        let _ = self.stop_tx.send(true);
    }

    pub fn local_peer_id(&self) -> &PeerId {
        self.transport.local_peer_id()
    }

    pub fn account_pub_key(&self) -> String {
        self.node_keys.account_pub_key()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Teach this node where a peer listens.
    pub fn add_peer(&self, peer: PeerId, addr: SocketAddr) {
        self.transport.add_peer(peer, addr);
    }

    pub fn status(&self) -> TssStatus {
        TssStatus {
            start_time: self.start_time,
            suc_key_gen: self.suc_key_gen.load(Ordering::Relaxed),
            failed_key_gen: self.failed_key_gen.load(Ordering::Relaxed),
            suc_key_sign: self.suc_key_sign.load(Ordering::Relaxed),
            failed_key_sign: self.failed_key_sign.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn subscribe_ceremony(&self, msg_id: &str) -> CeremonyChannels {
        CeremonyChannels {
            tss: self.transport.subscribe(MessageType::TssMsg, msg_id),
            ver: self.transport.subscribe(MessageType::VerMsg, msg_id),
            control: self.transport.subscribe(MessageType::ControlMsg, msg_id),
            task_done: self.transport.subscribe(MessageType::TaskDone, msg_id),
        }
    }

    pub(crate) fn unsubscribe_ceremony(&self, msg_id: &str) {
        self.transport.cancel_subscribe(MessageType::TssMsg, msg_id);
        self.transport.cancel_subscribe(MessageType::VerMsg, msg_id);
        self.transport.cancel_subscribe(MessageType::ControlMsg, msg_id);
        self.transport.cancel_subscribe(MessageType::TaskDone, msg_id);
    }

    pub(crate) fn count_keygen(&self, success: bool) {
        if success {
            self.suc_key_gen.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_key_gen.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn count_keysign(&self, success: bool) {
        if success {
            self.suc_key_sign.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_key_sign.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn keygen_lock(&self) -> &Mutex<()> {
        &self.keygen_lock
    }

    pub(crate) fn keysign_lock(&self) -> &Mutex<()> {
        &self.keysign_lock
    }

    pub(crate) fn node_keys(&self) -> &NodeKeys {
        &self.node_keys
    }

    pub(crate) fn node_keys_arc(&self) -> Arc<NodeKeys> {
        Arc::clone(&self.node_keys)
    }

    pub(crate) fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub(crate) fn coordinator(&self) -> &Arc<PartyCoordinator> {
        &self.coordinator
    }

    pub(crate) fn config(&self) -> &TssConfig {
        &self.conf
    }

    pub(crate) fn storage(&self) -> &LocalStateManager {
        &self.storage
    }

    pub(crate) fn factory(&self) -> &F {
        &self.factory
    }

    pub(crate) fn pre_params(&self) -> Option<Vec<u8>> {
        self.pre_params.clone()
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_rx.clone()
    }
}
