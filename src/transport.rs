//! Peer transport: streams between nodes under registered protocol IDs.
//!
//! Every stream is a TCP connection opened with a handshake frame naming
//! the protocol and the sender's peer-ID. Discovery is out of scope; the
//! address book is fed by the caller. Inbound `tss-message` and
//! `tss-control` frames are delivered to subscription channels keyed by
//! `(message type, message ID)`; join-party streams are handed to the
//! party coordinator together with the stream, so the response can be
//! written back after the ceremony resolves.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::codec;
use crate::error::{CodecError, TransportError};
use crate::identity::PeerId;
use crate::messages::{JoinPartyRequest, JoinPartyResponse, MessageType, WrappedMessage};
use crate::serde::{decode, encode};

const STREAM_OPEN_ATTEMPTS: usize = 4;
const STREAM_OPEN_RETRY_DELAY: Duration = Duration::from_secs(1);
const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(4);
/// Buffer of each subscription channel; messages queue here until the
/// ceremony drains them.
const SUBSCRIPTION_BUFFER: usize = 1024;

/// First frame on every stream.
#[derive(Debug, Serialize, Deserialize)]
struct Handshake {
    protocol: String,
    peer_id: PeerId,
}

/// An inbound wrapped message, tagged with the peer that sent it.
#[derive(Debug)]
pub struct InboundMessage {
    pub from: PeerId,
    pub wrapped: WrappedMessage,
}

/// An accepted join-party request, still holding the stream so the
/// coordinator can answer once the ceremony resolves.
pub struct JoinPartyStream {
    pub from: PeerId,
    pub request: JoinPartyRequest,
    stream: TcpStream,
    apply_deadline: bool,
}

impl JoinPartyStream {
    /// Write the response and close the stream.
    pub async fn respond(mut self, resp: &JoinPartyResponse) -> Result<(), CodecError> {
        codec::write_frame(&mut self.stream, &encode(resp), self.apply_deadline).await?;
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}

type SubKey = (MessageType, String);
type StreamKey = (PeerId, String);

pub struct Transport {
    local_peer: PeerId,
    local_addr: SocketAddr,
    apply_deadline: bool,
    address_book: RwLock<HashMap<PeerId, SocketAddr>>,
    subscribers: Mutex<HashMap<SubKey, mpsc::Sender<InboundMessage>>>,
    // Outbound stream cache; the outer lock is only held around map
    // operations, writes serialize on the per-stream async lock.
    streams: Mutex<HashMap<StreamKey, Arc<tokio::sync::Mutex<TcpStream>>>>,
    join_party_tx: mpsc::Sender<JoinPartyStream>,
    join_party_rx: Mutex<Option<mpsc::Receiver<JoinPartyStream>>>,
    stop: watch::Receiver<bool>,
}

impl Transport {
    /// Bind the listener and start accepting inbound streams.
    pub async fn new(
        listen_addr: SocketAddr,
        local_peer: PeerId,
        apply_deadline: bool,
        stop: watch::Receiver<bool>,
    ) -> io::Result<Arc<Self>> {
        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let (join_party_tx, join_party_rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let transport = Arc::new(Self {
            local_peer,
            local_addr,
            apply_deadline,
            address_book: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            join_party_tx,
            join_party_rx: Mutex::new(Some(join_party_rx)),
            stop,
        });
        tokio::spawn(Arc::clone(&transport).accept_loop(listener));
        Ok(transport)
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer
    }

    /// The address the listener actually bound; tests bind port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn apply_deadline(&self) -> bool {
        self.apply_deadline
    }

    pub fn add_peer(&self, peer: PeerId, addr: SocketAddr) {
        self.address_book.write().insert(peer, addr);
    }

    /// Register for inbound messages of one type within one ceremony.
    pub fn subscribe(&self, message_type: MessageType, msg_id: &str) -> mpsc::Receiver<InboundMessage> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers
            .lock()
            .insert((message_type, msg_id.to_string()), tx);
        rx
    }

    pub fn cancel_subscribe(&self, message_type: MessageType, msg_id: &str) {
        self.subscribers
            .lock()
            .remove(&(message_type, msg_id.to_string()));
    }

    /// The coordinator takes this exactly once to consume join-party
    /// streams.
    pub fn take_join_party_streams(&self) -> Option<mpsc::Receiver<JoinPartyStream>> {
        self.join_party_rx.lock().take()
    }

    /// Open a fresh stream to `peer` under `protocol`.
    ///
    /// Four connect attempts spaced one second apart, all bounded by a
    /// four second budget; on failure every cached stream to the peer is
    /// dropped before the error is returned.
    pub async fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &str,
    ) -> Result<TcpStream, TransportError> {
        let addr = self
            .address_book
            .read()
            .get(peer)
            .copied()
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?;

        let attempts = async {
            let mut last_err = String::new();
            for i in 0..STREAM_OPEN_ATTEMPTS {
                match TcpStream::connect(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => {
                        debug!(peer = %peer, attempt = i, error = %e, "fail to create stream");
                        last_err = e.to_string();
                        if i + 1 < STREAM_OPEN_ATTEMPTS {
                            tokio::time::sleep(STREAM_OPEN_RETRY_DELAY).await;
                        }
                    }
                }
            }
            Err(TransportError::OpenStream {
                peer: peer.clone(),
                reason: last_err,
            })
        };

        let mut stream = match timeout(STREAM_OPEN_TIMEOUT, attempts).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.drop_peer_streams(peer);
                return Err(e);
            }
            Err(_) => {
                self.drop_peer_streams(peer);
                return Err(TransportError::OpenStream {
                    peer: peer.clone(),
                    reason: format!("no stream within {STREAM_OPEN_TIMEOUT:?}"),
                });
            }
        };

        let handshake = Handshake {
            protocol: protocol.to_string(),
            peer_id: self.local_peer.clone(),
        };
        codec::write_frame(&mut stream, &encode(&handshake), self.apply_deadline)
            .await
            .map_err(|source| TransportError::Stream {
                peer: peer.clone(),
                source,
            })?;
        Ok(stream)
    }

    /// Send one wrapped message to a peer, reusing a cached stream when
    /// one exists. A failed write on a cached stream drops it and retries
    /// once on a fresh stream.
    pub async fn send_to_peer(
        &self,
        peer: &PeerId,
        protocol: &str,
        wrapped: &WrappedMessage,
    ) -> Result<(), TransportError> {
        let payload = encode(wrapped);
        let key = (peer.clone(), protocol.to_string());

        let cached = self.streams.lock().get(&key).cloned();
        if let Some(entry) = cached {
            let mut stream = entry.lock().await;
            match codec::write_frame(&mut *stream, &payload, self.apply_deadline).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(peer = %peer, error = %e, "cached stream failed, reopening");
                    drop(stream);
                    self.streams.lock().remove(&key);
                }
            }
        }

        let mut stream = self.open_stream(peer, protocol).await?;
        codec::write_frame(&mut stream, &payload, self.apply_deadline)
            .await
            .map_err(|source| TransportError::Stream {
                peer: peer.clone(),
                source,
            })?;
        self.streams
            .lock()
            .insert(key, Arc::new(tokio::sync::Mutex::new(stream)));
        Ok(())
    }

    /// Fan one message out to many peers concurrently. Per-peer failures
    /// are logged; a dead peer surfaces later through blame, not here.
    pub async fn broadcast(
        self: &Arc<Self>,
        peers: &[PeerId],
        protocol: &'static str,
        wrapped: &WrappedMessage,
    ) {
        let mut tasks = tokio::task::JoinSet::new();
        for peer in peers {
            let transport = Arc::clone(self);
            let peer = peer.clone();
            let wrapped = wrapped.clone();
            tasks.spawn(async move {
                if let Err(e) = transport.send_to_peer(&peer, protocol, &wrapped).await {
                    warn!(peer = %peer, error = %e, "fail to send broadcast message to peer");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    fn drop_peer_streams(&self, peer: &PeerId) {
        self.streams.lock().retain(|(p, _), _| p != peer);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut stop = self.stop.clone();
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    debug!("transport accept loop stopping");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let transport = Arc::clone(&self);
                        tokio::spawn(async move { transport.handle_inbound(stream).await });
                    }
                    Err(e) => warn!(error = %e, "fail to accept inbound connection"),
                }
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, mut stream: TcpStream) {
        let raw = match codec::read_frame(&mut stream, self.apply_deadline).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "fail to read handshake");
                return;
            }
        };
        let handshake: Handshake = match decode(&raw) {
            Ok(h) => h,
            Err(e) => {
                debug!(error = %e, "fail to decode handshake");
                return;
            }
        };

        match handshake.protocol.as_str() {
            crate::messages::JOIN_PARTY_PROTOCOL => {
                self.handle_join_party_stream(handshake.peer_id, stream).await;
            }
            crate::messages::TSS_PROTOCOL | crate::messages::TSS_CONTROL_PROTOCOL => {
                self.handle_message_stream(handshake.peer_id, stream).await;
            }
            other => debug!(protocol = other, "stream for unregistered protocol"),
        }
    }

    async fn handle_join_party_stream(&self, from: PeerId, mut stream: TcpStream) {
        let raw = match codec::read_frame(&mut stream, self.apply_deadline).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "fail to read join party request");
                return;
            }
        };
        let request: JoinPartyRequest = match decode(&raw) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "fail to decode join party request");
                return;
            }
        };
        let join = JoinPartyStream {
            from,
            request,
            stream,
            apply_deadline: self.apply_deadline,
        };
        if self.join_party_tx.send(join).await.is_err() {
            debug!("party coordinator is gone, dropping join party request");
        }
    }

    /// Read wrapped-message frames until the sender closes its write side.
    async fn handle_message_stream(&self, from: PeerId, mut stream: TcpStream) {
        let mut stop = self.stop.clone();
        loop {
            tokio::select! {
                _ = stop.changed() => return,
                frame = codec::read_frame(&mut stream, self.apply_deadline) => {
                    let raw = match frame {
                        Ok(raw) => raw,
                        // EOF: the peer is done with this stream.
                        Err(_) => return,
                    };
                    match decode::<WrappedMessage>(&raw) {
                        Ok(wrapped) => self.route(from.clone(), wrapped),
                        Err(e) => {
                            debug!(peer = %from, error = %e, "fail to decode wrapped message");
                            return;
                        }
                    }
                }
            }
        }
    }

    fn route(&self, from: PeerId, wrapped: WrappedMessage) {
        let key = (wrapped.message_type, wrapped.msg_id.clone());
        let subscriber = self.subscribers.lock().get(&key).cloned();
        match subscriber {
            Some(tx) => {
                if let Err(e) = tx.try_send(InboundMessage { from, wrapped }) {
                    warn!(error = %e, "fail to deliver inbound message to subscriber");
                }
            }
            None => {
                debug!(
                    msg_id = %wrapped.msg_id,
                    message_type = ?wrapped.message_type,
                    "no subscriber for inbound message, dropping",
                );
            }
        }
    }
}
