//! Error types shared across the crate.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::identity::PeerId;

/// Errors produced by the wire codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload length {length} exceeds max payload length {max}")]
    PayloadTooLarge { length: u32, max: u32 },
    #[error("i/o error on stream: {0}")]
    Io(#[from] io::Error),
    #[error("stream deadline of {0:?} exceeded")]
    Deadline(Duration),
}

/// Errors produced by the peer transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is not in the address book")]
    UnknownPeer(PeerId),
    #[error("fail to open stream to peer {peer}: {reason}")]
    OpenStream { peer: PeerId, reason: String },
    #[error("stream to peer {peer} failed: {source}")]
    Stream {
        peer: PeerId,
        #[source]
        source: CodecError,
    },
    #[error("fail to decode message from peer {peer}: {reason}")]
    Decode { peer: PeerId, reason: String },
    #[error("transport has been stopped")]
    Stopped,
}

/// Errors converting between key and identity representations.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("fail to decode bech32 account pub key ({key}): {reason}")]
    InvalidPubKey { key: String, reason: String },
    #[error("fail to parse secp256k1 key: {0}")]
    InvalidKey(String),
    #[error("local party is not in the list")]
    LocalPartyMissing,
    #[error("cannot compute a threshold for zero parties")]
    EmptyParties,
    #[error("cannot find party {0}")]
    UnknownParty(String),
}

/// Terminal outcomes of a join-party round. `Timeout` carries the peers
/// that were reachable so the caller can derive blame.
#[derive(Debug, Error)]
pub enum JoinPartyError {
    #[error("join party timeout, online peers: {0:?}")]
    Timeout(Vec<PeerId>),
    #[error("leader rejected us as an unknown peer")]
    UnknownPeer,
    #[error("join party aborted: {0}")]
    Aborted(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors reading or writing persisted key shares.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no local state found for pub key {0}")]
    NotFound(String),
    #[error("fail to access local state file: {0}")]
    Io(#[from] io::Error),
    #[error("fail to decode local state file: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Driver-level failures. Every variant maps to a blame record before it
/// reaches the caller.
#[derive(Debug, Error)]
pub enum TssError {
    #[error("signers fail to sync before the ceremony: {0}")]
    JoinParty(#[from] JoinPartyError),
    #[error("requested protocols do not include {0}")]
    UnsupportedProtocol(String),
    #[error("ceremony timed out in round {last_round:?}")]
    Timeout { last_round: Option<String> },
    #[error("hash check failed for cache key {key}")]
    HashCheck { key: String },
    #[error("party rejected a share from {party_id}: {reason}")]
    WrongShare { party_id: String, reason: String },
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("server is shutting down")]
    Stopped,
    #[error("internal error: {0}")]
    Internal(String),
}
