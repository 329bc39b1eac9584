//! Wire schema: everything that crosses the network between peers.
//!
//! All payloads are MessagePack-encoded through [`crate::serde`]. The outer
//! envelope for the `tss-message` and `tss-control` protocols is
//! [`WrappedMessage`], a tagged variant dispatched by a match on its
//! [`MessageType`].

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Protocol ID for the join-party request/response exchange.
pub const JOIN_PARTY_PROTOCOL: &str = "join-party/0.1";
/// Protocol ID carrying [`WrappedMessage`] frames during a ceremony.
pub const TSS_PROTOCOL: &str = "tss-message/0.1";
/// Protocol ID for round-replay control traffic.
pub const TSS_CONTROL_PROTOCOL: &str = "tss-control/0.1";

/// The kinds of message that travel inside a [`WrappedMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// A round message from the crypto primitive.
    TssMsg,
    /// A broadcast hash confirmation.
    VerMsg,
    /// A round-replay request or response.
    ControlMsg,
    /// The sender's crypto party has produced its final output.
    TaskDone,
}

/// Transport envelope tagging message type and ceremony ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedMessage {
    pub message_type: MessageType,
    pub msg_id: String,
    pub payload: Vec<u8>,
}

/// Where a wire message came from and where it is going.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Routing {
    /// Sender party ID.
    pub from: String,
    /// Recipient party IDs; `None` for broadcast.
    pub to: Option<Vec<String>>,
    pub is_broadcast: bool,
}

/// One round's signed payload from the crypto primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub routing: Routing,
    pub round_info: String,
    pub message: Vec<u8>,
    /// Sender's signature over `message || message-ID`, see
    /// [`crate::identity::NodeKeys::sign_envelope`].
    pub sig: Vec<u8>,
}

impl WireMessage {
    /// Key indexing the broadcast cache: `(round, sender party)`.
    pub fn cache_key(&self) -> String {
        cache_key(&self.round_info, &self.routing.from)
    }
}

pub fn cache_key(round_info: &str, party_id: &str) -> String {
    format!("{round_info}-{party_id}")
}

/// Hash echo for one broadcast wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfirmMessage {
    /// Sender party ID, for logging; attribution uses the transport peer.
    pub party_id: String,
    pub key: String,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequestType {
    /// Ask the message owner to replay a round we are missing.
    Replay,
}

/// Round-replay control message. A request carries `msg: None`; the
/// addressed peer answers with its stored message or stays silent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TssControl {
    pub req_hash: String,
    pub req_key: String,
    pub request_type: ControlRequestType,
    pub msg: Option<WireMessage>,
}

/// Payload of a [`MessageType::TaskDone`] message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TssTaskNotifier {
    pub task_done: bool,
}

/// Request a follower sends to the ceremony leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPartyRequest {
    /// Ceremony message ID.
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinPartyResponseType {
    Unknown,
    Success,
    Timeout,
    LeaderNotReady,
    UnknownPeer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPartyResponse {
    pub id: String,
    pub response_type: JoinPartyResponseType,
    /// On `Success` the exact participant set; on `Timeout` the subset
    /// that was reachable.
    pub peer_ids: Vec<PeerId>,
}

/// One produced ECDSA signature. `r` and `s` are big-endian scalar bytes,
/// `m` the message digest that was signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureData {
    pub r: Vec<u8>,
    pub s: Vec<u8>,
    pub m: Vec<u8>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::serde::{decode, encode};

    #[test]
    fn test_wrapped_message_round_trip() {
        let wire = WireMessage {
            routing: Routing {
                from: "2".to_string(),
                to: None,
                is_broadcast: true,
            },
            round_info: "keygen-commit".to_string(),
            message: vec![1, 2, 3],
            sig: vec![9; 64],
        };
        let wrapped = WrappedMessage {
            message_type: MessageType::TssMsg,
            msg_id: "abc".to_string(),
            payload: encode(&wire),
        };
        let back: WrappedMessage = decode(&encode(&wrapped)).unwrap();
        assert_eq!(back.msg_id, "abc");
        assert_eq!(back.message_type, MessageType::TssMsg);
        let wire_back: WireMessage = decode(&back.payload).unwrap();
        assert_eq!(wire_back.cache_key(), "keygen-commit-2");
        assert!(wire_back.routing.is_broadcast);
    }
}
