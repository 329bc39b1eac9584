//! The seam between this crate and the threshold-ECDSA primitive.
//!
//! The primitive is an external library; we only assume it can be driven as
//! a round-based state machine: it emits wire payloads to send, consumes
//! payloads received from other participants, and eventually returns its
//! output. This module defines that narrow interface.

use std::error;

use thiserror::Error;

use crate::messages::SignatureData;
use crate::participants::{PartyId, PartyIndex};
use crate::storage::KeygenLocalState;

/// Represents an error which can happen while running the crypto primitive.
#[derive(Debug, Error)]
pub enum PartyError {
    /// The primitive rejected a share or proof it was fed.
    ///
    /// Carries the round the offending message belonged to; the bridge
    /// attributes the fault to the message's sender.
    #[error("invalid share in round {round}: {reason}")]
    BadShare { round: String, reason: String },
    /// Some generic error happened.
    #[error("{0}")]
    Other(Box<dyn error::Error + Send + Sync>),
}

/// Represents an action by the local party in the protocol.
///
/// The basic flow is that the party reacts to being poked, or to messages
/// from other participants, with some kind of action. Eventually, the party
/// returns a value, ending the protocol.
#[derive(Debug, Clone)]
pub enum Action<T> {
    /// Don't do anything, wait for more messages.
    Wait,
    /// Send a message to all other participants.
    ///
    /// A party never sends messages to itself.
    SendMany { round: String, data: Vec<u8> },
    /// Send a private message to specific participants.
    SendPrivate {
        round: String,
        to: Vec<PartyIndex>,
        data: Vec<u8>,
    },
    /// End the protocol by returning a value.
    Return(T),
}

/// A trait for the local participant of one ceremony.
///
/// The computation of the participant is driven mainly by receiving
/// messages from other participants; `poke` advances it as far as it can
/// go and reports what it wants done next.
pub trait Party: Send {
    type Output;

    /// Advance the party, returning its next pending action.
    ///
    /// Called repeatedly until it yields [`Action::Wait`] (nothing to do
    /// until more messages arrive) or [`Action::Return`].
    fn poke(&mut self) -> Result<Action<Self::Output>, PartyError>;

    /// Feed this party a message from some participant.
    fn message(
        &mut self,
        from: PartyIndex,
        round: &str,
        data: &[u8],
        is_broadcast: bool,
    ) -> Result<(), PartyError>;
}

/// The output of a keygen party: the jointly generated public key and the
/// opaque local share material to persist.
#[derive(Debug, Clone)]
pub struct KeygenPartyOutput {
    /// SEC1 compressed pool public key, 33 bytes.
    pub pub_key: Vec<u8>,
    /// Opaque local share data, persisted as-is.
    pub local_data: Vec<u8>,
}

/// Everything a primitive needs to build a keygen party.
pub struct KeygenSetup {
    pub parties: Vec<PartyId>,
    pub local_party: PartyId,
    pub threshold: usize,
    pub msg_id: String,
    /// Pre-computed parameters, opaque to this crate.
    pub pre_params: Option<Vec<u8>>,
}

/// Everything a primitive needs to build a keysign party.
pub struct KeysignSetup {
    /// The selected signers, already sliced to `threshold + 1`.
    pub parties: Vec<PartyId>,
    pub local_party: PartyId,
    pub threshold: usize,
    pub msg_id: String,
    /// Digests to sign.
    pub messages: Vec<Vec<u8>>,
    /// The share produced by keygen for the pool key being signed with.
    pub local_state: KeygenLocalState,
}

/// Constructs parties for the two ceremony kinds.
pub trait PartyFactory: Send + Sync + 'static {
    fn keygen_party(
        &self,
        setup: KeygenSetup,
    ) -> Result<Box<dyn Party<Output = KeygenPartyOutput>>, PartyError>;

    fn keysign_party(
        &self,
        setup: KeysignSetup,
    ) -> Result<Box<dyn Party<Output = Vec<SignatureData>>>, PartyError>;
}
