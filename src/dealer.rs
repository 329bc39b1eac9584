//! A dealer-style reference party.
//!
//! This is NOT a threshold scheme: every participant derives the same
//! pool key deterministically from the participant set, the way a trusted
//! dealer would have handed it out. What it does share with a real
//! primitive is its shape: broadcast and unicast rounds, share
//! verification that can fail, and real ECDSA outputs that verify against
//! the pool public key. That makes it exactly enough to drive the
//! coordination layer in tests and simulations; do not use it for
//! anything else.

use std::collections::{HashSet, VecDeque};

use ecdsa::signature::Signer;
use k256::ecdsa::{Signature, SigningKey};
use sha2::{Digest, Sha256};

use crate::messages::SignatureData;
use crate::participants::{PartyId, PartyIndex};
use crate::party::{
    Action, KeygenPartyOutput, KeygenSetup, KeysignSetup, Party, PartyError, PartyFactory,
};

pub const KEYGEN_COMMIT_ROUND: &str = "keygen-commit";
pub const KEYGEN_ACK_ROUND: &str = "keygen-ack";
pub const KEYSIGN_COMMIT_ROUND: &str = "keysign-commit";
pub const KEYSIGN_SIG_ROUND: &str = "keysign-sig";

/// Factory for dealer parties. `corrupt_keygen_commit` makes the keygen
/// party broadcast a bad commitment, so tests can watch every honest peer
/// blame it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dealer {
    pub corrupt_keygen_commit: bool,
}

impl Dealer {
    pub fn honest() -> Self {
        Self {
            corrupt_keygen_commit: false,
        }
    }

    pub fn corrupt() -> Self {
        Self {
            corrupt_keygen_commit: true,
        }
    }
}

impl PartyFactory for Dealer {
    fn keygen_party(
        &self,
        setup: KeygenSetup,
    ) -> Result<Box<dyn Party<Output = KeygenPartyOutput>>, PartyError> {
        Ok(Box::new(KeygenParty::new(
            &setup,
            self.corrupt_keygen_commit,
        )))
    }

    fn keysign_party(
        &self,
        setup: KeysignSetup,
    ) -> Result<Box<dyn Party<Output = Vec<SignatureData>>>, PartyError> {
        KeysignParty::new(setup).map(|p| Box::new(p) as _)
    }
}

/// Hash the sorted participant keys into a signing key. The counter only
/// moves on the astronomically unlikely non-canonical digest.
fn derive_pool_key(parties: &[PartyId]) -> SigningKey {
    let mut counter: u8 = 0;
    loop {
        let mut hasher = Sha256::new();
        hasher.update(b"dealer-pool-key");
        for party in parties {
            hasher.update(&party.key);
        }
        hasher.update([counter]);
        let digest = hasher.finalize();
        if let Ok(key) = SigningKey::from_slice(&digest) {
            return key;
        }
        counter = counter.wrapping_add(1);
    }
}

fn pool_pub_bytes(key: &SigningKey) -> Vec<u8> {
    key.verifying_key().to_encoded_point(true).as_bytes().to_vec()
}

fn keygen_commitment(pool_pub: &[u8], from: PartyIndex) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"keygen-commitment");
    hasher.update(pool_pub);
    hasher.update(from.0.to_le_bytes());
    hasher.finalize().to_vec()
}

fn keygen_ack(pool_pub: &[u8], from: PartyIndex) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"keygen-ack");
    hasher.update(pool_pub);
    hasher.update(from.0.to_le_bytes());
    hasher.finalize().to_vec()
}

struct KeygenParty {
    me: PartyIndex,
    others: Vec<PartyIndex>,
    pool_key: SigningKey,
    pool_pub: Vec<u8>,
    commits_seen: HashSet<PartyIndex>,
    acks_seen: HashSet<PartyIndex>,
    pending: VecDeque<Action<KeygenPartyOutput>>,
    started: bool,
    corrupt_commit: bool,
    finished: bool,
}

impl KeygenParty {
    fn new(setup: &KeygenSetup, corrupt_commit: bool) -> Self {
        let pool_key = derive_pool_key(&setup.parties);
        let pool_pub = pool_pub_bytes(&pool_key);
        let me = setup.local_party.index();
        let others = setup
            .parties
            .iter()
            .map(|p| p.index())
            .filter(|i| *i != me)
            .collect();
        Self {
            me,
            others,
            pool_key,
            pool_pub,
            commits_seen: HashSet::new(),
            acks_seen: HashSet::new(),
            pending: VecDeque::new(),
            started: false,
            corrupt_commit,
            finished: false,
        }
    }

    fn done(&self) -> bool {
        self.commits_seen.len() == self.others.len() && self.acks_seen.len() == self.others.len()
    }
}

impl Party for KeygenParty {
    type Output = KeygenPartyOutput;

    fn poke(&mut self) -> Result<Action<KeygenPartyOutput>, PartyError> {
        if !self.started {
            self.started = true;
            let mut commitment = keygen_commitment(&self.pool_pub, self.me);
            if self.corrupt_commit {
                commitment[0] ^= 0xff;
            }
            self.pending.push_back(Action::SendMany {
                round: KEYGEN_COMMIT_ROUND.to_string(),
                data: commitment,
            });
            self.pending.push_back(Action::SendPrivate {
                round: KEYGEN_ACK_ROUND.to_string(),
                to: self.others.clone(),
                data: keygen_ack(&self.pool_pub, self.me),
            });
        }
        if let Some(action) = self.pending.pop_front() {
            return Ok(action);
        }
        if self.done() && !self.finished {
            self.finished = true;
            return Ok(Action::Return(KeygenPartyOutput {
                pub_key: self.pool_pub.clone(),
                local_data: self.pool_key.to_bytes().to_vec(),
            }));
        }
        Ok(Action::Wait)
    }

    fn message(
        &mut self,
        from: PartyIndex,
        round: &str,
        data: &[u8],
        _is_broadcast: bool,
    ) -> Result<(), PartyError> {
        match round {
            KEYGEN_COMMIT_ROUND => {
                if data != keygen_commitment(&self.pool_pub, from) {
                    return Err(PartyError::BadShare {
                        round: round.to_string(),
                        reason: format!("commitment from party {from} does not open"),
                    });
                }
                self.commits_seen.insert(from);
            }
            KEYGEN_ACK_ROUND => {
                if data != keygen_ack(&self.pool_pub, from) {
                    return Err(PartyError::BadShare {
                        round: round.to_string(),
                        reason: format!("bad ack from party {from}"),
                    });
                }
                self.acks_seen.insert(from);
            }
            other => {
                // Stale traffic from another round is ignored.
                tracing::debug!(round = other, "dealer keygen ignoring unknown round");
            }
        }
        Ok(())
    }
}

struct KeysignParty {
    me: PartyIndex,
    others: Vec<PartyIndex>,
    pool_pub: Vec<u8>,
    signatures: Vec<SignatureData>,
    sig_blob: Vec<u8>,
    commits_seen: HashSet<PartyIndex>,
    sigs_seen: HashSet<PartyIndex>,
    pending: VecDeque<Action<Vec<SignatureData>>>,
    started: bool,
    finished: bool,
}

impl KeysignParty {
    fn new(setup: KeysignSetup) -> Result<Self, PartyError> {
        // The "share" handed out at keygen is the signing key itself.
        let pool_key = SigningKey::from_slice(&setup.local_state.local_data)
            .map_err(|e| PartyError::Other(format!("invalid local share: {e}").into()))?;
        let pool_pub = pool_pub_bytes(&pool_key);
        let me = setup.local_party.index();
        let others: Vec<PartyIndex> = setup
            .parties
            .iter()
            .map(|p| p.index())
            .filter(|i| *i != me)
            .collect();

        // RFC 6979 signing: every signer computes the identical batch.
        let mut signatures = Vec::with_capacity(setup.messages.len());
        let mut sig_blob = Vec::new();
        for digest in &setup.messages {
            let sig: Signature = pool_key.sign(digest);
            signatures.push(SignatureData {
                r: sig.r().to_bytes().to_vec(),
                s: sig.s().to_bytes().to_vec(),
                m: digest.clone(),
            });
            sig_blob.extend_from_slice(&sig.to_bytes());
        }

        Ok(Self {
            me,
            others,
            pool_pub,
            signatures,
            sig_blob,
            commits_seen: HashSet::new(),
            sigs_seen: HashSet::new(),
            pending: VecDeque::new(),
            started: false,
            finished: false,
        })
    }

    fn commitment(&self, from: PartyIndex) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"keysign-commitment");
        hasher.update(&self.pool_pub);
        hasher.update(&self.sig_blob);
        hasher.update(from.0.to_le_bytes());
        hasher.finalize().to_vec()
    }

    fn done(&self) -> bool {
        self.commits_seen.len() == self.others.len() && self.sigs_seen.len() == self.others.len()
    }
}

impl Party for KeysignParty {
    type Output = Vec<SignatureData>;

    fn poke(&mut self) -> Result<Action<Vec<SignatureData>>, PartyError> {
        if !self.started {
            self.started = true;
            self.pending.push_back(Action::SendMany {
                round: KEYSIGN_COMMIT_ROUND.to_string(),
                data: self.commitment(self.me),
            });
            self.pending.push_back(Action::SendMany {
                round: KEYSIGN_SIG_ROUND.to_string(),
                data: self.sig_blob.clone(),
            });
        }
        if let Some(action) = self.pending.pop_front() {
            return Ok(action);
        }
        if self.done() && !self.finished {
            self.finished = true;
            return Ok(Action::Return(self.signatures.clone()));
        }
        Ok(Action::Wait)
    }

    fn message(
        &mut self,
        from: PartyIndex,
        round: &str,
        data: &[u8],
        _is_broadcast: bool,
    ) -> Result<(), PartyError> {
        match round {
            KEYSIGN_COMMIT_ROUND => {
                if data != self.commitment(from) {
                    return Err(PartyError::BadShare {
                        round: round.to_string(),
                        reason: format!("commitment from party {from} does not open"),
                    });
                }
                self.commits_seen.insert(from);
            }
            KEYSIGN_SIG_ROUND => {
                if data != self.sig_blob {
                    return Err(PartyError::BadShare {
                        round: round.to_string(),
                        reason: format!("party {from} produced a diverging signature"),
                    });
                }
                self.sigs_seen.insert(from);
            }
            other => {
                tracing::debug!(round = other, "dealer keysign ignoring unknown round");
            }
        }
        Ok(())
    }
}
