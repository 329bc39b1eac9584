//! Coordination layer for a distributed threshold-ECDSA (secp256k1)
//! service.
//!
//! A set of nodes jointly generates an ECDSA key such that no node holds
//! the private key; a quorum of them can later sign messages. The crypto
//! itself is an external primitive behind [`party::Party`]; this crate
//! provides everything around it: gathering the right peers for a
//! ceremony ([`coordinator`]), delivering round messages with broadcast
//! consistency ([`transport`], [`bridge`]), attributing faults to
//! specific public keys ([`blame`]), and driving keygen and keysign
//! ceremonies end to end ([`server`]).

pub mod blame;
pub mod bridge;
pub mod cache;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod dealer;
pub mod error;
pub mod identity;
pub mod keygen;
pub mod keysign;
pub mod messages;
pub mod notifier;
pub mod participants;
pub mod party;
mod serde;
pub mod server;
pub mod storage;
pub mod transport;

pub use config::TssConfig;
pub use keygen::{KeygenRequest, KeygenResponse};
pub use keysign::{KeysignRequest, KeysignResponse};
pub use server::{Status, TssServer};

#[cfg(test)]
mod test;
