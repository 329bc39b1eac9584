//! Broadcast cache items for the hash-echo confirm engine.

use std::collections::HashMap;

use crate::identity::PeerId;
use crate::messages::WireMessage;

/// One broadcast round message awaiting confirmation.
///
/// The message and the confirmations race: either can arrive first, so
/// `msg` may still be empty while `confirmed_list` fills up.
#[derive(Debug, Clone, Default)]
pub struct LocalCacheItem {
    pub msg: Option<WireMessage>,
    /// Hex SHA-256 of the stored message payload.
    pub hash: String,
    /// Peer-ID to the payload hash that peer reported.
    confirmed_list: HashMap<PeerId, String>,
}

impl LocalCacheItem {
    pub fn new(msg: Option<WireMessage>, hash: String) -> Self {
        Self {
            msg,
            hash,
            confirmed_list: HashMap::new(),
        }
    }

    /// Record one peer's confirmation. Re-confirmation overwrites, so a
    /// peer can never occupy two slots.
    pub fn update_confirm_list(&mut self, peer: PeerId, hash: String) {
        self.confirmed_list.insert(peer, hash);
    }

    pub fn total_confirm_party(&self) -> usize {
        self.confirmed_list.len()
    }

    /// The peers that confirmed this item.
    pub fn peers(&self) -> Vec<PeerId> {
        self.confirmed_list.keys().cloned().collect()
    }

    /// Peers whose reported hash differs from the stored one.
    pub fn mismatched_peers(&self) -> Vec<PeerId> {
        self.confirmed_list
            .iter()
            .filter(|(_, h)| **h != self.hash)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Whether every confirmation matches the stored hash.
    pub fn consistent(&self) -> bool {
        self.confirmed_list.values().all(|h| *h == self.hash)
    }

    /// Group confirmers by the hash they reported.
    pub fn hash_to_peers(&self) -> HashMap<String, Vec<PeerId>> {
        let mut buckets: HashMap<String, Vec<PeerId>> = HashMap::new();
        for (peer, hash) in &self.confirmed_list {
            buckets.entry(hash.clone()).or_default().push(peer.clone());
        }
        buckets
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::identity::peer_id_from_pub_key_bytes;

    fn peer(tag: u8) -> PeerId {
        peer_id_from_pub_key_bytes(&[tag; 33])
    }

    #[test]
    fn test_confirmations_are_idempotent() {
        let mut item = LocalCacheItem::new(None, "h1".to_string());
        item.update_confirm_list(peer(1), "h1".to_string());
        item.update_confirm_list(peer(1), "h1".to_string());
        assert_eq!(item.total_confirm_party(), 1);
        item.update_confirm_list(peer(2), "h1".to_string());
        assert_eq!(item.total_confirm_party(), 2);
        assert!(item.consistent());
        assert!(item.mismatched_peers().is_empty());
    }

    #[test]
    fn test_mismatch_detection() {
        let mut item = LocalCacheItem::new(None, "h1".to_string());
        item.update_confirm_list(peer(1), "h1".to_string());
        item.update_confirm_list(peer(2), "h2".to_string());
        assert!(!item.consistent());
        assert_eq!(item.mismatched_peers(), vec![peer(2)]);
        let buckets = item.hash_to_peers();
        assert_eq!(buckets["h1"], vec![peer(1)]);
        assert_eq!(buckets["h2"], vec![peer(2)]);
    }
}
