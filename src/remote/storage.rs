//! Stored objects: token accounting for one published encoding.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::codec::EncodedObject;
use crate::core::InstanceId;

/// Outcome of applying a decrement to a stored object.
#[derive(Debug, PartialEq, Eq)]
pub enum DecrementOutcome {
    /// Tokens remain outstanding.
    Remaining(u64),
    /// The count reached zero; the object must be erased.
    Released,
    /// The decrement would take the count below zero.
    OverRelease { held: u64, requested: u64 },
}

/// One published encoded object with its outstanding token count and a
/// per-peer ledger of tokens exported to each instance.
///
/// The ledger lets the manager infer which tokens die with a crashed
/// peer. All mutation happens under the manager lock.
pub struct StoredObject {
    object: Arc<EncodedObject>,
    tokens: u64,
    ledger: BTreeMap<InstanceId, u64>,
}

impl StoredObject {
    pub fn new(object: Arc<EncodedObject>, tokens: u64) -> Self {
        Self {
            object,
            tokens,
            ledger: BTreeMap::new(),
        }
    }

    pub fn object(&self) -> &Arc<EncodedObject> {
        &self.object
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    /// Record that `tokens` of this object's count now live at `peer`.
    pub fn record_export(&mut self, peer: InstanceId, tokens: u64) {
        *self.ledger.entry(peer).or_default() += tokens;
    }

    pub fn ledger_for(&self, peer: InstanceId) -> u64 {
        self.ledger.get(&peer).copied().unwrap_or(0)
    }

    /// Remove and return the tokens attributed to `peer`.
    pub fn take_ledger(&mut self, peer: InstanceId) -> u64 {
        self.ledger.remove(&peer).unwrap_or(0)
    }

    /// Apply a decrement of `tokens`, attributed to `origin` when known.
    pub fn apply_decrement(
        &mut self,
        tokens: u64,
        origin: Option<InstanceId>,
    ) -> DecrementOutcome {
        if tokens > self.tokens {
            return DecrementOutcome::OverRelease {
                held: self.tokens,
                requested: tokens,
            };
        }
        self.tokens -= tokens;

        if let Some(peer) = origin
            && let Some(entry) = self.ledger.get_mut(&peer)
        {
            *entry = entry.saturating_sub(tokens);
            if *entry == 0 {
                self.ledger.remove(&peer);
            }
        }

        if self.tokens == 0 {
            DecrementOutcome::Released
        } else {
            DecrementOutcome::Remaining(self.tokens)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{EncodingOptions, encode};
    use crate::memory::BlockProvider;
    use crate::test_harness::LoopbackFabric;

    fn stored(tokens: u64) -> StoredObject {
        let provider = BlockProvider::new(LoopbackFabric::new().create_worker());
        let object = encode(
            &1u32,
            InstanceId::new(1),
            &provider,
            EncodingOptions::default(),
        )
        .unwrap();
        StoredObject::new(Arc::new(object), tokens)
    }

    #[test]
    fn decrements_count_down_to_release() {
        let mut stored = stored(3);
        assert_eq!(stored.apply_decrement(1, None), DecrementOutcome::Remaining(2));
        assert_eq!(stored.apply_decrement(1, None), DecrementOutcome::Remaining(1));
        assert_eq!(stored.apply_decrement(1, None), DecrementOutcome::Released);
    }

    #[test]
    fn over_release_is_detected() {
        let mut stored = stored(1);
        assert_eq!(
            stored.apply_decrement(2, None),
            DecrementOutcome::OverRelease {
                held: 1,
                requested: 2
            }
        );
    }

    #[test]
    fn ledger_tracks_per_peer_tokens() {
        let peer_b = InstanceId::new(2);
        let peer_c = InstanceId::new(3);
        let mut stored = stored(3);
        stored.record_export(peer_b, 2);
        stored.record_export(peer_c, 1);

        assert_eq!(stored.ledger_for(peer_b), 2);
        stored.apply_decrement(1, Some(peer_b));
        assert_eq!(stored.ledger_for(peer_b), 1);

        assert_eq!(stored.take_ledger(peer_b), 1);
        assert_eq!(stored.ledger_for(peer_b), 0);
        assert_eq!(stored.ledger_for(peer_c), 1);
    }
}
