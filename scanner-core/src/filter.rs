//! Contract + positional-topic predicate, and bloom-based may-contain
//! pruning.

use std::collections::HashSet;

use alloy::primitives::{Address, B256, Bloom};
use alloy::primitives::bloom::BloomInput;

use crate::rpc::LogQuery;

/// A contract + per-position topic predicate.
///
/// An empty `contracts` set matches any address; an empty set at
/// `topics[i]` matches any value at that position.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    contracts: HashSet<Address>,
    topics: Vec<HashSet<B256>>,
}

impl Filter {
    /// Builds a filter over the given contracts (empty = any address).
    #[must_use]
    pub fn new(contracts: impl IntoIterator<Item = Address>) -> Self {
        Self {
            contracts: contracts.into_iter().collect(),
            topics: Vec::new(),
        }
    }

    /// Sets the topic set at position `i`, growing `topics` as needed
    /// so intermediate positions default to "any" (the empty set).
    pub fn set_topic(&mut self, i: usize, values: impl IntoIterator<Item = B256>) {
        if self.topics.len() <= i {
            self.topics.resize_with(i + 1, HashSet::new);
        }
        self.topics[i] = values.into_iter().collect();
    }

    /// Builds the upstream query for the inclusive block range
    /// `[from, to]`.
    #[must_use]
    pub fn to_query(&self, from: u64, to: u64) -> LogQuery {
        LogQuery {
            from_block: from,
            to_block: to,
            addresses: self.contracts.iter().copied().collect(),
            topics: self.topics.iter().map(|s| s.iter().copied().collect()).collect(),
        }
    }

    /// `true` if this filter has more than 20 contracts or more than 20
    /// topics at any position — such filters bypass bloom evaluation
    /// since rejection probability is low and bloom membership has no
    /// false-negative guarantee once the bitset saturates.
    #[must_use]
    pub fn is_heavy(&self) -> bool {
        self.contracts.len() > 20 || self.topics.iter().any(|t| t.len() > 20)
    }

    /// Evaluates this filter against a block's logs bloom. Returns
    /// `false` only when we can prove no log in the block could match;
    /// `true` means "may contain".
    #[must_use]
    pub fn matches_bloom(&self, bloom: &Bloom) -> bool {
        if !self.contracts.is_empty()
            && !self
                .contracts
                .iter()
                .any(|a| bloom.contains_input(BloomInput::Raw(a.as_slice())))
        {
            return false;
        }
        for topics in &self.topics {
            if !topics.is_empty()
                && !topics
                    .iter()
                    .any(|h| bloom.contains_input(BloomInput::Raw(h.as_slice())))
            {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::b256;

    #[test]
    fn to_query_sets_bounds_and_pads_intermediate_topics() {
        let mut f = Filter::new([Address::ZERO]);
        f.set_topic(2, [b256!("0000000000000000000000000000000000000000000000000000000000000001")]);

        let q = f.to_query(10, 20);
        assert_eq!(q.from_block, 10);
        assert_eq!(q.to_block, 20);
        assert_eq!(q.topics.len(), 3);
        assert!(q.topics[0].is_empty());
        assert!(q.topics[1].is_empty());
        assert_eq!(q.topics[2].len(), 1);
    }

    #[test]
    fn is_heavy_past_twenty_contracts() {
        let many: Vec<Address> = (0..21u8).map(|i| Address::with_last_byte(i)).collect();
        let f = Filter::new(many);
        assert!(f.is_heavy());
    }

    #[test]
    fn matches_bloom_false_when_address_absent() {
        let f = Filter::new([Address::with_last_byte(1)]);
        let empty_bloom = Bloom::default();
        assert!(!f.matches_bloom(&empty_bloom));
    }

    #[test]
    fn matches_bloom_true_when_no_contracts_no_topics() {
        let f = Filter::default();
        let empty_bloom = Bloom::default();
        assert!(f.matches_bloom(&empty_bloom));
    }
}
