use std::collections::BTreeSet;
use std::time::Duration;

use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};

use crate::{LogPollerError, LogPollerResult};

/// A named, durable description of the logs that must be indexed.
///
/// Any of `event_sigs` emitted by any of `addresses` is captured. `topic2`,
/// `topic3` and `topic4` optionally narrow the remaining indexed topics; an
/// empty list matches any value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Unique name
    pub name: String,
    /// Accepted values of topic 0
    pub event_sigs: Vec<H256>,
    /// Accepted emitting contracts
    pub addresses: Vec<Address>,
    /// Accepted values of topic 1
    #[serde(default)]
    pub topic2: Vec<H256>,
    /// Accepted values of topic 2
    #[serde(default)]
    pub topic3: Vec<H256>,
    /// Accepted values of topic 3
    #[serde(default)]
    pub topic4: Vec<H256>,
    /// How long matching logs are kept, zero keeps them forever
    #[serde(default)]
    pub retention: Duration,
}

impl Filter {
    /// A filter on `event_sigs` from `addresses` with infinite retention.
    pub fn new(
        name: impl Into<String>,
        event_sigs: impl IntoIterator<Item = H256>,
        addresses: impl IntoIterator<Item = Address>,
    ) -> Self {
        Self {
            name: name.into(),
            event_sigs: event_sigs.into_iter().collect(),
            addresses: addresses.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Set the retention.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Narrow indexed topics 1 to 3.
    pub fn with_topics(mut self, topic2: Vec<H256>, topic3: Vec<H256>, topic4: Vec<H256>) -> Self {
        self.topic2 = topic2;
        self.topic3 = topic3;
        self.topic4 = topic4;
        self
    }

    pub(crate) fn validate(&self) -> LogPollerResult<()> {
        let invalid = |reason| LogPollerError::InvalidFilter {
            name: self.name.clone(),
            reason,
        };
        if self.addresses.is_empty() {
            return Err(invalid("at least one address must be specified"));
        }
        if self.event_sigs.is_empty() {
            return Err(invalid("at least one event must be specified"));
        }
        if self.event_sigs.iter().any(H256::is_zero) {
            return Err(invalid("empty event sig"));
        }
        if self.addresses.iter().any(Address::is_zero) {
            return Err(invalid("empty address"));
        }
        Ok(())
    }

    /// Sort and dedup every set so filters compare by content.
    pub(crate) fn normalized(mut self) -> Self {
        sort_dedup(&mut self.addresses);
        sort_dedup(&mut self.event_sigs);
        sort_dedup(&mut self.topic2);
        sort_dedup(&mut self.topic3);
        sort_dedup(&mut self.topic4);
        self
    }

    /// Topic restrictions by position, the event signatures first.
    pub(crate) fn topic_sets(&self) -> [&[H256]; 4] {
        [&self.event_sigs, &self.topic2, &self.topic3, &self.topic4]
    }

    /// True if every log matched by `other` is matched by `self`.
    pub fn contains(&self, other: &Filter) -> bool {
        let addresses: BTreeSet<_> = self.addresses.iter().collect();
        if !other.addresses.iter().all(|a| addresses.contains(a)) {
            return false;
        }
        self.topic_sets()
            .into_iter()
            .zip(other.topic_sets())
            .all(|(ours, theirs)| match (ours.is_empty(), theirs.is_empty()) {
                (true, _) => true,
                (false, true) => false,
                (false, false) => theirs.iter().all(|t| ours.contains(t)),
            })
    }

    /// Union `other` into `self`. A wildcard topic position on either side
    /// stays a wildcard; a zero retention on either side wins.
    pub(crate) fn merge(&mut self, other: &Filter) {
        self.addresses.extend_from_slice(&other.addresses);
        self.event_sigs.extend_from_slice(&other.event_sigs);
        for (ours, theirs) in [
            (&mut self.topic2, &other.topic2),
            (&mut self.topic3, &other.topic3),
            (&mut self.topic4, &other.topic4),
        ] {
            if ours.is_empty() || theirs.is_empty() {
                ours.clear();
            } else {
                ours.extend_from_slice(theirs);
            }
        }
        self.retention = if self.retention.is_zero() || other.retention.is_zero() {
            Duration::ZERO
        } else {
            self.retention.max(other.retention)
        };
        sort_dedup(&mut self.addresses);
        sort_dedup(&mut self.event_sigs);
        sort_dedup(&mut self.topic2);
        sort_dedup(&mut self.topic3);
        sort_dedup(&mut self.topic4);
    }

    /// True if the filter captures logs with this address and event signature.
    pub(crate) fn matches(&self, address: &Address, event_sig: &H256) -> bool {
        self.addresses.contains(address) && self.event_sigs.contains(event_sig)
    }
}

fn sort_dedup<T: Ord>(values: &mut Vec<T>) {
    values.sort_unstable();
    values.dedup();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(n: u64) -> H256 {
        H256::from_low_u64_be(n)
    }

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    #[test]
    fn rejects_empty_sets_and_zero_values() {
        assert!(Filter::new("a", [], [addr(1)]).validate().is_err());
        assert!(Filter::new("a", [sig(1)], []).validate().is_err());
        assert!(Filter::new("a", [H256::zero()], [addr(1)]).validate().is_err());
        assert!(Filter::new("a", [sig(1)], [Address::zero()]).validate().is_err());
        assert!(Filter::new("a", [sig(1)], [addr(1)]).validate().is_ok());
    }

    #[test]
    fn contains_checks_addresses_and_topics() {
        let wide = Filter::new("a", [sig(1), sig(2)], [addr(1), addr(2)]).normalized();
        let narrow = Filter::new("a", [sig(2)], [addr(1)])
            .with_topics(vec![sig(9)], vec![], vec![])
            .normalized();
        assert!(wide.contains(&narrow));
        assert!(!narrow.contains(&wide));
        assert!(wide.contains(&wide));

        let other_address = Filter::new("a", [sig(1)], [addr(3)]);
        assert!(!wide.contains(&other_address));
    }

    #[test]
    fn merge_is_a_union() {
        let mut filter = Filter::new("a", [sig(2), sig(1)], [addr(1)])
            .with_topics(vec![sig(7)], vec![sig(8)], vec![])
            .with_retention(Duration::from_secs(60))
            .normalized();
        let other = Filter::new("a", [sig(1), sig(3)], [addr(2), addr(1)])
            .with_topics(vec![sig(6)], vec![], vec![sig(5)])
            .with_retention(Duration::from_secs(120));
        filter.merge(&other);

        assert_eq!(filter.event_sigs, vec![sig(1), sig(2), sig(3)]);
        assert_eq!(filter.addresses, vec![addr(1), addr(2)]);
        assert_eq!(filter.topic2, vec![sig(6), sig(7)]);
        assert!(filter.topic3.is_empty());
        assert!(filter.topic4.is_empty());
        assert_eq!(filter.retention, Duration::from_secs(120));
        assert!(filter.contains(&other));

        filter.merge(&Filter::new("a", [sig(1)], [addr(1)]));
        assert_eq!(filter.retention, Duration::ZERO);
    }
}
