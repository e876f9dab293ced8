use std::collections::BTreeMap;

use ethers::types::{Address, H256};
use itertools::Itertools;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::client::{BlockSelector, LogQuery};
use crate::db::LogPollerDb;
use crate::{Filter, LogPollerResult};

/// The union of every registered filter, as sent to `eth_getLogs`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AggregateFilter {
    /// Every registered address, in registration name order
    pub addresses: Vec<Address>,
    /// Every registered event signature, in registration name order
    pub event_sigs: Vec<H256>,
    /// Accepted values of topics 1 to 3, empty where any filter accepts any
    /// value
    pub topics: [Vec<H256>; 3],
}

impl AggregateFilter {
    fn build<'a>(filters: impl Iterator<Item = &'a Filter> + Clone) -> Self {
        if filters.clone().next().is_none() {
            // an empty registry must not turn into a match-all query
            return Self {
                addresses: vec![Address::zero()],
                ..Default::default()
            };
        }
        let topic = |pick: fn(&Filter) -> &Vec<H256>| {
            if filters.clone().any(|f| pick(f).is_empty()) {
                Vec::new()
            } else {
                ordered_union(filters.clone().map(pick))
            }
        };
        Self {
            addresses: ordered_union(filters.clone().map(|f| &f.addresses)),
            event_sigs: ordered_union(filters.clone().map(|f| &f.event_sigs)),
            topics: [topic(|f| &f.topic2), topic(|f| &f.topic3), topic(|f| &f.topic4)],
        }
    }

    /// `eth_getLogs` request for this filter over `block`.
    pub fn log_query(&self, block: BlockSelector) -> LogQuery {
        let [topic2, topic3, topic4] = self.topics.clone();
        LogQuery {
            block,
            addresses: self.addresses.clone(),
            topics: [self.event_sigs.clone(), topic2, topic3, topic4],
        }
    }
}

/// Concatenation of `lists` keeping the first occurrence of each value.
fn ordered_union<'a, T>(lists: impl Iterator<Item = &'a Vec<T>>) -> Vec<T>
where
    T: Copy + Eq + std::hash::Hash + 'a,
{
    lists.flatten().copied().unique().collect()
}

#[derive(Debug, Default)]
struct RegistryState {
    filters: BTreeMap<String, Filter>,
    /// `None` after every mutation, rebuilt on the next read
    aggregate: Option<AggregateFilter>,
}

/// Named filters, kept consistent with the filter table. One lock guards
/// both the filters and the cached aggregate.
#[derive(Debug, Default)]
pub struct FilterRegistry {
    state: Mutex<RegistryState>,
}

impl FilterRegistry {
    /// Validate and store `filter`. A filter with the same name is merged
    /// into rather than replaced. Memory is only updated once the store
    /// accepted the filter.
    #[instrument(skip_all, fields(filter = %filter.name))]
    pub async fn register<D: LogPollerDb>(&self, db: &D, filter: Filter) -> LogPollerResult<()> {
        filter.validate()?;
        let filter = filter.normalized();

        let mut state = self.state.lock().await;
        let filter = match state.filters.get(&filter.name) {
            Some(existing) if existing.contains(&filter) => {
                warn!("Filter already present, no-op");
                return Ok(());
            }
            Some(existing) => {
                warn!("Updating existing filter with more events or addresses");
                let mut merged = existing.clone();
                merged.merge(&filter);
                merged
            }
            None => filter,
        };

        db.insert_filter(&filter).await?;
        debug!(
            addresses = filter.addresses.len(),
            event_sigs = filter.event_sigs.len(),
            "Registered filter"
        );
        state.filters.insert(filter.name.clone(), filter);
        state.aggregate = None;
        Ok(())
    }

    /// Remove the filter from the store, then from memory. Unknown names are
    /// logged and ignored.
    #[instrument(skip(self, db))]
    pub async fn unregister<D: LogPollerDb>(&self, db: &D, name: &str) -> LogPollerResult<()> {
        let mut state = self.state.lock().await;
        let deleted = db.delete_filter(name).await?;
        let known = state.filters.remove(name).is_some();
        match (deleted, known) {
            (0, false) => warn!("Filter not found"),
            (0, true) => warn!("Filter was missing from storage, removed from memory"),
            _ => debug!("Unregistered filter"),
        }
        state.aggregate = None;
        Ok(())
    }

    /// Replace the in-memory filters with the stored ones, reporting any
    /// drift between the two.
    #[instrument(skip_all)]
    pub async fn load<D: LogPollerDb>(&self, db: &D) -> LogPollerResult<()> {
        // held across the read so a concurrent register can't be overwritten
        let mut state = self.state.lock().await;
        let stored: BTreeMap<_, _> = db
            .load_filters()
            .await?
            .into_iter()
            .map(|(name, filter)| (name, filter.normalized()))
            .collect();

        for (name, ours) in &state.filters {
            match stored.get(name) {
                None => warn!(filter = %name, "Filter missing from storage, dropping it"),
                Some(theirs) if !(theirs.contains(ours) && ours.contains(theirs)) => {
                    warn!(filter = %name, "Filter differs from storage, using stored definition")
                }
                Some(_) => {}
            }
        }
        debug!(filters = stored.len(), "Loaded filters");
        state.filters = stored;
        state.aggregate = None;
        Ok(())
    }

    /// The combined filter, rebuilt if anything changed since the last call.
    pub async fn aggregate(&self) -> AggregateFilter {
        let mut state = self.state.lock().await;
        if let Some(aggregate) = &state.aggregate {
            return aggregate.clone();
        }
        let aggregate = AggregateFilter::build(state.filters.values());
        state.aggregate = Some(aggregate.clone());
        aggregate
    }

    /// True if a filter with this name is registered.
    pub async fn has_filter(&self, name: &str) -> bool {
        self.state.lock().await.filters.contains_key(name)
    }

    /// A copy of every registered filter.
    pub async fn filters(&self) -> BTreeMap<String, Filter> {
        self.state.lock().await.filters.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use maplit::btreemap;
    use tokio::time::sleep;

    use super::*;
    use crate::test_utils::MemoryDb;

    const CHAIN_ID: u64 = 1337;

    fn sig(n: u64) -> H256 {
        H256::from_low_u64_be(n)
    }

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    #[tokio::test]
    async fn empty_registry_matches_zero_address() {
        let registry = FilterRegistry::default();
        let aggregate = registry.aggregate().await;
        assert_eq!(aggregate.addresses, vec![Address::zero()]);
        assert!(aggregate.event_sigs.is_empty());
    }

    #[tokio::test]
    async fn aggregate_dedups_across_filters() {
        let db = MemoryDb::new(CHAIN_ID);
        let registry = FilterRegistry::default();
        registry
            .register(&db, Filter::new("a", [sig(1), sig(2)], [addr(1), addr(2)]))
            .await
            .unwrap();
        registry
            .register(&db, Filter::new("b", [sig(2), sig(3)], [addr(2), addr(3)]))
            .await
            .unwrap();

        let aggregate = registry.aggregate().await;
        assert_eq!(aggregate.addresses, vec![addr(1), addr(2), addr(3)]);
        assert_eq!(aggregate.event_sigs, vec![sig(1), sig(2), sig(3)]);
        assert_eq!(aggregate.topics, [vec![], vec![], vec![]]);
    }

    #[tokio::test]
    async fn same_name_merges_instead_of_duplicating() {
        let db = MemoryDb::new(CHAIN_ID);
        let registry = FilterRegistry::default();
        registry
            .register(&db, Filter::new("a", [sig(1)], [addr(1)]))
            .await
            .unwrap();
        registry
            .register(&db, Filter::new("a", [sig(2)], [addr(2)]))
            .await
            .unwrap();

        let filters = registry.filters().await;
        assert_eq!(filters.len(), 1);
        assert_eq!(filters["a"].event_sigs, vec![sig(1), sig(2)]);
        assert_eq!(filters["a"].addresses, vec![addr(1), addr(2)]);
        assert_eq!(db.load_filters().await.unwrap(), filters);
    }

    #[tokio::test]
    async fn topics_only_restricted_when_every_filter_restricts_them() {
        let db = MemoryDb::new(CHAIN_ID);
        let registry = FilterRegistry::default();
        registry
            .register(
                &db,
                Filter::new("a", [sig(1)], [addr(1)]).with_topics(vec![sig(7)], vec![sig(8)], vec![]),
            )
            .await
            .unwrap();
        registry
            .register(
                &db,
                Filter::new("b", [sig(1)], [addr(1)]).with_topics(vec![sig(9)], vec![], vec![]),
            )
            .await
            .unwrap();

        let aggregate = registry.aggregate().await;
        assert_eq!(aggregate.topics, [vec![sig(7), sig(9)], vec![], vec![]]);
    }

    #[tokio::test]
    async fn failed_persistence_leaves_memory_untouched() {
        let db = MemoryDb::new(CHAIN_ID);
        db.fail_writes(true);
        let registry = FilterRegistry::default();
        let result = registry
            .register(&db, Filter::new("a", [sig(1)], [addr(1)]))
            .await;
        assert!(result.is_err());
        assert!(!registry.has_filter("a").await);
    }

    #[tokio::test]
    async fn invalid_filters_are_rejected() {
        let db = MemoryDb::new(CHAIN_ID);
        let registry = FilterRegistry::default();
        assert!(registry
            .register(&db, Filter::new("a", [], [addr(1)]))
            .await
            .is_err());
        assert!(registry
            .register(&db, Filter::new("a", [sig(1)], []))
            .await
            .is_err());
        assert!(db.load_filters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unregister_unknown_filter_is_a_no_op() {
        let db = MemoryDb::new(CHAIN_ID);
        let registry = FilterRegistry::default();
        registry.unregister(&db, "missing").await.unwrap();

        registry
            .register(&db, Filter::new("a", [sig(1)], [addr(1)]))
            .await
            .unwrap();
        registry.unregister(&db, "a").await.unwrap();
        assert!(!registry.has_filter("a").await);
        assert_eq!(registry.aggregate().await.addresses, vec![Address::zero()]);
    }

    #[tokio::test]
    async fn load_takes_the_stored_filters() {
        let db = MemoryDb::new(CHAIN_ID);
        let stored = Filter::new("stored", [sig(1)], [addr(1)]).with_retention(Duration::from_secs(5));
        db.insert_filter(&stored).await.unwrap();

        let registry = FilterRegistry::default();
        registry.load(&db).await.unwrap();
        assert_eq!(registry.filters().await, btreemap! { "stored".to_owned() => stored });
    }

    #[tokio::test]
    async fn register_during_load_is_kept() {
        let db = Arc::new(MemoryDb::new(CHAIN_ID));
        let registry = Arc::new(FilterRegistry::default());
        let (read, resume) = db.pause_next_filter_load();

        let load = tokio::spawn({
            let (db, registry) = (db.clone(), registry.clone());
            async move { registry.load(&db).await }
        });
        read.notified().await;
        let register = tokio::spawn({
            let (db, registry) = (db.clone(), registry.clone());
            async move {
                registry
                    .register(&db, Filter::new("new", [sig(1)], [addr(1)]))
                    .await
            }
        });
        // give the register a chance to run while the load is stalled
        sleep(Duration::from_millis(20)).await;
        resume.notify_one();

        load.await.unwrap().unwrap();
        register.await.unwrap().unwrap();
        assert!(db.load_filters().await.unwrap().contains_key("new"));
        assert!(registry.has_filter("new").await);
    }
}
