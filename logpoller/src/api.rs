use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;

use async_trait::async_trait;
use ethers::types::{Address, H256};
use sea_orm::prelude::TimeDateTime;
use tokio_util::sync::CancellationToken;

use crate::query::{Comparator, Expression, LimitAndSort, SortBy, SortDirection};
use crate::{Confirmations, Filter, Log, LogPollerBlock, LogPollerError, LogPollerResult};

/// Topic positions a query may compare, the event signature excluded.
pub(crate) fn check_topic_index(index: usize) -> LogPollerResult<()> {
    if (1..=3).contains(&index) {
        Ok(())
    } else {
        Err(LogPollerError::InvalidTopicIndex(index))
    }
}

fn emitted_by(address: Address, event_sig: H256) -> Vec<Expression> {
    vec![Expression::Address(address), Expression::EventSig(event_sig)]
}

fn topic(index: usize, op: Comparator, value: H256) -> Expression {
    Expression::Topic { index, op, value }
}

fn word(index: usize, op: Comparator, value: H256) -> Expression {
    Expression::DataWord { index, op, value }
}

/// Everything consumers can do with a log poller. Implemented by the
/// [`LogPoller`](crate::LogPoller) itself and by
/// [`DisabledLogPoller`](crate::DisabledLogPoller).
///
/// The typed queries are all expressed through
/// [`filtered_logs`](Self::filtered_logs). Topic indexes are 1 to 3, data
/// word indexes count 32 byte words from 0.
#[async_trait]
pub trait LogPollerApi: Send + Sync + Debug {
    /// Spawn the polling loops.
    fn start(&self) -> LogPollerResult<()>;

    /// Stop the polling loops and wait for them.
    async fn close(&self) -> LogPollerResult<()>;

    /// Error while the service is degraded.
    fn healthy(&self) -> LogPollerResult<()>;

    /// Service name
    fn name(&self) -> &str;

    /// Re-process the chain from `from_block`, waiting for completion.
    async fn replay(&self, cancel: &CancellationToken, from_block: u64) -> LogPollerResult<()>;

    /// Re-process the chain from `from_block` in the background.
    fn replay_async(&self, from_block: u64);

    /// Register a filter, merging it into an existing one of the same name.
    async fn register_filter(&self, filter: Filter) -> LogPollerResult<()>;

    /// Remove a filter by name. Unknown names are not an error.
    async fn unregister_filter(&self, name: &str) -> LogPollerResult<()>;

    /// True if a filter with this name is registered.
    async fn has_filter(&self, name: &str) -> bool;

    /// Every registered filter by name.
    async fn get_filters(&self) -> BTreeMap<String, Filter>;

    /// The latest processed block.
    async fn latest_block(&self) -> LogPollerResult<Option<LogPollerBlock>>;

    /// The stored block at `number`.
    async fn block_by_number(&self, number: u64) -> LogPollerResult<Option<LogPollerBlock>>;

    /// Blocks for `numbers` in the same order, fetched from the chain when
    /// not stored yet.
    async fn get_blocks_range(&self, numbers: &[u64]) -> LogPollerResult<Vec<LogPollerBlock>>;

    /// Logs matching every one of `filter`, named `query_name` in traces.
    async fn filtered_logs(
        &self,
        filter: &[Expression],
        limit_and_sort: &LimitAndSort,
        query_name: &str,
    ) -> LogPollerResult<Vec<Log>>;

    /// Logs of `event_sig` from `address` in `[start, end]`.
    async fn logs(
        &self,
        start: u64,
        end: u64,
        event_sig: H256,
        address: Address,
    ) -> LogPollerResult<Vec<Log>> {
        let mut filter = emitted_by(address, event_sig);
        filter.push(Expression::block_range(start, end));
        self.filtered_logs(&filter, &LimitAndSort::default(), "Logs")
            .await
    }

    /// Logs of any of `event_sigs` from `address` in `[start, end]`.
    async fn logs_with_sigs(
        &self,
        start: u64,
        end: u64,
        event_sigs: &[H256],
        address: Address,
    ) -> LogPollerResult<Vec<Log>> {
        let filter = [
            Expression::Address(address),
            Expression::event_sigs(event_sigs),
            Expression::block_range(start, end),
        ];
        self.filtered_logs(&filter, &LimitAndSort::default(), "LogsWithSigs")
            .await
    }

    /// Logs stored after `after`.
    async fn logs_created_after(
        &self,
        event_sig: H256,
        address: Address,
        after: TimeDateTime,
        confs: Confirmations,
    ) -> LogPollerResult<Vec<Log>> {
        let mut filter = emitted_by(address, event_sig);
        filter.push(Expression::CreatedAt {
            at: after,
            op: Comparator::Gt,
        });
        filter.push(Expression::Confirmations(confs));
        self.filtered_logs(&filter, &LimitAndSort::default(), "LogsCreatedAfter")
            .await
    }

    /// Logs whose topic at `topic_index` is any of `topic_values`.
    async fn indexed_logs(
        &self,
        event_sig: H256,
        address: Address,
        topic_index: usize,
        topic_values: &[H256],
        confs: Confirmations,
    ) -> LogPollerResult<Vec<Log>> {
        check_topic_index(topic_index)?;
        let mut filter = emitted_by(address, event_sig);
        filter.push(Expression::topic_in(topic_index, topic_values));
        filter.push(Expression::Confirmations(confs));
        self.filtered_logs(&filter, &LimitAndSort::default(), "IndexedLogs")
            .await
    }

    /// [`indexed_logs`](Self::indexed_logs) restricted to `[start, end]`.
    async fn indexed_logs_by_block_range(
        &self,
        start: u64,
        end: u64,
        event_sig: H256,
        address: Address,
        topic_index: usize,
        topic_values: &[H256],
    ) -> LogPollerResult<Vec<Log>> {
        check_topic_index(topic_index)?;
        let mut filter = emitted_by(address, event_sig);
        filter.push(Expression::topic_in(topic_index, topic_values));
        filter.push(Expression::block_range(start, end));
        self.filtered_logs(&filter, &LimitAndSort::default(), "IndexedLogsByBlockRange")
            .await
    }

    /// [`indexed_logs`](Self::indexed_logs) stored after `after`.
    async fn indexed_logs_created_after(
        &self,
        event_sig: H256,
        address: Address,
        topic_index: usize,
        topic_values: &[H256],
        after: TimeDateTime,
        confs: Confirmations,
    ) -> LogPollerResult<Vec<Log>> {
        check_topic_index(topic_index)?;
        let mut filter = emitted_by(address, event_sig);
        filter.push(Expression::topic_in(topic_index, topic_values));
        filter.push(Expression::CreatedAt {
            at: after,
            op: Comparator::Gt,
        });
        filter.push(Expression::Confirmations(confs));
        self.filtered_logs(&filter, &LimitAndSort::default(), "IndexedLogsCreatedAfter")
            .await
    }

    /// Logs emitted by transaction `tx_hash`.
    async fn indexed_logs_by_tx_hash(
        &self,
        event_sig: H256,
        address: Address,
        tx_hash: H256,
    ) -> LogPollerResult<Vec<Log>> {
        let mut filter = emitted_by(address, event_sig);
        filter.push(Expression::TxHash(tx_hash));
        self.filtered_logs(&filter, &LimitAndSort::default(), "IndexedLogsByTxHash")
            .await
    }

    /// Logs whose topic at `topic_index` is at least `min`.
    async fn indexed_logs_topic_greater_than(
        &self,
        event_sig: H256,
        address: Address,
        topic_index: usize,
        min: H256,
        confs: Confirmations,
    ) -> LogPollerResult<Vec<Log>> {
        check_topic_index(topic_index)?;
        let mut filter = emitted_by(address, event_sig);
        filter.push(topic(topic_index, Comparator::Gte, min));
        filter.push(Expression::Confirmations(confs));
        self.filtered_logs(
            &filter,
            &LimitAndSort::default(),
            "IndexedLogsTopicGreaterThan",
        )
        .await
    }

    /// Logs whose topic at `topic_index` is within `[min, max]`.
    async fn indexed_logs_topic_range(
        &self,
        event_sig: H256,
        address: Address,
        topic_index: usize,
        min: H256,
        max: H256,
        confs: Confirmations,
    ) -> LogPollerResult<Vec<Log>> {
        check_topic_index(topic_index)?;
        let mut filter = emitted_by(address, event_sig);
        filter.push(topic(topic_index, Comparator::Gte, min));
        filter.push(topic(topic_index, Comparator::Lte, max));
        filter.push(Expression::Confirmations(confs));
        self.filtered_logs(&filter, &LimitAndSort::default(), "IndexedLogsTopicRange")
            .await
    }

    /// Logs whose data word at `word_index` is within `[min, max]`.
    async fn logs_data_word_range(
        &self,
        event_sig: H256,
        address: Address,
        word_index: usize,
        min: H256,
        max: H256,
        confs: Confirmations,
    ) -> LogPollerResult<Vec<Log>> {
        let mut filter = emitted_by(address, event_sig);
        filter.push(word(word_index, Comparator::Gte, min));
        filter.push(word(word_index, Comparator::Lte, max));
        filter.push(Expression::Confirmations(confs));
        self.filtered_logs(&filter, &LimitAndSort::default(), "LogsDataWordRange")
            .await
    }

    /// Logs whose data word at `word_index` is at least `min`.
    async fn logs_data_word_greater_than(
        &self,
        event_sig: H256,
        address: Address,
        word_index: usize,
        min: H256,
        confs: Confirmations,
    ) -> LogPollerResult<Vec<Log>> {
        let mut filter = emitted_by(address, event_sig);
        filter.push(word(word_index, Comparator::Gte, min));
        filter.push(Expression::Confirmations(confs));
        self.filtered_logs(&filter, &LimitAndSort::default(), "LogsDataWordGreaterThan")
            .await
    }

    /// Logs with `data[word_index_min] <= value <= data[word_index_max]`.
    /// Equal indexes test the word at that index for equality.
    async fn logs_data_word_between(
        &self,
        event_sig: H256,
        address: Address,
        word_index_min: usize,
        word_index_max: usize,
        value: H256,
        confs: Confirmations,
    ) -> LogPollerResult<Vec<Log>> {
        let mut filter = emitted_by(address, event_sig);
        filter.push(word(word_index_min, Comparator::Lte, value));
        filter.push(word(word_index_max, Comparator::Gte, value));
        filter.push(Expression::Confirmations(confs));
        self.filtered_logs(&filter, &LimitAndSort::default(), "LogsDataWordBetween")
            .await
    }

    /// Logs of `sig_a` in `[from_block, to_block]` without a log of `sig_b`
    /// in the same range sharing the topic at `topic_index`. Useful for
    /// requests still waiting for their fulfillment.
    #[allow(clippy::too_many_arguments)]
    async fn indexed_logs_with_sigs_excluding(
        &self,
        address: Address,
        sig_a: H256,
        sig_b: H256,
        topic_index: usize,
        from_block: u64,
        to_block: u64,
        confs: Confirmations,
    ) -> LogPollerResult<Vec<Log>> {
        check_topic_index(topic_index)?;
        let query = |sig| {
            let mut filter = emitted_by(address, sig);
            filter.push(Expression::block_range(from_block, to_block));
            filter.push(Expression::Confirmations(confs));
            filter
        };
        let excluded: HashSet<H256> = self
            .filtered_logs(
                &query(sig_b),
                &LimitAndSort::default(),
                "IndexedLogsWithSigsExcluding",
            )
            .await?
            .iter()
            .filter_map(|log| log.topic(topic_index))
            .collect();
        let mut logs = self
            .filtered_logs(
                &query(sig_a),
                &LimitAndSort::default(),
                "IndexedLogsWithSigsExcluding",
            )
            .await?;
        logs.retain(|log| {
            log.topic(topic_index)
                .map_or(true, |value| !excluded.contains(&value))
        });
        Ok(logs)
    }

    /// The most recent log of `event_sig` from `address`.
    async fn latest_log_by_event_sig_with_confs(
        &self,
        event_sig: H256,
        address: Address,
        confs: Confirmations,
    ) -> LogPollerResult<Option<Log>> {
        let mut filter = emitted_by(address, event_sig);
        filter.push(Expression::Confirmations(confs));
        let logs = self
            .filtered_logs(
                &filter,
                &LimitAndSort::sorted([SortBy::Sequence(SortDirection::Desc)]).with_count(1),
                "LatestLogByEventSigWithConfs",
            )
            .await?;
        Ok(logs.into_iter().next())
    }

    /// The most recent log at or above `from_block` for every pair of
    /// address and event signature, in ascending order.
    async fn latest_log_event_sigs_addrs_with_confs(
        &self,
        from_block: u64,
        event_sigs: &[H256],
        addresses: &[Address],
        confs: Confirmations,
    ) -> LogPollerResult<Vec<Log>> {
        let filter = [
            Expression::addresses(addresses),
            Expression::event_sigs(event_sigs),
            Expression::Block {
                number: from_block,
                op: Comparator::Gte,
            },
            Expression::Confirmations(confs),
        ];
        let logs = self
            .filtered_logs(
                &filter,
                &LimitAndSort::sorted([SortBy::Sequence(SortDirection::Desc)]),
                "LatestLogEventSigsAddrsWithConfs",
            )
            .await?;
        let mut seen = HashSet::new();
        let mut latest: Vec<Log> = logs
            .into_iter()
            .filter(|log| seen.insert((log.address, log.event_sig)))
            .collect();
        latest.sort_by_key(|log| (log.block_number, log.log_index));
        Ok(latest)
    }

    /// The highest block at or above `from_block` holding a matching log,
    /// 0 if there is none.
    async fn latest_block_by_event_sigs_addrs_with_confs(
        &self,
        from_block: u64,
        event_sigs: &[H256],
        addresses: &[Address],
        confs: Confirmations,
    ) -> LogPollerResult<u64> {
        let filter = [
            Expression::addresses(addresses),
            Expression::event_sigs(event_sigs),
            Expression::Block {
                number: from_block,
                op: Comparator::Gte,
            },
            Expression::Confirmations(confs),
        ];
        let logs = self
            .filtered_logs(
                &filter,
                &LimitAndSort::sorted([SortBy::Block(SortDirection::Desc)]).with_count(1),
                "LatestBlockByEventSigsAddrsWithConfs",
            )
            .await?;
        Ok(logs.first().map_or(0, |log| log.block_number))
    }
}
