use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use auto_impl::auto_impl;
use ethers::types::{Address, H256};

use crate::query::{Expression, LimitAndSort};
use crate::{Filter, Log, LogPollerBlock};

pub use error::DbError;
pub use postgres::LogPollerPgDb;

mod error;
mod postgres;

/// Result type of the store
pub type DbResult<T> = Result<T, DbError>;

/// Transactional storage of blocks, logs and filters for a single chain.
///
/// Every write touching both blocks and logs is atomic: readers never see a
/// block without its logs or the other way around.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait LogPollerDb: Send + Sync + Debug {
    /// Chain this store is scoped to
    fn chain_id(&self) -> u64;

    /// Make sure the chain row filters reference exists.
    async fn insert_evm_chain(&self) -> DbResult<()>;

    /// Insert a block, replacing the stored row when its hash differs.
    async fn insert_block(&self, block: &LogPollerBlock) -> DbResult<()>;

    /// Insert logs, ignoring rows that are already stored.
    async fn insert_logs(&self, logs: &[Log]) -> DbResult<()>;

    /// Insert `block` and `logs` in one transaction.
    async fn insert_logs_with_block(&self, logs: &[Log], block: &LogPollerBlock) -> DbResult<()>;

    /// In one transaction, delete the logs in `[start, end]` emitted by any
    /// of `addresses` with any of `event_sigs`, insert `logs` and, if given,
    /// `block`.
    async fn replace_logs_in_range(
        &self,
        start: u64,
        end: u64,
        addresses: &[Address],
        event_sigs: &[H256],
        logs: &[Log],
        block: Option<&LogPollerBlock>,
    ) -> DbResult<()>;

    /// Delete blocks and logs at or above `start`.
    async fn delete_logs_and_blocks_after(&self, start: u64) -> DbResult<()>;

    /// Delete blocks at or below `end`, at most `limit` of them (0 for all).
    /// Returns the number of deleted rows.
    async fn delete_blocks_before(&self, end: u64, limit: u64) -> DbResult<u64>;

    /// Delete logs whose every matching filter has a finite, elapsed
    /// retention, at most `limit` of them (0 for all).
    async fn delete_expired_logs(&self, limit: u64) -> DbResult<u64>;

    /// Insert or replace a filter by name.
    async fn insert_filter(&self, filter: &Filter) -> DbResult<()>;

    /// Delete a filter by name, returning the number of deleted rows.
    async fn delete_filter(&self, name: &str) -> DbResult<u64>;

    /// All stored filters by name.
    async fn load_filters(&self) -> DbResult<BTreeMap<String, Filter>>;

    /// The block at `number`.
    async fn select_block_by_number(&self, number: u64) -> DbResult<Option<LogPollerBlock>>;

    /// The highest stored block.
    async fn select_latest_block(&self) -> DbResult<Option<LogPollerBlock>>;

    /// The lowest stored block at or above `min_allowed`.
    async fn select_oldest_block(&self, min_allowed: u64) -> DbResult<Option<LogPollerBlock>>;

    /// Stored blocks in `[start, end]`, ascending.
    async fn get_blocks_range(&self, start: u64, end: u64) -> DbResult<Vec<LogPollerBlock>>;

    /// Logs matching every expression of `filter`.
    async fn filtered_logs(
        &self,
        filter: &[Expression],
        limit_and_sort: &LimitAndSort,
    ) -> DbResult<Vec<Log>>;
}

/// Reject logs belonging to another chain before writing them.
pub(crate) fn validate_logs(chain_id: u64, logs: &[Log]) -> DbResult<()> {
    match logs.iter().find(|log| log.evm_chain_id != chain_id) {
        Some(log) => Err(DbError::InvalidChainId {
            got: log.evm_chain_id,
            want: chain_id,
        }),
        None => Ok(()),
    }
}
