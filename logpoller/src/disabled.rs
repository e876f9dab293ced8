use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::query::{Expression, LimitAndSort};
use crate::{Filter, Log, LogPollerApi, LogPollerBlock, LogPollerError, LogPollerResult};

/// Stand-in for chains without log polling. Every operation fails with
/// [`LogPollerError::Disabled`] without touching the chain or a store.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledLogPoller;

#[async_trait]
impl LogPollerApi for DisabledLogPoller {
    fn start(&self) -> LogPollerResult<()> {
        Err(LogPollerError::Disabled)
    }

    async fn close(&self) -> LogPollerResult<()> {
        Err(LogPollerError::Disabled)
    }

    fn healthy(&self) -> LogPollerResult<()> {
        Err(LogPollerError::Disabled)
    }

    fn name(&self) -> &str {
        "disabledLogPoller"
    }

    async fn replay(&self, _cancel: &CancellationToken, _from_block: u64) -> LogPollerResult<()> {
        Err(LogPollerError::Disabled)
    }

    fn replay_async(&self, _from_block: u64) {}

    async fn register_filter(&self, _filter: Filter) -> LogPollerResult<()> {
        Err(LogPollerError::Disabled)
    }

    async fn unregister_filter(&self, _name: &str) -> LogPollerResult<()> {
        Err(LogPollerError::Disabled)
    }

    async fn has_filter(&self, _name: &str) -> bool {
        false
    }

    async fn get_filters(&self) -> BTreeMap<String, Filter> {
        BTreeMap::new()
    }

    async fn latest_block(&self) -> LogPollerResult<Option<LogPollerBlock>> {
        Err(LogPollerError::Disabled)
    }

    async fn block_by_number(&self, _number: u64) -> LogPollerResult<Option<LogPollerBlock>> {
        Err(LogPollerError::Disabled)
    }

    async fn get_blocks_range(&self, _numbers: &[u64]) -> LogPollerResult<Vec<LogPollerBlock>> {
        Err(LogPollerError::Disabled)
    }

    async fn filtered_logs(
        &self,
        _filter: &[Expression],
        _limit_and_sort: &LimitAndSort,
        _query_name: &str,
    ) -> LogPollerResult<Vec<Log>> {
        Err(LogPollerError::Disabled)
    }
}
