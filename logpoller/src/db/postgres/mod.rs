use std::collections::BTreeMap;

use async_trait::async_trait;
use ethers::types::{Address, H256};
use sea_orm::{ActiveValue::*, Database, DbConn, EntityTrait, TransactionTrait};
use tracing::instrument;

use crate::conversions::u64_to_db;
use crate::db::{validate_logs, DbResult, LogPollerDb};
use crate::query::{Expression, LimitAndSort};
use crate::{Filter, Log, LogPollerBlock};

use generated::evm_chain;

mod block;
mod dsl;
mod filter;
#[allow(clippy::all)]
mod generated;
mod log;


/// Postgres backed [`LogPollerDb`].
#[derive(Clone, Debug)]
pub struct LogPollerPgDb {
    conn: DbConn,
    chain_id: u64,
}

impl LogPollerPgDb {
    /// Connect to the database at `url`.
    #[instrument]
    pub async fn connect(url: &str, chain_id: u64) -> DbResult<Self> {
        let conn = Database::connect(url).await?;
        Ok(Self::with_connection(conn, chain_id))
    }

    /// Use an existing connection.
    pub fn with_connection(conn: DbConn, chain_id: u64) -> Self {
        Self { conn, chain_id }
    }

    fn db_chain_id(&self) -> i64 {
        u64_to_db(self.chain_id)
    }
}

#[async_trait]
impl LogPollerDb for LogPollerPgDb {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    #[instrument(skip(self), fields(chain_id = self.chain_id))]
    async fn insert_evm_chain(&self) -> DbResult<()> {
        let model = evm_chain::ActiveModel {
            id: Set(self.db_chain_id()),
            time_created: NotSet,
        };
        evm_chain::Entity::insert(model)
            .on_conflict(
                sea_orm::sea_query::OnConflict::column(evm_chain::Column::Id)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.conn)
            .await?;
        Ok(())
    }

    async fn insert_block(&self, block: &LogPollerBlock) -> DbResult<()> {
        self.upsert_block(&self.conn, block).await
    }

    async fn insert_logs(&self, logs: &[Log]) -> DbResult<()> {
        validate_logs(self.chain_id, logs)?;
        let txn = self.conn.begin().await?;
        self.insert_logs_batched(&txn, logs).await?;
        txn.commit().await?;
        Ok(())
    }

    #[instrument(skip_all, fields(block = block.block_number, logs = logs.len()))]
    async fn insert_logs_with_block(&self, logs: &[Log], block: &LogPollerBlock) -> DbResult<()> {
        if logs.is_empty() {
            return self.upsert_block(&self.conn, block).await;
        }
        validate_logs(self.chain_id, logs)?;
        let txn = self.conn.begin().await?;
        self.upsert_block(&txn, block).await?;
        self.insert_logs_batched(&txn, logs).await?;
        txn.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, addresses, event_sigs, logs, block), fields(logs = logs.len()))]
    async fn replace_logs_in_range(
        &self,
        start: u64,
        end: u64,
        addresses: &[Address],
        event_sigs: &[H256],
        logs: &[Log],
        block: Option<&LogPollerBlock>,
    ) -> DbResult<()> {
        validate_logs(self.chain_id, logs)?;
        let txn = self.conn.begin().await?;
        self.delete_matching_logs(&txn, start, end, addresses, event_sigs)
            .await?;
        self.insert_logs_batched(&txn, logs).await?;
        if let Some(block) = block {
            self.upsert_block(&txn, block).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_logs_and_blocks_after(&self, start: u64) -> DbResult<()> {
        let txn = self.conn.begin().await?;
        self.delete_blocks_from(&txn, start).await?;
        self.delete_logs_from(&txn, start).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn delete_blocks_before(&self, end: u64, limit: u64) -> DbResult<u64> {
        self.delete_blocks_up_to(end, limit).await
    }

    async fn delete_expired_logs(&self, limit: u64) -> DbResult<u64> {
        self.delete_expired(limit).await
    }

    async fn insert_filter(&self, filter: &Filter) -> DbResult<()> {
        self.upsert_filter(filter).await
    }

    async fn delete_filter(&self, name: &str) -> DbResult<u64> {
        self.delete_filter_by_name(name).await
    }

    async fn load_filters(&self) -> DbResult<BTreeMap<String, Filter>> {
        self.select_filters().await
    }

    async fn select_block_by_number(&self, number: u64) -> DbResult<Option<LogPollerBlock>> {
        self.block_by_number(number).await
    }

    async fn select_latest_block(&self) -> DbResult<Option<LogPollerBlock>> {
        self.latest_block().await
    }

    async fn select_oldest_block(&self, min_allowed: u64) -> DbResult<Option<LogPollerBlock>> {
        self.oldest_block(min_allowed).await
    }

    async fn get_blocks_range(&self, start: u64, end: u64) -> DbResult<Vec<LogPollerBlock>> {
        self.blocks_in_range(start, end).await
    }

    async fn filtered_logs(
        &self,
        filter: &[Expression],
        limit_and_sort: &LimitAndSort,
    ) -> DbResult<Vec<Log>> {
        self.select_filtered_logs(filter, limit_and_sort).await
    }
}
