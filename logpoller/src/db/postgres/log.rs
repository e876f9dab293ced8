use ethers::types::{Address, H256};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    prelude::*, ActiveValue::*, ConnectionTrait, DbBackend, DbErr, EntityTrait, Statement,
    TransactionTrait,
};
use tracing::{debug, instrument, trace, warn};

use super::dsl::{apply_limit_and_sort, expressions_condition};
use super::generated::log;
use super::LogPollerPgDb;
use crate::conversions::{
    address_to_bytes, bytes_to_address, bytes_to_h256, db_to_u64, h256_to_bytes, u64_to_db,
};
use crate::db::DbResult;
use crate::query::{Expression, LimitAndSort};
use crate::Log;

const INSERT_BATCH_SIZE: usize = 4000;
const MIN_INSERT_BATCH_SIZE: usize = 500;

/// Logs whose every matching filter has a finite retention that elapsed.
/// A log matched by a filter with zero retention is never selected.
const EXPIRED_LOGS_SQL: &str = r#"
DELETE FROM log WHERE id IN (
    SELECT l.id FROM log l
    JOIN (
        SELECT a.address, e.event_sig, MAX(f.retention) AS retention
        FROM log_poller_filter f
        CROSS JOIN LATERAL unnest(f.addresses) AS a(address)
        CROSS JOIN LATERAL unnest(f.event_sigs) AS e(event_sig)
        WHERE f.evm_chain_id = $1
        GROUP BY a.address, e.event_sig
        HAVING MIN(f.retention) > 0
    ) r ON l.address = r.address AND l.event_sig = r.event_sig
    WHERE l.evm_chain_id = $1
    AND l.block_timestamp <= (NOW() AT TIME ZONE 'utc') - (r.retention * INTERVAL '1 second')
    {limit}
)"#;

impl From<log::Model> for Log {
    fn from(model: log::Model) -> Self {
        Self {
            evm_chain_id: db_to_u64(model.evm_chain_id),
            log_index: db_to_u64(model.log_index),
            block_hash: bytes_to_h256(&model.block_hash),
            block_number: db_to_u64(model.block_number),
            block_timestamp: model.block_timestamp,
            address: bytes_to_address(&model.address),
            event_sig: bytes_to_h256(&model.event_sig),
            topics: model.topics.iter().map(|t| bytes_to_h256(t)).collect(),
            tx_hash: bytes_to_h256(&model.tx_hash),
            data: model.data,
            created_at: model.time_created,
        }
    }
}

fn active_model(log: &Log) -> log::ActiveModel {
    log::ActiveModel {
        id: NotSet,
        time_created: NotSet,
        evm_chain_id: Set(u64_to_db(log.evm_chain_id)),
        log_index: Set(u64_to_db(log.log_index)),
        block_hash: Set(h256_to_bytes(&log.block_hash)),
        block_number: Set(u64_to_db(log.block_number)),
        block_timestamp: Set(log.block_timestamp),
        address: Set(address_to_bytes(&log.address)),
        event_sig: Set(h256_to_bytes(&log.event_sig)),
        topics: Set(log.topics.iter().map(h256_to_bytes).collect()),
        tx_hash: Set(h256_to_bytes(&log.tx_hash)),
        data: Set(log.data.clone()),
    }
}

fn is_timeout(err: &DbErr) -> bool {
    let msg = err.to_string();
    msg.contains("statement timeout") || msg.contains("timed out")
}

impl LogPollerPgDb {
    /// Insert logs in batches, each batch inside a savepoint of `conn`. A
    /// batch hitting a statement timeout is retried at half the size.
    pub(super) async fn insert_logs_batched<C>(&self, conn: &C, logs: &[Log]) -> DbResult<()>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let mut batch_size = INSERT_BATCH_SIZE;
        let mut offset = 0;
        while offset < logs.len() {
            let end = (offset + batch_size).min(logs.len());
            let models = logs[offset..end].iter().map(active_model).collect::<Vec<_>>();
            trace!(?models, "Writing logs to database");

            let savepoint = conn.begin().await?;
            let inserted = log::Entity::insert_many(models)
                .on_conflict(
                    OnConflict::columns([
                        log::Column::EvmChainId,
                        log::Column::BlockNumber,
                        log::Column::LogIndex,
                    ])
                    .do_nothing()
                    .to_owned(),
                )
                .exec_without_returning(&savepoint)
                .await;
            match inserted {
                Ok(rows) => {
                    savepoint.commit().await?;
                    debug!(logs = end - offset, inserted = rows, "Wrote logs to database");
                    offset = end;
                }
                Err(err) if is_timeout(&err) && batch_size > MIN_INSERT_BATCH_SIZE => {
                    savepoint.rollback().await?;
                    batch_size /= 2;
                    warn!(?err, batch_size, "Timed out inserting logs, halving batch size");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    pub(super) async fn delete_logs_from<C: ConnectionTrait>(
        &self,
        conn: &C,
        start: u64,
    ) -> DbResult<u64> {
        let deleted = log::Entity::delete_many()
            .filter(log::Column::EvmChainId.eq(self.db_chain_id()))
            .filter(log::Column::BlockNumber.gte(u64_to_db(start)))
            .exec(conn)
            .await?
            .rows_affected;
        debug!(start, deleted, "Deleted logs after reorg");
        Ok(deleted)
    }

    pub(super) async fn delete_matching_logs<C: ConnectionTrait>(
        &self,
        conn: &C,
        start: u64,
        end: u64,
        addresses: &[Address],
        event_sigs: &[H256],
    ) -> DbResult<u64> {
        let deleted = log::Entity::delete_many()
            .filter(log::Column::EvmChainId.eq(self.db_chain_id()))
            .filter(log::Column::BlockNumber.between(u64_to_db(start), u64_to_db(end)))
            .filter(log::Column::Address.is_in(addresses.iter().map(address_to_bytes)))
            .filter(log::Column::EventSig.is_in(event_sigs.iter().map(h256_to_bytes)))
            .exec(conn)
            .await?
            .rows_affected;
        debug!(start, end, deleted, "Deleted logs to be replaced");
        Ok(deleted)
    }

    #[instrument(skip(self))]
    pub(super) async fn delete_expired(&self, limit: u64) -> DbResult<u64> {
        let (sql, values) = if limit > 0 {
            (
                EXPIRED_LOGS_SQL.replace("{limit}", "LIMIT $2"),
                vec![self.db_chain_id().into(), u64_to_db(limit).into()],
            )
        } else {
            (
                EXPIRED_LOGS_SQL.replace("{limit}", ""),
                vec![self.db_chain_id().into()],
            )
        };
        let deleted = self
            .conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Postgres,
                sql,
                values,
            ))
            .await?
            .rows_affected();
        debug!(deleted, "Pruned expired logs");
        Ok(deleted)
    }

    #[instrument(skip(self))]
    pub(super) async fn select_filtered_logs(
        &self,
        filter: &[Expression],
        limit_and_sort: &LimitAndSort,
    ) -> DbResult<Vec<Log>> {
        let select = log::Entity::find()
            .filter(log::Column::EvmChainId.eq(self.db_chain_id()))
            .filter(expressions_condition(filter, self.db_chain_id())?);
        let logs = apply_limit_and_sort(select, limit_and_sort)
            .all(&self.conn)
            .await?;
        debug!(logs = logs.len(), "Queried logs");
        Ok(logs.into_iter().map(Into::into).collect())
    }
}
