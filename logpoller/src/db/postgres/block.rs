use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{prelude::*, ActiveValue::*, ConnectionTrait, EntityTrait, QueryOrder};
use tracing::{debug, instrument, trace};

use super::generated::log_poller_block as block;
use super::LogPollerPgDb;
use crate::conversions::{bytes_to_h256, db_to_u64, h256_to_bytes, u64_to_db};
use crate::db::DbResult;
use crate::LogPollerBlock;

impl From<block::Model> for LogPollerBlock {
    fn from(model: block::Model) -> Self {
        Self {
            evm_chain_id: db_to_u64(model.evm_chain_id),
            block_hash: bytes_to_h256(&model.block_hash),
            block_number: db_to_u64(model.block_number),
            block_timestamp: model.block_timestamp,
            finalized_block_number: db_to_u64(model.finalized_block_number),
            created_at: model.time_created,
        }
    }
}

impl LogPollerPgDb {
    /// Insert the block, overwriting the stored row for the same height only
    /// when the hash changed.
    #[instrument(skip_all, fields(block = block.block_number))]
    pub(super) async fn upsert_block<C: ConnectionTrait>(
        &self,
        conn: &C,
        block: &LogPollerBlock,
    ) -> DbResult<()> {
        let model = block::ActiveModel {
            id: NotSet,
            time_created: NotSet,
            evm_chain_id: Set(self.db_chain_id()),
            block_hash: Set(h256_to_bytes(&block.block_hash)),
            block_number: Set(u64_to_db(block.block_number)),
            block_timestamp: Set(block.block_timestamp),
            finalized_block_number: Set(u64_to_db(block.finalized_block_number)),
        };
        trace!(?model, "Writing block to database");
        block::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([block::Column::EvmChainId, block::Column::BlockNumber])
                    .update_columns([
                        block::Column::BlockHash,
                        block::Column::BlockTimestamp,
                        block::Column::FinalizedBlockNumber,
                    ])
                    .action_and_where(
                        Expr::col((block::Entity, block::Column::BlockHash))
                            .ne(Expr::cust("excluded.block_hash")),
                    )
                    .to_owned(),
            )
            .exec_without_returning(conn)
            .await?;
        Ok(())
    }

    pub(super) async fn delete_blocks_from<C: ConnectionTrait>(
        &self,
        conn: &C,
        start: u64,
    ) -> DbResult<u64> {
        let deleted = block::Entity::delete_many()
            .filter(block::Column::EvmChainId.eq(self.db_chain_id()))
            .filter(block::Column::BlockNumber.gte(u64_to_db(start)))
            .exec(conn)
            .await?
            .rows_affected;
        debug!(start, deleted, "Deleted blocks after reorg");
        Ok(deleted)
    }

    /// Delete one page of at most `limit` heights starting at the oldest
    /// stored block, never above `end`.
    #[instrument(skip(self))]
    pub(super) async fn delete_blocks_up_to(&self, end: u64, limit: u64) -> DbResult<u64> {
        let mut delete = block::Entity::delete_many()
            .filter(block::Column::EvmChainId.eq(self.db_chain_id()))
            .filter(block::Column::BlockNumber.lte(u64_to_db(end)));
        if limit > 0 {
            let Some(oldest) = self.oldest_block(0).await? else {
                return Ok(0);
            };
            let upper = oldest
                .block_number
                .saturating_add(limit - 1)
                .min(end);
            delete = delete.filter(block::Column::BlockNumber.lte(u64_to_db(upper)));
        }
        let deleted = delete.exec(&self.conn).await?.rows_affected;
        debug!(deleted, "Pruned old blocks");
        Ok(deleted)
    }

    pub(super) async fn block_by_number(&self, number: u64) -> DbResult<Option<LogPollerBlock>> {
        let block = block::Entity::find()
            .filter(block::Column::EvmChainId.eq(self.db_chain_id()))
            .filter(block::Column::BlockNumber.eq(u64_to_db(number)))
            .one(&self.conn)
            .await?;
        Ok(block.map(Into::into))
    }

    pub(super) async fn latest_block(&self) -> DbResult<Option<LogPollerBlock>> {
        let block = block::Entity::find()
            .filter(block::Column::EvmChainId.eq(self.db_chain_id()))
            .order_by_desc(block::Column::BlockNumber)
            .one(&self.conn)
            .await?;
        Ok(block.map(Into::into))
    }

    pub(super) async fn oldest_block(&self, min_allowed: u64) -> DbResult<Option<LogPollerBlock>> {
        let block = block::Entity::find()
            .filter(block::Column::EvmChainId.eq(self.db_chain_id()))
            .filter(block::Column::BlockNumber.gte(u64_to_db(min_allowed)))
            .order_by_asc(block::Column::BlockNumber)
            .one(&self.conn)
            .await?;
        Ok(block.map(Into::into))
    }

    pub(super) async fn blocks_in_range(
        &self,
        start: u64,
        end: u64,
    ) -> DbResult<Vec<LogPollerBlock>> {
        let blocks = block::Entity::find()
            .filter(block::Column::EvmChainId.eq(self.db_chain_id()))
            .filter(block::Column::BlockNumber.between(u64_to_db(start), u64_to_db(end)))
            .order_by_asc(block::Column::BlockNumber)
            .all(&self.conn)
            .await?;
        Ok(blocks.into_iter().map(Into::into).collect())
    }
}
