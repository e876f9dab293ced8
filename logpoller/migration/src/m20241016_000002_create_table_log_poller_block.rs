use sea_orm_migration::prelude::*;

use crate::l20241016_types::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(LogPollerBlock::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LogPollerBlock::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(LogPollerBlock::TimeCreated)
                            .timestamp()
                            .not_null()
                            .default("NOW()"),
                    )
                    .col(
                        ColumnDef::new(LogPollerBlock::EvmChainId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new_with_type(LogPollerBlock::BlockHash, Hash).not_null())
                    .col(
                        ColumnDef::new(LogPollerBlock::BlockNumber)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LogPollerBlock::BlockTimestamp)
                            .timestamp()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LogPollerBlock::FinalizedBlockNumber)
                            .big_integer()
                            .not_null(),
                    )
                    .index(
                        Index::create()
                            .col(LogPollerBlock::EvmChainId)
                            .col(LogPollerBlock::BlockNumber)
                            .unique(),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(LogPollerBlock::Table)
                    .name("log_poller_block_chain_timestamp_idx")
                    .col(LogPollerBlock::EvmChainId)
                    .col(LogPollerBlock::BlockTimestamp)
                    .index_type(IndexType::BTree)
                    .to_owned(),
            )
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(LogPollerBlock::Table).to_owned())
            .await
    }
}

/// Learn more at https://docs.rs/sea-query#iden
#[derive(Iden)]
pub enum LogPollerBlock {
    Table,
    /// Unique database ID
    Id,
    /// Time of record creation
    TimeCreated,
    /// Chain the block belongs to
    EvmChainId,
    /// Hash that was canonical for this height when it was saved
    BlockHash,
    /// Block height
    BlockNumber,
    /// Time the block was produced
    BlockTimestamp,
    /// Latest finalized height known when this block was saved
    FinalizedBlockNumber,
}
