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
                    .table(Log::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Log::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Log::TimeCreated)
                            .timestamp()
                            .not_null()
                            .default("NOW()"),
                    )
                    .col(ColumnDef::new(Log::EvmChainId).big_integer().not_null())
                    .col(ColumnDef::new(Log::LogIndex).big_integer().not_null())
                    .col(ColumnDef::new_with_type(Log::BlockHash, Hash).not_null())
                    .col(ColumnDef::new(Log::BlockNumber).big_integer().not_null())
                    .col(ColumnDef::new(Log::BlockTimestamp).timestamp().not_null())
                    .col(ColumnDef::new_with_type(Log::Address, Address).not_null())
                    .col(ColumnDef::new_with_type(Log::EventSig, Hash).not_null())
                    .col(ColumnDef::new(Log::Topics).array(Hash).not_null())
                    .col(ColumnDef::new_with_type(Log::TxHash, Hash).not_null())
                    .col(ColumnDef::new_with_type(Log::Data, Bytes).not_null())
                    .index(
                        Index::create()
                            .col(Log::EvmChainId)
                            .col(Log::BlockNumber)
                            .col(Log::LogIndex)
                            .unique(),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(Log::Table)
                    .name("log_chain_address_event_block_idx")
                    .col(Log::EvmChainId)
                    .col(Log::Address)
                    .col(Log::EventSig)
                    .col(Log::BlockNumber)
                    .index_type(IndexType::BTree)
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(Log::Table)
                    .name("log_chain_block_timestamp_idx")
                    .col(Log::EvmChainId)
                    .col(Log::BlockTimestamp)
                    .index_type(IndexType::BTree)
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(Log::Table)
                    .name("log_tx_hash_idx")
                    .col(Log::TxHash)
                    .index_type(IndexType::Hash)
                    .to_owned(),
            )
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Log::Table).to_owned())
            .await
    }
}

/// Learn more at https://docs.rs/sea-query#iden
#[derive(Iden)]
pub enum Log {
    Table,
    /// Unique database ID
    Id,
    /// Time of record creation
    TimeCreated,
    /// Chain the log was emitted on
    EvmChainId,
    /// Position of the log within its block
    LogIndex,
    /// Hash of the block the log was included in
    BlockHash,
    /// Height of the block the log was included in
    BlockNumber,
    /// Timestamp of the block the log was included in
    BlockTimestamp,
    /// Emitting contract
    Address,
    /// First topic
    EventSig,
    /// All topics, the event signature included
    Topics,
    /// Transaction that emitted the log
    TxHash,
    /// Non-indexed event payload
    Data,
}
