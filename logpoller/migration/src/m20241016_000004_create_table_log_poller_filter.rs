use sea_orm_migration::prelude::*;

use crate::l20241016_types::*;
use crate::m20241016_000001_create_table_evm_chain::EvmChain;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(LogPollerFilter::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LogPollerFilter::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(LogPollerFilter::TimeCreated)
                            .timestamp()
                            .not_null()
                            .default("NOW()"),
                    )
                    .col(ColumnDef::new(LogPollerFilter::Name).text().not_null())
                    .col(
                        ColumnDef::new(LogPollerFilter::EvmChainId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LogPollerFilter::Addresses)
                            .array(Address)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LogPollerFilter::EventSigs)
                            .array(Hash)
                            .not_null(),
                    )
                    .col(ColumnDef::new(LogPollerFilter::Topic2).array(Hash).not_null())
                    .col(ColumnDef::new(LogPollerFilter::Topic3).array(Hash).not_null())
                    .col(ColumnDef::new(LogPollerFilter::Topic4).array(Hash).not_null())
                    .col(
                        ColumnDef::new(LogPollerFilter::Retention)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from_col(LogPollerFilter::EvmChainId)
                            .to(EvmChain::Table, EvmChain::Id),
                    )
                    .index(
                        Index::create()
                            .col(LogPollerFilter::Name)
                            .col(LogPollerFilter::EvmChainId)
                            .unique(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(LogPollerFilter::Table).to_owned())
            .await
    }
}

/// Learn more at https://docs.rs/sea-query#iden
#[derive(Iden)]
pub enum LogPollerFilter {
    Table,
    /// Unique database ID
    Id,
    /// Time of record creation
    TimeCreated,
    /// Name the filter was registered under
    Name,
    /// Chain the filter applies to
    EvmChainId,
    /// Contracts to index
    Addresses,
    /// Event signatures (topic0) to index
    EventSigs,
    /// Allowed values for the second topic, empty for any
    Topic2,
    /// Allowed values for the third topic, empty for any
    Topic3,
    /// Allowed values for the fourth topic, empty for any
    Topic4,
    /// Seconds matching logs are kept for, zero for forever
    Retention,
}
