#![deny(dead_code)]

pub use sea_orm_migration::prelude::*;

mod l20241016_types;
mod m20241016_000001_create_table_evm_chain;
mod m20241016_000002_create_table_log_poller_block;
mod m20241016_000003_create_table_log;
mod m20241016_000004_create_table_log_poller_filter;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20241016_000001_create_table_evm_chain::Migration),
            Box::new(m20241016_000002_create_table_log_poller_block::Migration),
            Box::new(m20241016_000003_create_table_log::Migration),
            Box::new(m20241016_000004_create_table_log_poller_filter::Migration),
        ]
    }
}
