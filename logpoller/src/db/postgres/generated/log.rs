use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "log")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub time_created: TimeDateTime,
    pub evm_chain_id: i64,
    pub log_index: i64,
    pub block_hash: Vec<u8>,
    pub block_number: i64,
    pub block_timestamp: TimeDateTime,
    pub address: Vec<u8>,
    pub event_sig: Vec<u8>,
    pub topics: Vec<Vec<u8>>,
    pub tx_hash: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
