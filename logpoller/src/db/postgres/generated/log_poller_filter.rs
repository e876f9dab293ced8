use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "log_poller_filter")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub time_created: TimeDateTime,
    pub name: String,
    pub evm_chain_id: i64,
    pub addresses: Vec<Vec<u8>>,
    pub event_sigs: Vec<Vec<u8>>,
    pub topic2: Vec<Vec<u8>>,
    pub topic3: Vec<Vec<u8>>,
    pub topic4: Vec<Vec<u8>>,
    pub retention: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::evm_chain::Entity",
        from = "Column::EvmChainId",
        to = "super::evm_chain::Column::Id"
    )]
    EvmChain,
}

impl Related<super::evm_chain::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::EvmChain.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
