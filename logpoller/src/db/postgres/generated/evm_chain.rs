use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "evm_chain")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,
    pub time_created: TimeDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::log_poller_filter::Entity")]
    LogPollerFilter,
}

impl Related<super::log_poller_filter::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::LogPollerFilter.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
