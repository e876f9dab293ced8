use std::collections::BTreeMap;
use std::time::Duration;

use ethers::types::H256;
use sea_orm::sea_query::OnConflict;
use sea_orm::{prelude::*, ActiveValue::*, EntityTrait, QueryOrder};
use tracing::{debug, instrument};

use super::generated::log_poller_filter as filter;
use super::LogPollerPgDb;
use crate::conversions::{address_to_bytes, bytes_to_address, bytes_to_h256, h256_to_bytes};
use crate::db::DbResult;
use crate::Filter;

impl From<filter::Model> for Filter {
    fn from(model: filter::Model) -> Self {
        let hashes = |values: &[Vec<u8>]| -> Vec<H256> { values.iter().map(|v| bytes_to_h256(v)).collect() };
        Self {
            event_sigs: hashes(&model.event_sigs),
            addresses: model.addresses.iter().map(|v| bytes_to_address(v)).collect(),
            topic2: hashes(&model.topic2),
            topic3: hashes(&model.topic3),
            topic4: hashes(&model.topic4),
            retention: Duration::from_secs(u64::try_from(model.retention).unwrap_or_default()),
            name: model.name,
        }
    }
}

impl LogPollerPgDb {
    #[instrument(skip_all, fields(filter = %f.name))]
    pub(super) async fn upsert_filter(&self, f: &Filter) -> DbResult<()> {
        let hashes = |values: &[H256]| -> Vec<Vec<u8>> { values.iter().map(h256_to_bytes).collect() };
        let model = filter::ActiveModel {
            id: NotSet,
            time_created: NotSet,
            name: Set(f.name.clone()),
            evm_chain_id: Set(self.db_chain_id()),
            addresses: Set(f.addresses.iter().map(address_to_bytes).collect()),
            event_sigs: Set(hashes(&f.event_sigs)),
            topic2: Set(hashes(&f.topic2)),
            topic3: Set(hashes(&f.topic3)),
            topic4: Set(hashes(&f.topic4)),
            retention: Set(i64::try_from(f.retention.as_secs()).unwrap_or(i64::MAX)),
        };
        filter::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([filter::Column::Name, filter::Column::EvmChainId])
                    .update_columns([
                        filter::Column::Addresses,
                        filter::Column::EventSigs,
                        filter::Column::Topic2,
                        filter::Column::Topic3,
                        filter::Column::Topic4,
                        filter::Column::Retention,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.conn)
            .await?;
        debug!("Stored filter");
        Ok(())
    }

    #[instrument(skip(self))]
    pub(super) async fn delete_filter_by_name(&self, name: &str) -> DbResult<u64> {
        let deleted = filter::Entity::delete_many()
            .filter(filter::Column::EvmChainId.eq(self.db_chain_id()))
            .filter(filter::Column::Name.eq(name))
            .exec(&self.conn)
            .await?
            .rows_affected;
        Ok(deleted)
    }

    pub(super) async fn select_filters(&self) -> DbResult<BTreeMap<String, Filter>> {
        let filters = filter::Entity::find()
            .filter(filter::Column::EvmChainId.eq(self.db_chain_id()))
            .order_by_asc(filter::Column::Name)
            .all(&self.conn)
            .await?;
        debug!(filters = filters.len(), "Loaded filters");
        Ok(filters
            .into_iter()
            .map(|model| (model.name.clone(), model.into()))
            .collect())
    }
}
