use std::sync::Arc;

use async_trait::async_trait;
use derive_new::new;
use ethers::providers::{Middleware, MiddlewareError};
use ethers::types::{
    BlockId, BlockNumber, Filter, FilterBlockOption, Log as EthLog, ValueOrArray, H256,
};
use futures::future::join_all;
use serde_json::Value;
use tracing::{instrument, trace};

use super::{BatchElem, BlockSelector, ClientError, ClientResult, LogPollerClient, LogQuery};
use crate::Head;

/// [`LogPollerClient`] over an ethers middleware stack.
#[derive(Debug, new)]
pub struct EthersClient<M> {
    provider: Arc<M>,
    chain_id: u64,
}

/// Keep the JSON-RPC error code when the node returned one.
fn middleware_error<E: MiddlewareError>(err: E) -> ClientError {
    match err.as_error_response() {
        Some(resp) => ClientError::JsonRpc {
            code: resp.code,
            message: resp.message.clone(),
        },
        None => ClientError::Provider(err.to_string()),
    }
}

impl From<&LogQuery> for Filter {
    fn from(query: &LogQuery) -> Self {
        let mut filter = Filter::new();
        filter.block_option = match query.block {
            BlockSelector::Hash(hash) => FilterBlockOption::AtBlockHash(hash),
            BlockSelector::Range { from, to } => FilterBlockOption::Range {
                from_block: Some(BlockNumber::Number(from.into())),
                to_block: Some(BlockNumber::Number(to.into())),
            },
        };
        if !query.addresses.is_empty() {
            filter.address = Some(ValueOrArray::Array(query.addresses.clone()));
        }
        for (slot, accepted) in filter.topics.iter_mut().zip(&query.topics) {
            if !accepted.is_empty() {
                *slot = Some(ValueOrArray::Array(
                    accepted.iter().copied().map(Some).collect(),
                ));
            }
        }
        filter
    }
}

impl<M> EthersClient<M>
where
    M: Middleware + 'static,
{
    async fn head(&self, id: BlockId) -> ClientResult<Head> {
        let block = self
            .provider
            .get_block(id)
            .await
            .map_err(middleware_error)?
            .ok_or_else(|| ClientError::BlockNotFound(format!("{id:?}")))?;
        let (Some(hash), Some(number)) = (block.hash, block.number) else {
            return Err(ClientError::InvalidResponse(format!(
                "block {id:?} is not part of the chain yet"
            )));
        };
        Ok(Head {
            hash,
            parent_hash: block.parent_hash,
            number: number.as_u64(),
            timestamp: block.timestamp.low_u64(),
        })
    }
}

#[async_trait]
impl<M> LogPollerClient for EthersClient<M>
where
    M: Middleware + 'static,
{
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    #[instrument(level = "trace", skip(self))]
    async fn head_by_number(&self, number: Option<u64>) -> ClientResult<Head> {
        let number = number.map_or(BlockNumber::Latest, |n| BlockNumber::Number(n.into()));
        self.head(number.into()).await
    }

    #[instrument(level = "trace", skip(self))]
    async fn head_by_hash(&self, hash: H256) -> ClientResult<Head> {
        self.head(hash.into()).await
    }

    #[instrument(level = "trace", skip(self))]
    async fn filter_logs(&self, query: &LogQuery) -> ClientResult<Vec<EthLog>> {
        let logs = self
            .provider
            .get_logs(&query.into())
            .await
            .map_err(middleware_error)?;
        trace!(logs = logs.len(), "Fetched logs");
        Ok(logs)
    }

    #[instrument(level = "trace", skip_all, fields(calls = batch.len()))]
    async fn batch_call(&self, batch: &mut [BatchElem]) -> ClientResult<()> {
        let provider = self.provider.provider();
        let responses = join_all(
            batch
                .iter()
                .map(|elem| provider.request::<_, Value>(elem.method, elem.params.clone())),
        )
        .await;
        for (elem, response) in batch.iter_mut().zip(responses) {
            match response {
                Ok(value) => elem.result = Some(value),
                Err(err) => elem.error = Some(middleware_error(err)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::{Address, ValueOrArray};

    use super::*;

    #[test]
    fn log_query_becomes_ethers_filter() {
        let query = LogQuery {
            block: BlockSelector::Range { from: 5, to: 9 },
            addresses: vec![Address::repeat_byte(1)],
            topics: [vec![H256::repeat_byte(2)], vec![], vec![], vec![]],
        };
        let filter = Filter::from(&query);
        assert_eq!(filter.get_from_block(), Some(5.into()));
        assert_eq!(filter.get_to_block(), Some(9.into()));
        assert_eq!(
            filter.address,
            Some(ValueOrArray::Array(vec![Address::repeat_byte(1)]))
        );
        assert!(filter.topics[0].is_some());
        assert!(filter.topics[1].is_none());
    }
}
