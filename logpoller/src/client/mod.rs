use std::fmt::Debug;

use async_trait::async_trait;
use auto_impl::auto_impl;
use ethers::types::{Address, Log as EthLog, H256, U256, U64};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Head;

pub use ethereum::EthersClient;

mod ethereum;

/// Result type of the chain client
pub type ClientResult<T> = Result<T, ClientError>;

/// JSON-RPC code for "limit exceeded", see EIP-1474.
pub const JSON_RPC_LIMIT_EXCEEDED: i64 = -32005;

/// Errors of the chain client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The node answered with a JSON-RPC error object
    #[error("json-rpc error {code}: {message}")]
    JsonRpc {
        /// JSON-RPC error code
        code: i64,
        /// Error message
        message: String,
    },
    /// Transport or middleware failure
    #[error("provider error: {0}")]
    Provider(String),
    /// The node does not know the requested block
    #[error("block not found: {0}")]
    BlockNotFound(String),
    /// The node answered with something unexpected
    #[error("invalid rpc response: {0}")]
    InvalidResponse(String),
}

impl ClientError {
    /// True if the node refused the request because the response would be
    /// too large.
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, ClientError::JsonRpc { code, .. } if *code == JSON_RPC_LIMIT_EXCEEDED)
    }
}

/// Which blocks an `eth_getLogs` request covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockSelector {
    /// A single block by hash
    Hash(H256),
    /// An inclusive range of heights
    Range {
        /// First block
        from: u64,
        /// Last block
        to: u64,
    },
}

/// An `eth_getLogs` request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogQuery {
    /// Blocks to search
    pub block: BlockSelector,
    /// Emitting contracts
    pub addresses: Vec<Address>,
    /// Accepted values per topic position, empty for any
    pub topics: [Vec<H256>; 4],
}

impl LogQuery {
    /// True if the log satisfies the address and topic restrictions.
    pub fn matches(&self, log: &EthLog) -> bool {
        if !self.addresses.is_empty() && !self.addresses.contains(&log.address) {
            return false;
        }
        self.topics.iter().enumerate().all(|(i, accepted)| {
            accepted.is_empty()
                || log
                    .topics
                    .get(i)
                    .map_or(false, |topic| accepted.contains(topic))
        })
    }
}

/// One call of a JSON-RPC batch. The client fills in `result` or `error`.
#[derive(Clone, Debug)]
pub struct BatchElem {
    /// Method name
    pub method: &'static str,
    /// Positional parameters
    pub params: Value,
    /// Raw result on success
    pub result: Option<Value>,
    /// Failure of this call alone
    pub error: Option<ClientError>,
}

impl BatchElem {
    /// A pending call.
    pub fn new(method: &'static str, params: Value) -> Self {
        Self {
            method,
            params,
            result: None,
            error: None,
        }
    }

    /// `eth_getBlockByNumber` without transaction bodies. `tag` is a hex
    /// quantity or a block tag such as `latest`.
    pub fn block_by_number(tag: impl Into<String>) -> Self {
        Self::new(
            "eth_getBlockByNumber",
            Value::Array(vec![Value::String(tag.into()), Value::Bool(false)]),
        )
    }

    /// Decode the header returned by an `eth_getBlockByNumber` call.
    pub fn into_head(self) -> ClientResult<Head> {
        if let Some(err) = self.error {
            return Err(err);
        }
        match self.result {
            None | Some(Value::Null) => Err(ClientError::BlockNotFound(self.params.to_string())),
            Some(value) => serde_json::from_value::<RpcHeader>(value)
                .map_err(|e| ClientError::InvalidResponse(e.to_string()))?
                .try_into(),
        }
    }
}

/// Hex encoded block number as used in JSON-RPC params.
pub fn block_tag(number: u64) -> String {
    format!("{number:#x}")
}

/// The header fields of an `eth_getBlockByNumber` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcHeader {
    /// Block hash, absent for pending blocks
    pub hash: Option<H256>,
    /// Parent hash
    pub parent_hash: H256,
    /// Height, absent for pending blocks
    pub number: Option<U64>,
    /// Unix timestamp
    pub timestamp: U256,
}

impl From<Head> for RpcHeader {
    fn from(head: Head) -> Self {
        Self {
            hash: Some(head.hash),
            parent_hash: head.parent_hash,
            number: Some(head.number.into()),
            timestamp: head.timestamp.into(),
        }
    }
}

impl TryFrom<RpcHeader> for Head {
    type Error = ClientError;

    fn try_from(header: RpcHeader) -> Result<Self, Self::Error> {
        let hash = header
            .hash
            .filter(|h| !h.is_zero())
            .ok_or_else(|| ClientError::InvalidResponse("missing block hash".into()))?;
        let number = header
            .number
            .ok_or_else(|| ClientError::InvalidResponse(format!("missing number for {hash:?}")))?;
        Ok(Head {
            hash,
            parent_hash: header.parent_hash,
            number: number.as_u64(),
            timestamp: header.timestamp.low_u64(),
        })
    }
}

/// The chain access the log poller needs.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait LogPollerClient: Send + Sync + Debug {
    /// Chain id the client is configured for
    fn chain_id(&self) -> u64;

    /// Header at `number`, or the latest header for `None`
    async fn head_by_number(&self, number: Option<u64>) -> ClientResult<Head>;

    /// Header with the given hash
    async fn head_by_hash(&self, hash: H256) -> ClientResult<Head>;

    /// Logs matching `query`
    async fn filter_logs(&self, query: &LogQuery) -> ClientResult<Vec<EthLog>>;

    /// Send every call of `batch`, storing per call results and errors in
    /// place. The returned error is for the batch as a whole.
    async fn batch_call(&self, batch: &mut [BatchElem]) -> ClientResult<()>;
}
