use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, Log as EthLog, H256, U256, U64};
use ethers::utils::keccak256;
use parking_lot::Mutex;
use serde_json::Value;

use crate::client::{
    BatchElem, BlockSelector, ClientError, ClientResult, LogPollerClient, LogQuery, RpcHeader,
    JSON_RPC_LIMIT_EXCEEDED,
};
use crate::Head;

const GENESIS_TIMESTAMP: u64 = 1_700_000_000;
const BLOCK_TIME: u64 = 12;

#[derive(Clone, Debug)]
struct SimBlock {
    head: Head,
    logs: Vec<EthLog>,
}

#[derive(Debug)]
struct ChainState {
    /// canonical hashes by height
    canonical: Vec<H256>,
    /// every block ever mined, including orphaned ones
    blocks: HashMap<H256, SimBlock>,
    pending: Vec<(Address, Vec<H256>, Vec<u8>)>,
    hidden: HashSet<u64>,
    range_limit: Option<u64>,
    finality_depth: u64,
    nonce: u64,
}

/// A deterministic in-process chain with forks, for driving the poller in
/// tests.
#[derive(Debug)]
pub struct SimulatedChain {
    chain_id: u64,
    state: Mutex<ChainState>,
    filter_calls: AtomicUsize,
}

impl SimulatedChain {
    /// A chain holding only its genesis block.
    pub fn new(chain_id: u64) -> Self {
        let genesis = Head {
            hash: H256::from(keccak256(b"genesis")),
            parent_hash: H256::zero(),
            number: 0,
            timestamp: GENESIS_TIMESTAMP,
        };
        let state = ChainState {
            canonical: vec![genesis.hash],
            blocks: HashMap::from([(
                genesis.hash,
                SimBlock {
                    head: genesis,
                    logs: vec![],
                },
            )]),
            pending: vec![],
            hidden: HashSet::new(),
            range_limit: None,
            finality_depth: 0,
            nonce: 0,
        };
        Self {
            chain_id,
            state: Mutex::new(state),
            filter_calls: AtomicUsize::new(0),
        }
    }

    /// Queue a log for the next mined block. `topics[0]` is the event
    /// signature.
    pub fn emit(&self, address: Address, topics: Vec<H256>, data: Vec<u8>) {
        self.state.lock().pending.push((address, topics, data));
    }

    /// Mine one block holding every queued log.
    pub fn mine(&self) -> Head {
        let mut state = self.state.lock();
        state.nonce += 1;
        let parent = state.canonical[state.canonical.len() - 1];
        let number = state.canonical.len() as u64;
        let mut preimage = parent.as_bytes().to_vec();
        preimage.extend_from_slice(&number.to_be_bytes());
        preimage.extend_from_slice(&state.nonce.to_be_bytes());
        let head = Head {
            hash: H256::from(keccak256(preimage)),
            parent_hash: parent,
            number,
            timestamp: GENESIS_TIMESTAMP + number * BLOCK_TIME,
        };
        let logs = std::mem::take(&mut state.pending)
            .into_iter()
            .enumerate()
            .map(|(i, (address, topics, data))| EthLog {
                address,
                topics,
                data: Bytes::from(data),
                block_hash: Some(head.hash),
                block_number: Some(U64::from(number)),
                transaction_hash: Some(H256::from(keccak256(
                    [head.hash.as_bytes(), &(i as u64).to_be_bytes()[..]].concat(),
                ))),
                transaction_index: Some(U64::from(i)),
                log_index: Some(U256::from(i)),
                removed: Some(false),
                ..Default::default()
            })
            .collect();
        state.canonical.push(head.hash);
        state.blocks.insert(head.hash, SimBlock { head, logs });
        head
    }

    /// Mine `count` empty blocks, returning the last one.
    pub fn mine_many(&self, count: u64) -> Head {
        let mut head = self.latest();
        for _ in 0..count {
            head = self.mine();
        }
        head
    }

    /// Drop every canonical block above `number`. Blocks mined afterwards
    /// form a competing branch with different hashes.
    pub fn fork(&self, number: u64) {
        let mut state = self.state.lock();
        state.canonical.truncate(number as usize + 1);
    }

    /// The canonical head.
    pub fn latest(&self) -> Head {
        let state = self.state.lock();
        state.blocks[&state.canonical[state.canonical.len() - 1]].head
    }

    /// Canonical block at `number`.
    pub fn head_at(&self, number: u64) -> Option<Head> {
        let state = self.state.lock();
        state
            .canonical
            .get(number as usize)
            .map(|hash| state.blocks[hash].head)
    }

    /// Leave the logs of canonical block `number` out of range queries,
    /// like a lagging node would.
    pub fn hide_logs(&self, number: u64, hidden: bool) {
        let mut state = self.state.lock();
        if hidden {
            state.hidden.insert(number);
        } else {
            state.hidden.remove(&number);
        }
    }

    /// Fail range queries wider than `limit` blocks with the
    /// limit-exceeded JSON-RPC error.
    pub fn set_range_limit(&self, limit: Option<u64>) {
        self.state.lock().range_limit = limit;
    }

    /// The `finalized` tag trails the head by `depth` blocks.
    pub fn set_finality_depth(&self, depth: u64) {
        self.state.lock().finality_depth = depth;
    }

    /// Number of `filter_logs` calls served so far.
    pub fn filter_calls(&self) -> usize {
        self.filter_calls.load(Ordering::SeqCst)
    }

    fn by_number(state: &ChainState, number: u64) -> ClientResult<Head> {
        state
            .canonical
            .get(number as usize)
            .map(|hash| state.blocks[hash].head)
            .ok_or_else(|| ClientError::BlockNotFound(number.to_string()))
    }

    fn by_tag(state: &ChainState, tag: &str) -> ClientResult<Option<Head>> {
        let latest = state.canonical.len() as u64 - 1;
        let number = match tag {
            "latest" => latest,
            "finalized" => latest.saturating_sub(state.finality_depth),
            hex => u64::from_str_radix(hex.trim_start_matches("0x"), 16)
                .map_err(|e| ClientError::InvalidResponse(e.to_string()))?,
        };
        Ok(Self::by_number(state, number).ok())
    }
}

#[async_trait]
impl LogPollerClient for SimulatedChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn head_by_number(&self, number: Option<u64>) -> ClientResult<Head> {
        let state = self.state.lock();
        let number = number.unwrap_or(state.canonical.len() as u64 - 1);
        Self::by_number(&state, number)
    }

    async fn head_by_hash(&self, hash: H256) -> ClientResult<Head> {
        self.state
            .lock()
            .blocks
            .get(&hash)
            .map(|block| block.head)
            .ok_or_else(|| ClientError::BlockNotFound(format!("{hash:?}")))
    }

    async fn filter_logs(&self, query: &LogQuery) -> ClientResult<Vec<EthLog>> {
        self.filter_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        let blocks: Vec<&SimBlock> = match query.block {
            BlockSelector::Hash(hash) => state.blocks.get(&hash).into_iter().collect(),
            BlockSelector::Range { from, to } => {
                if let Some(limit) = state.range_limit {
                    if to.saturating_sub(from) + 1 > limit {
                        return Err(ClientError::JsonRpc {
                            code: JSON_RPC_LIMIT_EXCEEDED,
                            message: "query returned more than 10000 results".into(),
                        });
                    }
                }
                (from..=to)
                    .filter(|n| !state.hidden.contains(n))
                    .filter_map(|n| state.canonical.get(n as usize))
                    .map(|hash| &state.blocks[hash])
                    .collect()
            }
        };
        Ok(blocks
            .into_iter()
            .flat_map(|block| block.logs.iter())
            .filter(|log| query.matches(log))
            .cloned()
            .collect())
    }

    async fn batch_call(&self, batch: &mut [BatchElem]) -> ClientResult<()> {
        let state = self.state.lock();
        for elem in batch.iter_mut() {
            if elem.method != "eth_getBlockByNumber" {
                elem.error = Some(ClientError::JsonRpc {
                    code: -32601,
                    message: format!("method {} not found", elem.method),
                });
                continue;
            }
            let tag = elem.params.get(0).and_then(Value::as_str).unwrap_or("latest");
            match Self::by_tag(&state, tag) {
                Ok(Some(head)) => {
                    elem.result = Some(
                        serde_json::to_value(RpcHeader::from(head))
                            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?,
                    )
                }
                Ok(None) => elem.result = Some(Value::Null),
                Err(err) => elem.error = Some(err),
            }
        }
        Ok(())
    }
}
