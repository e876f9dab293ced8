use std::fmt::{self, Display};
use std::str::FromStr;

use derive_new::new;
use ethers::types::{Address, H256};
use sea_orm::prelude::TimeDateTime;

use crate::date_time;

/// A block as saved by the log poller, keyed by chain and number.
#[derive(Clone, Debug, PartialEq, Eq, new)]
pub struct LogPollerBlock {
    /// Chain id
    pub evm_chain_id: u64,
    /// Hash that was canonical at this height when the block was saved
    pub block_hash: H256,
    /// Height
    pub block_number: u64,
    /// Time the block was produced
    pub block_timestamp: TimeDateTime,
    /// Highest block believed final when this block was saved
    pub finalized_block_number: u64,
    /// Time the row was written
    #[new(value = "date_time::now()")]
    pub created_at: TimeDateTime,
}

/// An event log saved by the log poller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Log {
    /// Chain id
    pub evm_chain_id: u64,
    /// Position of the log in its block
    pub log_index: u64,
    /// Hash of the including block
    pub block_hash: H256,
    /// Height of the including block
    pub block_number: u64,
    /// Timestamp of the including block
    pub block_timestamp: TimeDateTime,
    /// Emitting contract
    pub address: Address,
    /// Topic 0
    pub event_sig: H256,
    /// All topics, the event signature first
    pub topics: Vec<H256>,
    /// Emitting transaction
    pub tx_hash: H256,
    /// Non-indexed payload
    pub data: Vec<u8>,
    /// Time the row was written
    pub created_at: TimeDateTime,
}

impl Log {
    /// Topic at `index`, where 0 is the event signature.
    pub fn topic(&self, index: usize) -> Option<H256> {
        self.topics.get(index).copied()
    }

    /// The `index`th 32 byte word of the payload.
    pub fn data_word(&self, index: usize) -> Option<H256> {
        let start = index.checked_mul(32)?;
        let word = self.data.get(start..start.checked_add(32)?)?;
        Some(H256::from_slice(word))
    }

    /// Pagination cursor pointing at this log.
    pub fn cursor(&self) -> Cursor {
        Cursor {
            block_number: self.block_number,
            log_index: self.log_index,
            tx_hash: self.tx_hash,
        }
    }
}

/// Header fields the log poller needs from the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Head {
    /// Block hash
    pub hash: H256,
    /// Hash of the parent block
    pub parent_hash: H256,
    /// Height
    pub number: u64,
    /// Unix timestamp in seconds
    pub timestamp: u64,
}

/// How far behind the latest saved block a log must be to be returned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Confirmations {
    /// At or below the finalized block saved with the latest block
    Finalized,
    /// At least this many blocks below the latest saved block
    Blocks(u64),
    /// Any saved log
    #[default]
    Unconfirmed,
}

impl Confirmations {
    /// Highest block number satisfying these confirmations given the latest
    /// saved block, `None` when nothing qualifies.
    pub fn max_block(&self, latest: &LogPollerBlock) -> Option<u64> {
        match self {
            Confirmations::Finalized => Some(latest.finalized_block_number),
            Confirmations::Blocks(n) => latest.block_number.checked_sub(*n),
            Confirmations::Unconfirmed => Some(latest.block_number),
        }
    }
}

/// Position of a log in the chain, rendered as `block-logindex-txhash`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor {
    /// Block of the log
    pub block_number: u64,
    /// Index of the log in the block
    pub log_index: u64,
    /// Transaction of the log
    pub tx_hash: H256,
}

impl Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{:?}",
            self.block_number, self.log_index, self.tx_hash
        )
    }
}

/// Failed to parse a [`Cursor`]
#[derive(Debug, thiserror::Error)]
#[error("invalid cursor {0:?}, expected block-logindex-txhash")]
pub struct InvalidCursor(pub String);

impl FromStr for Cursor {
    type Err = InvalidCursor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidCursor(s.to_owned());
        let mut parts = s.splitn(3, '-');
        let block_number = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let log_index = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let tx_hash = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        Ok(Self {
            block_number,
            log_index,
            tx_hash,
        })
    }
}

/// Build a filter name from an id and optional arguments: `id - a:b:c`.
pub fn filter_name(id: &str, args: &[&dyn Display]) -> String {
    let mut args = args.iter();
    let Some(first) = args.next() else {
        return id.to_owned();
    };
    let mut name = format!("{id} - {first}");
    for arg in args {
        name.push(':');
        name.push_str(&arg.to_string());
    }
    name
}

/// A 32 byte big-endian word holding `i`, as used for integers in event data.
pub fn evm_word(i: u64) -> H256 {
    H256::from_low_u64_be(i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_name_joins_args() {
        assert_eq!(filter_name("id", &[]), "id");
        assert_eq!(filter_name("id", &[&"a"]), "id - a");
        assert_eq!(filter_name("id", &[&"a", &"b", &3]), "id - a:b:3");
    }

    #[test]
    fn evm_word_is_big_endian() {
        let word = evm_word(0x0102);
        assert_eq!(word.as_bytes()[30..], [1, 2]);
        assert!(word.as_bytes()[..30].iter().all(|b| *b == 0));
    }

    #[test]
    fn cursor_parses_its_own_output() {
        let cursor = Cursor {
            block_number: 12,
            log_index: 3,
            tx_hash: H256::repeat_byte(0x11),
        };
        assert_eq!(cursor.to_string().parse::<Cursor>().unwrap(), cursor);
        assert!("12-x-0x00".parse::<Cursor>().is_err());
    }

    #[test]
    fn data_words_are_32_bytes() {
        let mut data = evm_word(7).as_bytes().to_vec();
        data.extend_from_slice(evm_word(9).as_bytes());
        let log = Log {
            evm_chain_id: 1,
            log_index: 0,
            block_hash: H256::zero(),
            block_number: 1,
            block_timestamp: date_time::now(),
            address: Address::zero(),
            event_sig: H256::zero(),
            topics: vec![H256::zero()],
            tx_hash: H256::zero(),
            data,
            created_at: date_time::now(),
        };
        assert_eq!(log.data_word(1), Some(evm_word(9)));
        assert_eq!(log.data_word(2), None);
        assert_eq!(log.topic(1), None);
    }
}
