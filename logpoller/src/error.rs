use crate::client::ClientError;
use crate::db::DbError;

/// Result type used throughout the log poller
pub type LogPollerResult<T> = Result<T, LogPollerError>;

/// Errors returned by the log poller.
#[derive(Debug, thiserror::Error)]
pub enum LogPollerError {
    /// Log polling is turned off for this chain
    #[error("log poller disabled")]
    Disabled,
    /// A filter failed validation
    #[error("invalid filter {name:?}: {reason}")]
    InvalidFilter {
        /// Name of the rejected filter
        name: String,
        /// What is wrong with it
        reason: &'static str,
    },
    /// Replay was requested outside of the chain
    #[error("invalid replay block number {requested}, acceptable range [1, {latest}]")]
    InvalidReplayBlock {
        /// Requested start block
        requested: u64,
        /// Latest block of the remote chain
        latest: u64,
    },
    /// The caller gave up before the replay was handed to the poller
    #[error("aborted, replay request cancelled")]
    ReplayRequestAborted,
    /// The caller gave up but the poller is already replaying
    #[error("replay request cancelled, but replay is already in progress")]
    ReplayInProgress,
    /// The log poller is stopping
    #[error("replay aborted due to log poller shutdown")]
    Shutdown,
    /// `start` was called twice
    #[error("log poller already started")]
    AlreadyStarted,
    /// A reorg deeper than the finalized block was observed
    #[error("finality violated")]
    FinalityViolated,
    /// The common ancestor search walked below the finalized block
    #[error("reorg greater than finality depth detected at block {block}, latest finalized {finalized}")]
    ReorgTooDeep {
        /// Block at which the mismatch was detected
        block: u64,
        /// Finalized block saved with the expected parent
        finalized: u64,
    },
    /// The RPC returned a different block than the one asked for
    #[error("block mismatch, have {have} want {want}")]
    BlockMismatch {
        /// Number of the returned block
        have: u64,
        /// Number of the requested block
        want: u64,
    },
    /// Blocks could be found neither in the store nor through the RPC
    #[error("blocks were not found in db or RPC call: {0:?}")]
    BlocksNotFound(Vec<u64>),
    /// Topic index outside of 1..=3
    #[error("invalid index for topic: {0}")]
    InvalidTopicIndex(usize),
    /// An RPC log without the fields of a mined log
    #[error("malformed log from rpc: missing {0}")]
    MalformedLog(&'static str),
    /// Chain client failure
    #[error(transparent)]
    Client(#[from] ClientError),
    /// Storage failure
    #[error(transparent)]
    Db(#[from] DbError),
}
