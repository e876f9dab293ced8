/// Errors of the log poller store.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Error from the database driver
    #[error(transparent)]
    SeaOrm(#[from] sea_orm::DbErr),
    /// A log of another chain was about to be written
    #[error("invalid chain id in log, got {got} want {want}")]
    InvalidChainId {
        /// Chain id of the log
        got: u64,
        /// Chain id of the store
        want: u64,
    },
    /// A query expression cannot be translated
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// Any other failure
    #[error("{0}")]
    Other(String),
}
