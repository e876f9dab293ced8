//! A local, continuously updated index of EVM event logs.
//!
//! The [`LogPoller`] follows the canonical chain of a single EVM network,
//! saves every log matching the registered [`Filter`]s together with the
//! block it was included in, rewinds when the chain reorganises, and serves
//! read queries against the stored logs so consumers don't have to hit the
//! RPC endpoint themselves.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub use api::*;
pub use disabled::DisabledLogPoller;
pub use error::*;
pub use filter::Filter;
pub use poller::{FinalityPolicy, LogPoller, Opts};
pub use registry::{AggregateFilter, FilterRegistry};
pub use types::*;

mod api;
/// Chain client capability and its ethers implementation
pub mod client;
mod conversions;
mod date_time;
/// Block, log and filter storage
pub mod db;
mod disabled;
mod error;
mod filter;
mod poller;
/// Declarative log query expressions
pub mod query;
mod registry;
/// Settings loading, tracing setup and construction of the log poller
pub mod settings;
mod types;

/// Deterministic chain and store doubles for tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
