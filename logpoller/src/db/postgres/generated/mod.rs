//! Entities mirroring the tables created by the `migration` crate.

pub mod evm_chain;
pub mod log;
pub mod log_poller_block;
pub mod log_poller_filter;
