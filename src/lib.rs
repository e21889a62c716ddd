//! Sluice - Rate-Limited Queue Drainer
//!
//! This crate drains a shared Redis work queue into a downstream publish
//! sink without exceeding a configured throughput ceiling. Any number of
//! drainers, in any number of processes, coordinate through a sliding-window
//! log kept in Redis and updated with optimistic transactions; there is no
//! central coordinator. A companion producer fills the queue with synthetic
//! load.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod ratelimit;
pub mod sink;
pub mod store;
