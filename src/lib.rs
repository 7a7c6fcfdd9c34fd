//! DNS load generation engine.
//!
//! A pool of cooperative traffic generators shares one event loop, one token
//! bucket, and one query source. Each generator paces batches of queries at a
//! target over UDP or TCP, matches responses back to outstanding transaction
//! ids, expires the rest, and feeds latency samples into the metrics sink.

pub mod cli;
pub mod dns;
pub mod flow;
pub mod framing;
pub mod generator;
pub mod limiter;
pub mod metrics;
pub mod query;
pub mod stats;
pub mod supervisor;
pub mod txid;
