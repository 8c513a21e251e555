//! flowblox - indexing pipeline for a Cadence L1 with an embedded EVM
//!
//! The kernel is four pieces: the pinned multi-node fetch layer
//! (`pool` + `fetcher`), the ingest services writing raw rows
//! (`ingest`), the idempotent range-scoped derivation processors
//! (`processor`, `processors`) driven by three engines sharing one
//! checkpoint/lease model (`live_deriver`, `history_deriver`,
//! `async_worker`), and the committer that turns completed leases into
//! contiguous checkpoint progress (`committer`).

pub mod address;
pub mod async_worker;
pub mod cadence;
pub mod committer;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod history_deriver;
pub mod http_client;
pub mod ingest;
pub mod live_deriver;
pub mod memstore;
pub mod metrics;
pub mod node_client;
pub mod pool;
pub mod processor;
pub mod processors;
pub mod repository;
pub mod scripts;
pub mod telemetry;
pub mod types;

#[cfg(test)]
pub mod testutil;
