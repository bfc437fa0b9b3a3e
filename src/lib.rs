//! Wallet-centric memory layer.
//!
//! Mirrors on-chain wallet activity from an upstream indexer stream into a
//! durable Postgres store, maintains derived analytics (balances, FIFO cost
//! basis, PnL, risk), encrypts privacy-protected rows, caches hot reads in
//! Redis, and broadcasts change events to subscribers.

pub mod api;
pub mod cache;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod degrade;
pub mod error;
pub mod events;
pub mod indexer;
pub mod metrics;
pub mod pnl;
pub mod registry;
pub mod risk;
pub mod store;
pub mod types;
pub mod upstream;
