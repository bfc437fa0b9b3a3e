//! Deterministic cache key derivation.
//!
//! Grammar: `wallet:<address>:<family>[:<64-hex-sha256>]` and
//! `market:<address>:<family>[:...]`. The params hash is SHA-256 over the
//! JSON of the parameter map with keys in lexicographic order, so two maps
//! that differ only in insertion order derive the same key.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::PnlPeriod;

/// Parameter map with deterministic (sorted) iteration order.
pub type Params = BTreeMap<String, Value>;

/// Hex SHA-256 over the sorted-key JSON of the parameter map.
pub fn params_hash(params: &Params) -> String {
    // BTreeMap serializes in key order; Value maps nested inside are the
    // caller's concern (top-level query parameters are flat).
    let json = serde_json::to_string(params).unwrap_or_else(|_| "{}".to_string());
    hex::encode(Sha256::digest(json.as_bytes()))
}

fn keyed(prefix: &str, address: &str, family: &str, params: Option<&Params>) -> String {
    match params {
        Some(p) if !p.is_empty() => {
            format!("{}:{}:{}:{}", prefix, address, family, params_hash(p))
        }
        _ => format!("{}:{}:{}", prefix, address, family),
    }
}

pub fn wallet_key(address: &str, family: &str, params: Option<&Params>) -> String {
    keyed("wallet", address, family, params)
}

pub fn market_key(address: &str, family: &str, params: Option<&Params>) -> String {
    keyed("market", address, family, params)
}

pub fn balances_key(address: &str) -> String {
    wallet_key(address, "balances", None)
}

pub fn portfolio_key(address: &str) -> String {
    wallet_key(address, "portfolio", None)
}

pub fn transactions_key(address: &str, params: Option<&Params>) -> String {
    wallet_key(address, "transactions", params)
}

pub fn pnl_key(address: &str, period: PnlPeriod) -> String {
    format!("wallet:{}:pnl:{}", address, period.as_str())
}

pub fn risk_key(address: &str) -> String {
    wallet_key(address, "risk", None)
}

/// Glob matching every key family of a wallet.
pub fn wallet_pattern(address: &str) -> String {
    format!("wallet:{}:*", address)
}

/// Glob matching every PnL period key of a wallet.
pub fn pnl_pattern(address: &str) -> String {
    format!("wallet:{}:pnl:*", address)
}

/// Glob matching every key family of a market.
pub fn market_pattern(address: &str) -> String {
    format!("market:{}:*", address)
}
