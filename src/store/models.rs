use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use crate::types::{IndexingState, PnlPeriod, Severity, TxKind};

/// A wallet registration row. Exists iff the wallet is subject to ingestion;
/// pausing preserves every historical row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WalletRegistration {
    pub address: String,
    pub registered_at: DateTime<Utc>,
    pub indexing_state: IndexingState,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub transaction_count: i64,
    pub is_privacy: bool,
    pub label: Option<String>,
    pub agent_id: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// For inserting new registrations
#[derive(Debug, Clone)]
pub struct NewWalletRegistration {
    pub address: String,
    pub is_privacy: bool,
    pub label: Option<String>,
    pub agent_id: Option<String>,
}

/// A stored wallet transaction. For privacy rows amount/counterparty/metadata
/// are NULL and encrypted_payload holds the sealed fields.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub signature: String,
    pub wallet_address: String,
    pub block_time: DateTime<Utc>,
    pub block_number: Option<i64>,
    pub kind: TxKind,
    pub amount: Option<f64>,
    pub token_mint: String,
    pub token_symbol: Option<String>,
    pub counterparty: Option<String>,
    pub fee: Option<f64>,
    pub metadata: Option<Value>,
    pub is_privacy: bool,
    pub encrypted_payload: Option<Value>,
    pub realized_pnl: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// For inserting new transactions
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub signature: String,
    pub wallet_address: String,
    pub block_time: DateTime<Utc>,
    pub block_number: Option<i64>,
    pub kind: TxKind,
    pub amount: Option<f64>,
    pub token_mint: String,
    pub token_symbol: Option<String>,
    pub counterparty: Option<String>,
    pub fee: Option<f64>,
    pub metadata: Option<Value>,
    pub is_privacy: bool,
    pub encrypted_payload: Option<Value>,
}

/// Per (wallet, mint) balance row, clamped at zero.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Balance {
    pub id: i64,
    pub wallet_address: String,
    pub token_mint: String,
    pub amount: f64,
    pub token_symbol: Option<String>,
    pub usd_value: Option<f64>,
    pub price_updated_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

/// Append-only cost-basis lot with partial consumption via remaining_amount.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CostBasisLot {
    pub id: i64,
    pub wallet_address: String,
    pub token_mint: String,
    pub remaining_amount: f64,
    pub cost_per_token: f64,
    pub total_cost: f64,
    pub acquired_at: DateTime<Utc>,
    pub source_signature: String,
    pub created_at: DateTime<Utc>,
}

/// For inserting new lots
#[derive(Debug, Clone)]
pub struct NewCostBasisLot {
    pub wallet_address: String,
    pub token_mint: String,
    pub remaining_amount: f64,
    pub cost_per_token: f64,
    pub total_cost: f64,
    pub acquired_at: DateTime<Utc>,
    pub source_signature: String,
}

/// One PnL snapshot per (wallet, period, calculated_at).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PnlSnapshot {
    pub id: i64,
    pub wallet_address: String,
    pub period: PnlPeriod,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_pnl: f64,
    pub return_pct: f64,
    pub fees_paid: f64,
    pub token_breakdown: Value,
    pub is_stale: bool,
    pub calculated_at: DateTime<Utc>,
}

/// For inserting new snapshots
#[derive(Debug, Clone)]
pub struct NewPnlSnapshot {
    pub wallet_address: String,
    pub period: PnlPeriod,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_pnl: f64,
    pub return_pct: f64,
    pub fees_paid: f64,
    pub token_breakdown: Value,
    pub is_stale: bool,
}

/// Aggregated per-wallet risk profile.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RiskProfile {
    pub wallet_address: String,
    pub score: f64,
    pub anomaly_count: i64,
    pub high_risk_pct: f64,
    pub counterparty_risk: f64,
    pub factor_large: bool,
    pub factor_frequency: bool,
    pub factor_denylist: bool,
    pub factor_rapid_balance: bool,
    pub last_assessed_at: DateTime<Utc>,
}

/// A recorded anomaly.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: i64,
    pub signature: String,
    pub wallet_address: String,
    pub kind: String,
    pub severity: Severity,
    pub score: f64,
    pub description: String,
    pub detected_at: DateTime<Utc>,
}

/// For inserting new anomalies
#[derive(Debug, Clone)]
pub struct NewAnomaly {
    pub signature: String,
    pub wallet_address: String,
    pub kind: String,
    pub severity: Severity,
    pub score: f64,
    pub description: String,
}
