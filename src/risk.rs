//! Anomaly scoring and per-wallet risk profiles.
//!
//! Per transaction: amount z-score against prior samples, trailing-hour
//! frequency, denylisted counterparty, and a circadian heuristic, clamped to
//! [0, 100]. Scores at or above 70 are high risk. The per-wallet profile
//! aggregates over the last 1000 transactions.

use std::collections::HashSet;
use std::sync::RwLock;

use chrono::{DateTime, Timelike, Utc};
use eyre::Result;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::store;
use crate::store::RiskProfile;

pub const HIGH_RISK_THRESHOLD: f64 = 70.0;
pub const CRITICAL_THRESHOLD: f64 = 90.0;

/// Transactions examined when aggregating a wallet profile.
const PROFILE_WINDOW: i64 = 1000;
/// Prior samples fetched for the z-score component.
const SAMPLE_LIMIT: i64 = 100;
/// Minimum samples before the z-score component participates.
const MIN_SAMPLES: usize = 10;
/// Trailing-hour transaction count above which frequency scores.
const FREQUENCY_LIMIT: i64 = 20;
/// Balance-affecting transactions in the trailing hour marking the
/// rapid-balance factor.
const RAPID_BALANCE_LIMIT: i64 = 10;

pub const KIND_LARGE_AMOUNT: &str = "large_amount";
pub const KIND_HIGH_FREQUENCY: &str = "high_frequency";
pub const KIND_DENYLISTED: &str = "denylisted_counterparty";
pub const KIND_ODD_HOURS: &str = "odd_hours";

/// One scoring component that fired.
#[derive(Debug, Clone, Serialize)]
pub struct RiskComponent {
    pub kind: &'static str,
    pub points: f64,
    pub detail: String,
}

/// Score for a single transaction.
#[derive(Debug, Clone, Serialize)]
pub struct TxRiskScore {
    pub score: f64,
    pub components: Vec<RiskComponent>,
}

impl TxRiskScore {
    pub fn is_high_risk(&self) -> bool {
        self.score >= HIGH_RISK_THRESHOLD
    }

    /// Primary component kind, for the anomaly record.
    pub fn dominant_kind(&self) -> &'static str {
        self.components
            .iter()
            .max_by(|a, b| a.points.total_cmp(&b.points))
            .map(|c| c.kind)
            .unwrap_or("composite")
    }

    pub fn describe(&self) -> String {
        if self.components.is_empty() {
            return "no risk factors".to_string();
        }
        self.components
            .iter()
            .map(|c| c.detail.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Inputs to the pure scoring function.
#[derive(Debug, Clone)]
pub struct TxRiskInputs<'a> {
    pub amount: f64,
    pub prior_amounts: &'a [f64],
    /// Transactions in [t - 1h, t]
    pub recent_count: i64,
    pub counterparty_denylisted: bool,
    pub utc_hour: u32,
}

fn mean_std(samples: &[f64]) -> (f64, f64) {
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Score one transaction in [0, 100].
pub fn score_transaction(inputs: &TxRiskInputs<'_>) -> TxRiskScore {
    let mut components = Vec::new();

    if inputs.prior_amounts.len() >= MIN_SAMPLES {
        let (mean, std) = mean_std(inputs.prior_amounts);
        if std > 0.0 {
            let z = ((inputs.amount - mean) / std).abs();
            if z > 3.0 {
                components.push(RiskComponent {
                    kind: KIND_LARGE_AMOUNT,
                    points: (10.0 * z).min(40.0),
                    detail: format!("amount deviates {:.1} sigma from history", z),
                });
            }
        }
    }

    if inputs.recent_count > FREQUENCY_LIMIT {
        components.push(RiskComponent {
            kind: KIND_HIGH_FREQUENCY,
            points: (inputs.recent_count as f64).min(30.0),
            detail: format!("{} transactions in the last hour", inputs.recent_count),
        });
    }

    if inputs.counterparty_denylisted {
        components.push(RiskComponent {
            kind: KIND_DENYLISTED,
            points: 50.0,
            detail: "counterparty is denylisted".to_string(),
        });
    }

    if (2..=5).contains(&inputs.utc_hour) {
        components.push(RiskComponent {
            kind: KIND_ODD_HOURS,
            points: 10.0,
            detail: format!("activity at {:02}:00 UTC", inputs.utc_hour),
        });
    }

    let score = components
        .iter()
        .map(|c| c.points)
        .sum::<f64>()
        .clamp(0.0, 100.0);

    TxRiskScore { score, components }
}

/// Inputs to the pure profile aggregation.
#[derive(Debug, Clone)]
pub struct ProfileInputs {
    /// Transactions considered (≤ 1000)
    pub total: i64,
    pub anomaly_count: i64,
    pub high_risk_count: i64,
    pub has_denylisted_counterparty: bool,
    pub factor_large: bool,
    pub factor_frequency: bool,
    pub factor_rapid_balance: bool,
}

/// Aggregate a wallet score: 0.4 x anomaly percentage + 0.6 x high-risk
/// percentage + factor penalties (large 10, frequency 15, denylist 25),
/// clamped to [0, 100].
pub fn aggregate_profile(inputs: &ProfileInputs) -> f64 {
    if inputs.total == 0 {
        return 0.0;
    }
    let total = inputs.total as f64;
    let anomaly_pct = inputs.anomaly_count as f64 / total * 100.0;
    let high_risk_pct = inputs.high_risk_count as f64 / total * 100.0;

    let mut score = 0.4 * anomaly_pct + 0.6 * high_risk_pct;
    if inputs.factor_large {
        score += 10.0;
    }
    if inputs.factor_frequency {
        score += 15.0;
    }
    if inputs.has_denylisted_counterparty {
        score += 25.0;
    }
    score.clamp(0.0, 100.0)
}

pub struct RiskEngine {
    db: PgPool,
    clock: SharedClock,
    denylist: RwLock<HashSet<String>>,
}

impl RiskEngine {
    pub fn new(db: PgPool, clock: SharedClock) -> Self {
        Self {
            db,
            clock,
            denylist: RwLock::new(HashSet::new()),
        }
    }

    /// Reload the denylist from the store.
    pub async fn refresh_denylist(&self) -> Result<usize> {
        let addresses = store::load_denylist(&self.db).await?;
        let count = addresses.len();
        *self.denylist.write().unwrap() = addresses.into_iter().collect();
        info!(count, "Denylist refreshed");
        Ok(count)
    }

    pub fn is_denylisted(&self, address: &str) -> bool {
        self.denylist.read().unwrap().contains(address)
    }

    /// Score a freshly indexed transaction. Privacy rows (no cleartext
    /// amount) contribute only the non-amount components.
    pub async fn assess_transaction(
        &self,
        wallet: &str,
        signature: &str,
        token_mint: &str,
        amount: Option<f64>,
        counterparty: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<TxRiskScore> {
        let prior = match amount {
            Some(_) => {
                store::amount_samples(&self.db, wallet, token_mint, signature, SAMPLE_LIMIT)
                    .await?
            }
            None => Vec::new(),
        };
        let recent_count = store::count_transactions_in_window(
            &self.db,
            wallet,
            at - chrono::Duration::hours(1),
            at,
        )
        .await?;
        let denylisted = counterparty.map(|c| self.is_denylisted(c)).unwrap_or(false);

        let score = score_transaction(&TxRiskInputs {
            amount: amount.unwrap_or(0.0),
            prior_amounts: &prior,
            recent_count,
            counterparty_denylisted: denylisted,
            utc_hour: at.hour(),
        });
        debug!(
            wallet = %wallet,
            signature = %signature,
            score = score.score,
            "Transaction risk assessed"
        );
        Ok(score)
    }

    /// Recompute and persist the wallet's aggregated profile.
    pub async fn update_profile(&self, wallet: &str) -> Result<RiskProfile> {
        let (total, anomaly_count, high_risk_count) =
            store::profile_window_stats(&self.db, wallet, PROFILE_WINDOW).await?;
        let denylisted =
            store::has_denylisted_counterparty(&self.db, wallet, PROFILE_WINDOW).await?;
        let kinds = store::anomaly_kinds_in_window(&self.db, wallet, PROFILE_WINDOW).await?;

        let now = self.clock.now();
        let rapid = store::count_transactions_in_window(
            &self.db,
            wallet,
            now - chrono::Duration::hours(1),
            now,
        )
        .await?
            > RAPID_BALANCE_LIMIT;

        let inputs = ProfileInputs {
            total,
            anomaly_count,
            high_risk_count,
            has_denylisted_counterparty: denylisted,
            factor_large: kinds.iter().any(|k| k == KIND_LARGE_AMOUNT),
            factor_frequency: kinds.iter().any(|k| k == KIND_HIGH_FREQUENCY),
            factor_rapid_balance: rapid,
        };

        let profile = RiskProfile {
            wallet_address: wallet.to_string(),
            score: aggregate_profile(&inputs),
            anomaly_count,
            high_risk_pct: if total == 0 {
                0.0
            } else {
                high_risk_count as f64 / total as f64 * 100.0
            },
            counterparty_risk: if denylisted { 100.0 } else { 0.0 },
            factor_large: inputs.factor_large,
            factor_frequency: inputs.factor_frequency,
            factor_denylist: denylisted,
            factor_rapid_balance: inputs.factor_rapid_balance,
            last_assessed_at: now,
        };

        store::upsert_risk_profile(&self.db, &profile).await?;
        Ok(profile)
    }
}
