//! Ingest pipeline.
//!
//! Single entry point `index`: lift metadata, resolve the registration,
//! seal privacy fields, persist the transaction + balance change + cost
//! basis atomically, bump the registration, invalidate the wallet's cache
//! keys, publish events, and run risk analysis. Duplicate signatures
//! coalesce silently without bumping the transaction counter. The batch
//! entry replays historical feeds in groups of 100, in order.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use crate::cache::CacheService;
use crate::clock::SharedClock;
use crate::crypto::{self, PrivatePayload};
use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventBus};
use crate::metrics;
use crate::pnl::{self, PriceSource};
use crate::risk::{RiskEngine, CRITICAL_THRESHOLD};
use crate::store;
use crate::store::NewTransaction;
use crate::types::{EventKind, Severity};
use crate::upstream::UpstreamTransaction;

pub mod metadata;

pub use metadata::{parse_metadata, ParsedMetadata};

/// Batch replay group size.
pub const BATCH_GROUP: usize = 100;

/// Historical replay feed. The core never reads raw chain history itself;
/// a deployment wires a provider against the upstream's archive API.
#[async_trait]
pub trait BatchFeed: Send + Sync {
    async fn history(&self, wallet: &str) -> CoreResult<Vec<UpstreamTransaction>>;
}

/// Default feed: no history source configured.
pub struct NullBatchFeed;

#[async_trait]
impl BatchFeed for NullBatchFeed {
    async fn history(&self, _wallet: &str) -> CoreResult<Vec<UpstreamTransaction>> {
        Ok(Vec::new())
    }
}

/// What one `index` call did.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexOutcome {
    /// False when the signature was already stored (duplicate coalesced).
    pub inserted: bool,
    pub new_balance: Option<f64>,
    /// The computed balance went negative and was floored at zero.
    pub clamped: bool,
}

/// Batch replay accounting.
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub indexed: usize,
    pub duplicates: usize,
    pub failed: usize,
}

pub struct Indexer {
    db: PgPool,
    cache: Arc<CacheService>,
    events: Arc<EventBus>,
    risk: Arc<RiskEngine>,
    prices: Arc<dyn PriceSource>,
    feed: Arc<dyn BatchFeed>,
    encryption_salt: String,
    #[allow(dead_code)]
    clock: SharedClock,
}

impl Indexer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: PgPool,
        cache: Arc<CacheService>,
        events: Arc<EventBus>,
        risk: Arc<RiskEngine>,
        prices: Arc<dyn PriceSource>,
        feed: Arc<dyn BatchFeed>,
        encryption_salt: String,
        clock: SharedClock,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            cache,
            events,
            risk,
            prices,
            feed,
            encryption_salt,
            clock,
        })
    }

    /// Index one validated upstream transaction.
    pub async fn index(&self, tx: &UpstreamTransaction) -> CoreResult<IndexOutcome> {
        let registration = store::get_registration(&self.db, &tx.wallet_address).await?;
        let Some(registration) = registration else {
            return Err(CoreError::NotRegistered(tx.wallet_address.clone()));
        };

        match self.index_registered(tx, registration.is_privacy).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // The registration exists but indexing failed: record the
                // error on the registration, best effort.
                if let Err(mark_err) = store::set_registration_state(
                    &self.db,
                    &tx.wallet_address,
                    crate::types::IndexingState::Error,
                    Some(&e.to_string()),
                )
                .await
                {
                    warn!(
                        wallet = %tx.wallet_address,
                        error = %mark_err,
                        "Could not mark registration errored"
                    );
                }
                Err(e)
            }
        }
    }

    async fn index_registered(
        &self,
        tx: &UpstreamTransaction,
        is_privacy: bool,
    ) -> CoreResult<IndexOutcome> {
        let parsed = parse_metadata(&tx.metadata);
        let fee = parsed.fee.unwrap_or(0.0);

        // Sale value resolution happens before the transaction is opened so
        // no oracle round-trip runs while rows are locked.
        let sale_value = if tx.kind.is_sale() {
            Some(self.resolve_sale_value(tx, &parsed).await)
        } else {
            None
        };

        let (amount, counterparty, metadata_json, encrypted_payload) = if is_privacy {
            let payload = PrivatePayload {
                amount: tx.amount,
                counterparty: parsed.counterparty.clone(),
                token_mint: tx.token_mint.clone(),
                metadata: parsed.rest.clone(),
            };
            let blob = crypto::encrypt_payload(&payload, &tx.wallet_address, &self.encryption_salt)?;
            (None, None, None, Some(serde_json::to_value(&blob)?))
        } else {
            (
                Some(tx.amount),
                parsed.counterparty.clone(),
                Some(Value::Object(parsed.rest.clone())),
                None,
            )
        };

        let new_tx = NewTransaction {
            signature: tx.signature.clone(),
            wallet_address: tx.wallet_address.clone(),
            block_time: tx.timestamp,
            block_number: parsed.block_number,
            kind: tx.kind,
            amount,
            token_mint: tx.token_mint.clone(),
            token_symbol: parsed.token_symbol.clone(),
            counterparty,
            fee: parsed.fee,
            metadata: metadata_json,
            is_privacy,
            encrypted_payload,
        };

        // Transaction + balance + cost basis commit as one unit.
        let mut dbtx = self.db.begin().await?;

        let inserted = store::insert_transaction(&mut dbtx, &new_tx).await?;
        let mut new_balance = None;
        let mut clamped = false;

        if inserted {
            let delta = tx.kind.balance_delta(tx.amount);
            if delta != 0.0 {
                let current = store::get_balance_for_update(
                    &mut dbtx,
                    &tx.wallet_address,
                    &tx.token_mint,
                )
                .await?
                .unwrap_or(0.0);
                let candidate = current + delta;
                let settled = if candidate < 0.0 {
                    clamped = true;
                    0.0
                } else {
                    candidate
                };
                store::put_balance(
                    &mut dbtx,
                    &tx.wallet_address,
                    &tx.token_mint,
                    settled,
                    parsed.token_symbol.as_deref(),
                )
                .await?;
                new_balance = Some(settled);
            }

            if let Some(sale_value) = sale_value {
                pnl::apply_sale(
                    &mut dbtx,
                    &tx.wallet_address,
                    &tx.token_mint,
                    tx.amount.abs(),
                    sale_value,
                    fee,
                    tx.timestamp,
                    &tx.signature,
                )
                .await?;
            }
            if let Some(buy) = &parsed.buy_side {
                pnl::apply_buy(
                    &mut dbtx,
                    &tx.wallet_address,
                    buy,
                    fee,
                    tx.timestamp,
                    &tx.signature,
                )
                .await?;
            }

            store::bump_registration_indexed(&mut dbtx, &tx.wallet_address, tx.timestamp)
                .await?;
        } else {
            store::touch_registration_indexed(&mut dbtx, &tx.wallet_address, tx.timestamp)
                .await?;
        }

        dbtx.commit().await?;

        if clamped {
            warn!(
                wallet = %tx.wallet_address,
                token = %tx.token_mint,
                signature = %tx.signature,
                "Balance went negative, floored at zero"
            );
        }
        if !inserted {
            debug!(signature = %tx.signature, "Duplicate transaction coalesced");
            metrics::record_transaction_indexed("duplicate");
            return Ok(IndexOutcome {
                inserted,
                new_balance,
                clamped,
            });
        }
        metrics::record_transaction_indexed("indexed");

        // Invalidation after commit; failure never blocks the write.
        if let Err(e) = self.cache.invalidate_wallet(&tx.wallet_address).await {
            warn!(wallet = %tx.wallet_address, error = %e, "Cache invalidation failed");
        }

        self.events.broadcast(&Event::new(
            EventKind::TransactionNew,
            Some(tx.wallet_address.clone()),
            json!({
                "signature": tx.signature,
                "wallet": tx.wallet_address,
                "type": tx.kind.as_str(),
                "tokenMint": tx.token_mint,
                "amount": if is_privacy { Value::Null } else { json!(tx.amount) },
                "timestamp": tx.timestamp.to_rfc3339(),
            }),
        ));
        if let Some(balance) = new_balance {
            self.events.broadcast(&Event::new(
                EventKind::BalanceUpdated,
                Some(tx.wallet_address.clone()),
                json!({
                    "wallet": tx.wallet_address,
                    "tokenMint": tx.token_mint,
                    "amount": balance,
                }),
            ));
        }

        self.run_risk_analysis(tx, &parsed).await;

        Ok(IndexOutcome {
            inserted,
            new_balance,
            clamped,
        })
    }

    /// Sale value: feed-provided figure, else amount at the current mark
    /// price, else the neutral zero (realized degrades to -cost-basis-fee).
    async fn resolve_sale_value(
        &self,
        tx: &UpstreamTransaction,
        parsed: &ParsedMetadata,
    ) -> f64 {
        if let Some(value) = parsed.sale_value {
            return value;
        }
        match self.prices.price_usd(&tx.token_mint).await {
            Ok(Some(price)) => tx.amount.abs() * price,
            Ok(None) => 0.0,
            Err(e) => {
                debug!(token = %tx.token_mint, error = %e, "Sale value price lookup failed");
                0.0
            }
        }
    }

    /// Risk step: score, record an anomaly for high-risk transactions,
    /// publish the anomaly event, refresh the profile. Failures here never
    /// fail the index.
    async fn run_risk_analysis(&self, tx: &UpstreamTransaction, parsed: &ParsedMetadata) {
        let assessment = self
            .risk
            .assess_transaction(
                &tx.wallet_address,
                &tx.signature,
                &tx.token_mint,
                Some(tx.amount),
                parsed.counterparty.as_deref(),
                tx.timestamp,
            )
            .await;

        let score = match assessment {
            Ok(score) => score,
            Err(e) => {
                warn!(signature = %tx.signature, error = %e, "Risk analysis failed");
                return;
            }
        };
        if !score.is_high_risk() {
            return;
        }

        let severity = if score.score > CRITICAL_THRESHOLD {
            Severity::Critical
        } else {
            Severity::High
        };
        let anomaly = store::NewAnomaly {
            signature: tx.signature.clone(),
            wallet_address: tx.wallet_address.clone(),
            kind: score.dominant_kind().to_string(),
            severity,
            score: score.score,
            description: score.describe(),
        };
        if let Err(e) = store::insert_anomaly(&self.db, &anomaly).await {
            warn!(signature = %tx.signature, error = %e, "Could not record anomaly");
        }
        metrics::record_anomaly(severity.as_str());

        self.events.broadcast(&Event::new(
            EventKind::SecurityAnomaly,
            Some(tx.wallet_address.clone()),
            json!({
                "signature": tx.signature,
                "wallet": tx.wallet_address,
                "severity": severity.as_str(),
                "score": score.score,
                "description": anomaly.description,
            }),
        ));

        if let Err(e) = self.risk.update_profile(&tx.wallet_address).await {
            warn!(wallet = %tx.wallet_address, error = %e, "Risk profile update failed");
        }
    }

    /// Batch replay: groups of 100, sequential within a group to preserve
    /// per-wallet order. Per-item errors accumulate; a non-zero failure
    /// count raises a summary after the batch completes.
    pub async fn index_batch(&self, txs: &[UpstreamTransaction]) -> CoreResult<BatchSummary> {
        let mut summary = BatchSummary::default();
        let mut failures: Vec<(String, String)> = Vec::new();

        for (group_no, group) in txs.chunks(BATCH_GROUP).enumerate() {
            for tx in group {
                match self.index(tx).await {
                    Ok(outcome) if outcome.inserted => summary.indexed += 1,
                    Ok(_) => summary.duplicates += 1,
                    Err(e) => {
                        error!(
                            signature = %tx.signature,
                            error = %e,
                            "Batch item failed"
                        );
                        failures.push((tx.signature.clone(), e.to_string()));
                    }
                }
            }
            debug!(
                group = group_no,
                indexed = summary.indexed,
                duplicates = summary.duplicates,
                failed = failures.len(),
                "Batch group processed"
            );
        }

        summary.failed = failures.len();
        if !failures.is_empty() {
            return Err(CoreError::Internal(format!(
                "batch indexing: {}/{} items failed (first: {} - {})",
                failures.len(),
                txs.len(),
                failures[0].0,
                failures[0].1
            )));
        }
        Ok(summary)
    }

    /// Replay a wallet's history from the configured batch feed, oldest
    /// first.
    pub async fn backfill(&self, wallet: &str) -> CoreResult<BatchSummary> {
        let mut history = self.feed.history(wallet).await?;
        if history.is_empty() {
            debug!(wallet = %wallet, "No history to backfill");
            return Ok(BatchSummary::default());
        }
        history.sort_by_key(|tx| tx.timestamp);
        info!(wallet = %wallet, count = history.len(), "Backfilling wallet history");
        self.index_batch(&history).await
    }
}
