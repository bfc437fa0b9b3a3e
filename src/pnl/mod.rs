//! FIFO cost-basis PnL.
//!
//! Lot consumption happens once per sale, inside the indexer's transaction;
//! the per-sale realized figure is persisted on the transaction row so
//! period aggregation is a windowed sum. A periodic driver snapshots every
//! active wallet per period, invalidates the PnL cache keys and publishes a
//! pnl_updated event. Mark prices come from the injected `PriceSource`; a
//! price older than 15 minutes marks the snapshot stale.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::Result;
use serde_json::{json, Map, Value};
use sqlx::{PgConnection, PgPool};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{keys, CacheService};
use crate::circuit::CircuitBreaker;
use crate::clock::SharedClock;
use crate::error::CoreResult;
use crate::events::{Event, EventBus};
use crate::store;
use crate::store::{NewCostBasisLot, NewPnlSnapshot};
use crate::types::{EventKind, ALL_PERIODS};

pub mod lots;

pub use lots::{consume_fifo, Consumption, Lot, LotUpdate};

/// Snapshot recompute cadence.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(600);
/// Mark prices older than this taint the snapshot.
const PRICE_STALE_AFTER_MINS: i64 = 15;

/// Paired buy side of a swap, lifted from transaction metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct BuySide {
    pub token_in: String,
    pub amount_in: f64,
    pub paid_value: f64,
}

/// Consume lots for a sale and persist the realized figure on the
/// transaction row. Runs inside the indexer's transaction. Returns the
/// realized PnL.
pub async fn apply_sale(
    conn: &mut PgConnection,
    wallet: &str,
    token_mint: &str,
    sale_amount: f64,
    sale_value: f64,
    fee: f64,
    at: DateTime<Utc>,
    signature: &str,
) -> Result<f64> {
    let rows = store::consumable_lots(conn, wallet, token_mint, at).await?;
    let view: Vec<Lot> = rows
        .iter()
        .map(|row| Lot {
            id: row.id,
            remaining: row.remaining_amount,
            cost_per_token: row.cost_per_token,
        })
        .collect();

    let consumption = consume_fifo(&view, sale_amount);
    for update in &consumption.updates {
        store::set_lot_remaining(conn, update.id, update.remaining).await?;
    }

    let realized = sale_value - consumption.consumed_cost - fee;
    store::set_transaction_realized(conn, signature, realized).await?;
    debug!(
        wallet = %wallet,
        token = %token_mint,
        sale_amount,
        consumed_cost = consumption.consumed_cost,
        realized,
        "Sale consumed cost basis"
    );
    Ok(realized)
}

/// Create the lot for the paired buy side of a swap. Runs inside the
/// indexer's transaction.
pub async fn apply_buy(
    conn: &mut PgConnection,
    wallet: &str,
    buy: &BuySide,
    fee: f64,
    at: DateTime<Utc>,
    signature: &str,
) -> Result<()> {
    if buy.amount_in <= 0.0 {
        warn!(wallet = %wallet, token = %buy.token_in, "Buy side with non-positive amount skipped");
        return Ok(());
    }
    let total_cost = buy.paid_value + fee;
    let lot = NewCostBasisLot {
        wallet_address: wallet.to_string(),
        token_mint: buy.token_in.clone(),
        remaining_amount: buy.amount_in,
        cost_per_token: total_cost / buy.amount_in,
        total_cost,
        acquired_at: at,
        source_signature: signature.to_string(),
    };
    store::insert_lot(conn, &lot).await?;
    Ok(())
}

/// Mark price provider. The balance row caches the last known price and its
/// timestamp; the stale rule reads that timestamp.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn price_usd(&self, token_mint: &str) -> CoreResult<Option<f64>>;
}

/// Used when no oracle is configured; snapshots fall back to stored prices.
pub struct NullPriceSource;

#[async_trait]
impl PriceSource for NullPriceSource {
    async fn price_usd(&self, _token_mint: &str) -> CoreResult<Option<f64>> {
        Ok(None)
    }
}

/// HTTP price oracle behind the oracle circuit breaker.
pub struct HttpPriceSource {
    client: reqwest::Client,
    base_url: String,
    breaker: Arc<CircuitBreaker>,
}

impl HttpPriceSource {
    pub fn new(base_url: String, breaker: Arc<CircuitBreaker>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            breaker,
        }
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn price_usd(&self, token_mint: &str) -> CoreResult<Option<f64>> {
        let url = format!("{}/v1/price/{}", self.base_url, token_mint);
        let client = self.client.clone();
        self.breaker
            .execute(|| async move {
                let response = client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| crate::error::CoreError::Stream(format!("oracle: {}", e)))?;
                if response.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                let body: Value = response
                    .error_for_status()
                    .map_err(|e| crate::error::CoreError::Stream(format!("oracle: {}", e)))?
                    .json()
                    .await
                    .map_err(|e| crate::error::CoreError::Stream(format!("oracle: {}", e)))?;
                Ok(body.get("price").and_then(Value::as_f64))
            })
            .await
    }
}

/// Whether a mark price stamped at `priced_at` is stale at `now`.
fn price_is_stale(now: DateTime<Utc>, priced_at: Option<DateTime<Utc>>) -> bool {
    match priced_at {
        Some(at) => now - at > chrono::Duration::minutes(PRICE_STALE_AFTER_MINS),
        None => true,
    }
}

/// Merge realized-by-token and unrealized-by-token into the snapshot
/// breakdown object.
fn breakdown_json(realized: &[(String, f64)], unrealized: &HashMap<String, f64>) -> Value {
    let mut merged: Map<String, Value> = Map::new();
    for (mint, value) in realized {
        merged.insert(mint.clone(), json!({"realized": value, "unrealized": 0.0}));
    }
    for (mint, value) in unrealized {
        match merged.get_mut(mint) {
            Some(entry) => {
                entry["unrealized"] = json!(value);
            }
            None => {
                merged.insert(mint.clone(), json!({"realized": 0.0, "unrealized": value}));
            }
        }
    }
    Value::Object(merged)
}

pub struct PnlEngine {
    db: PgPool,
    cache: Arc<CacheService>,
    events: Arc<EventBus>,
    prices: Arc<dyn PriceSource>,
    clock: SharedClock,
}

impl PnlEngine {
    pub fn new(
        db: PgPool,
        cache: Arc<CacheService>,
        events: Arc<EventBus>,
        prices: Arc<dyn PriceSource>,
        clock: SharedClock,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            cache,
            events,
            prices,
            clock,
        })
    }

    /// Periodic snapshot loop (10 minute cadence).
    pub async fn run(self: Arc<Self>, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would race startup warming
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.recompute_all().await {
                        Ok(count) => debug!(wallets = count, "PnL snapshot pass complete"),
                        Err(e) => warn!(error = %e, "PnL snapshot pass failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("PnL engine stopping");
                    return;
                }
            }
        }
    }

    /// Recompute snapshots for every active registration; per-wallet errors
    /// are logged and do not abort the pass.
    pub async fn recompute_all(&self) -> Result<usize> {
        let active =
            store::registrations_in_state(&self.db, crate::types::IndexingState::Active).await?;
        let mut succeeded = 0usize;
        for registration in &active {
            match self.recompute_wallet(&registration.address).await {
                Ok(()) => succeeded += 1,
                Err(e) => warn!(
                    wallet = %registration.address,
                    error = %e,
                    "PnL recompute failed for wallet"
                ),
            }
        }
        Ok(succeeded)
    }

    /// Snapshot one wallet across every period.
    pub async fn recompute_wallet(&self, wallet: &str) -> Result<()> {
        let now = self.clock.now();
        let balances = store::get_balances(&self.db, wallet).await?;

        let mut unrealized_total = 0.0;
        let mut unrealized_by_token: HashMap<String, f64> = HashMap::new();
        let mut basis_total = 0.0;
        let mut stale = false;
        let mut price_stamped = false;

        for balance in &balances {
            let (price, priced_at) = match self.prices.price_usd(&balance.token_mint).await {
                Ok(Some(price)) => {
                    store::set_balance_price(&self.db, wallet, &balance.token_mint, price, now)
                        .await?;
                    price_stamped = true;
                    (Some(price), Some(now))
                }
                Ok(None) => (balance.usd_value, balance.price_updated_at),
                Err(e) => {
                    debug!(token = %balance.token_mint, error = %e, "Price lookup failed");
                    (balance.usd_value, balance.price_updated_at)
                }
            };

            let basis = store::remaining_basis(&self.db, wallet, &balance.token_mint).await?;
            basis_total += basis;

            match price {
                Some(price) => {
                    if price_is_stale(now, priced_at) {
                        stale = true;
                    }
                    let unrealized = balance.amount * price - basis;
                    unrealized_total += unrealized;
                    unrealized_by_token.insert(balance.token_mint.clone(), unrealized);
                }
                None => {
                    stale = true;
                }
            }
        }

        // Price stamps mutated the balance rows: purge the derived keys.
        // Invalidation failure never blocks the write.
        if price_stamped {
            if let Err(e) = self.cache.invalidate_balances(wallet).await {
                warn!(wallet = %wallet, error = %e, "Balance cache invalidation failed");
            }
        }

        for period in ALL_PERIODS {
            let from = period.window().map(|window| now - window);
            let (realized, fees) = store::realized_in_window(&self.db, wallet, from, now).await?;
            let realized_tokens = store::realized_by_token(&self.db, wallet, from, now).await?;

            let total = realized + unrealized_total;
            let return_pct = if basis_total > 0.0 {
                total / basis_total * 100.0
            } else {
                0.0
            };

            let snapshot = NewPnlSnapshot {
                wallet_address: wallet.to_string(),
                period,
                realized_pnl: realized,
                unrealized_pnl: unrealized_total,
                total_pnl: total,
                return_pct,
                fees_paid: fees,
                token_breakdown: breakdown_json(&realized_tokens, &unrealized_by_token),
                is_stale: stale,
            };
            store::insert_pnl_snapshot(&self.db, &snapshot).await?;

            // Invalidation failure never blocks the write
            if let Err(e) = self.cache.delete(&keys::pnl_key(wallet, period)).await {
                warn!(wallet = %wallet, period = %period, error = %e, "PnL cache invalidation failed");
            }
        }

        self.events.broadcast(&Event::new(
            EventKind::PnlUpdated,
            Some(wallet.to_string()),
            json!({
                "wallet": wallet,
                "unrealized": unrealized_total,
                "stale": stale,
                "calculatedAt": now.to_rfc3339(),
            }),
        ));

        Ok(())
    }
}
