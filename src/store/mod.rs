//! Postgres access layer.
//!
//! Free async query functions over `PgPool`; the handful of operations that
//! must share the indexer's atomic unit take `&mut PgConnection` and run
//! inside the caller's transaction.

use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::PgConnection;
use tracing::error;

use crate::types::{IndexingState, PnlPeriod};

pub mod models;

pub use models::*;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(std::time::Duration::from_secs(30))
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

// ============ Registrations ============

const REGISTRATION_SELECT: &str = r#"address, registered_at, indexing_state, last_indexed_at,
    transaction_count, is_privacy, label, agent_id, last_error, updated_at"#;

/// Insert a registration. Returns false when the address is already
/// registered (no row written).
pub async fn insert_registration(pool: &PgPool, new: &NewWalletRegistration) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO wallet_registrations (address, is_privacy, label, agent_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (address) DO NOTHING
        "#,
    )
    .bind(&new.address)
    .bind(new.is_privacy)
    .bind(&new.label)
    .bind(&new.agent_id)
    .execute(pool)
    .await
    .wrap_err("Failed to insert wallet registration")?;

    Ok(result.rows_affected() > 0)
}

/// Get a registration by address
pub async fn get_registration(pool: &PgPool, address: &str) -> Result<Option<WalletRegistration>> {
    let query = format!(
        "SELECT {} FROM wallet_registrations WHERE address = $1",
        REGISTRATION_SELECT
    );
    let row = sqlx::query_as::<_, WalletRegistration>(&query)
        .bind(address)
        .fetch_optional(pool)
        .await
        .wrap_err("Failed to get wallet registration")?;

    Ok(row)
}

/// List registrations with optional state/privacy/agent filters
pub async fn list_registrations(
    pool: &PgPool,
    state: Option<IndexingState>,
    privacy: Option<bool>,
    agent_id: Option<&str>,
) -> Result<Vec<WalletRegistration>> {
    let query = format!(
        r#"SELECT {} FROM wallet_registrations
           WHERE ($1::VARCHAR IS NULL OR indexing_state = $1)
             AND ($2::BOOLEAN IS NULL OR is_privacy = $2)
             AND ($3::VARCHAR IS NULL OR agent_id = $3)
           ORDER BY registered_at"#,
        REGISTRATION_SELECT
    );
    let rows = sqlx::query_as::<_, WalletRegistration>(&query)
        .bind(state.map(|s| s.as_str()))
        .bind(privacy)
        .bind(agent_id)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to list wallet registrations")?;

    Ok(rows)
}

/// All registrations currently in the given state
pub async fn registrations_in_state(
    pool: &PgPool,
    state: IndexingState,
) -> Result<Vec<WalletRegistration>> {
    list_registrations(pool, Some(state), None, None).await
}

/// Update a registration's state, optionally recording an error message
pub async fn set_registration_state(
    pool: &PgPool,
    address: &str,
    state: IndexingState,
    last_error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"UPDATE wallet_registrations
           SET indexing_state = $1, last_error = $2, updated_at = NOW()
           WHERE address = $3"#,
    )
    .bind(state.as_str())
    .bind(last_error)
    .bind(address)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to set registration {} state to {}", address, state))?;

    Ok(())
}

/// Mark a registration active and account for one newly stored transaction.
/// Runs inside the indexer's transaction so the bump commits with the row.
pub async fn bump_registration_indexed(
    conn: &mut PgConnection,
    address: &str,
    indexed_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"UPDATE wallet_registrations
           SET indexing_state = 'active',
               last_indexed_at = GREATEST(COALESCE(last_indexed_at, 'epoch'::TIMESTAMPTZ), $1),
               transaction_count = transaction_count + 1,
               last_error = NULL,
               updated_at = NOW()
           WHERE address = $2"#,
    )
    .bind(indexed_at)
    .bind(address)
    .execute(conn)
    .await
    .wrap_err_with(|| format!("Failed to bump registration {}", address))?;

    Ok(())
}

/// Touch last_indexed_at without bumping the counter (duplicate coalesce).
pub async fn touch_registration_indexed(
    conn: &mut PgConnection,
    address: &str,
    indexed_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"UPDATE wallet_registrations
           SET indexing_state = 'active',
               last_indexed_at = GREATEST(COALESCE(last_indexed_at, 'epoch'::TIMESTAMPTZ), $1),
               updated_at = NOW()
           WHERE address = $2"#,
    )
    .bind(indexed_at)
    .bind(address)
    .execute(conn)
    .await
    .wrap_err_with(|| format!("Failed to touch registration {}", address))?;

    Ok(())
}

// ============ Transactions ============

const TRANSACTION_SELECT: &str = r#"signature, wallet_address, block_time, block_number, kind,
    amount, token_mint, token_symbol, counterparty, fee, metadata, is_privacy,
    encrypted_payload, realized_pnl, created_at"#;

/// Insert a transaction. Idempotent on signature: returns false when a row
/// with this signature already exists (nothing written).
pub async fn insert_transaction(conn: &mut PgConnection, tx: &NewTransaction) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO wallet_transactions (signature, wallet_address, block_time, block_number,
            kind, amount, token_mint, token_symbol, counterparty, fee, metadata, is_privacy,
            encrypted_payload)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (signature) DO NOTHING
        "#,
    )
    .bind(&tx.signature)
    .bind(&tx.wallet_address)
    .bind(tx.block_time)
    .bind(tx.block_number)
    .bind(tx.kind.as_str())
    .bind(tx.amount)
    .bind(&tx.token_mint)
    .bind(&tx.token_symbol)
    .bind(&tx.counterparty)
    .bind(tx.fee)
    .bind(&tx.metadata)
    .bind(tx.is_privacy)
    .bind(&tx.encrypted_payload)
    .execute(conn)
    .await
    .map_err(|e| {
        error!(signature = %tx.signature, error = %e, "SQL error inserting transaction");
        e
    })
    .wrap_err("Failed to insert transaction")?;

    Ok(result.rows_affected() > 0)
}

/// Get a transaction by signature
pub async fn get_transaction(pool: &PgPool, signature: &str) -> Result<Option<StoredTransaction>> {
    let query = format!(
        "SELECT {} FROM wallet_transactions WHERE signature = $1",
        TRANSACTION_SELECT
    );
    let row = sqlx::query_as::<_, StoredTransaction>(&query)
        .bind(signature)
        .fetch_optional(pool)
        .await
        .wrap_err("Failed to get transaction")?;

    Ok(row)
}

/// Recent transactions for a wallet, newest first, capped
pub async fn recent_transactions(
    pool: &PgPool,
    wallet: &str,
    since: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<StoredTransaction>> {
    let query = format!(
        r#"SELECT {} FROM wallet_transactions
           WHERE wallet_address = $1 AND block_time >= $2
           ORDER BY block_time DESC
           LIMIT $3"#,
        TRANSACTION_SELECT
    );
    let rows = sqlx::query_as::<_, StoredTransaction>(&query)
        .bind(wallet)
        .bind(since)
        .bind(limit)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to get recent transactions")?;

    Ok(rows)
}

/// Record the realized PnL of a sale on its transaction row (in-tx).
pub async fn set_transaction_realized(
    conn: &mut PgConnection,
    signature: &str,
    realized: f64,
) -> Result<()> {
    sqlx::query(r#"UPDATE wallet_transactions SET realized_pnl = $1 WHERE signature = $2"#)
        .bind(realized)
        .bind(signature)
        .execute(conn)
        .await
        .wrap_err_with(|| format!("Failed to set realized pnl for {}", signature))?;

    Ok(())
}

/// Prior amount samples for (wallet, token), newest first, excluding the
/// transaction under assessment. Privacy rows are excluded implicitly
/// (their amounts are NULL).
pub async fn amount_samples(
    pool: &PgPool,
    wallet: &str,
    token_mint: &str,
    exclude_signature: &str,
    limit: i64,
) -> Result<Vec<f64>> {
    let rows: Vec<(f64,)> = sqlx::query_as(
        r#"SELECT amount FROM wallet_transactions
           WHERE wallet_address = $1 AND token_mint = $2 AND amount IS NOT NULL
             AND signature <> $3
           ORDER BY block_time DESC
           LIMIT $4"#,
    )
    .bind(wallet)
    .bind(token_mint)
    .bind(exclude_signature)
    .bind(limit)
    .fetch_all(pool)
    .await
    .wrap_err("Failed to get amount samples")?;

    Ok(rows.into_iter().map(|r| r.0).collect())
}

/// Count transactions for a wallet within [from, to]
pub async fn count_transactions_in_window(
    pool: &PgPool,
    wallet: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"SELECT COUNT(*) FROM wallet_transactions
           WHERE wallet_address = $1 AND block_time >= $2 AND block_time <= $3"#,
    )
    .bind(wallet)
    .bind(from)
    .bind(to)
    .fetch_one(pool)
    .await
    .wrap_err("Failed to count transactions in window")?;

    Ok(row.0)
}

/// Realized PnL and fee sums over sales in [from, to]
pub async fn realized_in_window(
    pool: &PgPool,
    wallet: &str,
    from: Option<DateTime<Utc>>,
    to: DateTime<Utc>,
) -> Result<(f64, f64)> {
    let row: (f64, f64) = sqlx::query_as(
        r#"SELECT COALESCE(SUM(realized_pnl), 0), COALESCE(SUM(fee), 0)
           FROM wallet_transactions
           WHERE wallet_address = $1
             AND ($2::TIMESTAMPTZ IS NULL OR block_time >= $2)
             AND block_time <= $3"#,
    )
    .bind(wallet)
    .bind(from)
    .bind(to)
    .fetch_one(pool)
    .await
    .wrap_err("Failed to sum realized pnl")?;

    Ok((row.0, row.1))
}

/// Per-token realized PnL over [from, to]
pub async fn realized_by_token(
    pool: &PgPool,
    wallet: &str,
    from: Option<DateTime<Utc>>,
    to: DateTime<Utc>,
) -> Result<Vec<(String, f64)>> {
    let rows: Vec<(String, f64)> = sqlx::query_as(
        r#"SELECT token_mint, COALESCE(SUM(realized_pnl), 0)
           FROM wallet_transactions
           WHERE wallet_address = $1 AND realized_pnl IS NOT NULL
             AND ($2::TIMESTAMPTZ IS NULL OR block_time >= $2)
             AND block_time <= $3
           GROUP BY token_mint"#,
    )
    .bind(wallet)
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await
    .wrap_err("Failed to sum realized pnl by token")?;

    Ok(rows)
}

// ============ Balances ============

const BALANCE_SELECT: &str = r#"id, wallet_address, token_mint, amount, token_symbol,
    usd_value, price_updated_at, last_updated"#;

/// Get a single (wallet, mint) balance inside the indexer's transaction,
/// locking the row against concurrent updates.
pub async fn get_balance_for_update(
    conn: &mut PgConnection,
    wallet: &str,
    token_mint: &str,
) -> Result<Option<f64>> {
    let row: Option<(f64,)> = sqlx::query_as(
        r#"SELECT amount FROM wallet_balances
           WHERE wallet_address = $1 AND token_mint = $2
           FOR UPDATE"#,
    )
    .bind(wallet)
    .bind(token_mint)
    .fetch_optional(conn)
    .await
    .wrap_err("Failed to read balance for update")?;

    Ok(row.map(|r| r.0))
}

/// Write the new balance amount for (wallet, mint), inserting the row when
/// absent (in-tx).
pub async fn put_balance(
    conn: &mut PgConnection,
    wallet: &str,
    token_mint: &str,
    amount: f64,
    token_symbol: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO wallet_balances (wallet_address, token_mint, amount, token_symbol)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (wallet_address, token_mint) DO UPDATE SET
            amount = EXCLUDED.amount,
            token_symbol = COALESCE(EXCLUDED.token_symbol, wallet_balances.token_symbol),
            last_updated = NOW()
        "#,
    )
    .bind(wallet)
    .bind(token_mint)
    .bind(amount)
    .bind(token_symbol)
    .execute(conn)
    .await
    .wrap_err_with(|| format!("Failed to put balance for {} / {}", wallet, token_mint))?;

    Ok(())
}

/// All balances for a wallet
pub async fn get_balances(pool: &PgPool, wallet: &str) -> Result<Vec<Balance>> {
    let query = format!(
        "SELECT {} FROM wallet_balances WHERE wallet_address = $1 ORDER BY token_mint",
        BALANCE_SELECT
    );
    let rows = sqlx::query_as::<_, Balance>(&query)
        .bind(wallet)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to get balances")?;

    Ok(rows)
}

/// Stamp a balance row with a fresh mark price
pub async fn set_balance_price(
    pool: &PgPool,
    wallet: &str,
    token_mint: &str,
    usd_value: f64,
    priced_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"UPDATE wallet_balances
           SET usd_value = $1, price_updated_at = $2
           WHERE wallet_address = $3 AND token_mint = $4"#,
    )
    .bind(usd_value)
    .bind(priced_at)
    .bind(wallet)
    .bind(token_mint)
    .execute(pool)
    .await
    .wrap_err("Failed to set balance price")?;

    Ok(())
}

// ============ Cost basis ============

const LOT_SELECT: &str = r#"id, wallet_address, token_mint, remaining_amount, cost_per_token,
    total_cost, acquired_at, source_signature, created_at"#;

/// Un-consumed lots of (wallet, mint) acquired at or before `at`, oldest
/// first, locked for the caller's transaction (FIFO consumption order).
pub async fn consumable_lots(
    conn: &mut PgConnection,
    wallet: &str,
    token_mint: &str,
    at: DateTime<Utc>,
) -> Result<Vec<CostBasisLot>> {
    let query = format!(
        r#"SELECT {} FROM cost_basis
           WHERE wallet_address = $1 AND token_mint = $2
             AND remaining_amount > 0 AND acquired_at <= $3
           ORDER BY acquired_at, id
           FOR UPDATE"#,
        LOT_SELECT
    );
    let rows = sqlx::query_as::<_, CostBasisLot>(&query)
        .bind(wallet)
        .bind(token_mint)
        .bind(at)
        .fetch_all(conn)
        .await
        .wrap_err("Failed to get consumable lots")?;

    Ok(rows)
}

/// Decrement a lot's remaining amount; fully consumed lots are removed.
pub async fn set_lot_remaining(conn: &mut PgConnection, id: i64, remaining: f64) -> Result<()> {
    if remaining <= 0.0 {
        sqlx::query(r#"DELETE FROM cost_basis WHERE id = $1"#)
            .bind(id)
            .execute(conn)
            .await
            .wrap_err_with(|| format!("Failed to delete consumed lot {}", id))?;
    } else {
        sqlx::query(r#"UPDATE cost_basis SET remaining_amount = $1 WHERE id = $2"#)
            .bind(remaining)
            .bind(id)
            .execute(conn)
            .await
            .wrap_err_with(|| format!("Failed to update lot {}", id))?;
    }

    Ok(())
}

/// Append a new lot (in-tx)
pub async fn insert_lot(conn: &mut PgConnection, lot: &NewCostBasisLot) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO cost_basis (wallet_address, token_mint, remaining_amount, cost_per_token,
            total_cost, acquired_at, source_signature)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(&lot.wallet_address)
    .bind(&lot.token_mint)
    .bind(lot.remaining_amount)
    .bind(lot.cost_per_token)
    .bind(lot.total_cost)
    .bind(lot.acquired_at)
    .bind(&lot.source_signature)
    .fetch_one(conn)
    .await
    .wrap_err("Failed to insert cost basis lot")?;

    Ok(row.0)
}

/// Remaining cost basis of (wallet, mint): Σ remaining × cost-per-token
pub async fn remaining_basis(pool: &PgPool, wallet: &str, token_mint: &str) -> Result<f64> {
    let row: (f64,) = sqlx::query_as(
        r#"SELECT COALESCE(SUM(remaining_amount * cost_per_token), 0)
           FROM cost_basis
           WHERE wallet_address = $1 AND token_mint = $2 AND remaining_amount > 0"#,
    )
    .bind(wallet)
    .bind(token_mint)
    .fetch_one(pool)
    .await
    .wrap_err("Failed to sum remaining basis")?;

    Ok(row.0)
}

// ============ PnL snapshots ============

const PNL_SELECT: &str = r#"id, wallet_address, period, realized_pnl, unrealized_pnl, total_pnl,
    return_pct, fees_paid, token_breakdown, is_stale, calculated_at"#;

/// Insert a PnL snapshot
pub async fn insert_pnl_snapshot(pool: &PgPool, snapshot: &NewPnlSnapshot) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO wallet_pnl (wallet_address, period, realized_pnl, unrealized_pnl, total_pnl,
            return_pct, fees_paid, token_breakdown, is_stale)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING id
        "#,
    )
    .bind(&snapshot.wallet_address)
    .bind(snapshot.period.as_str())
    .bind(snapshot.realized_pnl)
    .bind(snapshot.unrealized_pnl)
    .bind(snapshot.total_pnl)
    .bind(snapshot.return_pct)
    .bind(snapshot.fees_paid)
    .bind(&snapshot.token_breakdown)
    .bind(snapshot.is_stale)
    .fetch_one(pool)
    .await
    .wrap_err("Failed to insert pnl snapshot")?;

    Ok(row.0)
}

/// Latest snapshot for (wallet, period)
pub async fn latest_pnl(
    pool: &PgPool,
    wallet: &str,
    period: PnlPeriod,
) -> Result<Option<PnlSnapshot>> {
    let query = format!(
        r#"SELECT {} FROM wallet_pnl
           WHERE wallet_address = $1 AND period = $2
           ORDER BY calculated_at DESC
           LIMIT 1"#,
        PNL_SELECT
    );
    let row = sqlx::query_as::<_, PnlSnapshot>(&query)
        .bind(wallet)
        .bind(period.as_str())
        .fetch_optional(pool)
        .await
        .wrap_err("Failed to get latest pnl snapshot")?;

    Ok(row)
}

// ============ Risk ============

/// Upsert the aggregated risk profile for a wallet
pub async fn upsert_risk_profile(pool: &PgPool, profile: &RiskProfile) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO risk_profiles (wallet_address, score, anomaly_count, high_risk_pct,
            counterparty_risk, factor_large, factor_frequency, factor_denylist,
            factor_rapid_balance, last_assessed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (wallet_address) DO UPDATE SET
            score = EXCLUDED.score,
            anomaly_count = EXCLUDED.anomaly_count,
            high_risk_pct = EXCLUDED.high_risk_pct,
            counterparty_risk = EXCLUDED.counterparty_risk,
            factor_large = EXCLUDED.factor_large,
            factor_frequency = EXCLUDED.factor_frequency,
            factor_denylist = EXCLUDED.factor_denylist,
            factor_rapid_balance = EXCLUDED.factor_rapid_balance,
            last_assessed_at = EXCLUDED.last_assessed_at
        "#,
    )
    .bind(&profile.wallet_address)
    .bind(profile.score)
    .bind(profile.anomaly_count)
    .bind(profile.high_risk_pct)
    .bind(profile.counterparty_risk)
    .bind(profile.factor_large)
    .bind(profile.factor_frequency)
    .bind(profile.factor_denylist)
    .bind(profile.factor_rapid_balance)
    .bind(profile.last_assessed_at)
    .execute(pool)
    .await
    .wrap_err("Failed to upsert risk profile")?;

    Ok(())
}

/// Get the stored risk profile for a wallet
pub async fn get_risk_profile(pool: &PgPool, wallet: &str) -> Result<Option<RiskProfile>> {
    let row = sqlx::query_as::<_, RiskProfile>(
        r#"SELECT wallet_address, score, anomaly_count, high_risk_pct, counterparty_risk,
                  factor_large, factor_frequency, factor_denylist, factor_rapid_balance,
                  last_assessed_at
           FROM risk_profiles WHERE wallet_address = $1"#,
    )
    .bind(wallet)
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to get risk profile")?;

    Ok(row)
}

/// Record an anomaly
pub async fn insert_anomaly(pool: &PgPool, anomaly: &NewAnomaly) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO anomalies (signature, wallet_address, kind, severity, score, description)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        "#,
    )
    .bind(&anomaly.signature)
    .bind(&anomaly.wallet_address)
    .bind(&anomaly.kind)
    .bind(anomaly.severity.as_str())
    .bind(anomaly.score)
    .bind(&anomaly.description)
    .fetch_one(pool)
    .await
    .wrap_err("Failed to insert anomaly")?;

    Ok(row.0)
}

/// Window stats for profile aggregation over the wallet's last `window`
/// transactions: (transactions considered, anomalies among them, anomalies
/// scoring >= 70).
pub async fn profile_window_stats(
    pool: &PgPool,
    wallet: &str,
    window: i64,
) -> Result<(i64, i64, i64)> {
    let total: (i64,) = sqlx::query_as(
        r#"SELECT COUNT(*) FROM (
               SELECT 1 FROM wallet_transactions
               WHERE wallet_address = $1
               ORDER BY block_time DESC
               LIMIT $2
           ) t"#,
    )
    .bind(wallet)
    .bind(window)
    .fetch_one(pool)
    .await
    .wrap_err("Failed to count profile window transactions")?;

    let anomalies: (i64, i64) = sqlx::query_as(
        r#"SELECT COUNT(*), COUNT(*) FILTER (WHERE a.score >= 70)
           FROM anomalies a
           JOIN (
               SELECT signature FROM wallet_transactions
               WHERE wallet_address = $1
               ORDER BY block_time DESC
               LIMIT $2
           ) t ON a.signature = t.signature"#,
    )
    .bind(wallet)
    .bind(window)
    .fetch_one(pool)
    .await
    .wrap_err("Failed to count profile window anomalies")?;

    Ok((total.0, anomalies.0, anomalies.1))
}

/// Distinct anomaly kinds among the wallet's last `window` transactions
pub async fn anomaly_kinds_in_window(
    pool: &PgPool,
    wallet: &str,
    window: i64,
) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"SELECT DISTINCT a.kind
           FROM anomalies a
           JOIN (
               SELECT signature FROM wallet_transactions
               WHERE wallet_address = $1
               ORDER BY block_time DESC
               LIMIT $2
           ) t ON a.signature = t.signature"#,
    )
    .bind(wallet)
    .bind(window)
    .fetch_all(pool)
    .await
    .wrap_err("Failed to get anomaly kinds in window")?;

    Ok(rows.into_iter().map(|r| r.0).collect())
}

/// Whether any of the wallet's recent counterparties is denylisted
pub async fn has_denylisted_counterparty(
    pool: &PgPool,
    wallet: &str,
    window: i64,
) -> Result<bool> {
    let row: (bool,) = sqlx::query_as(
        r#"SELECT EXISTS(
               SELECT 1 FROM (
                   SELECT counterparty FROM wallet_transactions
                   WHERE wallet_address = $1 AND counterparty IS NOT NULL
                   ORDER BY block_time DESC
                   LIMIT $2
               ) t
               JOIN malicious_addresses m ON m.address = t.counterparty
           )"#,
    )
    .bind(wallet)
    .bind(window)
    .fetch_one(pool)
    .await
    .wrap_err("Failed to check denylisted counterparties")?;

    Ok(row.0)
}

/// Load the full denylist
pub async fn load_denylist(pool: &PgPool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(r#"SELECT address FROM malicious_addresses"#)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to load denylist")?;

    Ok(rows.into_iter().map(|r| r.0).collect())
}

// ============ Status queries ============

/// Count registered wallets
pub async fn count_registrations(pool: &PgPool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM wallet_registrations"#)
        .fetch_one(pool)
        .await
        .wrap_err("Failed to count registrations")?;

    Ok(row.0)
}

/// Count stored transactions
pub async fn count_transactions(pool: &PgPool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM wallet_transactions"#)
        .fetch_one(pool)
        .await
        .wrap_err("Failed to count transactions")?;

    Ok(row.0)
}

/// Count recorded anomalies
pub async fn count_anomalies(pool: &PgPool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM anomalies"#)
        .fetch_one(pool)
        .await
        .wrap_err("Failed to count anomalies")?;

    Ok(row.0)
}
