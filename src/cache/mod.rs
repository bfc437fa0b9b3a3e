//! Redis-backed read cache.
//!
//! Key families per wallet/market, coordinated invalidation, SCAN-based
//! pattern deletes, startup warming, and pressure-driven active eviction on
//! top of an allkeys-lru backing policy. All operations run under a 5 s
//! per-operation deadline and feed the stats counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::CacheConfig;
use crate::error::{CoreError, CoreResult};
use crate::metrics;
use crate::store;
use crate::types::{PnlPeriod, ALL_PERIODS};

pub mod eviction;
pub mod keys;
pub mod pool;

pub use eviction::EvictionConfig;
pub use keys::Params;
pub use pool::RedisPool;

const CACHE_OP_DEADLINE: Duration = Duration::from_secs(5);
const SCAN_BATCH: usize = 100;
const WARM_TX_WINDOW_HOURS: i64 = 24;
const WARM_TX_CAP: i64 = 100;

/// Monotonic cache counters.
#[derive(Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    fn snapshot(&self) -> CacheStatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStatsSnapshot {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

/// Outcome of a warming pass.
#[derive(Debug, Clone, Serialize)]
pub struct WarmReport {
    pub success: usize,
    pub errors: Vec<String>,
    pub elapsed_ms: u64,
}

pub struct CacheService {
    pool: RedisPool,
    clock: SharedClock,
    default_ttl_secs: u64,
    pressure_threshold: f64,
    eviction: EvictionConfig,
    stats: CacheStats,
    eviction_tx: mpsc::Sender<()>,
}

impl CacheService {
    /// Connect the pool, set the backing eviction policy, and start the
    /// eviction worker.
    pub async fn connect(config: &CacheConfig, clock: SharedClock) -> CoreResult<Arc<Self>> {
        let pool = RedisPool::connect(
            &config.url,
            config.password.as_deref(),
            config.pool_min,
            config.pool_max,
        )
        .await?;

        let (eviction_tx, eviction_rx) = mpsc::channel(1);

        let service = Arc::new(Self {
            pool,
            clock,
            default_ttl_secs: config.default_ttl_secs,
            pressure_threshold: config.memory_pressure_threshold,
            eviction: EvictionConfig::default(),
            stats: CacheStats::default(),
            eviction_tx,
        });

        // Backing policy: LRU across all keys. Best effort; managed Redis
        // may refuse CONFIG.
        if let Err(e) = service.set_lru_policy().await {
            warn!(error = %e, "Could not set maxmemory-policy allkeys-lru");
        }

        let worker = Arc::clone(&service);
        tokio::spawn(async move {
            worker.eviction_worker(eviction_rx).await;
        });

        info!(
            pool_min = config.pool_min,
            pool_max = config.pool_max,
            default_ttl_secs = config.default_ttl_secs,
            "Cache connected"
        );

        Ok(service)
    }

    async fn set_lru_policy(&self) -> CoreResult<()> {
        let mut cmd = redis::cmd("CONFIG");
        cmd.arg("SET").arg("maxmemory-policy").arg("allkeys-lru");
        let _: String = self.exec(&cmd).await?;
        Ok(())
    }

    /// Single-command execution with deadline, error accounting, and broken
    /// connection discard.
    async fn exec<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> CoreResult<T> {
        let mut conn = self.pool.acquire().await?;
        match tokio::time::timeout(CACHE_OP_DEADLINE, cmd.query_async::<_, T>(&mut *conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                conn.discard();
                Err(CoreError::Cache(e))
            }
            Err(_) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                conn.discard();
                Err(CoreError::Timeout {
                    dependency: "cache",
                })
            }
        }
    }

    pub async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        let value: Option<String> = self.exec(&cmd).await?;
        match value {
            Some(_) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_lookup(true);
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_lookup(false);
            }
        }
        Ok(value)
    }

    /// Write a value with TTL (default when not given), then sample memory
    /// pressure and schedule eviction when over the threshold.
    pub async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> CoreResult<()> {
        let ttl = ttl_secs.unwrap_or(self.default_ttl_secs);
        let mut cmd = redis::cmd("SETEX");
        cmd.arg(key).arg(ttl).arg(value);
        let _: String = self.exec(&cmd).await?;
        self.stats.sets.fetch_add(1, Ordering::Relaxed);

        match self.memory_pressure().await {
            Ok(ratio) if ratio >= self.pressure_threshold => {
                // Non-blocking: a full channel means a run is already queued
                let _ = self.eviction_tx.try_send(());
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Memory pressure sample failed"),
        }
        Ok(())
    }

    /// Serialize and write a value with TTL.
    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: Option<u64>,
    ) -> CoreResult<()> {
        let encoded = serde_json::to_string(value)?;
        self.set(key, &encoded, ttl_secs).await
    }

    pub async fn delete(&self, key: &str) -> CoreResult<bool> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let removed: u64 = self.exec(&cmd).await?;
        self.stats.deletes.fetch_add(removed, Ordering::Relaxed);
        Ok(removed > 0)
    }

    pub async fn exists(&self, key: &str) -> CoreResult<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        let n: u64 = self.exec(&cmd).await?;
        Ok(n > 0)
    }

    /// Remaining TTL in seconds; None for a missing key or a key without
    /// expiry.
    pub async fn ttl(&self, key: &str) -> CoreResult<Option<i64>> {
        let mut cmd = redis::cmd("TTL");
        cmd.arg(key);
        let ttl: i64 = self.exec(&cmd).await?;
        Ok(if ttl < 0 { None } else { Some(ttl) })
    }

    /// Delete every key matching the glob via incremental SCAN (batches of
    /// 100), never KEYS. Returns the number of keys removed.
    pub async fn delete_pattern(&self, pattern: &str) -> CoreResult<u64> {
        let mut conn = self.pool.acquire().await?;
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let scan = async {
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async::<_, (u64, Vec<String>)>(&mut *conn)
                    .await
            };
            let (next, batch) = match tokio::time::timeout(CACHE_OP_DEADLINE, scan).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    conn.discard();
                    return Err(CoreError::Cache(e));
                }
                Err(_) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    conn.discard();
                    return Err(CoreError::Timeout {
                        dependency: "cache",
                    });
                }
            };

            if !batch.is_empty() {
                let mut del = redis::cmd("DEL");
                for key in &batch {
                    del.arg(key);
                }
                match tokio::time::timeout(
                    CACHE_OP_DEADLINE,
                    del.query_async::<_, u64>(&mut *conn),
                )
                .await
                {
                    Ok(Ok(n)) => removed += n,
                    Ok(Err(e)) => {
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                        conn.discard();
                        return Err(CoreError::Cache(e));
                    }
                    Err(_) => {
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                        conn.discard();
                        return Err(CoreError::Timeout {
                            dependency: "cache",
                        });
                    }
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        self.stats.deletes.fetch_add(removed, Ordering::Relaxed);
        if removed > 0 {
            debug!(pattern, removed, "Pattern delete");
        }
        Ok(removed)
    }

    // ---- Invalidation families ----

    /// Purge every cached family of a wallet (after a transaction commit).
    pub async fn invalidate_wallet(&self, address: &str) -> CoreResult<u64> {
        self.delete_pattern(&keys::wallet_pattern(address)).await
    }

    /// Purge balance-derived keys after a balance change.
    pub async fn invalidate_balances(&self, address: &str) -> CoreResult<()> {
        self.delete(&keys::balances_key(address)).await?;
        self.delete(&keys::portfolio_key(address)).await?;
        Ok(())
    }

    /// Purge PnL keys after a recompute.
    pub async fn invalidate_pnl(&self, address: &str) -> CoreResult<u64> {
        self.delete_pattern(&keys::pnl_pattern(address)).await
    }

    /// Purge every cached family of a market.
    pub async fn invalidate_market(&self, address: &str) -> CoreResult<u64> {
        self.delete_pattern(&keys::market_pattern(address)).await
    }

    // ---- Warming ----

    /// Pre-load the canonical read families for a set of wallets. Per-wallet
    /// failures are recorded and do not abort the pass.
    pub async fn warm(&self, db: &PgPool, wallets: &[String]) -> WarmReport {
        let started = std::time::Instant::now();
        let mut success = 0usize;
        let mut errors = Vec::new();

        for wallet in wallets {
            match self.warm_wallet(db, wallet).await {
                Ok(()) => success += 1,
                Err(e) => {
                    warn!(wallet = %wallet, error = %e, "Cache warm failed for wallet");
                    errors.push(format!("{}: {}", wallet, e));
                }
            }
        }

        let report = WarmReport {
            success,
            errors,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            success = report.success,
            failed = report.errors.len(),
            elapsed_ms = report.elapsed_ms,
            "Cache warming complete"
        );
        report
    }

    async fn warm_wallet(&self, db: &PgPool, wallet: &str) -> eyre::Result<()> {
        let balances = store::get_balances(db, wallet).await?;
        self.set_json(&keys::balances_key(wallet), &balances, None)
            .await?;

        let since = self.clock.now() - chrono::Duration::hours(WARM_TX_WINDOW_HOURS);
        let transactions = store::recent_transactions(db, wallet, since, WARM_TX_CAP).await?;
        self.set_json(&keys::transactions_key(wallet, None), &transactions, None)
            .await?;

        for period in ALL_PERIODS {
            if let Some(snapshot) = store::latest_pnl(db, wallet, period).await? {
                self.set_json(&keys::pnl_key(wallet, period), &snapshot, None)
                    .await?;
            }
        }

        Ok(())
    }

    /// Latest PnL cache key helper for external readers.
    pub fn pnl_cache_key(wallet: &str, period: PnlPeriod) -> String {
        keys::pnl_key(wallet, period)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn pool_live(&self) -> usize {
        self.pool.live()
    }

    pub fn pool_idle(&self) -> usize {
        self.pool.idle()
    }

    // ---- Eviction ----

    async fn memory_pressure(&self) -> CoreResult<f64> {
        let mut cmd = redis::cmd("INFO");
        cmd.arg("memory");
        let info: String = self.exec(&cmd).await?;
        let (used, max) = eviction::parse_memory_info(&info);
        Ok(eviction::pressure_ratio(used, max))
    }

    async fn eviction_worker(self: Arc<Self>, mut rx: mpsc::Receiver<()>) {
        while rx.recv().await.is_some() {
            if let Err(e) = self.run_eviction().await {
                warn!(error = %e, "Eviction run failed");
            }
        }
    }

    /// Sample random keys, sort by idle time, delete the coldest 20 %, and
    /// loop until pressure clears or the iteration cap is hit.
    async fn run_eviction(&self) -> CoreResult<()> {
        for iteration in 0..self.eviction.max_iterations {
            let ratio = self.memory_pressure().await?;
            if ratio < self.pressure_threshold {
                debug!(iteration, ratio, "Memory pressure cleared");
                return Ok(());
            }

            let mut samples = Vec::with_capacity(self.eviction.sample_size);
            for _ in 0..self.eviction.sample_size {
                let key: Option<String> = self.exec(&redis::cmd("RANDOMKEY")).await?;
                let Some(key) = key else { break };
                let mut idle_cmd = redis::cmd("OBJECT");
                idle_cmd.arg("IDLETIME").arg(&key);
                match self.exec::<i64>(&idle_cmd).await {
                    Ok(idle) => samples.push((key, idle)),
                    // Key may have expired between the two commands
                    Err(_) => continue,
                }
            }

            let victims = eviction::select_victims(&samples, self.eviction.evict_fraction);
            if victims.is_empty() {
                warn!(iteration, "Eviction found no candidates under pressure");
                return Ok(());
            }

            let mut del = redis::cmd("DEL");
            for key in &victims {
                del.arg(key);
            }
            let removed: u64 = self.exec(&del).await?;
            self.stats.deletes.fetch_add(removed, Ordering::Relaxed);
            metrics::record_evictions(removed);
            info!(iteration, removed, ratio, "Evicted cold keys under memory pressure");
        }
        Ok(())
    }
}
