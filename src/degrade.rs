//! Graceful degradation.
//!
//! Tracks the three failure domains (stream, primary store, cache), serves
//! reads cache-first with store fallback, and absorbs writes into a bounded
//! FIFO queue when the store is failing. The queue processor replays in
//! order every 10 seconds while the store circuit allows it.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::CacheService;
use crate::circuit::{retry_with_backoff, CircuitBreaker, CircuitState};
use crate::clock::SharedClock;
use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventBus};
use crate::metrics;
use crate::upstream::StreamStatus;

/// Queue processor cadence.
pub const QUEUE_TICK: Duration = Duration::from_secs(10);
/// Ops replayed per processor pass.
const DEQUEUE_BATCH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOpKind {
    Insert,
    Update,
    Upsert,
    Delete,
}

impl WriteOpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOpKind::Insert => "insert",
            WriteOpKind::Update => "update",
            WriteOpKind::Upsert => "upsert",
            WriteOpKind::Delete => "delete",
        }
    }
}

/// A queued (or in-flight) write operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteOp {
    pub id: u64,
    pub kind: WriteOpKind,
    pub table: String,
    /// Column -> value map (ignored for delete)
    pub data: Value,
    /// Equality filter, required for update/delete, conflict target for
    /// upsert
    pub filter: Option<Value>,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// Executes write ops against the store. Seam so queue semantics are
/// testable without Postgres.
#[async_trait]
pub trait WriteExecutor: Send + Sync {
    async fn execute(&self, op: &WriteOp) -> CoreResult<()>;
}

fn valid_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Object fields in deterministic (key-sorted) order, identifiers checked.
fn object_fields(value: &Value, what: &str) -> CoreResult<Vec<(String, Value)>> {
    let map = value
        .as_object()
        .ok_or_else(|| CoreError::Validation(format!("{} must be an object", what)))?;
    if map.is_empty() {
        return Err(CoreError::Validation(format!("{} must not be empty", what)));
    }
    let mut fields: Vec<(String, Value)> =
        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    fields.sort_by(|a, b| a.0.cmp(&b.0));
    for (key, _) in &fields {
        if !valid_ident(key) {
            return Err(CoreError::Validation(format!(
                "invalid column name '{}'",
                key
            )));
        }
    }
    Ok(fields)
}

/// Render an op to (sql, bind values). Column and table names are validated
/// identifiers; every value goes through a bind parameter.
pub fn build_sql(op: &WriteOp) -> CoreResult<(String, Vec<Value>)> {
    if !valid_ident(&op.table) {
        return Err(CoreError::Validation(format!(
            "invalid table name '{}'",
            op.table
        )));
    }

    match op.kind {
        WriteOpKind::Insert => {
            let fields = object_fields(&op.data, "data")?;
            let columns: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();
            let placeholders: Vec<String> =
                (1..=fields.len()).map(|i| format!("${}", i)).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                op.table,
                columns.join(", "),
                placeholders.join(", ")
            );
            Ok((sql, fields.into_iter().map(|(_, v)| v).collect()))
        }
        WriteOpKind::Upsert => {
            let fields = object_fields(&op.data, "data")?;
            let conflict = match &op.filter {
                Some(filter) => object_fields(filter, "filter")?
                    .into_iter()
                    .map(|(k, _)| k)
                    .collect::<Vec<_>>(),
                None => vec![fields[0].0.clone()],
            };
            let columns: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();
            let placeholders: Vec<String> =
                (1..=fields.len()).map(|i| format!("${}", i)).collect();
            let updates: Vec<String> = columns
                .iter()
                .filter(|c| !conflict.iter().any(|k| k == *c))
                .map(|c| format!("{} = EXCLUDED.{}", c, c))
                .collect();
            let action = if updates.is_empty() {
                "DO NOTHING".to_string()
            } else {
                format!("DO UPDATE SET {}", updates.join(", "))
            };
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
                op.table,
                columns.join(", "),
                placeholders.join(", "),
                conflict.join(", "),
                action
            );
            Ok((sql, fields.into_iter().map(|(_, v)| v).collect()))
        }
        WriteOpKind::Update => {
            let fields = object_fields(&op.data, "data")?;
            let filter = object_fields(
                op.filter
                    .as_ref()
                    .ok_or_else(|| CoreError::Validation("update requires a filter".into()))?,
                "filter",
            )?;
            let sets: Vec<String> = fields
                .iter()
                .enumerate()
                .map(|(i, (k, _))| format!("{} = ${}", k, i + 1))
                .collect();
            let wheres: Vec<String> = filter
                .iter()
                .enumerate()
                .map(|(i, (k, _))| format!("{} = ${}", k, fields.len() + i + 1))
                .collect();
            let sql = format!(
                "UPDATE {} SET {} WHERE {}",
                op.table,
                sets.join(", "),
                wheres.join(" AND ")
            );
            let mut values: Vec<Value> = fields.into_iter().map(|(_, v)| v).collect();
            values.extend(filter.into_iter().map(|(_, v)| v));
            Ok((sql, values))
        }
        WriteOpKind::Delete => {
            let filter = object_fields(
                op.filter
                    .as_ref()
                    .ok_or_else(|| CoreError::Validation("delete requires a filter".into()))?,
                "filter",
            )?;
            let wheres: Vec<String> = filter
                .iter()
                .enumerate()
                .map(|(i, (k, _))| format!("{} = ${}", k, i + 1))
                .collect();
            let sql = format!("DELETE FROM {} WHERE {}", op.table, wheres.join(" AND "));
            Ok((sql, filter.into_iter().map(|(_, v)| v).collect()))
        }
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.clone()),
    }
}

/// Production write executor over the primary store.
pub struct PgWriteExecutor {
    pool: PgPool,
}

impl PgWriteExecutor {
    pub fn new(pool: PgPool) -> Arc<Self> {
        Arc::new(Self { pool })
    }
}

#[async_trait]
impl WriteExecutor for PgWriteExecutor {
    async fn execute(&self, op: &WriteOp) -> CoreResult<()> {
        let (sql, values) = build_sql(op)?;
        let mut query = sqlx::query(&sql);
        for value in &values {
            query = bind_value(query, value);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }
}

/// Retry tuning for direct writes.
#[derive(Debug, Clone)]
pub struct DegradeConfig {
    pub write_attempts: u32,
    pub write_base_delay: Duration,
    pub queue_cap: usize,
    pub max_op_retries: u32,
}

impl Default for DegradeConfig {
    fn default() -> Self {
        Self {
            write_attempts: 3,
            write_base_delay: Duration::from_secs(1),
            queue_cap: 10_000,
            max_op_retries: 5,
        }
    }
}

/// Aggregated dependency view for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyStatuses {
    pub stream: StreamStatus,
    pub store_up: bool,
    pub store_queue_depth: usize,
    pub store_last_failure: Option<DateTime<Utc>>,
    pub cache_up: bool,
    pub cache_last_failure: Option<DateTime<Utc>>,
}

pub struct DegradationController {
    cache: Option<Arc<CacheService>>,
    store_breaker: Arc<CircuitBreaker>,
    cache_breaker: Arc<CircuitBreaker>,
    events: Arc<EventBus>,
    executor: Arc<dyn WriteExecutor>,
    clock: SharedClock,
    config: DegradeConfig,
    queue: Mutex<VecDeque<WriteOp>>,
    next_id: AtomicU64,
    overflow_dropped: AtomicU64,
    stream_status: Mutex<StreamStatus>,
    store_last_failure: Mutex<Option<DateTime<Utc>>>,
    cache_last_failure: Mutex<Option<DateTime<Utc>>>,
}

impl DegradationController {
    pub fn new(
        cache: Option<Arc<CacheService>>,
        store_breaker: Arc<CircuitBreaker>,
        cache_breaker: Arc<CircuitBreaker>,
        events: Arc<EventBus>,
        executor: Arc<dyn WriteExecutor>,
        clock: SharedClock,
        config: DegradeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            store_breaker,
            cache_breaker,
            events,
            executor,
            clock,
            config,
            queue: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            overflow_dropped: AtomicU64::new(0),
            stream_status: Mutex::new(StreamStatus::default()),
            store_last_failure: Mutex::new(None),
            cache_last_failure: Mutex::new(None),
        })
    }

    /// Pushed by the upstream client on connection changes.
    pub fn set_stream_status(&self, status: StreamStatus) {
        *self.stream_status.lock().unwrap() = status;
    }

    pub fn statuses(&self) -> DependencyStatuses {
        DependencyStatuses {
            stream: self.stream_status.lock().unwrap().clone(),
            store_up: self.store_breaker.state() != CircuitState::Open,
            store_queue_depth: self.queue_depth(),
            store_last_failure: *self.store_last_failure.lock().unwrap(),
            cache_up: self.cache_breaker.state() != CircuitState::Open,
            cache_last_failure: *self.cache_last_failure.lock().unwrap(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        let statuses = self.statuses();
        !statuses.stream.connected || !statuses.store_up || !statuses.cache_up
    }

    pub fn describe_degraded(&self) -> Vec<String> {
        let statuses = self.statuses();
        let mut reasons = Vec::new();
        if !statuses.stream.connected {
            reasons.push(format!(
                "upstream stream disconnected ({} attempts)",
                statuses.stream.reconnect_attempts
            ));
        }
        if !statuses.store_up {
            reasons.push(format!(
                "primary store circuit open ({} writes queued)",
                statuses.store_queue_depth
            ));
        }
        if !statuses.cache_up {
            reasons.push("cache circuit open".to_string());
        }
        reasons
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Cache-first read: cache through the cache breaker with a null
    /// fallback, then the store through the store breaker, then a
    /// best-effort write-back. A cache parse failure falls through to the
    /// store path.
    pub async fn execute_query<T, F, Fut>(
        &self,
        key: &str,
        ttl_secs: Option<u64>,
        db_fn: F,
    ) -> CoreResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        if let Some(cache) = &self.cache {
            let cached = match self.cache_breaker.execute(|| cache.get(key)).await {
                Ok(value) => value,
                Err(e) => {
                    *self.cache_last_failure.lock().unwrap() = Some(self.clock.now());
                    debug!(key, error = %e, "Cache read failed, falling back to store");
                    None
                }
            };
            if let Some(raw) = cached {
                match serde_json::from_str::<T>(&raw) {
                    Ok(value) => return Ok(value),
                    Err(e) => {
                        debug!(key, error = %e, "Cached value unparseable, refreshing from store")
                    }
                }
            }
        }

        let result = self
            .store_breaker
            .execute(|| async {
                tokio::time::timeout(Duration::from_secs(30), db_fn())
                    .await
                    .map_err(|_| CoreError::Timeout {
                        dependency: "primary-store",
                    })?
            })
            .await;

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                *self.store_last_failure.lock().unwrap() = Some(self.clock.now());
                return Err(e);
            }
        };

        if let Some(cache) = &self.cache {
            let write_back = self
                .cache_breaker
                .execute(|| cache.set_json(key, &value, ttl_secs))
                .await;
            if let Err(e) = write_back {
                debug!(key, error = %e, "Cache write-back failed");
            }
        }

        Ok(value)
    }

    /// Write with retry; persistent failure enqueues the op and reports a
    /// system-error event instead of failing the caller.
    pub async fn execute_write(
        &self,
        kind: WriteOpKind,
        table: &str,
        data: Value,
        filter: Option<Value>,
    ) -> CoreResult<()> {
        let op = WriteOp {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            kind,
            table: table.to_string(),
            data,
            filter,
            enqueued_at: self.clock.now(),
            retry_count: 0,
        };

        let attempt_op = &op;
        let result = retry_with_backoff(
            self.config.write_attempts,
            self.config.write_base_delay,
            || {
                self.store_breaker
                    .execute(|| self.executor.execute(attempt_op))
            },
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                *self.store_last_failure.lock().unwrap() = Some(self.clock.now());
                warn!(
                    op_id = op.id,
                    table = %op.table,
                    kind = op.kind.as_str(),
                    error = %e,
                    "Write failed after retries, queueing"
                );
                self.events.broadcast(&Event::system_error(
                    "write queued after retry exhaustion",
                    e.code(),
                    serde_json::json!({"table": op.table, "kind": op.kind.as_str()}),
                ));
                self.enqueue(op);
                Ok(())
            }
        }
    }

    fn enqueue(&self, op: WriteOp) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.config.queue_cap {
            queue.pop_front();
            let dropped = self.overflow_dropped.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(
                dropped_total = dropped,
                cap = self.config.queue_cap,
                "Write queue overflow, oldest op dropped"
            );
        }
        queue.push_back(op);
        metrics::set_write_queue_depth(queue.len() as i64);
    }

    /// One processor pass: skip while the store circuit is open, otherwise
    /// replay up to 10 ops in FIFO order. A failing op (and the untried
    /// remainder) goes back to the queue front so order is preserved; ops
    /// that exhaust their retries are dropped.
    pub async fn process_queue(&self) -> usize {
        if !self.store_breaker.is_available() {
            debug!("Store circuit open, skipping queue pass");
            return 0;
        }

        let batch: Vec<WriteOp> = {
            let mut queue = self.queue.lock().unwrap();
            let take = DEQUEUE_BATCH.min(queue.len());
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return 0;
        }

        let mut processed = 0usize;
        let mut batch = VecDeque::from(batch);
        while let Some(mut op) = batch.pop_front() {
            let result = self
                .store_breaker
                .execute(|| self.executor.execute(&op))
                .await;
            match result {
                Ok(()) => {
                    processed += 1;
                }
                Err(e) => {
                    *self.store_last_failure.lock().unwrap() = Some(self.clock.now());
                    op.retry_count += 1;
                    if op.retry_count >= self.config.max_op_retries {
                        warn!(
                            op_id = op.id,
                            table = %op.table,
                            retries = op.retry_count,
                            error = %e,
                            "Queued write dropped after retry limit"
                        );
                    } else {
                        batch.push_front(op);
                    }
                    // Put the failed op and everything untried back at the
                    // front, preserving FIFO order for the next pass.
                    let mut queue = self.queue.lock().unwrap();
                    for pending in batch.into_iter().rev() {
                        queue.push_front(pending);
                    }
                    metrics::set_write_queue_depth(queue.len() as i64);
                    return processed;
                }
            }
        }

        metrics::set_write_queue_depth(self.queue_depth() as i64);
        if processed > 0 {
            info!(processed, remaining = self.queue_depth(), "Queue pass complete");
        }
        processed
    }

    /// Queue processor loop; drains what it can on shutdown, then stops.
    pub async fn run(self: Arc<Self>, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(QUEUE_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.process_queue().await;
                }
                _ = shutdown.recv() => {
                    info!(depth = self.queue_depth(), "Draining write queue before shutdown");
                    loop {
                        let processed = self.process_queue().await;
                        if processed == 0 || self.queue_depth() == 0 {
                            break;
                        }
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;

    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::circuit::BreakerConfig;
    use crate::clock::testing::ManualClock;
    use crate::clock::Clock;
    use crate::events::EventBus;
    use crate::types::EventKind;

    struct MemoryExecutor {
        fail_all: AtomicBool,
        fail_once: Mutex<HashSet<u64>>,
        log: Mutex<Vec<u64>>,
    }

    impl MemoryExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail_all: AtomicBool::new(false),
                fail_once: Mutex::new(HashSet::new()),
                log: Mutex::new(Vec::new()),
            })
        }

        fn executed(&self) -> Vec<u64> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WriteExecutor for MemoryExecutor {
        async fn execute(&self, op: &WriteOp) -> CoreResult<()> {
            if self.fail_all.load(Ordering::SeqCst) {
                return Err(CoreError::Stream("store down".to_string()));
            }
            if self.fail_once.lock().unwrap().remove(&op.id) {
                return Err(CoreError::Stream("transient".to_string()));
            }
            self.log.lock().unwrap().push(op.id);
            Ok(())
        }
    }

    fn controller_with(
        executor: Arc<MemoryExecutor>,
        clock: Arc<ManualClock>,
        store_threshold: u32,
        queue_cap: usize,
    ) -> Arc<DegradationController> {
        let store_breaker = Arc::new(CircuitBreaker::new(
            "primary-store",
            BreakerConfig {
                failure_threshold: store_threshold,
                success_threshold: 1,
                cooldown: Duration::from_secs(120),
            },
            clock.clone(),
        ));
        let cache_breaker = Arc::new(CircuitBreaker::new(
            "cache",
            BreakerConfig::default(),
            clock.clone(),
        ));
        DegradationController::new(
            None,
            store_breaker,
            cache_breaker,
            EventBus::new(clock.clone()),
            executor,
            clock,
            DegradeConfig {
                write_attempts: 2,
                write_base_delay: Duration::from_millis(1),
                queue_cap,
                max_op_retries: 5,
            },
        )
    }

    fn manual_clock() -> Arc<ManualClock> {
        ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_writes_queue_while_store_down_then_replay_in_order() {
        let executor = MemoryExecutor::new();
        let clock = manual_clock();
        let controller = controller_with(executor.clone(), clock.clone(), 3, 10_000);

        executor.fail_all.store(true, Ordering::SeqCst);
        for i in 0..5 {
            controller
                .execute_write(WriteOpKind::Insert, "wallet_balances", json!({"v": i}), None)
                .await
                .unwrap();
        }
        assert_eq!(controller.queue_depth(), 5);
        assert!(controller.is_degraded());

        // Store circuit is open after the repeated failures: pass skips
        executor.fail_all.store(false, Ordering::SeqCst);
        assert_eq!(controller.process_queue().await, 0);
        assert_eq!(controller.queue_depth(), 5);

        // Cooldown elapses, the probe succeeds, the queue drains in order
        clock.advance(chrono::Duration::seconds(121));
        let processed = controller.process_queue().await;
        assert_eq!(processed, 5);
        assert_eq!(controller.queue_depth(), 0);
        assert_eq!(executor.executed(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_transient_failure_preserves_order() {
        let executor = MemoryExecutor::new();
        let clock = manual_clock();
        // High threshold so the breaker stays closed through the test
        let controller = controller_with(executor.clone(), clock.clone(), 100, 10_000);

        executor.fail_all.store(true, Ordering::SeqCst);
        for i in 0..5 {
            controller
                .execute_write(WriteOpKind::Insert, "t", json!({"v": i}), None)
                .await
                .unwrap();
        }
        executor.fail_all.store(false, Ordering::SeqCst);

        // Second op fails once; the pass stops there and keeps order
        executor.fail_once.lock().unwrap().insert(2);
        let processed = controller.process_queue().await;
        assert_eq!(processed, 1);
        assert_eq!(controller.queue_depth(), 4);

        let processed = controller.process_queue().await;
        assert_eq!(processed, 4);
        assert_eq!(executor.executed(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_queue_overflow_drops_oldest() {
        let executor = MemoryExecutor::new();
        let clock = manual_clock();
        let controller = controller_with(executor.clone(), clock.clone(), 100, 3);

        executor.fail_all.store(true, Ordering::SeqCst);
        for i in 0..5 {
            controller
                .execute_write(WriteOpKind::Insert, "t", json!({"v": i}), None)
                .await
                .unwrap();
        }
        assert_eq!(controller.queue_depth(), 3);

        executor.fail_all.store(false, Ordering::SeqCst);
        controller.process_queue().await;
        // Ops 1 and 2 were dropped on overflow
        assert_eq!(executor.executed(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_op_dropped_after_retry_limit() {
        let executor = MemoryExecutor::new();
        let clock = manual_clock();
        let controller = controller_with(executor.clone(), clock.clone(), 1000, 10_000);

        executor.fail_all.store(true, Ordering::SeqCst);
        controller
            .execute_write(WriteOpKind::Insert, "t", json!({"v": 1}), None)
            .await
            .unwrap();
        assert_eq!(controller.queue_depth(), 1);

        // Five failing passes exhaust the op's retry budget
        for _ in 0..5 {
            controller.process_queue().await;
        }
        assert_eq!(controller.queue_depth(), 0);
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn test_system_error_event_after_retry_exhaustion() {
        let executor = MemoryExecutor::new();
        let clock = manual_clock();

        let store_breaker = Arc::new(CircuitBreaker::new(
            "primary-store",
            BreakerConfig {
                failure_threshold: 100,
                success_threshold: 1,
                cooldown: Duration::from_secs(120),
            },
            clock.clone(),
        ));
        let cache_breaker = Arc::new(CircuitBreaker::new(
            "cache",
            BreakerConfig::default(),
            clock.clone(),
        ));
        let bus = EventBus::new(clock.clone());
        let controller = DegradationController::new(
            None,
            store_breaker,
            cache_breaker,
            Arc::clone(&bus),
            executor.clone(),
            clock.clone(),
            DegradeConfig {
                write_attempts: 2,
                write_base_delay: Duration::from_millis(1),
                queue_cap: 100,
                max_op_retries: 5,
            },
        );

        let (tx, mut rx) = mpsc::channel(8);
        bus.subscribe(
            "watcher",
            vec![EventKind::SystemError],
            None,
            Arc::new(crate::events::ChannelSink(tx)),
            None,
        )
        .await;
        let _ = rx.recv().await; // confirmation

        executor.fail_all.store(true, Ordering::SeqCst);
        controller
            .execute_write(WriteOpKind::Insert, "t", json!({"v": 1}), None)
            .await
            .unwrap();

        bus.deliver_pending(true).await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event["eventType"], "system_error");
        assert_eq!(event["data"]["context"]["table"], "t");
    }

    #[test]
    fn test_statuses_reflect_stream() {
        let executor = MemoryExecutor::new();
        let clock = manual_clock();
        let controller = controller_with(executor, clock, 3, 100);

        assert!(controller.is_degraded());
        controller.set_stream_status(StreamStatus {
            connected: true,
            reconnect_attempts: 0,
            disconnects: 0,
        });
        assert!(!controller.is_degraded());
        assert!(controller.describe_degraded().is_empty());

        controller.set_stream_status(StreamStatus {
            connected: false,
            reconnect_attempts: 2,
            disconnects: 1,
        });
        let reasons = controller.describe_degraded();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("stream"));
    }

    #[test]
    fn test_build_insert_sql() {
        let op = WriteOp {
            id: 1,
            kind: WriteOpKind::Insert,
            table: "wallet_balances".to_string(),
            data: json!({"wallet_address": "W", "amount": 5.0}),
            filter: None,
            enqueued_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            retry_count: 0,
        };
        let (sql, values) = build_sql(&op).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO wallet_balances (amount, wallet_address) VALUES ($1, $2)"
        );
        assert_eq!(values, vec![json!(5.0), json!("W")]);
    }

    #[test]
    fn test_build_update_and_delete_sql() {
        let update = WriteOp {
            id: 1,
            kind: WriteOpKind::Update,
            table: "wallet_registrations".to_string(),
            data: json!({"indexing_state": "paused"}),
            filter: Some(json!({"address": "W"})),
            enqueued_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            retry_count: 0,
        };
        let (sql, values) = build_sql(&update).unwrap();
        assert_eq!(
            sql,
            "UPDATE wallet_registrations SET indexing_state = $1 WHERE address = $2"
        );
        assert_eq!(values, vec![json!("paused"), json!("W")]);

        let delete = WriteOp {
            id: 2,
            kind: WriteOpKind::Delete,
            table: "anomalies".to_string(),
            data: Value::Null,
            filter: Some(json!({"signature": "s1"})),
            enqueued_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            retry_count: 0,
        };
        let (sql, values) = build_sql(&delete).unwrap();
        assert_eq!(sql, "DELETE FROM anomalies WHERE signature = $1");
        assert_eq!(values, vec![json!("s1")]);
    }

    #[test]
    fn test_build_upsert_sql() {
        let op = WriteOp {
            id: 1,
            kind: WriteOpKind::Upsert,
            table: "wallet_balances".to_string(),
            data: json!({"wallet_address": "W", "token_mint": "M", "amount": 5.0}),
            filter: Some(json!({"wallet_address": true, "token_mint": true})),
            enqueued_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            retry_count: 0,
        };
        let (sql, _) = build_sql(&op).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO wallet_balances (amount, token_mint, wallet_address) \
             VALUES ($1, $2, $3) ON CONFLICT (token_mint, wallet_address) \
             DO UPDATE SET amount = EXCLUDED.amount"
        );
    }

    #[test]
    fn test_rejects_bad_identifiers() {
        let op = WriteOp {
            id: 1,
            kind: WriteOpKind::Insert,
            table: "balances; DROP TABLE users".to_string(),
            data: json!({"a": 1}),
            filter: None,
            enqueued_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            retry_count: 0,
        };
        assert!(build_sql(&op).is_err());

        let op = WriteOp {
            id: 2,
            kind: WriteOpKind::Insert,
            table: "balances".to_string(),
            data: json!({"amount\" = 0; --": 1}),
            filter: None,
            enqueued_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            retry_count: 0,
        };
        assert!(build_sql(&op).is_err());
    }

    #[test]
    fn test_clock_in_enqueued_at() {
        let clock = manual_clock();
        let now = clock.now();
        assert_eq!(now.timestamp(), Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap().timestamp());
    }
}
