//! Event fan-out.
//!
//! Subscribers register a kind set, a wallet filter (exact set or wildcard)
//! and a delivery sink. Broadcast appends matching messages to bounded
//! per-subscription buffers; a 100 ms delivery tick drains each buffer FIFO
//! under the subscription's rate limit. A sink that fails or cannot keep up
//! is unsubscribed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::error::{CoreError, CoreResult};
use crate::metrics;
use crate::types::EventKind;

pub const DELIVERY_TICK: Duration = Duration::from_millis(100);
pub const MAX_BUFFERED: usize = 1000;
pub const DEFAULT_RATE_LIMIT: f64 = 100.0;

/// Delivery endpoint for one subscriber.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, message: Value) -> CoreResult<()>;
}

/// Sink over a bounded tokio channel. A full or closed channel counts as a
/// sink failure.
pub struct ChannelSink(pub mpsc::Sender<Value>);

#[async_trait]
impl EventSink for ChannelSink {
    async fn deliver(&self, message: Value) -> CoreResult<()> {
        self.0
            .try_send(message)
            .map_err(|e| CoreError::Stream(format!("sink rejected message: {}", e)))
    }
}

/// An event to broadcast.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub wallet: Option<String>,
    pub data: Value,
}

impl Event {
    pub fn new(kind: EventKind, wallet: Option<String>, data: Value) -> Self {
        Self { kind, wallet, data }
    }

    /// System-error event payload carrying {message, code, context}.
    pub fn system_error(message: &str, code: &str, context: Value) -> Self {
        Self {
            kind: EventKind::SystemError,
            wallet: None,
            data: json!({"message": message, "code": code, "context": context}),
        }
    }
}

struct Subscription {
    id: String,
    agent_id: String,
    kinds: HashSet<EventKind>,
    /// None = wildcard
    wallets: Option<HashSet<String>>,
    sink: Arc<dyn EventSink>,
    rate_limit: f64,
    buffer: VecDeque<Value>,
    last_emit: DateTime<Utc>,
}

impl Subscription {
    fn matches(&self, event: &Event) -> bool {
        if !self.kinds.contains(&event.kind) {
            return false;
        }
        match (&self.wallets, &event.wallet) {
            (None, _) => true,
            (Some(set), Some(wallet)) => set.contains(wallet),
            // Wallet-filtered subscriptions skip wallet-less events
            (Some(_), None) => false,
        }
    }
}

pub struct EventBus {
    clock: SharedClock,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    seq: AtomicU64,
}

impl EventBus {
    pub fn new(clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            clock,
            subscriptions: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        })
    }

    /// Register a subscriber. A wallet filter of `None` or one containing
    /// "*" is the wildcard. A confirmation message is sent to the sink.
    pub async fn subscribe(
        &self,
        agent_id: &str,
        kinds: Vec<EventKind>,
        wallets: Option<Vec<String>>,
        sink: Arc<dyn EventSink>,
        rate_limit: Option<f64>,
    ) -> String {
        let id = format!("sub-{:08}", self.seq.fetch_add(1, Ordering::SeqCst) + 1);

        let wallet_filter = match wallets {
            None => None,
            Some(list) if list.iter().any(|w| w == "*") => None,
            Some(list) => Some(list.into_iter().collect::<HashSet<_>>()),
        };

        let confirmation = json!({
            "type": "subscription_confirmed",
            "subscriptionId": id,
            "agentId": agent_id,
            "eventTypes": kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
            "walletAddresses": match &wallet_filter {
                None => vec!["*".to_string()],
                Some(set) => {
                    let mut list: Vec<String> = set.iter().cloned().collect();
                    list.sort();
                    list
                }
            },
            "timestamp": self.clock.now().to_rfc3339(),
        });
        if let Err(e) = sink.deliver(confirmation).await {
            debug!(error = %e, "Subscription confirmation not delivered");
        }

        let subscription = Subscription {
            id: id.clone(),
            agent_id: agent_id.to_string(),
            kinds: kinds.into_iter().collect(),
            wallets: wallet_filter,
            sink,
            rate_limit: rate_limit.unwrap_or(DEFAULT_RATE_LIMIT),
            buffer: VecDeque::new(),
            last_emit: self.clock.now(),
        };

        info!(
            subscription_id = %id,
            agent_id = %subscription.agent_id,
            "Subscriber registered"
        );
        self.subscriptions
            .lock()
            .unwrap()
            .insert(id.clone(), subscription);
        metrics::set_subscriber_count(self.subscription_count() as i64);
        id
    }

    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let removed = self
            .subscriptions
            .lock()
            .unwrap()
            .remove(subscription_id)
            .is_some();
        if removed {
            info!(subscription_id, "Subscriber removed");
            metrics::set_subscriber_count(self.subscription_count() as i64);
        }
        removed
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    /// Match and buffer. Oldest messages are dropped once a buffer exceeds
    /// the cap.
    pub fn broadcast(&self, event: &Event) {
        let now = self.clock.now();
        let mut subs = self.subscriptions.lock().unwrap();
        for sub in subs.values_mut() {
            if !sub.matches(event) {
                continue;
            }
            let message = json!({
                "eventType": event.kind.as_str(),
                "timestamp": now.to_rfc3339(),
                "data": event.data,
                "subscriptionId": sub.id,
            });
            sub.buffer.push_back(message);
            if sub.buffer.len() > MAX_BUFFERED {
                let overflow = sub.buffer.len() - MAX_BUFFERED;
                sub.buffer.drain(..overflow);
                warn!(
                    subscription_id = %sub.id,
                    dropped = overflow,
                    "Subscriber buffer overflow, oldest messages dropped"
                );
                metrics::record_events_dropped(overflow as u64);
            }
        }
        metrics::record_event_published(event.kind.as_str());
    }

    /// One delivery pass: per subscription drain
    /// floor(elapsed_secs * rate_limit) messages FIFO to the sink.
    /// `ignore_rate` empties buffers regardless (shutdown drain).
    pub async fn deliver_pending(&self, ignore_rate: bool) {
        let now = self.clock.now();
        let mut outbound: Vec<(String, Arc<dyn EventSink>, Vec<Value>)> = Vec::new();

        {
            let mut subs = self.subscriptions.lock().unwrap();
            for sub in subs.values_mut() {
                if sub.buffer.is_empty() {
                    continue;
                }
                let budget = if ignore_rate {
                    sub.buffer.len()
                } else {
                    let elapsed = (now - sub.last_emit)
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .as_secs_f64();
                    (elapsed * sub.rate_limit).floor() as usize
                };
                if budget == 0 {
                    continue;
                }
                let take = budget.min(sub.buffer.len());
                let batch: Vec<Value> = sub.buffer.drain(..take).collect();
                sub.last_emit = now;
                outbound.push((sub.id.clone(), Arc::clone(&sub.sink), batch));
            }
        }

        let mut broken = Vec::new();
        for (id, sink, batch) in outbound {
            for message in batch {
                if let Err(e) = sink.deliver(message).await {
                    warn!(subscription_id = %id, error = %e, "Sink write failed");
                    broken.push(id.clone());
                    break;
                }
                metrics::record_event_delivered();
            }
        }

        for id in broken {
            self.unsubscribe(&id);
        }
    }

    /// Delivery loop; drains remaining buffers on shutdown, then stops.
    pub async fn run(self: Arc<Self>, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(DELIVERY_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.deliver_pending(false).await;
                }
                _ = shutdown.recv() => {
                    info!("Event fan-out draining before shutdown");
                    self.deliver_pending(true).await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::clock::testing::ManualClock;

    fn manual_clock() -> Arc<ManualClock> {
        ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap())
    }

    fn sink_pair(capacity: usize) -> (Arc<ChannelSink>, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(ChannelSink(tx)), rx)
    }

    fn tx_event(wallet: &str) -> Event {
        Event::new(
            EventKind::TransactionNew,
            Some(wallet.to_string()),
            json!({"signature": "s", "wallet": wallet}),
        )
    }

    async fn drain(rx: &mut mpsc::Receiver<Value>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_subscribe_sends_confirmation() {
        let clock = manual_clock();
        let bus = EventBus::new(clock);
        let (sink, mut rx) = sink_pair(8);

        let id = bus
            .subscribe("agent-1", vec![EventKind::TransactionNew], None, sink, None)
            .await;

        let confirmation = rx.recv().await.unwrap();
        assert_eq!(confirmation["type"], "subscription_confirmed");
        assert_eq!(confirmation["subscriptionId"], id.as_str());
        assert_eq!(confirmation["agentId"], "agent-1");
        assert_eq!(confirmation["walletAddresses"][0], "*");
    }

    #[tokio::test]
    async fn test_kind_and_wallet_filtering() {
        let clock = manual_clock();
        let bus = EventBus::new(clock.clone());

        let (sink1, mut rx1) = sink_pair(16);
        let (sink2, mut rx2) = sink_pair(16);

        bus.subscribe(
            "a1",
            vec![EventKind::TransactionNew],
            Some(vec!["WalletA".to_string()]),
            sink1,
            None,
        )
        .await;
        bus.subscribe(
            "a2",
            vec![EventKind::BalanceUpdated],
            Some(vec!["*".to_string()]),
            sink2,
            None,
        )
        .await;

        // Consume confirmations
        drain(&mut rx1).await;
        drain(&mut rx2).await;

        bus.broadcast(&tx_event("WalletA"));
        bus.broadcast(&tx_event("WalletB"));
        bus.broadcast(&Event::new(
            EventKind::BalanceUpdated,
            Some("WalletC".to_string()),
            json!({"wallet": "WalletC"}),
        ));

        clock.advance(chrono::Duration::seconds(1));
        bus.deliver_pending(false).await;

        let got1 = drain(&mut rx1).await;
        assert_eq!(got1.len(), 1);
        assert_eq!(got1[0]["eventType"], "transaction_new");
        assert_eq!(got1[0]["data"]["wallet"], "WalletA");

        let got2 = drain(&mut rx2).await;
        assert_eq!(got2.len(), 1);
        assert_eq!(got2[0]["eventType"], "balance_updated");
    }

    #[tokio::test]
    async fn test_rate_limit_and_fifo_order() {
        let clock = manual_clock();
        let bus = EventBus::new(clock.clone());
        let (sink, mut rx) = sink_pair(64);

        bus.subscribe(
            "a1",
            vec![EventKind::TransactionNew],
            None,
            sink,
            Some(2.0),
        )
        .await;
        drain(&mut rx).await;

        for i in 0..5 {
            bus.broadcast(&Event::new(
                EventKind::TransactionNew,
                Some("W".to_string()),
                json!({"seq": i}),
            ));
        }

        // 1 second elapsed at 2/s -> exactly 2 messages, in order
        clock.advance(chrono::Duration::seconds(1));
        bus.deliver_pending(false).await;
        let first = drain(&mut rx).await;
        assert_eq!(first.len(), 2);
        assert_eq!(first[0]["data"]["seq"], 0);
        assert_eq!(first[1]["data"]["seq"], 1);

        // Next second -> two more
        clock.advance(chrono::Duration::seconds(1));
        bus.deliver_pending(false).await;
        let second = drain(&mut rx).await;
        assert_eq!(second.len(), 2);
        assert_eq!(second[0]["data"]["seq"], 2);

        clock.advance(chrono::Duration::seconds(1));
        bus.deliver_pending(false).await;
        let third = drain(&mut rx).await;
        assert_eq!(third.len(), 1);
        assert_eq!(third[0]["data"]["seq"], 4);
    }

    #[tokio::test]
    async fn test_buffer_overflow_drops_oldest() {
        let clock = manual_clock();
        let bus = EventBus::new(clock.clone());
        let (sink, mut rx) = sink_pair(4);

        bus.subscribe("a1", vec![EventKind::TransactionNew], None, sink, None)
            .await;
        drain(&mut rx).await;

        for i in 0..(MAX_BUFFERED + 5) {
            bus.broadcast(&Event::new(
                EventKind::TransactionNew,
                Some("W".to_string()),
                json!({"seq": i}),
            ));
        }

        // Deliver one tick worth; the first message surviving must be seq 5
        clock.advance(chrono::Duration::milliseconds(100));
        bus.deliver_pending(false).await;
        let got = drain(&mut rx).await;
        assert!(!got.is_empty());
        assert_eq!(got[0]["data"]["seq"], 5);
    }

    #[tokio::test]
    async fn test_broken_sink_unsubscribed() {
        let clock = manual_clock();
        let bus = EventBus::new(clock.clone());
        let (sink, rx) = sink_pair(4);
        drop(rx);

        bus.subscribe("a1", vec![EventKind::TransactionNew], None, sink, None)
            .await;
        assert_eq!(bus.subscription_count(), 1);

        bus.broadcast(&tx_event("W"));
        clock.advance(chrono::Duration::seconds(1));
        bus.deliver_pending(false).await;

        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drain_ignores_rate() {
        let clock = manual_clock();
        let bus = EventBus::new(clock.clone());
        let (sink, mut rx) = sink_pair(64);

        bus.subscribe(
            "a1",
            vec![EventKind::TransactionNew],
            None,
            sink,
            Some(1.0),
        )
        .await;
        drain(&mut rx).await;

        for i in 0..10 {
            bus.broadcast(&Event::new(
                EventKind::TransactionNew,
                Some("W".to_string()),
                json!({"seq": i}),
            ));
        }

        bus.deliver_pending(true).await;
        let got = drain(&mut rx).await;
        assert_eq!(got.len(), 10);
    }
}
