//! Persistent upstream stream consumer.
//!
//! One WebSocket to the external indexer. The subscription set is
//! authoritative and re-issued on every successful connect; unexpected
//! closes schedule bounded reconnects; a 30 s heartbeat keeps intermediaries
//! from idling the socket out. Validated transaction frames go to the ingest
//! channel; connection status is published on a watch channel for the
//! degradation controller.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, Weak};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::UpstreamConfig;
use crate::error::{CoreError, CoreResult};
use crate::metrics;

pub mod protocol;

pub use protocol::{InboundFrame, UpstreamTransaction};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);
const RECONNECT_DELAYS_SECS: [u64; 5] = [1, 2, 4, 8, 16];
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Connection status pushed to the degradation controller.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamStatus {
    pub connected: bool,
    pub reconnect_attempts: u32,
    pub disconnects: u64,
}

#[derive(Default)]
struct TaskHandles {
    read: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

pub struct UpstreamClient {
    config: UpstreamConfig,
    self_ref: Weak<Self>,
    writer: Mutex<Option<WsSink>>,
    subscriptions: StdMutex<HashSet<String>>,
    ingest_tx: mpsc::Sender<UpstreamTransaction>,
    status_tx: watch::Sender<StreamStatus>,
    connecting: AtomicBool,
    manual_disconnect: AtomicBool,
    reconnect_attempts: AtomicU32,
    disconnects: AtomicU64,
    tasks: StdMutex<TaskHandles>,
}

impl UpstreamClient {
    pub fn new(
        config: UpstreamConfig,
        ingest_tx: mpsc::Sender<UpstreamTransaction>,
    ) -> (Arc<Self>, watch::Receiver<StreamStatus>) {
        let (status_tx, status_rx) = watch::channel(StreamStatus::default());
        let client = Arc::new_cyclic(|weak| Self {
            config,
            self_ref: weak.clone(),
            writer: Mutex::new(None),
            subscriptions: StdMutex::new(HashSet::new()),
            ingest_tx,
            status_tx,
            connecting: AtomicBool::new(false),
            manual_disconnect: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            disconnects: AtomicU64::new(0),
            tasks: StdMutex::new(TaskHandles::default()),
        });
        (client, status_rx)
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref
            .upgrade()
            .expect("client outlives its own methods")
    }

    pub fn is_connected(&self) -> bool {
        self.status_tx.borrow().connected
    }

    /// Current authoritative subscription set.
    pub fn subscriptions(&self) -> HashSet<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Open the stream. Exactly one connect may be in flight; a concurrent
    /// call fails with `AlreadyConnecting`.
    pub async fn connect(&self) -> CoreResult<()> {
        if self.connecting.swap(true, Ordering::SeqCst) {
            return Err(CoreError::AlreadyConnecting);
        }
        let result = self.connect_inner().await;
        self.connecting.store(false, Ordering::SeqCst);
        result
    }

    fn connect_inner(&self) -> Pin<Box<dyn Future<Output = CoreResult<()>> + Send + '_>> {
        Box::pin(self.connect_inner_impl())
    }

    async fn connect_inner_impl(&self) -> CoreResult<()> {
        if self.writer.lock().await.is_some() {
            debug!("Upstream already connected");
            return Ok(());
        }

        let mut request = self
            .config
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| CoreError::Stream(format!("invalid upstream url: {}", e)))?;
        let bearer = format!("Bearer {}", self.config.api_key);
        request.headers_mut().insert(
            "Authorization",
            bearer
                .parse()
                .map_err(|_| CoreError::Stream("api key is not a valid header value".into()))?,
        );

        let (ws, _response) =
            tokio::time::timeout(HANDSHAKE_DEADLINE, connect_async(request))
                .await
                .map_err(|_| CoreError::Timeout {
                    dependency: "upstream-stream",
                })?
                .map_err(|e| CoreError::Stream(format!("connect failed: {}", e)))?;

        let (sink, source) = ws.split();
        *self.writer.lock().await = Some(sink);

        self.manual_disconnect.store(false, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.push_status(true);
        info!(url = %self.config.ws_url, "Upstream connected");

        {
            let mut tasks = self.tasks.lock().unwrap();
            if let Some(handle) = tasks.read.take() {
                handle.abort();
            }
            if let Some(handle) = tasks.heartbeat.take() {
                handle.abort();
            }
            let reader = self.arc();
            tasks.read = Some(tokio::spawn(async move {
                reader.read_loop(source).await;
            }));
            let beater = self.arc();
            tasks.heartbeat = Some(tokio::spawn(async move {
                beater.heartbeat_loop().await;
            }));
        }

        // Re-issue every active subscription on the fresh socket
        let subs: Vec<String> = self.subscriptions().into_iter().collect();
        for wallet in subs {
            if let Err(e) = self.send_raw(protocol::subscribe_frame(&wallet)).await {
                warn!(wallet = %wallet, error = %e, "Failed to re-issue subscription");
            }
        }

        Ok(())
    }

    /// User-initiated disconnect: cancels pending reconnects, stops the
    /// heartbeat, closes the socket.
    pub async fn disconnect(&self) {
        self.manual_disconnect.store(true, Ordering::SeqCst);
        {
            let mut tasks = self.tasks.lock().unwrap();
            if let Some(handle) = tasks.reconnect.take() {
                handle.abort();
            }
            if let Some(handle) = tasks.heartbeat.take() {
                handle.abort();
            }
        }
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        self.push_status(false);
        info!("Upstream disconnected by request");
    }

    /// Subscribe to a wallet's activity. Fails with `NotConnected` when the
    /// socket is down; the set is updated only after the frame is sent.
    pub async fn subscribe(&self, wallet: &str) -> CoreResult<()> {
        self.send_raw(protocol::subscribe_frame(wallet)).await?;
        self.subscriptions
            .lock()
            .unwrap()
            .insert(wallet.to_string());
        debug!(wallet = %wallet, "Subscribed");
        Ok(())
    }

    /// Unsubscribe from a wallet's activity.
    pub async fn unsubscribe(&self, wallet: &str) -> CoreResult<()> {
        self.send_raw(protocol::unsubscribe_frame(wallet)).await?;
        self.subscriptions.lock().unwrap().remove(wallet);
        debug!(wallet = %wallet, "Unsubscribed");
        Ok(())
    }

    async fn send_raw(&self, frame: String) -> CoreResult<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => sink
                .send(Message::Text(frame))
                .await
                .map_err(|e| CoreError::Stream(format!("send failed: {}", e))),
            None => Err(CoreError::NotConnected),
        }
    }

    async fn read_loop(self: Arc<Self>, mut source: WsSource) {
        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Text(text)) => self.handle_frame(&text).await,
                Ok(Message::Close(_)) => {
                    debug!("Upstream sent close frame");
                    break;
                }
                // Pings are answered by the protocol layer on the next flush
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Upstream read error");
                    break;
                }
            }
        }
        self.on_disconnect().await;
    }

    async fn handle_frame(&self, text: &str) {
        match protocol::parse_frame(text) {
            Ok(InboundFrame::Transaction(tx)) => {
                metrics::record_stream_frame("transaction");
                if self.ingest_tx.send(tx).await.is_err() {
                    warn!("Ingest channel closed; dropping frame");
                }
            }
            Ok(InboundFrame::Error(data)) => {
                metrics::record_stream_frame("error");
                warn!(data = %data, "Upstream reported an error");
            }
            Ok(InboundFrame::Pong) => {
                metrics::record_stream_frame("pong");
            }
            Ok(InboundFrame::Unknown(kind)) => {
                metrics::record_stream_frame("unknown");
                debug!(kind = %kind, "Ignoring unknown upstream frame");
            }
            // Malformed frame: per-message error, connection stays up
            Err(e) => {
                metrics::record_stream_frame("malformed");
                warn!(error = %e, "Malformed upstream frame");
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.send_raw(protocol::ping_frame()).await {
                debug!(error = %e, "Heartbeat stopped");
                return;
            }
        }
    }

    async fn on_disconnect(&self) {
        *self.writer.lock().await = None;
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.push_status(false);

        if self.manual_disconnect.load(Ordering::SeqCst) {
            return;
        }

        warn!("Upstream connection lost; scheduling reconnect");
        let client = self.arc();
        let handle = tokio::spawn(async move {
            client.reconnect_loop().await;
        });
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(old) = tasks.reconnect.replace(handle) {
            old.abort();
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > MAX_RECONNECT_ATTEMPTS {
                error!(
                    attempts = MAX_RECONNECT_ATTEMPTS,
                    "Giving up on upstream reconnect"
                );
                self.push_status(false);
                return;
            }
            let delay = RECONNECT_DELAYS_SECS[(attempt as usize - 1).min(4)];
            info!(attempt, delay_secs = delay, "Reconnecting to upstream");
            self.push_status(false);
            tokio::time::sleep(Duration::from_secs(delay)).await;
            if self.manual_disconnect.load(Ordering::SeqCst) {
                return;
            }
            match self.connect().await {
                Ok(()) => return,
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }
    }

    fn push_status(&self, connected: bool) {
        let status = StreamStatus {
            connected,
            reconnect_attempts: self.reconnect_attempts.load(Ordering::SeqCst),
            disconnects: self.disconnects.load(Ordering::SeqCst),
        };
        metrics::set_stream_connected(connected);
        let _ = self.status_tx.send(status);
    }
}
