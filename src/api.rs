//! Health & status API endpoints
//!
//! Provides HTTP endpoints for monitoring:
//! - GET /health - Simple health check
//! - GET /metrics - Prometheus metrics
//! - GET /status - Degradation state, queue depth, cache stats, row counts

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::Result;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use sqlx::PgPool;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::cache::{CacheService, CacheStatsSnapshot};
use crate::degrade::{DegradationController, DependencyStatuses};
use crate::metrics;
use crate::store;

/// Maximum concurrent connections to the API server.
const API_MAX_CONNECTIONS: usize = 128;

/// Read timeout for incoming connections.
const API_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handles the endpoints read from.
pub struct ApiContext {
    pub db: PgPool,
    pub cache: Arc<CacheService>,
    pub degrade: Arc<DegradationController>,
    pub started_at: Instant,
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    uptime_seconds: u64,
    degraded: bool,
    degraded_reasons: Vec<String>,
    dependencies: DependencyStatuses,
    cache: CacheStatsSnapshot,
    counts: CountsResponse,
}

#[derive(Serialize)]
struct CountsResponse {
    registrations: i64,
    transactions: i64,
    anomalies: i64,
}

/// Start the API server
pub async fn start_api_server(addr: SocketAddr, ctx: Arc<ApiContext>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API server started");

    metrics::UP.set(1.0);

    let semaphore = Arc::new(Semaphore::new(API_MAX_CONNECTIONS));

    loop {
        let (mut socket, _) = listener.accept().await?;
        let sem = semaphore.clone();
        let ctx = Arc::clone(&ctx);

        tokio::spawn(async move {
            // Acquire connection permit (bounded concurrency)
            let _permit = match sem.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };

            // Read request with timeout
            let mut buf = [0u8; 4096];
            let n = match tokio::time::timeout(API_READ_TIMEOUT, socket.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => n,
                _ => return,
            };

            let (method, path) = match parse_request(&buf[..n]) {
                Some(mp) => mp,
                None => {
                    let _ = socket
                        .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
                        .await;
                    return;
                }
            };

            match (method.as_str(), path.as_str()) {
                ("GET", "/metrics") => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    let _ = encoder.encode(&metric_families, &mut buffer);

                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n",
                        buffer.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.write_all(&buffer).await;
                }
                ("GET", "/health") => {
                    let response =
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nOK";
                    let _ = socket.write_all(response.as_bytes()).await;
                }
                ("GET", "/status") => {
                    let status = build_status_response(&ctx).await;
                    let body =
                        serde_json::to_string(&status).unwrap_or_else(|_| "{}".to_string());
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                }
                _ => {
                    let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
                    let _ = socket.write_all(response.as_bytes()).await;
                }
            }
        });
    }
}

/// Parse HTTP method and path from raw request bytes.
fn parse_request(buf: &[u8]) -> Option<(String, String)> {
    let request = std::str::from_utf8(buf).ok()?;
    let first_line = request.lines().next()?;
    let mut parts = first_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    Some((method, path))
}

async fn build_status_response(ctx: &ApiContext) -> StatusResponse {
    let degraded = ctx.degrade.is_degraded();
    StatusResponse {
        status: if degraded { "degraded" } else { "ok" }.to_string(),
        uptime_seconds: ctx.started_at.elapsed().as_secs(),
        degraded,
        degraded_reasons: ctx.degrade.describe_degraded(),
        dependencies: ctx.degrade.statuses(),
        cache: ctx.cache.stats(),
        counts: CountsResponse {
            registrations: store::count_registrations(&ctx.db).await.unwrap_or(-1),
            transactions: store::count_transactions(&ctx.db).await.unwrap_or(-1),
            anomalies: store::count_anomalies(&ctx.db).await.unwrap_or(-1),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let raw = b"GET /status HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (method, path) = parse_request(raw).unwrap();
        assert_eq!(method, "GET");
        assert_eq!(path, "/status");
    }

    #[test]
    fn test_parse_request_rejects_garbage() {
        assert!(parse_request(&[0xff, 0xfe, 0x00]).is_none());
        assert!(parse_request(b"").is_none());
    }
}
