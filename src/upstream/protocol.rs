//! Upstream wire protocol.
//!
//! JSON frames. Client to server: `{type: "subscribe"|"unsubscribe",
//! data: {wallet}}` and `{type: "ping"}`. Server to client: `transaction`,
//! `error`, `pong`. A malformed frame is a per-message error and never
//! disturbs the connection.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use crate::error::CoreError;
use crate::types::TxKind;

/// Upstream stamps above this are taken as milliseconds.
const MILLIS_CUTOFF: f64 = 20_000_000_000.0;

pub fn subscribe_frame(wallet: &str) -> String {
    json!({"type": "subscribe", "data": {"wallet": wallet}}).to_string()
}

pub fn unsubscribe_frame(wallet: &str) -> String {
    json!({"type": "unsubscribe", "data": {"wallet": wallet}}).to_string()
}

pub fn ping_frame() -> String {
    json!({"type": "ping"}).to_string()
}

/// A validated inbound transaction frame.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamTransaction {
    pub signature: String,
    pub wallet_address: String,
    pub timestamp: DateTime<Utc>,
    pub kind: TxKind,
    pub amount: f64,
    pub token_mint: String,
    pub metadata: serde_json::Map<String, Value>,
}

/// Parsed inbound frame.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Transaction(UpstreamTransaction),
    Error(Value),
    Pong,
    Unknown(String),
}

/// Parse one inbound frame.
pub fn parse_frame(text: &str) -> Result<InboundFrame, CoreError> {
    let value: Value = serde_json::from_str(text)?;
    match value.get("type").and_then(Value::as_str) {
        Some("transaction") => {
            let data = value.get("data").unwrap_or(&Value::Null);
            Ok(InboundFrame::Transaction(validate_transaction(data)?))
        }
        Some("error") => Ok(InboundFrame::Error(
            value.get("data").cloned().unwrap_or(Value::Null),
        )),
        Some("pong") => Ok(InboundFrame::Pong),
        Some(other) => Ok(InboundFrame::Unknown(other.to_string())),
        None => Err(CoreError::Validation(
            "frame is missing a type field".to_string(),
        )),
    }
}

/// Validate a transaction payload: non-empty signature/wallet/mint, numeric
/// timestamp and amount, known kind; metadata defaults to an empty map.
pub fn validate_transaction(data: &Value) -> Result<UpstreamTransaction, CoreError> {
    let signature = non_empty_str(data, "signature")?;
    let wallet_address = non_empty_str(data, "walletAddress")?;

    let raw_ts = data
        .get("timestamp")
        .and_then(Value::as_f64)
        .ok_or_else(|| CoreError::Validation("timestamp must be numeric".to_string()))?;
    let timestamp = parse_timestamp(raw_ts)?;

    let kind_raw = non_empty_str(data, "type")?;
    let kind = TxKind::parse(&kind_raw.replace('-', "_")).ok_or_else(|| {
        CoreError::Validation(format!("unknown transaction type '{}'", kind_raw))
    })?;

    let amount = data
        .get("amount")
        .and_then(Value::as_f64)
        .ok_or_else(|| CoreError::Validation("amount must be numeric".to_string()))?;

    let token_mint = non_empty_str(data, "tokenMint")?;

    let metadata = match data.get("metadata") {
        None | Some(Value::Null) => serde_json::Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return Err(CoreError::Validation(
                "metadata must be an object".to_string(),
            ))
        }
    };

    Ok(UpstreamTransaction {
        signature,
        wallet_address,
        timestamp,
        kind,
        amount,
        token_mint,
        metadata,
    })
}

fn non_empty_str(data: &Value, field: &str) -> Result<String, CoreError> {
    match data.get(field).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(CoreError::Validation(format!(
            "{} must be a non-empty string",
            field
        ))),
    }
}

/// The feed nominally sends unix seconds; tolerate millisecond stamps.
fn parse_timestamp(raw: f64) -> Result<DateTime<Utc>, CoreError> {
    let seconds = if raw > MILLIS_CUTOFF { raw / 1000.0 } else { raw };
    let secs = seconds.trunc() as i64;
    let nanos = ((seconds.fract()) * 1e9) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .ok_or_else(|| CoreError::Validation(format!("timestamp {} is out of range", raw)))
}
