//! Metadata lifting.
//!
//! The upstream feed carries a free-form metadata object. The named fields
//! the pipeline cares about are lifted out under their aliases; everything
//! else is carried through untouched on the stored row.

use serde_json::{Map, Value};

use crate::pnl::BuySide;

/// Keys consumed by the lift; they do not reappear in `rest`.
const LIFTED_KEYS: &[&str] = &[
    "counterparty",
    "to",
    "from",
    "fee",
    "feeAmount",
    "tokenSymbol",
    "symbol",
    "blockNumber",
    "slot",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMetadata {
    pub counterparty: Option<String>,
    pub fee: Option<f64>,
    pub token_symbol: Option<String>,
    pub block_number: Option<i64>,
    /// USD value of the sale side of a swap, when the feed provides one.
    pub sale_value: Option<f64>,
    /// Paired buy side of a swap.
    pub buy_side: Option<BuySide>,
    /// Remaining keys, carried through to the stored row.
    pub rest: Map<String, Value>,
}

fn first_str(raw: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| raw.get(*k).and_then(Value::as_str))
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}

fn first_f64(raw: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| {
        let value = raw.get(*k)?;
        value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
    })
}

fn first_i64(raw: &Map<String, Value>, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| {
        let value = raw.get(*k)?;
        value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
    })
}

/// Lift the named fields out of the raw metadata map.
pub fn parse_metadata(raw: &Map<String, Value>) -> ParsedMetadata {
    let counterparty = first_str(raw, &["counterparty", "to", "from"]);
    let fee = first_f64(raw, &["fee", "feeAmount"]);
    let token_symbol = first_str(raw, &["tokenSymbol", "symbol"]);
    let block_number = first_i64(raw, &["blockNumber", "slot"]);
    let sale_value = first_f64(raw, &["saleValue", "usdValue"]);

    let buy_side = match (
        first_str(raw, &["tokenIn"]),
        first_f64(raw, &["amountIn"]),
    ) {
        (Some(token_in), Some(amount_in)) if amount_in > 0.0 => Some(BuySide {
            token_in,
            amount_in,
            paid_value: first_f64(raw, &["paidValue"]).or(sale_value).unwrap_or(0.0),
        }),
        _ => None,
    };

    let rest: Map<String, Value> = raw
        .iter()
        .filter(|(k, _)| !LIFTED_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    ParsedMetadata {
        counterparty,
        fee,
        token_symbol,
        block_number,
        sale_value,
        buy_side,
        rest,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn raw(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_lifts_aliased_fields() {
        let parsed = parse_metadata(&raw(json!({
            "to": "CptyAddr",
            "feeAmount": 0.000005,
            "symbol": "SOL",
            "slot": 271_828_182,
            "memo": "hello"
        })));
        assert_eq!(parsed.counterparty.as_deref(), Some("CptyAddr"));
        assert_eq!(parsed.fee, Some(0.000005));
        assert_eq!(parsed.token_symbol.as_deref(), Some("SOL"));
        assert_eq!(parsed.block_number, Some(271_828_182));
        // Lifted keys are removed; the rest carries through
        assert_eq!(parsed.rest.len(), 1);
        assert_eq!(parsed.rest.get("memo"), Some(&json!("hello")));
    }

    #[test]
    fn test_primary_alias_wins() {
        let parsed = parse_metadata(&raw(json!({
            "counterparty": "Primary",
            "to": "Secondary",
            "fee": 1.0,
            "feeAmount": 2.0
        })));
        assert_eq!(parsed.counterparty.as_deref(), Some("Primary"));
        assert_eq!(parsed.fee, Some(1.0));
    }

    #[test]
    fn test_numeric_strings_accepted() {
        let parsed = parse_metadata(&raw(json!({
            "fee": "0.25",
            "blockNumber": "12345"
        })));
        assert_eq!(parsed.fee, Some(0.25));
        assert_eq!(parsed.block_number, Some(12345));
    }

    #[test]
    fn test_buy_side_parsed() {
        let parsed = parse_metadata(&raw(json!({
            "tokenIn": "JUPmint111",
            "amountIn": 250.0,
            "paidValue": 300.0
        })));
        assert_eq!(
            parsed.buy_side,
            Some(BuySide {
                token_in: "JUPmint111".to_string(),
                amount_in: 250.0,
                paid_value: 300.0,
            })
        );
    }

    #[test]
    fn test_buy_side_falls_back_to_sale_value() {
        let parsed = parse_metadata(&raw(json!({
            "tokenIn": "JUPmint111",
            "amountIn": 250.0,
            "usdValue": 275.0
        })));
        assert_eq!(parsed.buy_side.unwrap().paid_value, 275.0);
        assert_eq!(parsed.sale_value, Some(275.0));
    }

    #[test]
    fn test_buy_side_requires_positive_amount() {
        let parsed = parse_metadata(&raw(json!({
            "tokenIn": "JUPmint111",
            "amountIn": 0.0
        })));
        assert!(parsed.buy_side.is_none());
    }

    #[test]
    fn test_empty_metadata() {
        let parsed = parse_metadata(&Map::new());
        assert_eq!(parsed, ParsedMetadata::default());
    }
}
