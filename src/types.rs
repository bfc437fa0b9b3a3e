use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Bitcoin-style base58 alphabet; excludes the ambiguous characters 0, O, I, l.
const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Validated base58 wallet address, length 32-44.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        if !(32..=44).contains(&s.len()) {
            return Err(CoreError::Validation(format!(
                "wallet address must be 32-44 characters, got {}",
                s.len()
            )));
        }
        if let Some(c) = s.chars().find(|c| !BASE58_ALPHABET.contains(*c)) {
            return Err(CoreError::Validation(format!(
                "wallet address contains non-base58 character '{}'",
                c
            )));
        }
        // The alphabet check already rejects 0/O/I/l; decode to be sure the
        // address is well-formed base58 end to end.
        bs58::decode(s)
            .into_vec()
            .map_err(|e| CoreError::Validation(format!("invalid base58 address: {}", e)))?;
        Ok(WalletAddress(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for WalletAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        WalletAddress::parse(&s)
    }
}

impl From<WalletAddress> for String {
    fn from(addr: WalletAddress) -> String {
        addr.0
    }
}

impl FromStr for WalletAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WalletAddress::parse(s)
    }
}

/// Transaction kind as delivered by the upstream feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Transfer,
    Swap,
    Stake,
    Unstake,
    LiquidityAdd,
    LiquidityRemove,
    Vote,
    Unknown,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Transfer => "transfer",
            TxKind::Swap => "swap",
            TxKind::Stake => "stake",
            TxKind::Unstake => "unstake",
            TxKind::LiquidityAdd => "liquidity_add",
            TxKind::LiquidityRemove => "liquidity_remove",
            TxKind::Vote => "vote",
            TxKind::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transfer" => Some(TxKind::Transfer),
            "swap" => Some(TxKind::Swap),
            "stake" => Some(TxKind::Stake),
            "unstake" => Some(TxKind::Unstake),
            "liquidity_add" => Some(TxKind::LiquidityAdd),
            "liquidity_remove" => Some(TxKind::LiquidityRemove),
            "vote" => Some(TxKind::Vote),
            "unknown" => Some(TxKind::Unknown),
            _ => None,
        }
    }

    /// Signed balance delta this kind applies for a given feed amount.
    ///
    /// Transfers and swaps carry a signed amount already; staking and
    /// liquidity adds lock funds away, their counterparts release them.
    pub fn balance_delta(&self, amount: f64) -> f64 {
        match self {
            TxKind::Transfer | TxKind::Swap => amount,
            TxKind::Stake | TxKind::LiquidityAdd => -amount.abs(),
            TxKind::Unstake | TxKind::LiquidityRemove => amount.abs(),
            TxKind::Vote | TxKind::Unknown => 0.0,
        }
    }

    /// Kinds that dispose of the row's token and consume cost-basis lots.
    pub fn is_sale(&self) -> bool {
        matches!(self, TxKind::Swap | TxKind::LiquidityRemove)
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum IndexingState {
    Pending,
    Active,
    Error,
    Paused,
}

impl IndexingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexingState::Pending => "pending",
            IndexingState::Active => "active",
            IndexingState::Error => "error",
            IndexingState::Paused => "paused",
        }
    }
}

impl fmt::Display for IndexingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PnL aggregation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR")]
pub enum PnlPeriod {
    #[sqlx(rename = "24h")]
    #[serde(rename = "24h")]
    Day,
    #[sqlx(rename = "7d")]
    #[serde(rename = "7d")]
    Week,
    #[sqlx(rename = "30d")]
    #[serde(rename = "30d")]
    Month,
    #[sqlx(rename = "all")]
    #[serde(rename = "all")]
    All,
}

pub const ALL_PERIODS: [PnlPeriod; 4] = [
    PnlPeriod::Day,
    PnlPeriod::Week,
    PnlPeriod::Month,
    PnlPeriod::All,
];

impl PnlPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PnlPeriod::Day => "24h",
            PnlPeriod::Week => "7d",
            PnlPeriod::Month => "30d",
            PnlPeriod::All => "all",
        }
    }

    /// Window length; `None` means unbounded (all history).
    pub fn window(&self) -> Option<chrono::Duration> {
        match self {
            PnlPeriod::Day => Some(chrono::Duration::hours(24)),
            PnlPeriod::Week => Some(chrono::Duration::days(7)),
            PnlPeriod::Month => Some(chrono::Duration::days(30)),
            PnlPeriod::All => None,
        }
    }
}

impl fmt::Display for PnlPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anomaly severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event kinds delivered by the fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TransactionNew,
    BalanceUpdated,
    SecurityAnomaly,
    MarketOddsChanged,
    PnlUpdated,
    SystemError,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TransactionNew => "transaction_new",
            EventKind::BalanceUpdated => "balance_updated",
            EventKind::SecurityAnomaly => "security_anomaly",
            EventKind::MarketOddsChanged => "market_odds_changed",
            EventKind::PnlUpdated => "pnl_updated",
            EventKind::SystemError => "system_error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_44: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";
    const VALID_32: &str = "JUPyiwrYJFskUPiHa7hkeR8VUtAeFoSY";

    #[test]
    fn test_valid_addresses() {
        assert!(WalletAddress::parse(VALID_44).is_ok());
        assert!(WalletAddress::parse(VALID_32).is_ok());
    }

    #[test]
    fn test_length_bounds() {
        assert!(WalletAddress::parse("abc").is_err());
        let too_long = "1".repeat(45);
        assert!(WalletAddress::parse(&too_long).is_err());
        let min = "1".repeat(32);
        assert!(WalletAddress::parse(&min).is_ok());
    }

    #[test]
    fn test_rejects_ambiguous_characters() {
        // 0, O, I and l are not in the base58 alphabet
        for c in ['0', 'O', 'I', 'l'] {
            let addr = format!("{}{}", c, "1".repeat(35));
            assert!(
                WalletAddress::parse(&addr).is_err(),
                "address with '{}' should be rejected",
                c
            );
        }
    }

    #[test]
    fn test_rejects_non_base58() {
        let addr = format!("{}!", "1".repeat(35));
        assert!(WalletAddress::parse(&addr).is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let addr = WalletAddress::parse(VALID_44).unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        let back: WalletAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(addr, back);

        // Deserialization validates
        let bad: Result<WalletAddress, _> = serde_json::from_str("\"0invalid\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_kind_parse_roundtrip() {
        for kind in [
            TxKind::Transfer,
            TxKind::Swap,
            TxKind::Stake,
            TxKind::Unstake,
            TxKind::LiquidityAdd,
            TxKind::LiquidityRemove,
            TxKind::Vote,
            TxKind::Unknown,
        ] {
            assert_eq!(TxKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TxKind::parse("airdrop"), None);
    }

    #[test]
    fn test_balance_delta_mapping() {
        assert_eq!(TxKind::Transfer.balance_delta(100.0), 100.0);
        assert_eq!(TxKind::Transfer.balance_delta(-25.0), -25.0);
        assert_eq!(TxKind::Swap.balance_delta(-25.0), -25.0);
        assert_eq!(TxKind::Stake.balance_delta(50.0), -50.0);
        assert_eq!(TxKind::Stake.balance_delta(-50.0), -50.0);
        assert_eq!(TxKind::LiquidityAdd.balance_delta(10.0), -10.0);
        assert_eq!(TxKind::Unstake.balance_delta(-50.0), 50.0);
        assert_eq!(TxKind::LiquidityRemove.balance_delta(10.0), 10.0);
        assert_eq!(TxKind::Vote.balance_delta(99.0), 0.0);
        assert_eq!(TxKind::Unknown.balance_delta(99.0), 0.0);
    }

    #[test]
    fn test_sale_kinds() {
        assert!(TxKind::Swap.is_sale());
        assert!(TxKind::LiquidityRemove.is_sale());
        assert!(!TxKind::Transfer.is_sale());
        assert!(!TxKind::Stake.is_sale());
    }

    #[test]
    fn test_period_strings_and_windows() {
        assert_eq!(PnlPeriod::Day.as_str(), "24h");
        assert_eq!(PnlPeriod::Week.as_str(), "7d");
        assert_eq!(PnlPeriod::Month.as_str(), "30d");
        assert_eq!(PnlPeriod::All.as_str(), "all");
        assert_eq!(PnlPeriod::Day.window(), Some(chrono::Duration::hours(24)));
        assert_eq!(PnlPeriod::All.window(), None);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_event_kind_wire_names() {
        assert_eq!(EventKind::TransactionNew.as_str(), "transaction_new");
        assert_eq!(
            serde_json::to_string(&EventKind::PnlUpdated).unwrap(),
            "\"pnl_updated\""
        );
    }
}
