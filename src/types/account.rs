//! Account ledger types.
//!
//! An [`Account`] is the full persisted snapshot of one trader's financial
//! state. It is serialized as a single JSON blob per trader.

use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Wire format for every timestamp in a snapshot.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Second-resolution point in time, serialized as `YYYY-MM-DD HH:MM:SS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(NaiveDateTime);

impl Timestamp {
    /// Truncates sub-second precision so the value survives a round trip.
    pub fn new(at: NaiveDateTime) -> Self {
        Self(at.with_nanosecond(0).unwrap_or(at))
    }

    /// Current wall-clock time (UTC).
    pub fn now() -> Self {
        Self::new(Utc::now().naive_utc())
    }

    /// Market close (16:00:00) on the given date.
    pub fn market_close(date: NaiveDate) -> Self {
        Self(date.and_hms_opt(16, 0, 0).unwrap_or_default())
    }

    /// Parse from the wire format.
    pub fn parse(s: &str) -> Result<Self, chrono::ParseError> {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).map(Self)
    }

    /// Time elapsed from `earlier` to `self` (negative if `earlier` is later).
    pub fn since(&self, earlier: Timestamp) -> Duration {
        self.0 - earlier.0
    }

    pub fn plus(&self, delta: Duration) -> Self {
        Self(self.0 + delta)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Timestamp::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Immutable record of one fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub symbol: String,
    /// Positive for a buy, negative for a sell.
    pub quantity: i64,
    /// Post-spread execution price.
    pub price: Decimal,
    pub timestamp: Timestamp,
    pub rationale: String,
}

impl Transaction {
    /// Signed cash value of the fill (`quantity * price`).
    pub fn total(&self) -> Decimal {
        Decimal::from(self.quantity) * self.price
    }

    pub fn is_buy(&self) -> bool {
        self.quantity > 0
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} shares of {} at {} each.",
            self.quantity.unsigned_abs(),
            self.symbol,
            self.price
        )
    }
}

/// Persisted per-trader snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Lower-cased trader name; also the store key.
    pub name: String,
    pub balance: Decimal,
    pub strategy: String,
    /// Symbol -> positive quantity. Zero-quantity entries are never kept.
    pub holdings: BTreeMap<String, u64>,
    pub transactions: Vec<Transaction>,
    pub portfolio_value_time_series: Vec<(Timestamp, Decimal)>,
    pub last_trade_time: Option<Timestamp>,
}

impl Account {
    /// Fresh account with the given starting cash.
    pub fn new(name: &str, initial_balance: Decimal) -> Self {
        Self {
            name: Self::key(name),
            balance: initial_balance,
            strategy: String::new(),
            holdings: BTreeMap::new(),
            transactions: Vec::new(),
            portfolio_value_time_series: Vec::new(),
            last_trade_time: None,
        }
    }

    /// Case-normalized store key for a trader name.
    pub fn key(name: &str) -> String {
        name.trim().to_lowercase()
    }

    /// Held quantity of a symbol (zero when absent).
    pub fn quantity_of(&self, symbol: &str) -> u64 {
        self.holdings.get(symbol).copied().unwrap_or(0)
    }

    /// Sum of signed transaction totals: net cash deployed into positions.
    pub fn net_invested(&self) -> Decimal {
        self.transactions.iter().map(Transaction::total).sum()
    }

    /// `portfolio_value - Σ transaction.total() - balance`.
    ///
    /// Deposits and withdrawals move `balance` and `portfolio_value` together,
    /// so they cancel out and are never counted as profit.
    pub fn profit_loss(&self, portfolio_value: Decimal) -> Decimal {
        portfolio_value - self.net_invested() - self.balance
    }

    pub fn trade_count(&self) -> usize {
        self.transactions.len()
    }
}

/// Result of `report()`: the snapshot plus computed totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountReport {
    #[serde(flatten)]
    pub account: Account,
    pub total_portfolio_value: Decimal,
    pub total_profit_loss: Decimal,
}

/// Outcome of the advisory cooldown check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeCheck {
    pub allowed: bool,
    pub reason: String,
}

impl TradeCheck {
    pub fn allowed(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// One row of the per-trader activity log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub datetime: Timestamp,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}
