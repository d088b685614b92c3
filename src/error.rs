use rust_decimal::Decimal;
use thiserror::Error;

/// Persistence-layer failures. Always infrastructure, never business rules.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt record for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Corrupt { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Ledger operation failures.
///
/// Business-rule variants go back to the decision maker unchanged; only
/// `StoreUnavailable` is retried (by the persistence wrapper).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: Decimal, available: Decimal },

    #[error("Cannot sell {requested} shares of {symbol}: only {held} held")]
    InsufficientHoldings {
        symbol: String,
        requested: u64,
        held: u64,
    },

    #[error("Unrecognized symbol {0}")]
    UnknownSymbol(String),

    #[error("Trade rejected during cooldown: {0}")]
    CooldownActive(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl LedgerError {
    /// Whether the decision maker caused this (and should pick another action).
    pub fn is_business_rule(&self) -> bool {
        !matches!(self, LedgerError::StoreUnavailable(_))
    }
}

impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        LedgerError::StoreUnavailable(e.to_string())
    }
}

/// Application error types.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Market data error: {0}")]
    MarketData(String),

    #[error("Trader {trader} failed: {reason}")]
    Trader { trader: String, reason: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
