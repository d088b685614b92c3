//! Tradefloor - ledger and simulation engine for a floor of autonomous traders

pub mod config;
pub mod error;
pub mod services;
pub mod types;

pub use config::Config;
pub use error::{AppError, LedgerError, Result, StoreError};
