use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

/// Ledger rules shared by every account.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Starting cash for a freshly created account.
    pub initial_balance: Decimal,
    /// Fraction added to buys and subtracted from sells (0.002 = 20 bps).
    pub spread: Decimal,
    /// Advisory minimum gap between trades on one account.
    pub min_minutes_between_trades: i64,
    /// Also reject trades inside the cooldown window, not just report it.
    pub enforce_cooldown: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            initial_balance: Decimal::new(10_000_00, 2),
            spread: Decimal::new(2, 3),
            min_minutes_between_trades: 5,
            enforce_cooldown: false,
        }
    }
}

/// Retry policy for transient persistence failures.
#[derive(Debug, Clone)]
pub struct StorePolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Historical replay settings.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub enabled: bool,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Skip weekends and fixed market holidays instead of every calendar day.
    pub trading_days_only: bool,
    /// Fill missing closes with seeded synthetic prices instead of zero.
    pub synthetic_prices: bool,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default(),
            end_date: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap_or_default(),
            trading_days_only: false,
            synthetic_prices: false,
            seed: 42,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path.
    pub database_path: String,
    /// Trader names, in registration order.
    pub trader_names: Vec<String>,
    /// Live-mode poll interval in minutes.
    pub run_every_n_minutes: u64,
    /// Run live cycles even when the market is closed.
    pub run_even_when_market_is_closed: bool,
    /// Portfolio value at or below which a trader is retired as bankrupt.
    pub bankruptcy_threshold: Decimal,
    /// Upper bound on trader turns running at once (0 = one per trader).
    pub max_concurrent_traders: usize,
    /// Failed cycles after which a trader is reported as failing.
    pub failure_report_threshold: u64,
    /// Finnhub API key for live quotes.
    pub finnhub_api_key: Option<String>,
    /// Alpha Vantage API key for historical closes.
    pub alpha_vantage_api_key: Option<String>,
    pub ledger: LedgerConfig,
    pub simulation: SimulationConfig,
    pub store: StorePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "accounts.db".to_string(),
            trader_names: default_trader_names(),
            run_every_n_minutes: 60,
            run_even_when_market_is_closed: false,
            bankruptcy_threshold: Decimal::ONE,
            max_concurrent_traders: 0,
            failure_report_threshold: 3,
            finnhub_api_key: None,
            alpha_vantage_api_key: None,
            ledger: LedgerConfig::default(),
            simulation: SimulationConfig::default(),
            store: StorePolicy::default(),
        }
    }
}

fn default_trader_names() -> Vec<String> {
    ["Warren", "George", "Ray", "Cathie"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_flag(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
}

fn parse_date(key: &str) -> Option<NaiveDate> {
    env::var(key)
        .ok()
        .and_then(|v| NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d").ok())
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        // Format: "Warren,George,Ray"
        let trader_names = env::var("TRADER_NAMES")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|names| !names.is_empty())
            .unwrap_or(defaults.trader_names);

        let ledger = LedgerConfig {
            initial_balance: parse_env("INITIAL_BALANCE")
                .unwrap_or(defaults.ledger.initial_balance),
            spread: parse_env("SPREAD").unwrap_or(defaults.ledger.spread),
            min_minutes_between_trades: parse_env("MIN_MINUTES_BETWEEN_TRADES")
                .unwrap_or(defaults.ledger.min_minutes_between_trades),
            enforce_cooldown: parse_flag("ENFORCE_TRADE_COOLDOWN")
                .unwrap_or(defaults.ledger.enforce_cooldown),
        };

        let simulation = SimulationConfig {
            enabled: parse_flag("SIMULATION_MODE").unwrap_or(defaults.simulation.enabled),
            start_date: parse_date("SIMULATION_START_DATE")
                .unwrap_or(defaults.simulation.start_date),
            end_date: parse_date("SIMULATION_END_DATE").unwrap_or(defaults.simulation.end_date),
            trading_days_only: parse_flag("SIMULATION_TRADING_DAYS_ONLY")
                .unwrap_or(defaults.simulation.trading_days_only),
            synthetic_prices: parse_flag("SIMULATION_SYNTHETIC_PRICES")
                .unwrap_or(defaults.simulation.synthetic_prices),
            seed: parse_env("SIMULATION_SEED").unwrap_or(defaults.simulation.seed),
        };

        let store = StorePolicy {
            max_retries: parse_env("STORE_MAX_RETRIES").unwrap_or(defaults.store.max_retries),
            initial_backoff: parse_env("STORE_RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.store.initial_backoff),
            max_backoff: defaults.store.max_backoff,
        };

        Self {
            database_path: env::var("DATABASE_PATH").unwrap_or(defaults.database_path),
            trader_names,
            run_every_n_minutes: parse_env("RUN_EVERY_N_MINUTES")
                .unwrap_or(defaults.run_every_n_minutes),
            run_even_when_market_is_closed: parse_flag("RUN_EVEN_WHEN_MARKET_IS_CLOSED")
                .unwrap_or(defaults.run_even_when_market_is_closed),
            bankruptcy_threshold: parse_env("BANKRUPTCY_THRESHOLD")
                .unwrap_or(defaults.bankruptcy_threshold),
            max_concurrent_traders: parse_env("MAX_CONCURRENT_TRADERS")
                .unwrap_or(defaults.max_concurrent_traders),
            failure_report_threshold: parse_env("FAILURE_REPORT_THRESHOLD")
                .unwrap_or(defaults.failure_report_threshold),
            finnhub_api_key: env::var("FINNHUB_API_KEY").ok().filter(|k| !k.is_empty()),
            alpha_vantage_api_key: env::var("ALPHA_VANTAGE_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            ledger,
            simulation,
            store,
        }
    }

    /// Reject settings no run can use.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.simulation.start_date > self.simulation.end_date {
            return Err(AppError::Config(format!(
                "simulation start {} is after end {}",
                self.simulation.start_date, self.simulation.end_date
            )));
        }
        if self.ledger.spread.is_sign_negative() {
            return Err(AppError::Config(format!(
                "spread must not be negative, got {}",
                self.ledger.spread
            )));
        }
        if self.ledger.initial_balance.is_sign_negative() {
            return Err(AppError::Config(format!(
                "initial balance must not be negative, got {}",
                self.ledger.initial_balance
            )));
        }
        if self.trader_names.is_empty() {
            return Err(AppError::Config("no traders configured".to_string()));
        }
        Ok(())
    }

    /// Live-mode sleep between cycles.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.run_every_n_minutes * 60)
    }

    /// Effective concurrency bound for a floor of `traders` traders.
    pub fn concurrency_limit(&self, traders: usize) -> usize {
        match self.max_concurrent_traders {
            0 => traders.max(1),
            n => n,
        }
    }
}
