//! Market data providers.
//!
//! `price(symbol)` returns a `Decimal` where zero means "unknown symbol"; the
//! ledger turns that into `UnknownSymbol`. Providers never return errors.

use crate::services::cache::QuoteCache;
use crate::services::simulation::{HistoricalDataCache, SimulationClock};
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use dashmap::DashMap;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const FINNHUB_URL: &str = "https://finnhub.io/api/v1";
const QUOTE_TTL: Duration = Duration::from_secs(60);

/// Boxed future returned by the object-safe async traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Price source consumed by the ledger.
pub trait MarketData: Send + Sync {
    /// Latest quote for `symbol`, or zero when the symbol is unknown.
    fn price<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, Decimal>;

    /// Whether a live cycle should run now.
    fn is_market_open(&self) -> BoxFuture<'_, bool>;
}

/// Finnhub quote response (only the fields we use).
#[derive(Debug, Clone, Deserialize)]
struct FinnhubQuote {
    /// Current price
    #[serde(rename = "c")]
    current: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinnhubMarketStatus {
    is_open: bool,
}

/// Regular US session in UTC, ignoring daylight saving and holidays.
pub fn regular_session_open(at: DateTime<Utc>) -> bool {
    if matches!(at.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let minute_of_day = at.hour() * 60 + at.minute();
    (14 * 60 + 30..21 * 60).contains(&minute_of_day)
}

/// Live quotes from Finnhub, cached for a short TTL.
///
/// When a refresh fails the last good quote for the symbol is served instead,
/// so a provider hiccup does not mark a held position to zero.
pub struct LiveMarketData {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    quotes: QuoteCache<Decimal>,
    last_good: DashMap<String, Decimal>,
}

impl LiveMarketData {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: FINNHUB_URL.to_string(),
            quotes: QuoteCache::new(QUOTE_TTL),
            last_good: DashMap::new(),
        }
    }

    pub fn with_quote_ttl(mut self, ttl: Duration) -> Self {
        self.quotes = QuoteCache::new(ttl);
        self
    }

    /// Point the client at a different Finnhub-compatible host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get_quote(&self, symbol: &str, api_key: &str) -> Result<Decimal, String> {
        let url = format!("{}/quote?symbol={}&token={}", self.base_url, symbol, api_key);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("API error: {}", response.status()));
        }

        let quote = response
            .json::<FinnhubQuote>()
            .await
            .map_err(|e| format!("Parse error: {}", e))?;

        Decimal::try_from(quote.current)
            .map(|p| p.round_dp(4))
            .map_err(|e| format!("Bad price {}: {}", quote.current, e))
    }

    async fn get_market_status(&self, api_key: &str) -> Result<bool, String> {
        let url = format!("{}/stock/market-status?exchange=US&token={}", self.base_url, api_key);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("API error: {}", response.status()));
        }

        response
            .json::<FinnhubMarketStatus>()
            .await
            .map(|s| s.is_open)
            .map_err(|e| format!("Parse error: {}", e))
    }

    async fn lookup(&self, symbol: &str) -> Decimal {
        let symbol = symbol.trim().to_uppercase();
        if let Some(price) = self.quotes.get(&symbol) {
            debug!("Quote cache hit for {}", symbol);
            return price;
        }
        self.quotes.cleanup();

        let Some(api_key) = self.api_key.as_deref() else {
            warn!("No FINNHUB_API_KEY configured; {} priced at 0", symbol);
            return Decimal::ZERO;
        };

        match self.get_quote(&symbol, api_key).await {
            Ok(price) if price > Decimal::ZERO => {
                self.quotes.set(&symbol, price);
                self.last_good.insert(symbol, price);
                price
            }
            Ok(_) => self.fallback(&symbol, "provider returned no price"),
            Err(e) => self.fallback(&symbol, &e),
        }
    }

    fn fallback(&self, symbol: &str, reason: &str) -> Decimal {
        match self.last_good.get(symbol) {
            Some(price) => {
                warn!(
                    "Quote for {} unavailable ({}), using last good {}",
                    symbol,
                    reason,
                    *price.value()
                );
                *price.value()
            }
            None => {
                warn!("Failed to fetch quote for {}: {}", symbol, reason);
                Decimal::ZERO
            }
        }
    }
}

impl MarketData for LiveMarketData {
    fn price<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, Decimal> {
        Box::pin(self.lookup(symbol))
    }

    fn is_market_open(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            if let Some(api_key) = self.api_key.as_deref() {
                match self.get_market_status(api_key).await {
                    Ok(open) => return open,
                    Err(e) => warn!("Market status check failed, using session hours: {}", e),
                }
            }
            regular_session_open(Utc::now())
        })
    }
}

/// Fixed quote table for offline runs and tests.
#[derive(Default)]
pub struct StaticMarketData {
    prices: DashMap<String, Decimal>,
    closed: AtomicBool,
}

impl StaticMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(self, symbol: &str, price: Decimal) -> Self {
        self.set_price(symbol, price);
        self
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.insert(symbol.trim().to_uppercase(), price);
    }

    pub fn set_market_open(&self, open: bool) {
        self.closed.store(!open, Ordering::SeqCst);
    }
}

impl MarketData for StaticMarketData {
    fn price<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, Decimal> {
        let price = self
            .prices
            .get(&symbol.trim().to_uppercase())
            .map(|p| *p.value())
            .unwrap_or(Decimal::ZERO);
        Box::pin(async move { price })
    }

    fn is_market_open(&self) -> BoxFuture<'_, bool> {
        let open = !self.closed.load(Ordering::SeqCst);
        Box::pin(async move { open })
    }
}

/// Close prices for the clock's current simulated date.
pub struct SimulatedMarketData {
    clock: Arc<SimulationClock>,
    history: Arc<HistoricalDataCache>,
}

impl SimulatedMarketData {
    pub fn new(clock: Arc<SimulationClock>, history: Arc<HistoricalDataCache>) -> Self {
        Self { clock, history }
    }
}

impl MarketData for SimulatedMarketData {
    fn price<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, Decimal> {
        Box::pin(async move { self.history.price(symbol, self.clock.current_date()).await })
    }

    // Every simulated day is a session.
    fn is_market_open(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { !self.clock.is_complete() })
    }
}
