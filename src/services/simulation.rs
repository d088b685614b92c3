//! Historical replay: a date clock and a memoized close-price cache.

use crate::config::StorePolicy;
use crate::services::alphavantage::DailyCloseFetcher;
use crate::services::ledger::TimeSource;
use crate::services::retry::with_retry;
use crate::services::store::AccountStore;
use crate::types::Timestamp;
use chrono::{Datelike, NaiveDate, Weekday};
use dashmap::{DashMap, DashSet};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Fixed-date US market holidays (month, day).
const FIXED_HOLIDAYS: &[(u32, u32)] = &[(1, 1), (6, 19), (7, 4), (12, 25)];

/// How far back a close is carried over days without one.
const CARRY_FORWARD_DAYS: u32 = 7;

/// Weekday that is not a fixed holiday.
pub fn is_trading_day(date: NaiveDate) -> bool {
    if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    !FIXED_HOLIDAYS.contains(&(date.month(), date.day()))
}

/// Steps through simulated dates from `start` to `end` inclusive.
///
/// Shared between the floor (which advances it) and the simulated market and
/// ledger (which read it), so the current date sits behind a lock.
#[derive(Debug)]
pub struct SimulationClock {
    start: NaiveDate,
    end: NaiveDate,
    trading_days_only: bool,
    current: RwLock<NaiveDate>,
}

impl SimulationClock {
    pub fn new(start: NaiveDate, end: NaiveDate, trading_days_only: bool) -> Self {
        let clock = Self {
            start,
            end,
            trading_days_only,
            current: RwLock::new(start),
        };
        if trading_days_only && !is_trading_day(start) {
            let first = clock.next_after(start);
            clock.set_current(first);
        }
        clock
    }

    fn includes(&self, date: NaiveDate) -> bool {
        !self.trading_days_only || is_trading_day(date)
    }

    fn next_after(&self, date: NaiveDate) -> NaiveDate {
        let mut next = date;
        loop {
            next = match next.succ_opt() {
                Some(d) => d,
                None => return NaiveDate::MAX,
            };
            if next > self.end || self.includes(next) {
                return next;
            }
        }
    }

    fn set_current(&self, date: NaiveDate) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = date;
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start
    }

    pub fn end_date(&self) -> NaiveDate {
        self.end
    }

    pub fn current_date(&self) -> NaiveDate {
        *self.current.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Simulated date at market close.
    pub fn current_datetime(&self) -> Timestamp {
        Timestamp::market_close(self.current_date())
    }

    pub fn is_complete(&self) -> bool {
        self.current_date() > self.end
    }

    /// Move to the next simulated day. No-op once complete.
    pub fn advance(&self) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if *current > self.end {
            return;
        }
        *current = self.next_after(*current);
    }

    /// Number of days the clock will visit.
    pub fn trading_days_count(&self) -> usize {
        self.start
            .iter_days()
            .take_while(|d| *d <= self.end)
            .filter(|d| self.includes(*d))
            .count()
    }
}

impl TimeSource for SimulationClock {
    fn now(&self) -> Timestamp {
        self.current_datetime()
    }
}

/// Deterministic price in [50, 200] for a missing close.
pub fn synthetic_price(seed: u64, symbol: &str, date: NaiveDate) -> Decimal {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(symbol.as_bytes());
    hasher.update(date.format("%Y-%m-%d").to_string().as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();

    let mut rng = StdRng::from_seed(digest);
    Decimal::from(rng.gen_range(50u32..=200))
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatistics {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub hit_rate: f64,
}

/// Memoized close prices keyed by `(symbol, date)`.
///
/// Lookup order: memo, store `market` table, fetcher (whose closes are
/// persisted), the latest close of the previous week, synthetic fallback.
/// Without any of these a missing price is zero.
pub struct HistoricalDataCache {
    start: NaiveDate,
    end: NaiveDate,
    store: Arc<dyn AccountStore>,
    policy: StorePolicy,
    fetcher: Option<Arc<dyn DailyCloseFetcher>>,
    synthetic_seed: Option<u64>,
    memo: DashMap<(String, NaiveDate), Decimal>,
    fetched: DashSet<String>,
    fetch_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
}

impl HistoricalDataCache {
    pub fn new(start: NaiveDate, end: NaiveDate, store: Arc<dyn AccountStore>) -> Self {
        Self {
            start,
            end,
            store,
            policy: StorePolicy::default(),
            fetcher: None,
            synthetic_seed: None,
            memo: DashMap::new(),
            fetched: DashSet::new(),
            fetch_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn DailyCloseFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_synthetic_prices(mut self, seed: u64) -> Self {
        self.synthetic_seed = Some(seed);
        self
    }

    pub fn with_store_policy(mut self, policy: StorePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Close for `symbol` on `date`, or zero when unknown.
    pub async fn price(&self, symbol: &str, date: NaiveDate) -> Decimal {
        let symbol = symbol.trim().to_uppercase();
        let key = (symbol.clone(), date);

        if let Some(price) = self.memo.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return *price.value();
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        if let Some(price) = self.load_from_store(&symbol, date).await {
            self.memo.insert(key, price);
            return price;
        }

        if self.fetch_symbol(&symbol).await {
            if let Some(price) = self.memo.get(&key) {
                return *price.value();
            }
        }

        if let Some(price) = self.carry_forward(&symbol, date).await {
            debug!("Carrying {} close {} forward to {}", symbol, price, date);
            self.memo.insert(key, price);
            return price;
        }

        // Not memoized, so a later carry-forward never picks one up.
        if let Some(seed) = self.synthetic_seed {
            let price = synthetic_price(seed, &symbol, date);
            debug!("Synthetic close for {} on {}: {}", symbol, date, price);
            return price;
        }

        Decimal::ZERO
    }

    /// Most recent real close before `date`, looking back at most
    /// `CARRY_FORWARD_DAYS` and never before the range start.
    async fn carry_forward(&self, symbol: &str, date: NaiveDate) -> Option<Decimal> {
        let mut day = date;
        for _ in 0..CARRY_FORWARD_DAYS {
            day = day.pred_opt()?;
            if day < self.start {
                return None;
            }
            if let Some(price) = self.memo.get(&(symbol.to_string(), day)) {
                return Some(*price.value());
            }
            if let Some(price) = self.load_from_store(symbol, day).await {
                return Some(price);
            }
        }
        None
    }

    async fn load_from_store(&self, symbol: &str, date: NaiveDate) -> Option<Decimal> {
        let day = match with_retry(&self.policy, "read market", || self.store.read_market(date)).await
        {
            Ok(day) => day?,
            Err(e) => {
                warn!("Market data for {} unavailable: {}", date, e);
                return None;
            }
        };

        // Memoize the whole day while we have it.
        for (s, p) in &day {
            self.memo.entry((s.clone(), date)).or_insert(*p);
        }
        day.get(symbol).copied()
    }

    /// Fetch and persist a symbol's history once. Returns whether anything new was loaded.
    async fn fetch_symbol(&self, symbol: &str) -> bool {
        let Some(fetcher) = self.fetcher.as_ref() else {
            return false;
        };

        let _guard = self.fetch_lock.lock().await;
        if !self.fetched.insert(symbol.to_string()) {
            return false;
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let closes = match fetcher.daily_closes(symbol).await {
            Ok(closes) => closes,
            Err(e) => {
                warn!("Failed to fetch history for {}: {}", symbol, e);
                return false;
            }
        };

        let mut stored = 0usize;
        for (date, close) in closes.range(self.start..=self.end) {
            self.memo.insert((symbol.to_string(), *date), *close);

            let persisted = with_retry(&self.policy, "write market", || {
                let mut day = self.store.read_market(*date)?.unwrap_or_default();
                day.insert(symbol.to_string(), *close);
                self.store.write_market(*date, &day)
            })
            .await;
            match persisted {
                Ok(()) => stored += 1,
                Err(e) => warn!("Could not persist {} close for {}: {}", symbol, date, e),
            }
        }

        info!("Loaded {} daily closes for {}", stored, symbol);
        true
    }

    /// Warm the memo for `symbols` across the whole range. Returns entries cached.
    pub async fn preload(&self, symbols: &[&str]) -> usize {
        let wanted: Vec<String> = symbols.iter().map(|s| s.trim().to_uppercase()).collect();

        let mut date = self.start;
        while date <= self.end {
            match with_retry(&self.policy, "read market", || self.store.read_market(date)).await {
                Ok(Some(day)) => {
                    for symbol in &wanted {
                        if let Some(price) = day.get(symbol) {
                            self.memo.insert((symbol.clone(), date), *price);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Market data for {} unavailable: {}", date, e),
            }
            date = match date.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }

        for symbol in &wanted {
            let known = self.memo.iter().any(|entry| &entry.key().0 == symbol);
            if !known {
                self.fetch_symbol(symbol).await;
            }
        }

        let loaded = self.memo.len();
        info!("Preloaded {} cached closes for {} symbols", loaded, wanted.len());
        loaded
    }

    pub fn statistics(&self) -> CacheStatistics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStatistics {
            entries: self.memo.len(),
            hits,
            misses,
            fetches: self.fetches.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::{MarketDay, MemoryStore};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_clock_steps_calendar_days() {
        let clock = SimulationClock::new(date(2024, 1, 5), date(2024, 1, 7), false);
        assert_eq!(clock.trading_days_count(), 3);

        let mut seen = Vec::new();
        while !clock.is_complete() {
            seen.push(clock.current_date());
            clock.advance();
        }
        assert_eq!(seen, vec![date(2024, 1, 5), date(2024, 1, 6), date(2024, 1, 7)]);

        clock.advance();
        assert!(clock.is_complete());
        assert_eq!(clock.current_date(), date(2024, 1, 8));
    }

    #[test]
    fn test_clock_trading_days_only() {
        // Mon 2024-01-01 is a holiday; Sat/Sun 6-7 are skipped.
        let clock = SimulationClock::new(date(2024, 1, 1), date(2024, 1, 8), true);
        assert_eq!(clock.current_date(), date(2024, 1, 2));
        assert_eq!(clock.trading_days_count(), 5);

        let mut days = 0;
        while !clock.is_complete() {
            assert!(is_trading_day(clock.current_date()));
            days += 1;
            clock.advance();
        }
        assert_eq!(days, 5);
    }

    #[test]
    fn test_clock_single_day_and_datetime() {
        let clock = SimulationClock::new(date(2024, 3, 5), date(2024, 3, 5), false);
        assert_eq!(clock.current_datetime().to_string(), "2024-03-05 16:00:00");
        assert_eq!(clock.now(), clock.current_datetime());
        clock.advance();
        assert!(clock.is_complete());
    }

    #[test]
    fn test_synthetic_price_is_deterministic() {
        let a = synthetic_price(42, "AAPL", date(2024, 1, 2));
        let b = synthetic_price(42, "AAPL", date(2024, 1, 2));
        assert_eq!(a, b);
        assert!(a >= Decimal::from(50) && a <= Decimal::from(200));
    }

    #[tokio::test]
    async fn test_cache_reads_store_then_memoizes() {
        let store = Arc::new(MemoryStore::new());
        let mut day = MarketDay::new();
        day.insert("AAPL".to_string(), Decimal::from(100));
        store.write_market(date(2024, 1, 2), &day).unwrap();

        let cache = HistoricalDataCache::new(date(2024, 1, 1), date(2024, 1, 31), store);
        assert_eq!(cache.price("aapl", date(2024, 1, 2)).await, Decimal::from(100));
        assert_eq!(cache.price("AAPL", date(2024, 1, 2)).await, Decimal::from(100));

        let stats = cache.statistics();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_cache_missing_price_is_zero() {
        let store = Arc::new(MemoryStore::new());
        let cache = HistoricalDataCache::new(date(2024, 1, 1), date(2024, 1, 31), store);
        assert_eq!(cache.price("ZZZZ", date(2024, 1, 2)).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_cache_carries_last_close_over_gaps() {
        let store = Arc::new(MemoryStore::new());
        let mut friday = MarketDay::new();
        friday.insert("AAPL".to_string(), Decimal::from(100));
        store.write_market(date(2024, 1, 5), &friday).unwrap();

        let cache = HistoricalDataCache::new(date(2024, 1, 1), date(2024, 1, 8), store.clone());
        // Weekend, a Monday with no row, and the day after the range.
        for day in [6, 7, 8, 9] {
            assert_eq!(cache.price("AAPL", date(2024, 1, day)).await, Decimal::from(100));
        }
        // Nothing earlier to carry.
        assert_eq!(cache.price("AAPL", date(2024, 1, 4)).await, Decimal::ZERO);

        let cold = HistoricalDataCache::new(date(2024, 1, 1), date(2024, 1, 31), store);
        assert_eq!(cold.price("AAPL", date(2024, 1, 13)).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_cache_synthetic_fallback() {
        let store = Arc::new(MemoryStore::new());
        let cache = HistoricalDataCache::new(date(2024, 1, 1), date(2024, 1, 31), store)
            .with_synthetic_prices(7);
        let price = cache.price("MSFT", date(2024, 1, 2)).await;
        assert_eq!(price, synthetic_price(7, "MSFT", date(2024, 1, 2)));
    }
}
