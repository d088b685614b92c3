pub mod alphavantage;
pub mod cache;
pub mod floor;
pub mod ledger;
pub mod market;
pub mod retry;
pub mod simulation;
pub mod store;

pub use alphavantage::{AlphaVantageClient, DailyCloseFetcher, DailyCloses};
pub use cache::QuoteCache;
pub use floor::{RuleTrader, Trader, TradingFloor, TurnContext};
pub use ledger::{Ledger, ManualTimeSource, SystemTimeSource, TimeSource, TraderAccount};
pub use market::{
    BoxFuture, LiveMarketData, MarketData, SimulatedMarketData, StaticMarketData,
};
pub use retry::with_retry;
pub use simulation::{CacheStatistics, HistoricalDataCache, SimulationClock};
pub use store::{AccountStore, MarketDay, MemoryStore, SqliteStore};
