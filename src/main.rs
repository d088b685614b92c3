use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tradefloor::config::Config;
use tradefloor::services::{
    AccountStore, AlphaVantageClient, HistoricalDataCache, Ledger, LiveMarketData, RuleTrader,
    SimulatedMarketData, SimulationClock, SqliteStore, Trader, TradingFloor,
};

/// Symbols the demo traders watch.
const WATCHLIST: &[&str] = &["AAPL", "MSFT", "NVDA", "AMZN", "GOOGL", "META", "TSLA", "SPY"];

fn strategy_for(name: &str) -> &'static str {
    match name.to_lowercase().as_str() {
        "warren" => "Value investing: buy durable businesses on strength and hold them.",
        "george" => "Macro: ride trends and cut losers quickly.",
        "ray" => "Risk parity: small, balanced positions across the watchlist.",
        "cathie" => "Innovation: concentrate in high-growth technology names.",
        _ => "Momentum: buy what is rising, sell what is falling.",
    }
}

fn build_traders(config: &Config) -> Vec<Arc<dyn Trader>> {
    config
        .trader_names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            // Each trader watches a different rotation of the list.
            let mut watchlist: Vec<&str> = WATCHLIST.to_vec();
            watchlist.rotate_left(i % WATCHLIST.len());
            watchlist.truncate(5);
            Arc::new(RuleTrader::new(name, strategy_for(name), &watchlist)) as Arc<dyn Trader>
        })
        .collect()
}

fn stop_on_ctrl_c(floor: Arc<TradingFloor>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, finishing the current cycle");
            floor.stop();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradefloor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    config.validate()?;
    info!(
        "Starting trading floor with {} traders ({})",
        config.trader_names.len(),
        if config.simulation.enabled { "simulation" } else { "live" }
    );

    let store: Arc<dyn AccountStore> = Arc::new(SqliteStore::new(&config.database_path)?);
    let traders = build_traders(&config);

    let results = if config.simulation.enabled {
        let sim = &config.simulation;
        let clock = Arc::new(SimulationClock::new(
            sim.start_date,
            sim.end_date,
            sim.trading_days_only,
        ));

        let mut history = HistoricalDataCache::new(sim.start_date, sim.end_date, store.clone())
            .with_store_policy(config.store.clone());
        if let Some(key) = &config.alpha_vantage_api_key {
            history = history.with_fetcher(Arc::new(AlphaVantageClient::new(key.clone())));
        }
        if sim.synthetic_prices {
            history = history.with_synthetic_prices(sim.seed);
        }
        let history = Arc::new(history);
        history.preload(WATCHLIST).await;

        let market = Arc::new(SimulatedMarketData::new(clock.clone(), history.clone()));
        let ledger = Ledger::new(store, market, config.ledger.clone())
            .with_time_source(clock.clone())
            .with_store_policy(config.store.clone());

        let floor = Arc::new(TradingFloor::new(config.clone(), ledger, traders));
        floor.reset_accounts().await?;
        stop_on_ctrl_c(floor.clone());

        let results = floor.run_simulation(clock).await?;
        let stats = history.statistics();
        info!(
            "Price cache: {} entries, {} hits, {} misses, {} fetches ({:.1}% hit rate)",
            stats.entries,
            stats.hits,
            stats.misses,
            stats.fetches,
            stats.hit_rate * 100.0
        );
        results
    } else {
        let market = Arc::new(LiveMarketData::new(config.finnhub_api_key.clone()));
        let ledger = Ledger::new(store, market, config.ledger.clone())
            .with_store_policy(config.store.clone());

        let floor = Arc::new(TradingFloor::new(config.clone(), ledger, traders));
        floor.seed_strategies().await?;
        stop_on_ctrl_c(floor.clone());

        floor.run_live().await?
    };

    println!("{}", results);
    Ok(())
}
