//! Integration tests for the trading floor
//!
//! Tests cover:
//! - Mode alternation and cycle fan-out
//! - Per-trader failure isolation and failure reporting
//! - Bankruptcy retirement
//! - Simulation runs, ranking and determinism
//! - Live loop scheduling and shutdown

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tradefloor::config::Config;
use tradefloor::error::AppError;
use tradefloor::services::{
    AccountStore, BoxFuture, HistoricalDataCache, Ledger, MarketData, MarketDay, MemoryStore,
    RuleTrader, SimulatedMarketData, SimulationClock, StaticMarketData, Trader, TradingFloor,
    TurnContext,
};
use tradefloor::types::{CycleOutcome, TradeMode, TraderState};

fn d(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn date(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

/// What a scripted trader does on each turn.
#[derive(Clone, Copy)]
enum Behavior {
    /// Buy one AAPL share.
    BuyOne,
    /// Buy this many AAPL shares on the first cycle, then sit tight.
    Hold(u32),
    /// Withdraw every dollar.
    WithdrawAll,
    Fail,
    Panic,
    /// Sleep, tracking how many turns overlap.
    Slow,
}

struct ScriptedTrader {
    name: String,
    behavior: Behavior,
    modes: Mutex<Vec<TradeMode>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl ScriptedTrader {
    fn new(name: &str, behavior: Behavior) -> Self {
        Self::sharing(name, behavior, Arc::default(), Arc::default())
    }

    fn sharing(
        name: &str,
        behavior: Behavior,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            modes: Mutex::new(Vec::new()),
            in_flight,
            max_in_flight,
        }
    }

    fn modes(&self) -> Vec<TradeMode> {
        self.modes.lock().unwrap().clone()
    }
}

impl Trader for ScriptedTrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn strategy(&self) -> &str {
        "scripted"
    }

    fn run_turn<'a>(&'a self, ctx: &'a TurnContext) -> BoxFuture<'a, Result<(), AppError>> {
        Box::pin(async move {
            self.modes.lock().unwrap().push(ctx.mode);
            match self.behavior {
                Behavior::BuyOne => {
                    ctx.account.buy("AAPL", 1, "scripted").await?;
                }
                Behavior::Hold(quantity) => {
                    if ctx.cycle == 1 {
                        ctx.account.buy("AAPL", quantity, "scripted").await?;
                    }
                }
                Behavior::WithdrawAll => {
                    let balance = ctx.account.balance().await?;
                    if balance > Decimal::ZERO {
                        ctx.account.withdraw(balance).await?;
                    }
                }
                Behavior::Fail => {
                    return Err(AppError::Trader {
                        trader: self.name.clone(),
                        reason: "model timed out".to_string(),
                    });
                }
                Behavior::Panic => panic!("scripted panic"),
                Behavior::Slow => {
                    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            }
            Ok(())
        })
    }
}

fn static_floor(
    config: Config,
    traders: Vec<Arc<dyn Trader>>,
) -> (TradingFloor, Arc<StaticMarketData>) {
    let market = Arc::new(StaticMarketData::new().with_price("AAPL", d("100")));
    let ledger = Ledger::new(
        Arc::new(MemoryStore::new()),
        market.clone(),
        config.ledger.clone(),
    );
    (TradingFloor::new(config, ledger, traders), market)
}

// =============================================================================
// Cycles
// =============================================================================

mod cycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_modes_alternate_every_cycle() {
        let trader = Arc::new(ScriptedTrader::new("Warren", Behavior::BuyOne));
        let (floor, _) = static_floor(Config::default(), vec![trader.clone() as Arc<dyn Trader>]);

        for _ in 0..3 {
            floor.run_cycle().await;
        }
        assert_eq!(
            trader.modes(),
            vec![
                TradeMode::SeekPositions,
                TradeMode::Rebalance,
                TradeMode::SeekPositions
            ]
        );
        assert_eq!(floor.cycles_run(), 3);
    }

    #[tokio::test]
    async fn test_modes_toggle_even_after_failure() {
        let trader = Arc::new(ScriptedTrader::new("George", Behavior::Fail));
        let (floor, _) = static_floor(Config::default(), vec![trader.clone() as Arc<dyn Trader>]);

        floor.run_cycle().await;
        floor.run_cycle().await;
        assert_eq!(
            trader.modes(),
            vec![TradeMode::SeekPositions, TradeMode::Rebalance]
        );
    }

    #[tokio::test]
    async fn test_turns_run_concurrently() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));
        let traders: Vec<Arc<dyn Trader>> = ["a", "b", "c"]
            .iter()
            .map(|n| {
                Arc::new(ScriptedTrader::sharing(
                    n,
                    Behavior::Slow,
                    in_flight.clone(),
                    max.clone(),
                )) as Arc<dyn Trader>
            })
            .collect();
        let (floor, _) = static_floor(Config::default(), traders);

        floor.run_cycle().await;
        assert_eq!(max.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));
        let traders: Vec<Arc<dyn Trader>> = ["a", "b", "c"]
            .iter()
            .map(|n| {
                Arc::new(ScriptedTrader::sharing(
                    n,
                    Behavior::Slow,
                    in_flight.clone(),
                    max.clone(),
                )) as Arc<dyn Trader>
            })
            .collect();
        let config = Config {
            max_concurrent_traders: 1,
            ..Config::default()
        };
        let (floor, _) = static_floor(config, traders);

        let report = floor.run_cycle().await;
        assert_eq!(report.failures(), 0);
        assert_eq!(max.load(Ordering::SeqCst), 1);
    }
}

// =============================================================================
// Failure Isolation
// =============================================================================

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_one_failing_trader_does_not_undo_others() {
        let traders: Vec<Arc<dyn Trader>> = vec![
            Arc::new(ScriptedTrader::new("Warren", Behavior::BuyOne)),
            Arc::new(ScriptedTrader::new("George", Behavior::Fail)),
            Arc::new(ScriptedTrader::new("Ray", Behavior::Panic)),
        ];
        let (floor, _) = static_floor(Config::default(), traders);

        let report = floor.run_cycle().await;
        assert_eq!(report.failures(), 2);
        assert_eq!(report.outcomes[0].2, CycleOutcome::Completed);
        assert!(report.outcomes[1].2.is_failed());
        assert_eq!(
            report.outcomes[2].2,
            CycleOutcome::Failed("turn panicked".to_string())
        );

        let holdings = floor.ledger().holdings("warren").await.unwrap();
        assert_eq!(holdings["AAPL"], 1);

        let statuses = floor.statuses();
        assert_eq!(statuses[1].failed_cycles, 1);
        assert!(statuses[1]
            .last_error
            .as_deref()
            .unwrap()
            .contains("model timed out"));
        assert!(statuses.iter().all(|s| s.state == TraderState::Active));
    }

    #[tokio::test]
    async fn test_repeated_failures_are_reported_as_failing() {
        let traders: Vec<Arc<dyn Trader>> = vec![
            Arc::new(ScriptedTrader::new("Warren", Behavior::BuyOne)),
            Arc::new(ScriptedTrader::new("George", Behavior::Fail)),
        ];
        let (floor, _) = static_floor(Config::default(), traders);

        for _ in 0..3 {
            floor.run_cycle().await;
        }
        let results = floor.results().await.unwrap();
        let george = results.rankings.iter().find(|r| r.name == "George").unwrap();
        assert!(george.failing);
        assert!(!george.bankrupt);
        assert_eq!(george.failed_cycles, 3);

        let warren = results.rankings.iter().find(|r| r.name == "Warren").unwrap();
        assert!(!warren.failing);
        assert_eq!(warren.trade_count, 3);
        assert!(results.to_string().contains("[FAILING]"));
    }
}

// =============================================================================
// Bankruptcy
// =============================================================================

mod bankruptcy_tests {
    use super::*;

    #[tokio::test]
    async fn test_bankrupt_trader_is_retired_for_good() {
        let broke = Arc::new(ScriptedTrader::new("Cathie", Behavior::WithdrawAll));
        let steady = Arc::new(ScriptedTrader::new("Warren", Behavior::BuyOne));
        let traders: Vec<Arc<dyn Trader>> = vec![broke.clone(), steady.clone()];
        let (floor, _) = static_floor(Config::default(), traders);

        let report = floor.run_cycle().await;
        assert_eq!(report.newly_bankrupt, vec!["Cathie".to_string()]);
        assert_eq!(floor.active_count(), 1);

        // Becoming solvent again does not bring the trader back.
        floor.ledger().deposit("cathie", d("5000")).await.unwrap();
        let report = floor.run_cycle().await;
        assert!(report.newly_bankrupt.is_empty());
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(broke.modes().len(), 1);
        assert_eq!(steady.modes().len(), 2);

        let statuses = floor.statuses();
        assert_eq!(statuses[0].state, TraderState::Bankrupt);
    }

    #[tokio::test]
    async fn test_threshold_is_configurable() {
        let config = Config {
            bankruptcy_threshold: d("20000"),
            ..Config::default()
        };
        let (floor, _) = static_floor(
            config,
            vec![Arc::new(ScriptedTrader::new("Ray", Behavior::BuyOne)) as Arc<dyn Trader>],
        );

        let report = floor.run_cycle().await;
        assert_eq!(report.newly_bankrupt, vec!["Ray".to_string()]);
    }

    #[tokio::test]
    async fn test_unpriced_holding_skips_the_check() {
        let config = Config {
            bankruptcy_threshold: d("9950"),
            ..Config::default()
        };
        let (floor, market) = static_floor(
            config,
            vec![Arc::new(ScriptedTrader::new("Ray", Behavior::Hold(1))) as Arc<dyn Trader>],
        );

        let report = floor.run_cycle().await;
        assert!(report.newly_bankrupt.is_empty());

        // Cash alone (9899.80) is under the threshold, but the position is
        // unpriced rather than worthless.
        market.set_price("AAPL", Decimal::ZERO);
        let report = floor.run_cycle().await;
        assert!(report.newly_bankrupt.is_empty());
        assert_eq!(floor.active_count(), 1);
    }

    #[tokio::test]
    async fn test_simulation_ends_when_everyone_is_bankrupt() {
        let (floor, _) = static_floor(
            Config::default(),
            vec![Arc::new(ScriptedTrader::new("Cathie", Behavior::WithdrawAll)) as Arc<dyn Trader>],
        );
        let clock = Arc::new(SimulationClock::new(date(2024, 1, 1), date(2024, 1, 31), false));

        let results = floor.run_simulation(clock.clone()).await.unwrap();
        assert_eq!(results.cycles, 1);
        assert_eq!(results.bankrupt(), 1);
        assert!(!clock.is_complete());
        assert!(results.to_string().contains("Summary: 0 survived, 1 went bankrupt"));
    }
}

// =============================================================================
// Simulation
// =============================================================================

mod simulation_tests {
    use super::*;

    const CLOSES: &[(u32, &str, &str)] = &[
        (2, "100.00", "50.00"),
        (3, "104.00", "51.00"),
        (4, "108.00", "49.00"),
        (5, "103.00", "53.00"),
        (8, "99.00", "55.00"),
        (9, "101.00", "58.00"),
        (10, "106.00", "57.00"),
    ];

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for (day, aapl, xyz) in CLOSES {
            let mut prices = MarketDay::new();
            prices.insert("AAPL".to_string(), d(aapl));
            prices.insert("XYZ".to_string(), d(xyz));
            store.write_market(date(2024, 1, *day), &prices).unwrap();
        }
        store
    }

    async fn simulate(store: Arc<MemoryStore>) -> (String, String, String) {
        let config = Config::default();
        let clock = Arc::new(SimulationClock::new(date(2024, 1, 1), date(2024, 1, 10), true));
        let history = Arc::new(HistoricalDataCache::new(
            date(2024, 1, 1),
            date(2024, 1, 10),
            store.clone(),
        ));
        let market = Arc::new(SimulatedMarketData::new(clock.clone(), history));
        let ledger = Ledger::new(store.clone(), market, config.ledger.clone())
            .with_time_source(clock.clone());

        let traders: Vec<Arc<dyn Trader>> = vec![
            Arc::new(RuleTrader::new("Warren", "momentum", &["AAPL", "XYZ"])),
            Arc::new(
                RuleTrader::new("George", "aggressive momentum", &["XYZ"])
                    .with_position_fraction(d("0.5")),
            ),
        ];
        let floor = TradingFloor::new(config, ledger, traders);
        floor.reset_accounts().await.unwrap();

        let results = floor.run_simulation(clock).await.unwrap();
        (
            store.raw_account("warren").unwrap(),
            store.raw_account("george").unwrap(),
            results.to_string(),
        )
    }

    #[tokio::test]
    async fn test_replay_is_deterministic() {
        let first = simulate(seeded_store()).await;
        let second = simulate(seeded_store()).await;
        assert_eq!(first, second);
        assert!(first.2.starts_with("FINAL RESULTS (7 cycles)"));
    }

    #[tokio::test]
    async fn test_replay_trades_and_ranks() {
        let store = seeded_store();
        let (warren, _, table) = simulate(store.clone()).await;

        let account: serde_json::Value = serde_json::from_str(&warren).unwrap();
        let transactions = account["transactions"].as_array().unwrap();
        assert!(!transactions.is_empty());
        for tx in transactions {
            assert!(tx["timestamp"].as_str().unwrap().ends_with("16:00:00"));
        }
        assert!(table.contains("1. "));
        assert!(table.contains("2. "));
    }

    fn closes_store(closes: &[(NaiveDate, &str)]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for (day, close) in closes {
            let mut prices = MarketDay::new();
            prices.insert("AAPL".to_string(), d(close));
            store.write_market(*day, &prices).unwrap();
        }
        store
    }

    fn replay_floor(
        config: Config,
        store: Arc<MemoryStore>,
        trader: ScriptedTrader,
    ) -> (TradingFloor, Arc<SimulationClock>) {
        let sim = &config.simulation;
        let clock = Arc::new(SimulationClock::new(
            sim.start_date,
            sim.end_date,
            sim.trading_days_only,
        ));
        let history = Arc::new(HistoricalDataCache::new(
            sim.start_date,
            sim.end_date,
            store.clone(),
        ));
        let market = Arc::new(SimulatedMarketData::new(clock.clone(), history));
        let ledger = Ledger::new(store, market, config.ledger.clone())
            .with_time_source(clock.clone());
        let traders = vec![Arc::new(trader) as Arc<dyn Trader>];
        (TradingFloor::new(config, ledger, traders), clock)
    }

    #[tokio::test]
    async fn test_calendar_days_hold_positions_over_the_weekend() {
        // Closes exist for Friday and Monday only.
        let store = closes_store(&[(date(2024, 1, 5), "10.00"), (date(2024, 1, 8), "10.00")]);
        let mut config = Config::default();
        config.simulation.start_date = date(2024, 1, 5);
        config.simulation.end_date = date(2024, 1, 8);
        assert!(!config.simulation.trading_days_only);

        let (floor, clock) = replay_floor(
            config,
            store,
            ScriptedTrader::new("Cathie", Behavior::Hold(998)),
        );
        let results = floor.run_simulation(clock).await.unwrap();

        assert_eq!(results.cycles, 4);
        assert_eq!(results.bankrupt(), 0);
        let cathie = &results.rankings[0];
        // 0.04 cash + 998 * 10.00
        assert_eq!(cathie.final_portfolio_value, d("9980.04"));
        assert_eq!(cathie.profit_loss, d("-19.96"));
        assert_eq!(cathie.roi_percent, d("-0.1996"));
    }

    #[tokio::test]
    async fn test_final_table_marks_positions_at_last_close() {
        let store = closes_store(&[(date(2024, 1, 2), "100.00"), (date(2024, 1, 3), "100.00")]);
        let mut config = Config::default();
        config.simulation.start_date = date(2024, 1, 2);
        config.simulation.end_date = date(2024, 1, 3);
        config.simulation.trading_days_only = true;

        let (floor, clock) = replay_floor(
            config,
            store,
            ScriptedTrader::new("Warren", Behavior::Hold(10)),
        );
        let results = floor.run_simulation(clock.clone()).await.unwrap();
        assert!(clock.is_complete());

        let warren = &results.rankings[0];
        assert_eq!(warren.final_portfolio_value, d("9998.00"));
        assert_eq!(warren.profit_loss, d("-2.00"));
        assert_eq!(warren.roi_percent, d("-0.02"));
        assert_eq!(warren.trade_count, 1);
        assert!(results.to_string().contains("Final Portfolio Value: $9998.00"));
    }

    #[tokio::test]
    async fn test_results_rank_by_roi() {
        let traders: Vec<Arc<dyn Trader>> = vec![
            Arc::new(ScriptedTrader::new("Loser", Behavior::BuyOne)),
            Arc::new(ScriptedTrader::new("Idle", Behavior::Slow)),
        ];
        let (floor, market) = static_floor(Config::default(), traders);
        floor.run_cycle().await;
        market.set_price("AAPL", d("50"));

        let results = floor.results().await.unwrap();
        assert_eq!(results.rankings[0].name, "Idle");
        assert_eq!(results.rankings[0].roi_percent, Decimal::ZERO);
        assert_eq!(results.rankings[1].name, "Loser");
        // 50 - 100.20 on one share
        assert_eq!(results.rankings[1].profit_loss, d("-50.20"));
        assert_eq!(results.rankings[1].roi_percent, d("-0.502"));
    }
}

// =============================================================================
// Live Loop
// =============================================================================

mod live_tests {
    use super::*;

    async fn wait_for_cycles(floor: &TradingFloor, n: u64) {
        for _ in 0..200 {
            if floor.cycles_run() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_stop_interrupts_the_poll_sleep() {
        let config = Config {
            run_even_when_market_is_closed: true,
            ..Config::default()
        };
        let (floor, market) = static_floor(
            config,
            vec![Arc::new(ScriptedTrader::new("Warren", Behavior::BuyOne)) as Arc<dyn Trader>],
        );
        market.set_market_open(false);
        let floor = Arc::new(floor);

        let runner = {
            let floor = floor.clone();
            tokio::spawn(async move { floor.run_live().await })
        };
        wait_for_cycles(&floor, 1).await;
        floor.stop();

        let results = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("live loop did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(results.cycles, 1);
        assert_eq!(results.rankings[0].trade_count, 1);
    }

    #[tokio::test]
    async fn test_closed_market_skips_cycles() {
        let (floor, market) = static_floor(
            Config::default(),
            vec![Arc::new(ScriptedTrader::new("Warren", Behavior::BuyOne)) as Arc<dyn Trader>],
        );
        market.set_market_open(false);
        let floor = Arc::new(floor);

        let runner = {
            let floor = floor.clone();
            tokio::spawn(async move { floor.run_live().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        floor.stop();

        let results = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("live loop did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(results.cycles, 0);
        assert!(!market.is_market_open().await);
    }
}
