//! Trading Floor Runner
//!
//! Fans each cycle out to every active trader, records per-trader outcomes,
//! retires bankrupt traders and produces the ranked results.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures_util::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::services::ledger::Ledger;
use crate::services::simulation::SimulationClock;
use crate::types::{
    CycleOutcome, CycleReport, FloorResults, TradeMode, TraderResult, TraderState, TraderStatus,
};

use super::{Trader, TurnContext};

/// Orchestrates traders over the shared ledger.
pub struct TradingFloor {
    config: Config,
    ledger: Ledger,
    /// Registration order; `statuses` is index-aligned.
    traders: Vec<Arc<dyn Trader>>,
    statuses: RwLock<Vec<TraderStatus>>,
    cycles: AtomicU64,
    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
    stop_requested: AtomicBool,
}

impl TradingFloor {
    pub fn new(config: Config, ledger: Ledger, traders: Vec<Arc<dyn Trader>>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let statuses = traders.iter().map(|t| TraderStatus::new(t.name())).collect();

        Self {
            config,
            ledger,
            traders,
            statuses: RwLock::new(statuses),
            cycles: AtomicU64::new(0),
            shutdown_tx,
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn trader_count(&self) -> usize {
        self.traders.len()
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    pub fn statuses(&self) -> Vec<TraderStatus> {
        self.statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn active_count(&self) -> usize {
        self.statuses().iter().filter(|s| s.is_active()).count()
    }

    fn is_stopped(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Stop after the cycle in progress (if any) finishes.
    pub fn stop(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        info!("Trading floor stop requested");
    }

    /// Reset every trader's account to the starting balance and its strategy.
    pub async fn reset_accounts(&self) -> Result<(), AppError> {
        for trader in &self.traders {
            self.ledger.reset(trader.name(), trader.strategy()).await?;
        }
        Ok(())
    }

    /// Give accounts that have no strategy yet their trader's strategy.
    pub async fn seed_strategies(&self) -> Result<(), AppError> {
        for trader in &self.traders {
            if self.ledger.get_strategy(trader.name()).await?.is_empty() {
                self.ledger
                    .change_strategy(trader.name(), trader.strategy())
                    .await?;
            }
        }
        Ok(())
    }

    /// Run one turn for every active trader concurrently, then check for bankruptcy.
    pub async fn run_cycle(&self) -> CycleReport {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;

        let scheduled: Vec<(usize, TradeMode)> = self
            .statuses()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_active())
            .map(|(i, s)| (i, s.next_mode))
            .collect();

        let permits = Arc::new(Semaphore::new(
            self.config.concurrency_limit(scheduled.len()),
        ));

        let handles = scheduled.iter().map(|&(index, mode)| {
            let trader = self.traders[index].clone();
            let permits = permits.clone();
            let ctx = TurnContext {
                mode,
                cycle,
                account: self.ledger.trader(trader.name()),
            };
            tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.map_err(|e| AppError::Trader {
                    trader: trader.name().to_string(),
                    reason: e.to_string(),
                })?;
                trader.run_turn(&ctx).await
            })
        });
        let joined = join_all(handles).await;

        let mut outcomes = Vec::with_capacity(scheduled.len());
        {
            let mut statuses = self.statuses.write().unwrap_or_else(|e| e.into_inner());
            for ((index, mode), result) in scheduled.into_iter().zip(joined) {
                let outcome = match result {
                    Ok(Ok(())) => CycleOutcome::Completed,
                    Ok(Err(e)) => CycleOutcome::Failed(e.to_string()),
                    Err(e) if e.is_panic() => CycleOutcome::Failed("turn panicked".to_string()),
                    Err(e) => CycleOutcome::Failed(e.to_string()),
                };

                let status = &mut statuses[index];
                status.turns_run += 1;
                status.next_mode = mode.toggled();
                match &outcome {
                    CycleOutcome::Completed => status.consecutive_failures = 0,
                    CycleOutcome::Failed(reason) => {
                        error!(
                            "{} failed while {} in cycle {}: {}",
                            status.name,
                            mode.label(),
                            cycle,
                            reason
                        );
                        status.failed_cycles += 1;
                        status.consecutive_failures += 1;
                        status.last_error = Some(reason.clone());
                    }
                }
                outcomes.push((status.name.clone(), mode, outcome));
            }
        }

        let newly_bankrupt = self.retire_bankrupt().await;
        let report = CycleReport {
            cycle,
            outcomes,
            newly_bankrupt,
        };
        info!(
            "Cycle {} complete: {} turns, {} failed, {} newly bankrupt",
            cycle,
            report.outcomes.len(),
            report.failures(),
            report.newly_bankrupt.len()
        );
        report
    }

    /// Move active traders at or below the threshold into the bankrupt set.
    /// A trader with an unpriced holding is left alone for this cycle.
    async fn retire_bankrupt(&self) -> Vec<String> {
        let active: Vec<(usize, String)> = self
            .statuses()
            .into_iter()
            .enumerate()
            .filter(|(_, s)| s.is_active())
            .map(|(i, s)| (i, s.name))
            .collect();

        let mut retired = Vec::new();
        for (index, name) in active {
            let value = match self.ledger.marked_portfolio_value(&name).await {
                Ok(Some(value)) => value,
                Ok(None) => {
                    warn!("Skipping bankruptcy check for {}: a holding has no quote", name);
                    continue;
                }
                Err(e) => {
                    warn!("Skipping bankruptcy check for {}: {}", name, e);
                    continue;
                }
            };
            if value <= self.config.bankruptcy_threshold {
                warn!("{} is bankrupt (portfolio value {})", name, value);
                let mut statuses = self.statuses.write().unwrap_or_else(|e| e.into_inner());
                statuses[index].state = TraderState::Bankrupt;
                retired.push(name);
            }
        }
        retired
    }

    /// Poll on `RUN_EVERY_N_MINUTES` until stopped or every trader is bankrupt.
    pub async fn run_live(&self) -> Result<FloorResults, AppError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.config.poll_interval();
        info!(
            "Starting live trading floor with {} traders every {:?}",
            self.traders.len(),
            interval
        );

        while !self.is_stopped() {
            if self.config.run_even_when_market_is_closed
                || self.ledger.market().is_market_open().await
            {
                self.run_cycle().await;
            } else {
                info!("Market is closed, skipping run");
            }

            if self.active_count() == 0 {
                info!("No active traders remain");
                break;
            }
            if self.is_stopped() {
                break;
            }

            tokio::select! {
                _ = sleep(interval) => {}
                _ = shutdown_rx.recv() => {
                    info!("Trading floor received shutdown signal");
                    break;
                }
            }
        }

        self.results().await
    }

    /// One cycle per simulated day until the clock completes, every trader is
    /// bankrupt, or a stop is requested.
    pub async fn run_simulation(&self, clock: Arc<SimulationClock>) -> Result<FloorResults, AppError> {
        info!(
            "Starting simulation {} to {} ({} days)",
            clock.start_date(),
            clock.end_date(),
            clock.trading_days_count()
        );

        while !clock.is_complete() {
            if self.is_stopped() {
                info!("Simulation stopped at {}", clock.current_date());
                break;
            }
            if self.active_count() == 0 {
                info!("All traders are bankrupt; ending simulation");
                break;
            }

            info!("Simulating {}", clock.current_date());
            self.run_cycle().await;
            clock.advance();
        }

        self.results().await
    }

    /// Final standings, ranked by ROI.
    pub async fn results(&self) -> Result<FloorResults, AppError> {
        let initial = self.ledger.initial_balance();
        let statuses = self.statuses();

        let mut rows = Vec::with_capacity(statuses.len());
        for status in statuses {
            let account = self.ledger.account(&status.name).await?;
            let value = self.ledger.portfolio_value(&status.name).await?;
            let profit_loss = account.profit_loss(value);
            let roi_percent = if initial.is_zero() {
                Decimal::ZERO
            } else {
                (profit_loss / initial * Decimal::ONE_HUNDRED).round_dp(4)
            };

            rows.push(TraderResult {
                name: status.name.clone(),
                final_portfolio_value: value,
                profit_loss,
                roi_percent,
                trade_count: account.trade_count(),
                bankrupt: status.state == TraderState::Bankrupt,
                failed_cycles: status.failed_cycles,
                failing: status.failed_cycles >= self.config.failure_report_threshold,
            });
        }

        Ok(FloorResults::ranked(self.cycles_run(), rows))
    }
}
