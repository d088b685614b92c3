//! Trading-floor orchestration types.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a trader is asked to do on its turn. Alternates every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeMode {
    /// Look for new positions.
    SeekPositions,
    /// Review and rebalance existing positions.
    Rebalance,
}

impl TradeMode {
    pub fn toggled(self) -> Self {
        match self {
            TradeMode::SeekPositions => TradeMode::Rebalance,
            TradeMode::Rebalance => TradeMode::SeekPositions,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TradeMode::SeekPositions => "trading",
            TradeMode::Rebalance => "rebalancing",
        }
    }
}

impl Default for TradeMode {
    fn default() -> Self {
        TradeMode::SeekPositions
    }
}

/// Lifecycle of a trader on the floor. `Bankrupt` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraderState {
    Active,
    Bankrupt,
}

/// Runtime status of one trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderStatus {
    pub name: String,
    pub state: TraderState,
    /// Mode the trader will run in on its next turn.
    pub next_mode: TradeMode,
    pub turns_run: u64,
    pub failed_cycles: u64,
    pub consecutive_failures: u64,
    pub last_error: Option<String>,
}

impl TraderStatus {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: TraderState::Active,
            next_mode: TradeMode::default(),
            turns_run: 0,
            failed_cycles: 0,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == TraderState::Active
    }
}

/// Result of one trader's turn within a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed,
    Failed(String),
}

impl CycleOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, CycleOutcome::Failed(_))
    }
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: u64,
    /// Per-trader outcomes, in trader registration order.
    pub outcomes: Vec<(String, TradeMode, CycleOutcome)>,
    /// Traders retired as bankrupt at the end of this cycle.
    pub newly_bankrupt: Vec<String>,
}

impl CycleReport {
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|(_, _, o)| o.is_failed()).count()
    }
}

/// Final standing of one trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderResult {
    pub name: String,
    pub final_portfolio_value: Decimal,
    pub profit_loss: Decimal,
    pub roi_percent: Decimal,
    pub trade_count: usize,
    pub bankrupt: bool,
    pub failed_cycles: u64,
    /// Failed at least the configured number of cycles.
    pub failing: bool,
}

/// Ranked exit table of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloorResults {
    /// Cycles (live polls or simulated days) executed.
    pub cycles: u64,
    /// Sorted by ROI, best first.
    pub rankings: Vec<TraderResult>,
}

impl FloorResults {
    /// Sort rows descending by ROI; ties keep registration order.
    pub fn ranked(cycles: u64, mut rankings: Vec<TraderResult>) -> Self {
        rankings.sort_by(|a, b| b.roi_percent.cmp(&a.roi_percent));
        Self { cycles, rankings }
    }

    pub fn survivors(&self) -> usize {
        self.rankings.iter().filter(|r| !r.bankrupt).count()
    }

    pub fn bankrupt(&self) -> usize {
        self.rankings.iter().filter(|r| r.bankrupt).count()
    }
}

impl fmt::Display for FloorResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "FINAL RESULTS ({} cycles)", self.cycles)?;
        for (i, row) in self.rankings.iter().enumerate() {
            let status = match (row.bankrupt, row.failing) {
                (true, _) => "BANKRUPT",
                (false, true) => "FAILING",
                (false, false) => "Active",
            };
            writeln!(f, "{}. {} [{}]", i + 1, row.name, status)?;
            writeln!(
                f,
                "   Final Portfolio Value: ${:.2}",
                row.final_portfolio_value
            )?;
            writeln!(f, "   P&L: ${:.2}", row.profit_loss)?;
            writeln!(f, "   ROI: {:.2}%", row.roi_percent)?;
            writeln!(f, "   Total Trades: {}", row.trade_count)?;
            if row.failed_cycles > 0 {
                writeln!(f, "   Failed Cycles: {}", row.failed_cycles)?;
            }
        }
        write!(
            f,
            "Summary: {} survived, {} went bankrupt",
            self.survivors(),
            self.bankrupt()
        )
    }
}
