//! Trading floor
//!
//! Runs a set of independent traders against the shared ledger, either on a
//! live polling schedule or one simulated day at a time.

mod rule_trader;
mod runner;

pub use rule_trader::RuleTrader;
pub use runner::TradingFloor;

use crate::error::AppError;
use crate::services::ledger::TraderAccount;
use crate::services::market::BoxFuture;
use crate::types::TradeMode;

/// What a trader gets for one turn.
#[derive(Clone)]
pub struct TurnContext {
    pub mode: TradeMode,
    /// 1-based cycle number.
    pub cycle: u64,
    /// The trader's own account; the only ledger surface it may use.
    pub account: TraderAccount,
}

/// A decision maker on the floor.
pub trait Trader: Send + Sync {
    /// Unique name; also the account key (case-insensitive).
    fn name(&self) -> &str;

    /// Strategy text the account is seeded with on reset.
    fn strategy(&self) -> &str;

    /// Take one turn. Business-rule rejections should be handled inside the
    /// turn; an `Err` marks this trader's cycle as failed.
    fn run_turn<'a>(&'a self, ctx: &'a TurnContext) -> BoxFuture<'a, Result<(), AppError>>;
}
