//! Rule Trader
//!
//! A small deterministic decision maker: buys symbols whose price rose since
//! the last look, sells holdings whose price fell.

use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::error::{AppError, LedgerError};
use crate::services::market::BoxFuture;
use crate::types::TradeMode;

use super::{Trader, TurnContext};

/// Momentum buyer / stop-out seller over a fixed watchlist.
pub struct RuleTrader {
    name: String,
    strategy: String,
    watchlist: Vec<String>,
    /// Fraction of cash committed to one new position.
    position_fraction: Decimal,
    last_seen: DashMap<String, Decimal>,
}

impl RuleTrader {
    pub fn new(name: &str, strategy: &str, watchlist: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            strategy: strategy.to_string(),
            watchlist: watchlist.iter().map(|s| s.trim().to_uppercase()).collect(),
            position_fraction: Decimal::new(10, 2),
            last_seen: DashMap::new(),
        }
    }

    pub fn with_position_fraction(mut self, fraction: Decimal) -> Self {
        self.position_fraction = fraction;
        self
    }

    /// Record `price` and return the previous observation.
    fn observe(&self, symbol: &str, price: Decimal) -> Option<Decimal> {
        self.last_seen.insert(symbol.to_string(), price)
    }

    async fn seek_positions(&self, ctx: &TurnContext) -> Result<(), AppError> {
        let holdings = ctx.account.holdings().await?;

        for symbol in &self.watchlist {
            let price = ctx.account.price(symbol).await;
            if price <= Decimal::ZERO {
                debug!("{} has no price for {}", self.name, symbol);
                continue;
            }
            let Some(previous) = self.observe(symbol, price) else {
                continue;
            };
            if holdings.contains_key(symbol) || price <= previous {
                continue;
            }

            let budget = ctx.account.balance().await? * self.position_fraction;
            let quantity = (budget / price).floor().to_u32().unwrap_or(0);
            if quantity == 0 {
                continue;
            }

            let rationale = format!("{} rose from {} to {}", symbol, previous, price);
            match ctx.account.buy(symbol, quantity, &rationale).await {
                Ok(_) => info!("{} bought {} {}", self.name, quantity, symbol),
                Err(e) if e.is_business_rule() => {
                    warn!("{} could not buy {}: {}", self.name, symbol, e)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn rebalance(&self, ctx: &TurnContext) -> Result<(), AppError> {
        let holdings = ctx.account.holdings().await?;

        for (symbol, quantity) in holdings {
            let price = ctx.account.price(&symbol).await;
            if price <= Decimal::ZERO {
                continue;
            }
            match self.observe(&symbol, price) {
                Some(previous) if price < previous => {}
                _ => continue,
            }

            let quantity = u32::try_from(quantity).unwrap_or(u32::MAX);
            let rationale = format!("{} fell to {}", symbol, price);
            match ctx.account.sell(&symbol, quantity, &rationale).await {
                Ok(_) => info!("{} sold {} {}", self.name, quantity, symbol),
                Err(e @ LedgerError::StoreUnavailable(_)) => return Err(e.into()),
                Err(e) => warn!("{} could not sell {}: {}", self.name, symbol, e),
            }
        }
        Ok(())
    }
}

impl Trader for RuleTrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn strategy(&self) -> &str {
        &self.strategy
    }

    fn run_turn<'a>(&'a self, ctx: &'a TurnContext) -> BoxFuture<'a, Result<(), AppError>> {
        Box::pin(async move {
            let check = ctx.account.can_trade_now().await;
            if !check.allowed {
                info!("{} sitting out cycle {}: {}", self.name, ctx.cycle, check.reason);
                return Ok(());
            }

            match ctx.mode {
                TradeMode::SeekPositions => self.seek_positions(ctx).await?,
                TradeMode::Rebalance => self.rebalance(ctx).await?,
            }

            ctx.account.report().await?;
            Ok(())
        })
    }
}
