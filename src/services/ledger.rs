//! Account Ledger
//!
//! Per-trader cash, holdings and transaction history. Every mutating operation
//! runs under that account's lock:
//! - read the snapshot (creating it on first use)
//! - validate against the business rules
//! - mutate a copy and persist the whole snapshot
//!
//! A failed validation or write leaves the stored snapshot untouched.

use crate::config::{LedgerConfig, StorePolicy};
use crate::error::LedgerError;
use crate::services::market::MarketData;
use crate::services::retry::with_retry;
use crate::services::store::AccountStore;
use crate::types::{Account, AccountReport, LogEntry, Timestamp, TradeCheck, Transaction};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const LOG_KIND: &str = "account";

/// Source of "now" for trade timestamps and cooldown checks.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time (UTC).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Externally driven time, for tests and scripted replays.
#[derive(Debug)]
pub struct ManualTimeSource {
    now: RwLock<Timestamp>,
}

impl ManualTimeSource {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn set(&self, at: Timestamp) {
        *self.now.write().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now = now.plus(delta);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cooldown check against `last_trade_time`.
fn cooldown_check(account: &Account, now: Timestamp, min_minutes: i64) -> TradeCheck {
    let Some(last) = account.last_trade_time else {
        return TradeCheck::allowed("No previous trades");
    };

    let minutes_since = now.since(last).num_seconds() as f64 / 60.0;
    let min_minutes = min_minutes as f64;
    if minutes_since < min_minutes {
        TradeCheck::blocked(format!(
            "Must wait {} more minutes before trading (last trade: {:.1} min ago)",
            (min_minutes - minutes_since).floor() as i64,
            minutes_since
        ))
    } else {
        TradeCheck::allowed(format!(
            "Ready to trade (last trade: {:.1} min ago)",
            minutes_since
        ))
    }
}

/// Shared ledger over every trader's account.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn AccountStore>,
    market: Arc<dyn MarketData>,
    time: Arc<dyn TimeSource>,
    config: LedgerConfig,
    policy: StorePolicy,
    /// One writer per account key.
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Ledger {
    pub fn new(
        store: Arc<dyn AccountStore>,
        market: Arc<dyn MarketData>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            store,
            market,
            time: Arc::new(SystemTimeSource),
            config,
            policy: StorePolicy::default(),
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn with_store_policy(mut self, policy: StorePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn initial_balance(&self) -> Decimal {
        self.config.initial_balance
    }

    pub fn market(&self) -> &Arc<dyn MarketData> {
        &self.market
    }

    /// Decision-maker handle bound to one account.
    pub fn trader(&self, name: &str) -> TraderAccount {
        TraderAccount {
            name: Account::key(name),
            ledger: self.clone(),
        }
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks.entry(Account::key(name)).or_default().clone()
    }

    /// Read a snapshot, creating and persisting a fresh one on first use.
    /// Callers must hold the account lock.
    async fn load(&self, name: &str) -> Result<Account, LedgerError> {
        let existing = with_retry(&self.policy, "read account", || self.store.read_account(name))
            .await?;

        match existing {
            Some(account) => Ok(account),
            None => {
                let account = Account::new(name, self.config.initial_balance);
                self.persist(&account).await?;
                info!("Created account {} with {}", account.name, account.balance);
                Ok(account)
            }
        }
    }

    async fn persist(&self, account: &Account) -> Result<(), LedgerError> {
        with_retry(&self.policy, "write account", || self.store.write_account(account)).await?;
        Ok(())
    }

    /// Activity log failures never fail the operation that produced them.
    async fn log(&self, name: &str, message: &str) {
        let written = with_retry(&self.policy, "append log", || {
            self.store.append_log(name, LOG_KIND, message)
        })
        .await;
        if let Err(e) = written {
            warn!("Could not write activity log for {}: {}", name, e);
        }
    }

    fn trade_timestamp(&self, account: &Account) -> Timestamp {
        let now = self.time.now();
        match account.last_trade_time {
            Some(last) if last > now => last,
            _ => now,
        }
    }

    async fn portfolio_value_of(&self, account: &Account) -> Decimal {
        let mut value = account.balance;
        for (symbol, quantity) in &account.holdings {
            value += self.market.price(symbol).await * Decimal::from(*quantity);
        }
        value
    }

    /// Mark-to-market value, or `None` while any held symbol has no quote.
    async fn marked_value_of(&self, account: &Account) -> Option<Decimal> {
        let mut value = account.balance;
        for (symbol, quantity) in &account.holdings {
            let price = self.market.price(symbol).await;
            if price <= Decimal::ZERO {
                debug!("{} holds {} with no quote", account.name, symbol);
                return None;
            }
            value += price * Decimal::from(*quantity);
        }
        Some(value)
    }

    /// Current snapshot (lazily created).
    pub async fn account(&self, name: &str) -> Result<Account, LedgerError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        self.load(name).await
    }

    /// Alias of [`Ledger::account`].
    pub async fn get(&self, name: &str) -> Result<Account, LedgerError> {
        self.account(name).await
    }

    pub async fn deposit(&self, name: &str, amount: Decimal) -> Result<Account, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        let mut account = self.load(name).await?;

        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or(LedgerError::InvalidAmount(amount))?;
        self.persist(&account).await?;
        self.log(name, &format!("Deposited ${}", amount)).await;
        info!("{} deposited {}", account.name, amount);
        Ok(account)
    }

    pub async fn withdraw(&self, name: &str, amount: Decimal) -> Result<Account, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        let mut account = self.load(name).await?;

        if amount > account.balance {
            return Err(LedgerError::InsufficientFunds {
                needed: amount,
                available: account.balance,
            });
        }

        account.balance -= amount;
        self.persist(&account).await?;
        self.log(name, &format!("Withdrew ${}", amount)).await;
        info!("{} withdrew {}", account.name, amount);
        Ok(account)
    }

    fn check_cooldown(&self, account: &Account) -> Result<(), LedgerError> {
        if !self.config.enforce_cooldown {
            return Ok(());
        }
        let check = cooldown_check(
            account,
            self.time.now(),
            self.config.min_minutes_between_trades,
        );
        if check.allowed {
            Ok(())
        } else {
            Err(LedgerError::CooldownActive(check.reason))
        }
    }

    /// Buy at `quote * (1 + spread)`.
    pub async fn buy(
        &self,
        name: &str,
        symbol: &str,
        quantity: u32,
        rationale: &str,
    ) -> Result<Account, LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::InvalidAmount(Decimal::ZERO));
        }
        let symbol = symbol.trim().to_uppercase();

        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        let mut account = self.load(name).await?;
        self.check_cooldown(&account)?;

        let quote = self.market.price(&symbol).await;
        if quote <= Decimal::ZERO {
            warn!("{} tried to buy unknown symbol {}", account.name, symbol);
            return Err(LedgerError::UnknownSymbol(symbol));
        }

        let price = quote
            .checked_mul(Decimal::ONE + self.config.spread)
            .ok_or(LedgerError::InvalidAmount(quote))?;
        let cost = price
            .checked_mul(Decimal::from(quantity))
            .ok_or(LedgerError::InvalidAmount(price))?;
        if cost > account.balance {
            warn!(
                "{} rejected: buying {} {} costs {}, balance {}",
                account.name, quantity, symbol, cost, account.balance
            );
            return Err(LedgerError::InsufficientFunds {
                needed: cost,
                available: account.balance,
            });
        }

        let timestamp = self.trade_timestamp(&account);
        *account.holdings.entry(symbol.clone()).or_insert(0) += u64::from(quantity);
        account.balance -= cost;
        account.transactions.push(Transaction {
            symbol: symbol.clone(),
            quantity: i64::from(quantity),
            price,
            timestamp,
            rationale: rationale.to_string(),
        });
        account.last_trade_time = Some(timestamp);

        self.persist(&account).await?;
        self.log(name, &format!("Bought {} of {}", quantity, symbol)).await;
        info!("{} bought {} {} at {}", account.name, quantity, symbol, price);
        Ok(account)
    }

    /// Sell at `quote * (1 - spread)`.
    pub async fn sell(
        &self,
        name: &str,
        symbol: &str,
        quantity: u32,
        rationale: &str,
    ) -> Result<Account, LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::InvalidAmount(Decimal::ZERO));
        }
        let symbol = symbol.trim().to_uppercase();

        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        let mut account = self.load(name).await?;

        let held = account.quantity_of(&symbol);
        if held < u64::from(quantity) {
            warn!(
                "{} rejected: selling {} {} with {} held",
                account.name, quantity, symbol, held
            );
            return Err(LedgerError::InsufficientHoldings {
                symbol,
                requested: u64::from(quantity),
                held,
            });
        }
        self.check_cooldown(&account)?;

        let quote = self.market.price(&symbol).await;
        if quote <= Decimal::ZERO {
            return Err(LedgerError::UnknownSymbol(symbol));
        }

        let price = quote
            .checked_mul(Decimal::ONE - self.config.spread)
            .ok_or(LedgerError::InvalidAmount(quote))?;
        let balance = price
            .checked_mul(Decimal::from(quantity))
            .and_then(|proceeds| account.balance.checked_add(proceeds))
            .ok_or(LedgerError::InvalidAmount(price))?;
        let timestamp = self.trade_timestamp(&account);

        let remaining = held - u64::from(quantity);
        if remaining == 0 {
            account.holdings.remove(&symbol);
        } else {
            account.holdings.insert(symbol.clone(), remaining);
        }
        account.balance = balance;
        account.transactions.push(Transaction {
            symbol: symbol.clone(),
            quantity: -i64::from(quantity),
            price,
            timestamp,
            rationale: rationale.to_string(),
        });
        account.last_trade_time = Some(timestamp);

        self.persist(&account).await?;
        self.log(name, &format!("Sold {} of {}", quantity, symbol)).await;
        info!("{} sold {} {} at {}", account.name, quantity, symbol, price);
        Ok(account)
    }

    pub async fn change_strategy(&self, name: &str, strategy: &str) -> Result<Account, LedgerError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        let mut account = self.load(name).await?;

        account.strategy = strategy.to_string();
        self.persist(&account).await?;
        self.log(name, "Changed strategy").await;
        Ok(account)
    }

    pub async fn get_strategy(&self, name: &str) -> Result<String, LedgerError> {
        Ok(self.account(name).await?.strategy)
    }

    /// Advisory cooldown check. An unreadable account is reported as blocked.
    pub async fn can_trade_now(&self, name: &str) -> TradeCheck {
        match self.account(name).await {
            Ok(account) => cooldown_check(
                &account,
                self.time.now(),
                self.config.min_minutes_between_trades,
            ),
            Err(e) => TradeCheck::blocked(format!("Account unavailable: {}", e)),
        }
    }

    /// Sample portfolio value into the time series and return the snapshot.
    pub async fn report(&self, name: &str) -> Result<AccountReport, LedgerError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        let mut account = self.load(name).await?;

        let value = self.portfolio_value_of(&account).await;
        account
            .portfolio_value_time_series
            .push((self.time.now(), value));
        self.persist(&account).await?;

        let profit_loss = account.profit_loss(value);
        debug!("{} report: value {}, p&l {}", account.name, value, profit_loss);
        Ok(AccountReport {
            account,
            total_portfolio_value: value,
            total_profit_loss: profit_loss,
        })
    }

    /// Portfolio value without recording a sample.
    pub async fn portfolio_value(&self, name: &str) -> Result<Decimal, LedgerError> {
        let account = self.account(name).await?;
        Ok(self.portfolio_value_of(&account).await)
    }

    /// Portfolio value only when every holding can be priced.
    pub async fn marked_portfolio_value(&self, name: &str) -> Result<Option<Decimal>, LedgerError> {
        let account = self.account(name).await?;
        Ok(self.marked_value_of(&account).await)
    }

    pub async fn profit_loss(&self, name: &str) -> Result<Decimal, LedgerError> {
        let account = self.account(name).await?;
        let value = self.portfolio_value_of(&account).await;
        Ok(account.profit_loss(value))
    }

    pub async fn holdings(&self, name: &str) -> Result<BTreeMap<String, u64>, LedgerError> {
        Ok(self.account(name).await?.holdings)
    }

    pub async fn transactions(&self, name: &str) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self.account(name).await?.transactions)
    }

    /// Restore starting cash and clear history.
    pub async fn reset(&self, name: &str, strategy: &str) -> Result<Account, LedgerError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let mut account = Account::new(name, self.config.initial_balance);
        account.strategy = strategy.to_string();
        self.persist(&account).await?;
        self.log(name, "Reset account").await;
        info!("Reset account {}", account.name);
        Ok(account)
    }

    /// Most recent activity log entries, oldest first.
    pub async fn recent_logs(&self, name: &str, limit: usize) -> Result<Vec<LogEntry>, LedgerError> {
        Ok(
            with_retry(&self.policy, "read logs", || self.store.recent_logs(name, limit))
                .await?,
        )
    }
}

/// The ledger surface a decision maker sees, bound to its own account.
#[derive(Clone)]
pub struct TraderAccount {
    name: String,
    ledger: Ledger,
}

impl TraderAccount {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Quote from the same provider the ledger prices trades with.
    pub async fn price(&self, symbol: &str) -> Decimal {
        self.ledger.market().price(symbol).await
    }

    pub async fn buy(&self, symbol: &str, quantity: u32, rationale: &str) -> Result<Account, LedgerError> {
        self.ledger.buy(&self.name, symbol, quantity, rationale).await
    }

    pub async fn sell(&self, symbol: &str, quantity: u32, rationale: &str) -> Result<Account, LedgerError> {
        self.ledger.sell(&self.name, symbol, quantity, rationale).await
    }

    pub async fn deposit(&self, amount: Decimal) -> Result<Account, LedgerError> {
        self.ledger.deposit(&self.name, amount).await
    }

    pub async fn withdraw(&self, amount: Decimal) -> Result<Account, LedgerError> {
        self.ledger.withdraw(&self.name, amount).await
    }

    pub async fn report(&self) -> Result<AccountReport, LedgerError> {
        self.ledger.report(&self.name).await
    }

    pub async fn get_strategy(&self) -> Result<String, LedgerError> {
        self.ledger.get_strategy(&self.name).await
    }

    pub async fn change_strategy(&self, strategy: &str) -> Result<Account, LedgerError> {
        self.ledger.change_strategy(&self.name, strategy).await
    }

    pub async fn can_trade_now(&self) -> TradeCheck {
        self.ledger.can_trade_now(&self.name).await
    }

    pub async fn holdings(&self) -> Result<BTreeMap<String, u64>, LedgerError> {
        self.ledger.holdings(&self.name).await
    }

    pub async fn balance(&self) -> Result<Decimal, LedgerError> {
        Ok(self.ledger.account(&self.name).await?.balance)
    }
}
