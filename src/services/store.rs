//! Keyed persistence for account snapshots, activity logs and daily closes.
//!
//! One logical record per trader holds the whole [`Account`] as a single
//! JSON blob. Writes are full-snapshot overwrites (last writer wins); the
//! ledger serializes writers per account so that is safe.

use crate::error::StoreError;
use crate::types::{Account, LogEntry, Timestamp};
use chrono::NaiveDate;
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Close prices for one date, keyed by symbol.
pub type MarketDay = BTreeMap<String, Decimal>;

/// Persistence contract used by the ledger and the historical cache.
///
/// Keys are lower-cased trader names; implementations normalize again so
/// callers cannot bypass that.
pub trait AccountStore: Send + Sync {
    fn read_account(&self, name: &str) -> Result<Option<Account>, StoreError>;

    fn write_account(&self, account: &Account) -> Result<(), StoreError>;

    fn append_log(&self, name: &str, kind: &str, message: &str) -> Result<(), StoreError>;

    /// Most recent `limit` entries, oldest first.
    fn recent_logs(&self, name: &str, limit: usize) -> Result<Vec<LogEntry>, StoreError>;

    fn read_market(&self, date: NaiveDate) -> Result<Option<MarketDay>, StoreError>;

    fn write_market(&self, date: NaiveDate, prices: &MarketDay) -> Result<(), StoreError>;
}

fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("SQLite store initialized");
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!("In-memory SQLite store initialized");
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                name TEXT PRIMARY KEY,
                account TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                datetime TEXT NOT NULL,
                type TEXT NOT NULL,
                message TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_logs_name ON logs(name, id DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS market (
                date TEXT PRIMARY KEY,
                data TEXT NOT NULL
            )",
            [],
        )?;

        debug!("SQLite schema initialized");
        Ok(())
    }
}

impl AccountStore for SqliteStore {
    fn read_account(&self, name: &str) -> Result<Option<Account>, StoreError> {
        let key = Account::key(name);
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT account FROM accounts WHERE name = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| StoreError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
    }

    fn write_account(&self, account: &Account) -> Result<(), StoreError> {
        let key = Account::key(&account.name);
        let json = serde_json::to_string(account).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO accounts (name, account) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET account = excluded.account",
            params![key, json],
        )?;
        Ok(())
    }

    fn append_log(&self, name: &str, kind: &str, message: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO logs (name, datetime, type, message) VALUES (?1, ?2, ?3, ?4)",
            params![Account::key(name), Timestamp::now().to_string(), kind, message],
        )?;
        Ok(())
    }

    fn recent_logs(&self, name: &str, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT datetime, type, message FROM logs
             WHERE name = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![Account::key(name), limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (datetime, kind, message) = row?;
            let datetime = Timestamp::parse(&datetime).map_err(|e| StoreError::Corrupt {
                key: format!("logs:{}", name),
                reason: e.to_string(),
            })?;
            entries.push(LogEntry {
                datetime,
                kind,
                message,
            });
        }
        entries.reverse();
        Ok(entries)
    }

    fn read_market(&self, date: NaiveDate) -> Result<Option<MarketDay>, StoreError> {
        let key = date_key(date);
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM market WHERE date = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| StoreError::Corrupt {
                key: format!("market:{}", key),
                reason: e.to_string(),
            })
        })
        .transpose()
    }

    fn write_market(&self, date: NaiveDate, prices: &MarketDay) -> Result<(), StoreError> {
        let key = date_key(date);
        let json = serde_json::to_string(prices).map_err(|e| StoreError::Corrupt {
            key: format!("market:{}", key),
            reason: e.to_string(),
        })?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO market (date, data) VALUES (?1, ?2)
             ON CONFLICT(date) DO UPDATE SET data = excluded.data",
            params![key, json],
        )?;
        Ok(())
    }
}

/// In-memory store for tests and dry runs.
///
/// `fail_next(n)` makes the next `n` calls fail with `Unavailable`, which is
/// how the retry path gets exercised.
#[derive(Default)]
pub struct MemoryStore {
    accounts: DashMap<String, String>,
    logs: DashMap<String, Vec<LogEntry>>,
    market: DashMap<NaiveDate, MarketDay>,
    failures_pending: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` store calls.
    pub fn fail_next(&self, n: u32) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    /// Raw persisted JSON for an account (what a byte-for-byte comparison sees).
    pub fn raw_account(&self, name: &str) -> Option<String> {
        self.accounts.get(&Account::key(name)).map(|e| e.value().clone())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        let pending = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match pending {
            Ok(_) => Err(StoreError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

impl AccountStore for MemoryStore {
    fn read_account(&self, name: &str) -> Result<Option<Account>, StoreError> {
        self.check_available()?;
        let key = Account::key(name);
        match self.accounts.get(&key) {
            Some(json) => serde_json::from_str(json.value())
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key,
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn write_account(&self, account: &Account) -> Result<(), StoreError> {
        self.check_available()?;
        let key = Account::key(&account.name);
        let json = serde_json::to_string(account).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.accounts.insert(key, json);
        Ok(())
    }

    fn append_log(&self, name: &str, kind: &str, message: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.logs
            .entry(Account::key(name))
            .or_default()
            .push(LogEntry {
                datetime: Timestamp::now(),
                kind: kind.to_string(),
                message: message.to_string(),
            });
        Ok(())
    }

    fn recent_logs(&self, name: &str, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        self.check_available()?;
        Ok(self
            .logs
            .get(&Account::key(name))
            .map(|entries| {
                let skip = entries.len().saturating_sub(limit);
                entries.value()[skip..].to_vec()
            })
            .unwrap_or_default())
    }

    fn read_market(&self, date: NaiveDate) -> Result<Option<MarketDay>, StoreError> {
        self.check_available()?;
        Ok(self.market.get(&date).map(|day| day.value().clone()))
    }

    fn write_market(&self, date: NaiveDate, prices: &MarketDay) -> Result<(), StoreError> {
        self.check_available()?;
        self.market.insert(date, prices.clone());
        Ok(())
    }
}
