mod schema;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{Budget, Expense};

/// Persistence capability behind the budget ledger.
///
/// Implementations only move records in and out; the domain rules live in
/// [`crate::ledger::BudgetLedger`]. The one rule a store must enforce itself is
/// that a participant never ends up with two active budgets in the same chat,
/// since that has to hold even against writers racing outside this process.
///
/// Writes are not abandoned by callers: an implementation bounds its own
/// wait before touching data, and a write it has started always reports
/// its real outcome.
#[async_trait]
pub(crate) trait LedgerStore: Send + Sync {
    async fn find_active(&self, user_id: i64, chat_id: i64) -> Result<Option<Budget>>;

    /// Oldest active budget in the chat, whoever owns it.
    async fn find_active_for_chat(&self, chat_id: i64) -> Result<Option<Budget>>;

    /// Returns `false`, writing nothing, when the owner already has an active
    /// budget in that chat.
    async fn insert_budget(&self, budget: &Budget) -> Result<bool>;

    /// Closes the owner's active budget. Returns whether one was closed.
    async fn deactivate(&self, user_id: i64, chat_id: i64, end_at: DateTime<Utc>) -> Result<bool>;

    /// Appends the expense and lowers the balance as one unit. Returns the
    /// updated budget, or `None` if it is missing or no longer active.
    async fn append_expense(&self, budget_id: Uuid, expense: &Expense) -> Result<Option<Budget>>;
}

const BUDGET_COLUMNS: &str = "id, name, amount, current_amount, active, created_at, end_at, \
                              user_id, chat_id, user_name, expenses";

#[derive(Clone)]
pub(crate) struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    lock_timeout: Duration,
}

impl SqliteStore {
    /// Open (and migrate) the database at `path`. No call waits longer than
    /// `lock_timeout` for the connection or for SQLite's file lock.
    pub(crate) fn open(path: &Path, lock_timeout: Duration) -> Result<Self> {
        let mut conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to set database pragmas")?;
        conn.busy_timeout(lock_timeout)
            .context("Failed to set database busy timeout")?;
        migrate(&mut conn).context("Database migration failed")?;
        Ok(Self::from_connection(conn, lock_timeout))
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        Ok(Self::from_connection(conn, Duration::from_secs(5)))
    }

    fn from_connection(conn: Connection, lock_timeout: Duration) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            lock_timeout,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Keep the connection busy until the returned guard drops.
    #[cfg(test)]
    pub(crate) async fn hold_connection(&self) -> tokio::sync::OwnedMutexGuard<Connection> {
        Arc::clone(&self.conn).lock_owned().await
    }

    /// Run `f` against the connection on the blocking pool.
    ///
    /// Only the wait for the connection is bounded. Once `f` has the
    /// connection it runs to completion on its own task, whether or not the
    /// caller is still waiting, so callers must not time this out.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut conn = tokio::time::timeout(self.lock_timeout, Arc::clone(&self.conn).lock_owned())
            .await
            .map_err(|_| anyhow!("ledger store busy for longer than {:?}", self.lock_timeout))?;
        tokio::task::spawn_blocking(move || f(&mut *conn))
            .await
            .context("Ledger store worker panicked")?
    }

    /// Every budget a participant ever opened in a chat, oldest first.
    #[cfg(test)]
    pub(crate) async fn budgets_of(&self, user_id: i64, chat_id: i64) -> Result<Vec<Budget>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BUDGET_COLUMNS} FROM budgets
                 WHERE user_id = ?1 AND chat_id = ?2
                 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt.query_map(params![user_id, chat_id], budget_from_row)?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn find_active(&self, user_id: i64, chat_id: i64) -> Result<Option<Budget>> {
        self.run(move |conn| {
            let result = conn.query_row(
                &format!(
                    "SELECT {BUDGET_COLUMNS} FROM budgets
                     WHERE user_id = ?1 AND chat_id = ?2 AND active = 1"
                ),
                params![user_id, chat_id],
                budget_from_row,
            );
            optional(result)
        })
        .await
    }

    async fn find_active_for_chat(&self, chat_id: i64) -> Result<Option<Budget>> {
        self.run(move |conn| {
            let result = conn.query_row(
                &format!(
                    "SELECT {BUDGET_COLUMNS} FROM budgets
                     WHERE chat_id = ?1 AND active = 1
                     ORDER BY created_at ASC, rowid ASC
                     LIMIT 1"
                ),
                params![chat_id],
                budget_from_row,
            );
            optional(result)
        })
        .await
    }

    async fn insert_budget(&self, budget: &Budget) -> Result<bool> {
        let budget = budget.clone();
        self.run(move |conn| {
            let expenses = serde_json::to_string(&budget.expenses)
                .context("Failed to encode expenses")?;
            let result = conn.execute(
                &format!(
                    "INSERT INTO budgets ({BUDGET_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    budget.id.to_string(),
                    budget.name,
                    budget.amount.to_string(),
                    budget.current_amount.to_string(),
                    budget.active,
                    timestamp(&budget.created_at),
                    budget.end_at.as_ref().map(timestamp),
                    budget.user_id,
                    budget.chat_id,
                    budget.user_name,
                    expenses,
                ],
            );
            match result {
                Ok(_) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
                {
                    Ok(false)
                }
                Err(e) => Err(anyhow::Error::new(e).context("Failed to insert budget")),
            }
        })
        .await
    }

    async fn deactivate(&self, user_id: i64, chat_id: i64, end_at: DateTime<Utc>) -> Result<bool> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE budgets SET active = 0, end_at = ?3
                 WHERE user_id = ?1 AND chat_id = ?2 AND active = 1",
                params![user_id, chat_id, timestamp(&end_at)],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn append_expense(&self, budget_id: Uuid, expense: &Expense) -> Result<Option<Budget>> {
        let expense = expense.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let result = tx.query_row(
                &format!("SELECT {BUDGET_COLUMNS} FROM budgets WHERE id = ?1 AND active = 1"),
                params![budget_id.to_string()],
                budget_from_row,
            );
            let Some(mut budget) = optional(result)? else {
                return Ok(None);
            };

            budget.record_expense(expense);
            let expenses = serde_json::to_string(&budget.expenses)
                .context("Failed to encode expenses")?;
            tx.execute(
                "UPDATE budgets SET current_amount = ?1, expenses = ?2 WHERE id = ?3",
                params![budget.current_amount.to_string(), expenses, budget_id.to_string()],
            )?;
            tx.commit()?;
            Ok(Some(budget))
        })
        .await
    }
}

/// Bring the schema up to [`schema::CURRENT_VERSION`] in one transaction.
fn migrate(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    let known: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version')",
        [],
        |row| row.get(0),
    )?;

    if known {
        let version = optional(tx.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get::<_, i32>(0)
        }))?
        .unwrap_or(0);
        let pending = schema::MIGRATIONS.iter().filter(|(from, _)| version <= *from);
        for (from, sql) in pending {
            tx.execute_batch(sql)
                .with_context(|| format!("Migration from version {from} failed"))?;
        }
        if version < schema::CURRENT_VERSION {
            tx.execute("UPDATE schema_version SET version = ?1", params![schema::CURRENT_VERSION])?;
        }
    } else {
        tx.execute_batch(schema::SCHEMA_V1)?;
        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", params![schema::CURRENT_VERSION])?;
    }

    tx.commit()?;
    Ok(())
}

fn optional<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn budget_from_row(row: &Row<'_>) -> rusqlite::Result<Budget> {
    Ok(Budget {
        id: parse_column(row, 0, Uuid::from_str)?,
        name: row.get(1)?,
        amount: parse_column(row, 2, Decimal::from_str)?,
        current_amount: parse_column(row, 3, Decimal::from_str)?,
        active: row.get(4)?,
        created_at: parse_column(row, 5, parse_timestamp)?,
        end_at: row
            .get::<_, Option<String>>(6)?
            .map(|s| parse_timestamp(&s).map_err(|e| conversion_error(6, e)))
            .transpose()?,
        user_id: row.get(7)?,
        chat_id: row.get(8)?,
        user_name: row.get(9)?,
        expenses: parse_column(row, 10, |s| serde_json::from_str::<Vec<Expense>>(s))?,
    })
}

fn parse_timestamp(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|at| at.with_timezone(&Utc))
}

/// Read a text column and parse it, reporting failures as conversion errors.
fn parse_column<T, E>(
    row: &Row<'_>,
    idx: usize,
    parse: impl FnOnce(&str) -> std::result::Result<T, E>,
) -> rusqlite::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}
