#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::{LedgerStore, SqliteStore};
use crate::ledger::BudgetLedger;
use crate::models::{Budget, Expense};

pub(crate) const TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory SQLite store that can be switched into a failing mode, or
/// have its connection kept busy when the next expense is appended.
#[derive(Clone)]
pub(crate) struct FlakyStore {
    pub(crate) inner: SqliteStore,
    failing: Arc<AtomicBool>,
    busy_append: Arc<Mutex<Option<Duration>>>,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self::with_lock_timeout(TIMEOUT)
    }

    pub(crate) fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            inner: SqliteStore::open_in_memory()
                .unwrap()
                .with_lock_timeout(lock_timeout),
            failing: Arc::new(AtomicBool::new(false)),
            busy_append: Arc::new(Mutex::new(None)),
        }
    }

    /// The next `append_expense` finds the connection taken for `hold`.
    pub(crate) fn hold_next_append(&self, hold: Duration) {
        *self.busy_append.lock().unwrap() = Some(hold);
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for FlakyStore {
    async fn find_active(&self, user_id: i64, chat_id: i64) -> Result<Option<Budget>> {
        self.check()?;
        self.inner.find_active(user_id, chat_id).await
    }

    async fn find_active_for_chat(&self, chat_id: i64) -> Result<Option<Budget>> {
        self.check()?;
        self.inner.find_active_for_chat(chat_id).await
    }

    async fn insert_budget(&self, budget: &Budget) -> Result<bool> {
        self.check()?;
        self.inner.insert_budget(budget).await
    }

    async fn deactivate(&self, user_id: i64, chat_id: i64, end_at: DateTime<Utc>) -> Result<bool> {
        self.check()?;
        self.inner.deactivate(user_id, chat_id, end_at).await
    }

    async fn append_expense(&self, budget_id: Uuid, expense: &Expense) -> Result<Option<Budget>> {
        self.check()?;
        let hold = self.busy_append.lock().unwrap().take();
        if let Some(hold) = hold {
            let conn = self.inner.hold_connection().await;
            tokio::spawn(async move {
                tokio::time::sleep(hold).await;
                drop(conn);
            });
        }
        self.inner.append_expense(budget_id, expense).await
    }
}

/// A store whose every call hangs well past any reasonable timeout.
pub(crate) struct StalledStore;

impl StalledStore {
    async fn stall<T>() -> Result<T> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        bail!("unreachable")
    }
}

#[async_trait]
impl LedgerStore for StalledStore {
    async fn find_active(&self, _user_id: i64, _chat_id: i64) -> Result<Option<Budget>> {
        Self::stall().await
    }

    async fn find_active_for_chat(&self, _chat_id: i64) -> Result<Option<Budget>> {
        Self::stall().await
    }

    async fn insert_budget(&self, _budget: &Budget) -> Result<bool> {
        Self::stall().await
    }

    async fn deactivate(&self, _user_id: i64, _chat_id: i64, _end_at: DateTime<Utc>) -> Result<bool> {
        Self::stall().await
    }

    async fn append_expense(&self, _budget_id: Uuid, _expense: &Expense) -> Result<Option<Budget>> {
        Self::stall().await
    }
}

pub(crate) fn ledger_over(store: &FlakyStore) -> BudgetLedger {
    BudgetLedger::new(Arc::new(store.clone()), TIMEOUT)
}
