use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::db::LedgerStore;
use crate::error::{LedgerError, ValidationError};
use crate::models::{Budget, Expense, NewBudget, NewExpense};

/// Domain rules over a [`LedgerStore`]: one active budget per participant and
/// chat, and a balance that always equals `amount - sum(expenses)`.
///
/// Reads are cut off after `timeout`. Writes are awaited until the store
/// reports their outcome, so a failed write never leaves data behind.
#[derive(Clone)]
pub(crate) struct BudgetLedger {
    store: Arc<dyn LedgerStore>,
    timeout: Duration,
}

impl BudgetLedger {
    pub(crate) fn new(store: Arc<dyn LedgerStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub(crate) async fn active_budget(
        &self,
        user_id: i64,
        chat_id: i64,
    ) -> Result<Option<Budget>, LedgerError> {
        self.bounded(self.store.find_active(user_id, chat_id)).await
    }

    pub(crate) async fn active_budget_for_chat(
        &self,
        chat_id: i64,
    ) -> Result<Option<Budget>, LedgerError> {
        self.bounded(self.store.find_active_for_chat(chat_id)).await
    }

    /// Open a new budget. Any existing active budget for the same participant
    /// must be closed first with [`Self::deactivate_budget`].
    pub(crate) async fn create_budget(&self, new: NewBudget) -> Result<Budget, LedgerError> {
        if new.name.trim().is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        if new.amount <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveAmount.into());
        }
        if self.active_budget(new.user_id, new.chat_id).await?.is_some() {
            return Err(LedgerError::Conflict);
        }

        let budget = Budget::open(new, Utc::now());
        if !written(self.store.insert_budget(&budget)).await? {
            // Lost a race with another writer for the same participant.
            return Err(LedgerError::Conflict);
        }
        info!(
            budget_id = %budget.id,
            user_id = budget.user_id,
            chat_id = budget.chat_id,
            amount = %budget.amount,
            "budget created"
        );
        Ok(budget)
    }

    pub(crate) async fn deactivate_budget(
        &self,
        user_id: i64,
        chat_id: i64,
    ) -> Result<(), LedgerError> {
        let closed = written(self.store.deactivate(user_id, chat_id, Utc::now())).await?;
        if closed {
            info!(user_id, chat_id, "budget deactivated");
        } else {
            debug!(user_id, chat_id, "no active budget to deactivate");
        }
        Ok(())
    }

    /// Record an expense against the chat's active budget and return the
    /// budget as persisted afterwards.
    pub(crate) async fn add_expense(
        &self,
        chat_id: i64,
        new: NewExpense,
    ) -> Result<Budget, LedgerError> {
        if new.description.trim().is_empty() {
            return Err(ValidationError::EmptyDescription.into());
        }
        if new.amount <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveAmount.into());
        }
        let budget = self
            .active_budget_for_chat(chat_id)
            .await?
            .ok_or(LedgerError::NotFound)?;

        let expense = Expense::new(new, Utc::now());
        let updated = written(self.store.append_expense(budget.id, &expense))
            .await?
            // Closed between the lookup and the append.
            .ok_or(LedgerError::NotFound)?;
        debug_assert!(updated.balance_holds(), "balance drifted from expenses");
        info!(
            budget_id = %updated.id,
            chat_id,
            user_id = expense.user_id,
            amount = %expense.amount,
            current_amount = %updated.current_amount,
            "expense recorded"
        );
        Ok(updated)
    }

    /// Expenses of the chat's active budget, oldest first.
    pub(crate) async fn list_expenses(&self, chat_id: i64) -> Result<Vec<Expense>, LedgerError> {
        Ok(self
            .active_budget_for_chat(chat_id)
            .await?
            .map(|b| b.expenses)
            .unwrap_or_default())
    }

    /// Only for reads, which are safe to abandon.
    async fn bounded<T>(
        &self,
        op: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, LedgerError> {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => result.map_err(LedgerError::Store),
            Err(_) => Err(LedgerError::Store(anyhow::anyhow!(
                "store call timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

async fn written<T>(op: impl Future<Output = anyhow::Result<T>>) -> Result<T, LedgerError> {
    op.await.map_err(LedgerError::Store)
}
