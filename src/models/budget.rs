use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::Expense;

#[derive(Debug, Clone, PartialEq)]
pub struct Budget {
    pub id: Uuid,
    pub name: String,
    pub amount: Decimal,
    pub current_amount: Decimal,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub user_id: i64,
    pub chat_id: i64,
    pub user_name: String,
    /// Chronological; only ever appended to while the budget is active.
    pub expenses: Vec<Expense>,
}

/// A fully collected budget request, ready to be handed to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBudget {
    pub name: String,
    pub amount: Decimal,
    pub user_id: i64,
    pub chat_id: i64,
    pub user_name: String,
}

impl Budget {
    pub fn open(new: NewBudget, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: new.name,
            amount: new.amount,
            current_amount: new.amount,
            active: true,
            created_at: now,
            end_at: None,
            user_id: new.user_id,
            chat_id: new.chat_id,
            user_name: new.user_name,
            expenses: Vec::new(),
        }
    }

    /// Append an expense and draw its amount from the running balance.
    pub fn record_expense(&mut self, expense: Expense) {
        self.current_amount -= expense.amount;
        self.expenses.push(expense);
    }

    pub fn spent(&self) -> Decimal {
        self.expenses.iter().map(|e| e.amount).sum()
    }

    pub fn is_over_budget(&self) -> bool {
        self.current_amount < Decimal::ZERO
    }

    /// How far past the envelope the spending went, if it did.
    pub fn overspend(&self) -> Option<Decimal> {
        self.is_over_budget().then(|| self.current_amount.abs())
    }

    /// Total spend once the envelope is exhausted: `amount + |current_amount|`.
    pub fn total_spend(&self) -> Option<Decimal> {
        self.overspend().map(|excess| self.amount + excess)
    }

    pub fn balance_holds(&self) -> bool {
        self.current_amount == self.amount - self.spent()
    }
}
