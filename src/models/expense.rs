use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub id: Uuid,
    pub amount: Decimal,
    pub description: String,
    pub date: DateTime<Utc>,
    pub user_id: i64,
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewExpense {
    pub amount: Decimal,
    pub description: String,
    pub user_id: i64,
    pub user_name: String,
}

impl Expense {
    pub fn new(new: NewExpense, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            amount: new.amount,
            description: new.description,
            date: now,
            user_id: new.user_id,
            user_name: new.user_name,
        }
    }
}
