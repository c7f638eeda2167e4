mod amount;
mod budget;
mod expense;

pub(crate) use amount::{non_empty, parse_amount};
pub use budget::{Budget, NewBudget};
pub use expense::{Expense, NewExpense};
