//! Reply texts. Everything here is a pure function of its inputs.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::chat::{Chat, ChatKind, Reply};
use crate::error::ValidationError;
use crate::models::{Budget, Expense};
use crate::router::Action;

const SEPARATOR: &str = "------------------------";

pub(crate) const ASK_BUDGET_NAME: &str = "Please give your new budget a name:";
pub(crate) const ASK_BUDGET_AMOUNT: &str = "Please enter the amount for your new budget:";
pub(crate) const BUDGET_REPLACED: &str =
    "You cancelled your current budget. Now, please give your new budget a name:";
pub(crate) const BUDGET_KEPT: &str = "You decided to keep your current budget.";
pub(crate) const ASK_EXPENSE_AMOUNT: &str = "Please enter the amount of your new expense:";
pub(crate) const ASK_EXPENSE_DESCRIPTION: &str = "Please describe your expense:";
pub(crate) const NO_ACTIVE_BUDGET: &str = "You have no active budget.";
pub(crate) const NO_EXPENSES: &str = "You have not recorded any expenses yet.";
pub(crate) const REQUEST_FAILED: &str = "Something went wrong while processing your request.";
pub(crate) const IDLE_HINT: &str = "Send /menu to see what I can do for you.";

/// Date and money rendering, kept apart from the message layout.
pub(crate) trait Locale: Send + Sync {
    fn date(&self, at: DateTime<Utc>) -> String;
    fn amount(&self, value: Decimal) -> String;
}

/// English dates, euro amounts with a trailing sign: `1,234.50€`.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EuroLocale;

impl Locale for EuroLocale {
    fn date(&self, at: DateTime<Utc>) -> String {
        at.format("%A, %B %-d, %Y").to_string()
    }

    fn amount(&self, value: Decimal) -> String {
        format!("{}€", format_amount(value))
    }
}

/// Two decimals with thousands separators, half-up rounding.
pub(crate) fn format_amount(val: Decimal) -> String {
    let abs = val
        .abs()
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let formatted = format!("{abs:.2}");
    let (int_part, dec_part) = formatted.split_once('.').unwrap_or((&formatted, "00"));

    let with_commas: String = int_part
        .as_bytes()
        .rchunks(3)
        .rev()
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or(""))
        .collect::<Vec<_>>()
        .join(",");

    if val < Decimal::ZERO && !abs.is_zero() {
        format!("-{with_commas}.{dec_part}")
    } else {
        format!("{with_commas}.{dec_part}")
    }
}

pub(crate) fn welcome(chat: &Chat) -> Reply {
    let intro = "I'm 🌙Luna, your assistant for managing budgets and expenses. \
                 Here is a menu with the options available to help you keep your finances in order.";
    let text = match (chat.kind, chat.title.as_deref()) {
        (ChatKind::Group, Some(title)) => format!("Welcome! Hi, members of {title}, {intro}"),
        (ChatKind::Group, None) => format!("Welcome! Hi, members of this group, {intro}"),
        (ChatKind::Private, _) => format!("Welcome! Hi, {intro}"),
    };
    Reply::text(text).with_buttons(&[Action::CreateBudget])
}

pub(crate) fn menu() -> Reply {
    Reply::text("Pick an option from the main menu:").with_buttons(&Action::MENU)
}

/// `commands` are `(name, description)` pairs, listed in the given order.
pub(crate) fn help(commands: &[(&str, &str)]) -> Reply {
    let mut text = String::from("Here is the list of commands you can use:\n\n");
    for (name, description) in commands {
        text.push_str(&format!("/{name} - {description}\n"));
    }
    Reply::text(text.trim_end())
}

pub(crate) fn unknown_command(name: &str, suggestion: &str) -> Reply {
    Reply::text(format!(
        "Unknown command: /{name}. Did you mean /{suggestion}?"
    ))
}

pub(crate) fn invalid_input(error: ValidationError) -> &'static str {
    match error {
        ValidationError::EmptyName => "The name cannot be empty. Please give your budget a name:",
        ValidationError::EmptyDescription => {
            "The description cannot be empty. Please describe your expense:"
        }
        ValidationError::MalformedAmount | ValidationError::NonPositiveAmount => {
            "Please enter a valid number greater than zero."
        }
    }
}

pub(crate) fn budget_summary(budget: &Budget, kind: ChatKind, locale: &dyn Locale) -> Reply {
    let mut lines = vec![
        format!("🏷 Budget: {}", budget.name),
        format!("📅 Start date: {}", locale.date(budget.created_at)),
        format!("💰 Initial amount: {}", locale.amount(budget.amount)),
        format!("💸 Current amount: {}", locale.amount(budget.current_amount)),
    ];
    if let (Some(excess), Some(total)) = (budget.overspend(), budget.total_spend()) {
        lines.push(format!(
            "⚠️ You have exceeded your budget by {}",
            locale.amount(excess)
        ));
        lines.push(format!("🤑 Your total spend is {}", locale.amount(total)));
    }

    let header = match kind {
        ChatKind::Group => {
            lines.push(format!("👤 User: {}", budget.user_name));
            "Here is the current budget:"
        }
        ChatKind::Private => "Here is your current budget:",
    };
    Reply::text(format!("{header}\n\n{}", lines.join("\n")))
}

pub(crate) fn expense_report(expenses: &[Expense], locale: &dyn Locale) -> Reply {
    if expenses.is_empty() {
        return Reply::text(NO_EXPENSES);
    }

    let mut text = String::from("Here is a report of your expenses:\n\n");
    for expense in expenses {
        text.push_str(&format!("🗓 {}\n", locale.date(expense.date)));
        text.push_str(&format!("💸 Amount: {}\n", locale.amount(expense.amount)));
        text.push_str(&format!("📝 Description: {}\n", expense.description));
        text.push_str(&format!("👤 User: {}\n", expense.user_name));
        text.push_str(SEPARATOR);
        text.push('\n');
    }
    let total: Decimal = expenses.iter().map(|e| e.amount).sum();
    text.push_str(&format!("💰 Total spent: {}", locale.amount(total)));
    Reply::text(text)
}

/// Confirmation for a freshly recorded expense, followed by what is left.
pub(crate) fn expense_receipt(budget: &Budget, expense: &Expense, locale: &dyn Locale) -> Reply {
    let mut text = String::from("📝 You registered a new expense:\n");
    text.push_str(&format!("🗓 Date: {}\n", locale.date(expense.date)));
    text.push_str(&format!("💸 Amount: {}\n", locale.amount(expense.amount)));
    text.push_str(&format!("📝 Description: {}\n", expense.description));
    text.push_str(SEPARATOR);
    text.push('\n');
    match budget.overspend() {
        Some(excess) => text.push_str(&format!(
            "⚠️ You went over your budget by {}",
            locale.amount(excess)
        )),
        None => text.push_str(&format!(
            "💰 You have {} left in your budget",
            locale.amount(budget.current_amount)
        )),
    }
    Reply::text(text)
}

pub(crate) fn budget_created(budget: &Budget, participant: &str, locale: &dyn Locale) -> Reply {
    Reply::text(format!(
        "🤩 Congratulations {participant}, you set up a new budget called {} with an amount of {}.",
        budget.name,
        locale.amount(budget.amount)
    ))
}

pub(crate) fn replace_prompt(existing: &Budget, locale: &dyn Locale) -> Reply {
    Reply::text(format!(
        "Are you sure you want to cancel the budget {} that you created on {} with an amount of {}?",
        existing.name,
        locale.date(existing.created_at),
        locale.amount(existing.amount)
    ))
    .with_buttons(&[Action::ConfirmCancel, Action::DenyCancel])
}
