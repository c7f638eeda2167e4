use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use tracing::{debug, error, warn};

use crate::chat::{ChatKind, Reply, Update, UpdateKind};
use crate::error::LedgerError;
use crate::ledger::BudgetLedger;
use crate::models::{NewBudget, NewExpense};
use crate::report::{self, Locale};
use crate::session::{
    Dialog, Effect, Session, SessionEvent, SessionGuard, SessionKey, SessionManager, Step,
};

/// Inline button actions, named as they travel over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Action {
    CreateBudget,
    CurrentBudget,
    RegisterExpense,
    ExpenseReport,
    ConfirmCancel,
    DenyCancel,
}

impl Action {
    pub(crate) const MENU: [Action; 4] = [
        Action::CreateBudget,
        Action::CurrentBudget,
        Action::RegisterExpense,
        Action::ExpenseReport,
    ];

    const ALL: [Action; 6] = [
        Action::CreateBudget,
        Action::CurrentBudget,
        Action::RegisterExpense,
        Action::ExpenseReport,
        Action::ConfirmCancel,
        Action::DenyCancel,
    ];

    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::CreateBudget => "createBudget",
            Self::CurrentBudget => "currentBudget",
            Self::RegisterExpense => "registerExpense",
            Self::ExpenseReport => "expenseReport",
            Self::ConfirmCancel => "confirmCancel",
            Self::DenyCancel => "denyCancel",
        }
    }

    pub(crate) fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.name() == name)
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            Self::CreateBudget => "💰 Create budget",
            Self::CurrentBudget => "💲 Current budget",
            Self::RegisterExpense => "💸 Register expense",
            Self::ExpenseReport => "📊 Expense report",
            Self::ConfirmCancel => "Yes",
            Self::DenyCancel => "No",
        }
    }
}

// ── Commands ─────────────────────────────────────────────────

pub(crate) struct Command {
    pub(crate) description: &'static str,
    pub(crate) run: fn(&Update) -> Reply,
}

macro_rules! register_command {
    ($name:expr, $desc:expr, $func:expr, $registry:expr) => {{
        $registry.insert(
            $name,
            Command {
                description: $desc,
                run: $func,
            },
        );
    }};
}

pub(crate) static COMMANDS: LazyLock<HashMap<&str, Command>> = LazyLock::new(|| {
    let mut r: HashMap<&str, Command> = HashMap::new();

    register_command!("start", "Start the bot and show the main menu", cmd_start, r);
    register_command!("menu", "Show the main menu", cmd_menu, r);
    register_command!("help", "Show this list of available commands", cmd_help, r);

    r
});

/// `/start@SomeBot extra` and `/START` both resolve to `start`.
fn command_name(input: &str) -> String {
    let word = input.split_whitespace().next().unwrap_or("");
    let word = word.trim_start_matches('/');
    word.split('@').next().unwrap_or("").to_lowercase()
}

fn find_closest(input: &str) -> String {
    COMMANDS
        .keys()
        .min_by_key(|k| levenshtein(input, k))
        .unwrap_or(&"help")
        .to_string()
}

fn levenshtein(a: &str, b: &str) -> usize {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

fn cmd_start(update: &Update) -> Reply {
    report::welcome(&update.chat)
}

fn cmd_menu(_update: &Update) -> Reply {
    report::menu()
}

fn cmd_help(_update: &Update) -> Reply {
    let mut entries: Vec<(&str, &str)> = COMMANDS
        .iter()
        .map(|(name, cmd)| (*name, cmd.description))
        .collect();
    entries.sort_unstable_by_key(|(name, _)| *name);
    report::help(&entries)
}

// ── Routing ──────────────────────────────────────────────────

/// A dialog input, before any ledger lookup its guard needs.
enum Turn {
    CreateBudget,
    RegisterExpense,
    Event(SessionEvent),
}

/// Turns inbound updates into replies, driving the ledger and the
/// per-participant dialogs.
pub(crate) struct Router {
    ledger: BudgetLedger,
    sessions: SessionManager,
    locale: Arc<dyn Locale>,
}

impl Router {
    pub(crate) fn new(ledger: BudgetLedger, locale: Arc<dyn Locale>) -> Self {
        Self {
            ledger,
            sessions: SessionManager::new(),
            locale,
        }
    }

    /// Handle one update. Domain failures are answered, never returned.
    /// Calling this again with an update that was already handled replays
    /// the earlier reply without touching the ledger.
    pub(crate) async fn handle(&self, update: &Update) -> Option<Reply> {
        debug!(
            update_id = update.id,
            chat_id = update.chat.id,
            user_id = update.from.id,
            kind = ?update.kind,
            "handling update"
        );
        match &update.kind {
            UpdateKind::Command(input) => Some(self.command(update, input)),
            UpdateKind::Action(name) => match Action::parse(name) {
                Some(Action::CurrentBudget) => self.current_budget(update).await,
                Some(Action::ExpenseReport) => self.expense_report(update).await,
                Some(Action::CreateBudget) => self.converse(update, Turn::CreateBudget).await,
                Some(Action::RegisterExpense) => {
                    self.converse(update, Turn::RegisterExpense).await
                }
                Some(Action::ConfirmCancel) => {
                    self.converse(update, Turn::Event(SessionEvent::ConfirmReplace))
                        .await
                }
                Some(Action::DenyCancel) => {
                    self.converse(update, Turn::Event(SessionEvent::DenyReplace))
                        .await
                }
                None => {
                    warn!(update_id = update.id, action = %name, "unknown action");
                    None
                }
            },
            UpdateKind::Text(text) => {
                self.converse(update, Turn::Event(SessionEvent::Text(text.clone())))
                    .await
            }
        }
    }

    /// A snapshot of the participant's dialog.
    pub(crate) async fn session(&self, chat_id: i64, user_id: i64) -> Session {
        self.sessions.get(chat_id, user_id).await
    }

    /// Drop whatever dialog the participant is in.
    pub(crate) async fn abandon(&self, chat_id: i64, user_id: i64) {
        self.sessions.reset(chat_id, user_id).await;
    }

    fn command(&self, update: &Update, input: &str) -> Reply {
        let name = command_name(input);
        match COMMANDS.get(name.as_str()) {
            Some(cmd) => (cmd.run)(update),
            None => {
                let suggestion = find_closest(&name);
                debug!(command = %name, %suggestion, "unknown command");
                report::unknown_command(&name, &suggestion)
            }
        }
    }

    async fn current_budget(&self, update: &Update) -> Option<Reply> {
        match self.ledger.active_budget_for_chat(update.chat.id).await {
            Ok(Some(budget)) => Some(report::budget_summary(
                &budget,
                update.chat.kind,
                self.locale.as_ref(),
            )),
            Ok(None) => Some(Reply::text(report::NO_ACTIVE_BUDGET)),
            Err(err) => self.failure(update, err).await,
        }
    }

    async fn expense_report(&self, update: &Update) -> Option<Reply> {
        match self.report_expenses(update.chat.id).await {
            Ok(reply) => Some(reply),
            Err(err) => self.failure(update, err).await,
        }
    }

    async fn report_expenses(&self, chat_id: i64) -> Result<Reply, LedgerError> {
        let expenses = self.ledger.list_expenses(chat_id).await?;
        if expenses.is_empty() && self.ledger.active_budget_for_chat(chat_id).await?.is_none() {
            return Err(LedgerError::NotFound);
        }
        Ok(report::expense_report(&expenses, self.locale.as_ref()))
    }

    /// Run one dialog turn under the participant's session lock. The planned
    /// step is committed only once its effect has gone through.
    async fn converse(&self, update: &Update, turn: Turn) -> Option<Reply> {
        let key = SessionKey::new(update.chat.id, update.from.id);
        let mut guard = self.sessions.lock(key).await;
        if let Some(reply) = guard.replay(update.id) {
            debug!(
                update_id = update.id,
                chat_id = key.chat_id,
                user_id = key.user_id,
                "replaying reply for redelivered update"
            );
            return reply;
        }

        let reply = match self.advance(&guard, update, turn).await {
            Ok((next, reply)) => {
                guard.commit(next);
                reply
            }
            // The budget went away under an open dialog; nothing left to finish.
            Err(LedgerError::NotFound) => {
                guard.reset();
                Some(Reply::text(report::NO_ACTIVE_BUDGET))
            }
            Err(err) => return self.failure(update, err).await,
        };
        guard.remember(update.id, reply.clone());
        reply
    }

    async fn advance(
        &self,
        guard: &SessionGuard<'_>,
        update: &Update,
        turn: Turn,
    ) -> Result<(Dialog, Option<Reply>), LedgerError> {
        let (chat, from) = (&update.chat, &update.from);
        let locale = self.locale.as_ref();

        let mut existing = None;
        let event = match turn {
            Turn::CreateBudget => {
                existing = self.ledger.active_budget(from.id, chat.id).await?;
                SessionEvent::CreateBudget {
                    has_active: existing.is_some(),
                }
            }
            Turn::RegisterExpense => SessionEvent::RegisterExpense {
                has_active: self.ledger.active_budget_for_chat(chat.id).await?.is_some(),
            },
            Turn::Event(event) => event,
        };

        let Step { next, effect } = guard.plan(event);
        let reply = match effect {
            Effect::Ignored => {
                (chat.kind == ChatKind::Private).then(|| Reply::text(report::IDLE_HINT))
            }
            Effect::AskBudgetName => Some(Reply::text(report::ASK_BUDGET_NAME)),
            Effect::ConfirmReplace => existing
                .as_ref()
                .map(|budget| report::replace_prompt(budget, locale)),
            Effect::ReplaceBudget => {
                self.ledger.deactivate_budget(from.id, chat.id).await?;
                Some(Reply::text(report::BUDGET_REPLACED))
            }
            Effect::KeepBudget => Some(Reply::text(report::BUDGET_KEPT)),
            Effect::AskBudgetAmount => Some(Reply::text(report::ASK_BUDGET_AMOUNT)),
            Effect::CreateBudget { name, amount } => {
                let budget = self
                    .ledger
                    .create_budget(NewBudget {
                        name,
                        amount,
                        user_id: from.id,
                        chat_id: chat.id,
                        user_name: from.name.clone(),
                    })
                    .await?;
                Some(report::budget_created(&budget, &from.name, locale))
            }
            Effect::AskExpenseAmount => Some(Reply::text(report::ASK_EXPENSE_AMOUNT)),
            Effect::NoActiveBudget => Some(Reply::text(report::NO_ACTIVE_BUDGET)),
            Effect::AskExpenseDescription => Some(Reply::text(report::ASK_EXPENSE_DESCRIPTION)),
            Effect::RecordExpense {
                amount,
                description,
            } => {
                let budget = self
                    .ledger
                    .add_expense(
                        chat.id,
                        NewExpense {
                            amount,
                            description,
                            user_id: from.id,
                            user_name: from.name.clone(),
                        },
                    )
                    .await?;
                budget
                    .expenses
                    .last()
                    .map(|expense| report::expense_receipt(&budget, expense, locale))
            }
            Effect::Invalid(e) => Some(Reply::text(report::invalid_input(e))),
        };
        Ok((next, reply))
    }

    /// The reply for a failed turn. The session is left as it was.
    async fn failure(&self, update: &Update, err: LedgerError) -> Option<Reply> {
        match &err {
            LedgerError::Validation(e) => Some(Reply::text(report::invalid_input(*e))),
            LedgerError::NotFound => Some(Reply::text(report::NO_ACTIVE_BUDGET)),
            LedgerError::Conflict => {
                warn!(
                    update_id = update.id,
                    chat_id = update.chat.id,
                    user_id = update.from.id,
                    "budget already active"
                );
                match self.ledger.active_budget(update.from.id, update.chat.id).await {
                    Ok(Some(existing)) => {
                        Some(report::replace_prompt(&existing, self.locale.as_ref()))
                    }
                    _ => Some(Reply::text(report::REQUEST_FAILED)),
                }
            }
            LedgerError::Store(_) => {
                error!(
                    update_id = update.id,
                    chat_id = update.chat.id,
                    user_id = update.from.id,
                    error = %err,
                    "failed to handle update"
                );
                Some(Reply::text(report::REQUEST_FAILED))
            }
        }
    }
}

#[cfg(test)]
mod tests;
