use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rust_decimal::Decimal;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::chat::Reply;
use crate::error::ValidationError;
use crate::models::{non_empty, parse_amount};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SessionKey {
    pub(crate) chat_id: i64,
    pub(crate) user_id: i64,
}

impl SessionKey {
    pub(crate) fn new(chat_id: i64, user_id: i64) -> Self {
        Self { chat_id, user_id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DialogState {
    Idle,
    AwaitingBudgetName,
    AwaitingBudgetAmount,
    AwaitingExpenseAmount,
    AwaitingExpenseDescription,
}

impl std::fmt::Display for DialogState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::AwaitingBudgetName => write!(f, "BUDGET_NAME"),
            Self::AwaitingBudgetAmount => write!(f, "BUDGET_AMOUNT"),
            Self::AwaitingExpenseAmount => write!(f, "EXPENSE_AMOUNT"),
            Self::AwaitingExpenseDescription => write!(f, "EXPENSE_DESCRIPTION"),
        }
    }
}

/// A dialog step together with whatever has been collected so far. Drafts
/// live inside the step that needs them, so leaving a step drops its draft.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) enum Dialog {
    #[default]
    Idle,
    AwaitingBudgetName,
    AwaitingBudgetAmount {
        name: String,
    },
    AwaitingExpenseAmount,
    AwaitingExpenseDescription {
        amount: Decimal,
    },
}

impl Dialog {
    pub(crate) fn state(&self) -> DialogState {
        match self {
            Self::Idle => DialogState::Idle,
            Self::AwaitingBudgetName => DialogState::AwaitingBudgetName,
            Self::AwaitingBudgetAmount { .. } => DialogState::AwaitingBudgetAmount,
            Self::AwaitingExpenseAmount => DialogState::AwaitingExpenseAmount,
            Self::AwaitingExpenseDescription { .. } => DialogState::AwaitingExpenseDescription,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct BudgetDraft {
    pub(crate) name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ExpenseDraft {
    pub(crate) amount: Option<Decimal>,
}

/// Input to the dialog state machine. Guards that depend on the ledger are
/// resolved by the caller and passed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionEvent {
    CreateBudget { has_active: bool },
    ConfirmReplace,
    DenyReplace,
    RegisterExpense { has_active: bool },
    Text(String),
}

/// What the caller has to do for a planned step to take effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Effect {
    Ignored,
    AskBudgetName,
    ConfirmReplace,
    /// Close the participant's active budget, then ask for a name.
    ReplaceBudget,
    KeepBudget,
    AskBudgetAmount,
    CreateBudget { name: String, amount: Decimal },
    AskExpenseAmount,
    NoActiveBudget,
    AskExpenseDescription,
    RecordExpense { amount: Decimal, description: String },
    Invalid(ValidationError),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Step {
    pub(crate) next: Dialog,
    pub(crate) effect: Effect,
}

/// How many handled updates are kept for replay, across all sessions.
const RECENT_UPDATES: usize = 256;

#[derive(Debug, Clone, PartialEq)]
struct HandledUpdate {
    key: SessionKey,
    update_id: u64,
    reply: Option<Reply>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Session {
    pub(crate) dialog: Dialog,
}

impl Session {
    pub(crate) fn state(&self) -> DialogState {
        self.dialog.state()
    }

    pub(crate) fn draft_budget(&self) -> BudgetDraft {
        match &self.dialog {
            Dialog::AwaitingBudgetAmount { name } => BudgetDraft {
                name: Some(name.clone()),
            },
            _ => BudgetDraft::default(),
        }
    }

    pub(crate) fn draft_expense(&self) -> ExpenseDraft {
        match &self.dialog {
            Dialog::AwaitingExpenseDescription { amount } => ExpenseDraft {
                amount: Some(*amount),
            },
            _ => ExpenseDraft::default(),
        }
    }

    /// Work out the next dialog step for `event` without applying it.
    ///
    /// Budget and expense actions are accepted in any state and discard
    /// whatever was in flight.
    pub(crate) fn plan(&self, event: SessionEvent) -> Step {
        let step = |next: Dialog, effect: Effect| Step { next, effect };
        let stay = |effect: Effect| Step {
            next: self.dialog.clone(),
            effect,
        };

        match (&self.dialog, event) {
            (_, SessionEvent::CreateBudget { has_active: false }) => {
                step(Dialog::AwaitingBudgetName, Effect::AskBudgetName)
            }
            (_, SessionEvent::CreateBudget { has_active: true }) => {
                step(Dialog::Idle, Effect::ConfirmReplace)
            }
            (_, SessionEvent::ConfirmReplace) => {
                step(Dialog::AwaitingBudgetName, Effect::ReplaceBudget)
            }
            (_, SessionEvent::DenyReplace) => step(Dialog::Idle, Effect::KeepBudget),
            (_, SessionEvent::RegisterExpense { has_active: true }) => {
                step(Dialog::AwaitingExpenseAmount, Effect::AskExpenseAmount)
            }
            (_, SessionEvent::RegisterExpense { has_active: false }) => {
                step(Dialog::Idle, Effect::NoActiveBudget)
            }

            (Dialog::Idle, SessionEvent::Text(_)) => stay(Effect::Ignored),
            (Dialog::AwaitingBudgetName, SessionEvent::Text(text)) => match non_empty(&text) {
                Some(name) => step(
                    Dialog::AwaitingBudgetAmount { name },
                    Effect::AskBudgetAmount,
                ),
                None => stay(Effect::Invalid(ValidationError::EmptyName)),
            },
            (Dialog::AwaitingBudgetAmount { name }, SessionEvent::Text(text)) => {
                match parse_amount(&text) {
                    Ok(amount) => step(
                        Dialog::Idle,
                        Effect::CreateBudget {
                            name: name.clone(),
                            amount,
                        },
                    ),
                    Err(e) => stay(Effect::Invalid(e)),
                }
            }
            (Dialog::AwaitingExpenseAmount, SessionEvent::Text(text)) => {
                match parse_amount(&text) {
                    Ok(amount) => step(
                        Dialog::AwaitingExpenseDescription { amount },
                        Effect::AskExpenseDescription,
                    ),
                    Err(e) => stay(Effect::Invalid(e)),
                }
            }
            (Dialog::AwaitingExpenseDescription { amount }, SessionEvent::Text(text)) => {
                match non_empty(&text) {
                    Some(description) => step(
                        Dialog::Idle,
                        Effect::RecordExpense {
                            amount: *amount,
                            description,
                        },
                    ),
                    None => stay(Effect::Invalid(ValidationError::EmptyDescription)),
                }
            }
        }
    }
}

/// Exclusive access to one participant's session for the length of an event.
/// An idle session is dropped from the manager when its last guard goes.
pub(crate) struct SessionGuard<'a> {
    manager: &'a SessionManager,
    key: SessionKey,
    session: OwnedMutexGuard<Session>,
}

impl SessionGuard<'_> {
    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn plan(&self, event: SessionEvent) -> Step {
        self.session.plan(event)
    }

    pub(crate) fn commit(&mut self, next: Dialog) {
        if next.state() != self.session.state() {
            debug!(
                chat_id = self.key.chat_id,
                user_id = self.key.user_id,
                from = %self.session.state(),
                to = %next.state(),
                "dialog transition"
            );
        }
        self.session.dialog = next;
    }

    pub(crate) fn reset(&mut self) {
        self.commit(Dialog::Idle);
    }

    /// The reply already produced for `update_id`, if this participant's
    /// update is among the recently handled ones. `Some(None)` means it was
    /// handled without a reply.
    pub(crate) fn replay(&self, update_id: u64) -> Option<Option<Reply>> {
        self.manager
            .handled()
            .iter()
            .rev()
            .find(|handled| handled.key == self.key && handled.update_id == update_id)
            .map(|handled| handled.reply.clone())
    }

    pub(crate) fn remember(&mut self, update_id: u64, reply: Option<Reply>) {
        let mut handled = self.manager.handled();
        if handled.len() == RECENT_UPDATES {
            handled.pop_front();
        }
        handled.push_back(HandledUpdate {
            key: self.key,
            update_id,
            reply,
        });
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if self.session.dialog != Dialog::Idle {
            return;
        }
        let mut sessions = self.manager.sessions();
        // Slots are only cloned under the map lock, so two owners (the map
        // and this guard) means nobody is waiting on it.
        let unused = sessions
            .get(&self.key)
            .is_some_and(|slot| {
                Arc::ptr_eq(slot, OwnedMutexGuard::mutex(&self.session))
                    && Arc::strong_count(slot) == 2
            });
        if unused {
            sessions.remove(&self.key);
        }
    }
}

/// Keyed registry of per-participant sessions. Each key has its own lock, so
/// unrelated conversations never wait on each other. Only sessions with a
/// dialog in progress (or a guard out) are kept.
#[derive(Default)]
pub(crate) struct SessionManager {
    sessions: Mutex<HashMap<SessionKey, Arc<AsyncMutex<Session>>>>,
    handled: Mutex<VecDeque<HandledUpdate>>,
}

impl SessionManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionKey, Arc<AsyncMutex<Session>>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handled(&self) -> MutexGuard<'_, VecDeque<HandledUpdate>> {
        self.handled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for exclusive use of the session under `key`, creating it idle on
    /// first use. Held until the returned guard drops.
    pub(crate) async fn lock(&self, key: SessionKey) -> SessionGuard<'_> {
        let slot = Arc::clone(self.sessions().entry(key).or_default());
        SessionGuard {
            manager: self,
            key,
            session: slot.lock_owned().await,
        }
    }

    pub(crate) async fn get(&self, chat_id: i64, user_id: i64) -> Session {
        self.lock(SessionKey::new(chat_id, user_id))
            .await
            .session()
            .clone()
    }

    /// Apply `event` and keep the resulting step regardless of its effect.
    /// The router does not use this: a turn with a ledger effect plans
    /// through [`SessionGuard::plan`] and commits with
    /// [`SessionGuard::commit`] once the effect went through.
    #[cfg(test)]
    pub(crate) async fn transition(
        &self,
        chat_id: i64,
        user_id: i64,
        event: SessionEvent,
    ) -> Session {
        let mut guard = self.lock(SessionKey::new(chat_id, user_id)).await;
        let step = guard.plan(event);
        guard.commit(step.next);
        guard.session().clone()
    }

    pub(crate) async fn reset(&self, chat_id: i64, user_id: i64) {
        self.lock(SessionKey::new(chat_id, user_id)).await.reset();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sessions().len()
    }
}
