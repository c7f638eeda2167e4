#![allow(clippy::unwrap_used)]

use std::cell::Cell;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::*;
use crate::chat::{Chat, Sender};
use crate::db::LedgerStore;
use crate::error::ValidationError;
use crate::session::DialogState;
use crate::report::EuroLocale;
use crate::testutil::{ledger_over, FlakyStore};

struct Harness {
    store: FlakyStore,
    router: Router,
    next_id: Cell<u64>,
}

impl Harness {
    fn new() -> Self {
        Self::over(FlakyStore::new())
    }

    fn over(store: FlakyStore) -> Self {
        let router = Router::new(ledger_over(&store), Arc::new(EuroLocale));
        Self {
            store,
            router,
            next_id: Cell::new(1),
        }
    }

    fn update(&self, chat: &Chat, from: &Sender, kind: UpdateKind) -> Update {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        Update {
            id,
            chat: chat.clone(),
            from: from.clone(),
            kind,
        }
    }

    async fn send(&self, chat: &Chat, from: &Sender, kind: UpdateKind) -> Option<Reply> {
        let update = self.update(chat, from, kind);
        self.router.handle(&update).await
    }

    async fn text(&self, chat: &Chat, from: &Sender, text: &str) -> Option<Reply> {
        self.send(chat, from, UpdateKind::Text(text.into())).await
    }

    async fn press(&self, chat: &Chat, from: &Sender, action: Action) -> Option<Reply> {
        self.send(chat, from, UpdateKind::Action(action.name().into()))
            .await
    }

    async fn command(&self, chat: &Chat, from: &Sender, name: &str) -> Reply {
        self.send(chat, from, UpdateKind::Command(name.into()))
            .await
            .unwrap()
    }

    /// Walk the create-budget dialog from the top.
    async fn create(&self, chat: &Chat, from: &Sender, name: &str, amount: &str) -> Reply {
        self.press(chat, from, Action::CreateBudget).await.unwrap();
        self.text(chat, from, name).await.unwrap();
        self.text(chat, from, amount).await.unwrap()
    }

    async fn spend(&self, chat: &Chat, from: &Sender, amount: &str, description: &str) -> Reply {
        self.press(chat, from, Action::RegisterExpense)
            .await
            .unwrap();
        self.text(chat, from, amount).await.unwrap();
        self.text(chat, from, description).await.unwrap()
    }

    async fn state(&self, chat: &Chat, from: &Sender) -> DialogState {
        self.router.session(chat.id, from.id).await.state()
    }
}

fn private(user_id: i64) -> Chat {
    Chat {
        id: user_id,
        kind: ChatKind::Private,
        title: None,
    }
}

fn group() -> Chat {
    Chat {
        id: -100,
        kind: ChatKind::Group,
        title: Some("Flatmates".into()),
    }
}

fn alice() -> Sender {
    Sender {
        id: 1,
        name: "Alice".into(),
    }
}

fn bob() -> Sender {
    Sender {
        id: 2,
        name: "Bob".into(),
    }
}

fn actions(reply: &Reply) -> Vec<Action> {
    reply.buttons.iter().map(|b| b.action).collect()
}

// ── Actions and commands ──────────────────────────────────────

#[test]
fn test_action_names_round_trip() {
    for action in Action::ALL {
        assert_eq!(Action::parse(action.name()), Some(action));
    }
    assert_eq!(Action::parse("dropTables"), None);
}

#[test]
fn test_command_name_normalization() {
    assert_eq!(command_name("/start"), "start");
    assert_eq!(command_name("start@BudgetBot"), "start");
    assert_eq!(command_name("/MENU extra words"), "menu");
    assert_eq!(command_name(""), "");
}

#[test]
fn test_levenshtein() {
    assert_eq!(levenshtein("menu", "menu"), 0);
    assert_eq!(levenshtein("mneu", "menu"), 2);
    assert_eq!(levenshtein("", "help"), 4);
}

#[tokio::test]
async fn test_start_in_private_and_group() {
    let h = Harness::new();
    let reply = h.command(&private(1), &alice(), "start").await;
    assert!(reply.text.contains("Luna"));
    assert_eq!(actions(&reply), [Action::CreateBudget]);

    let reply = h.command(&group(), &alice(), "start").await;
    assert!(reply.text.contains("members of Flatmates"));
}

#[tokio::test]
async fn test_menu_offers_four_actions() {
    let h = Harness::new();
    let reply = h.command(&private(1), &alice(), "menu").await;
    assert_eq!(actions(&reply), Action::MENU);
    assert_eq!(reply.buttons[0].label, "💰 Create budget");
}

#[tokio::test]
async fn test_help_lists_every_command() {
    let h = Harness::new();
    let text = h.command(&private(1), &alice(), "help").await.text;
    for name in ["/start", "/menu", "/help"] {
        assert!(text.contains(name), "missing {name}");
    }
}

#[tokio::test]
async fn test_unknown_command_suggests_closest() {
    let h = Harness::new();
    let reply = h.command(&private(1), &alice(), "mneu").await;
    assert_eq!(reply.text, "Unknown command: /mneu. Did you mean /menu?");
}

#[tokio::test]
async fn test_unknown_action_is_dropped() {
    let h = Harness::new();
    let reply = h
        .send(&private(1), &alice(), UpdateKind::Action("launchRocket".into()))
        .await;
    assert!(reply.is_none());
}

#[tokio::test]
async fn test_commands_leave_dialog_alone() {
    let h = Harness::new();
    let chat = private(1);
    h.press(&chat, &alice(), Action::CreateBudget).await;
    h.command(&chat, &alice(), "menu").await;
    assert_eq!(h.state(&chat, &alice()).await, DialogState::AwaitingBudgetName);
}

// ── Dialogs ───────────────────────────────────────────────────

#[tokio::test]
async fn test_groceries_scenario() {
    let h = Harness::new();
    let chat = private(1);

    let reply = h.press(&chat, &alice(), Action::CreateBudget).await.unwrap();
    assert_eq!(reply.text, report::ASK_BUDGET_NAME);
    let reply = h.text(&chat, &alice(), "Groceries").await.unwrap();
    assert_eq!(reply.text, report::ASK_BUDGET_AMOUNT);
    let reply = h.text(&chat, &alice(), "100").await.unwrap();
    assert!(reply.text.contains("Congratulations Alice"));
    assert!(reply.text.contains("100.00€"));
    assert_eq!(h.state(&chat, &alice()).await, DialogState::Idle);

    let receipt = h.spend(&chat, &alice(), "30", "Milk").await;
    assert!(receipt.text.contains("70.00€ left"));
    let receipt = h.spend(&chat, &alice(), "80", "Cheese board").await;
    assert!(receipt.text.contains("over your budget by 10.00€"));

    let summary = h.press(&chat, &alice(), Action::CurrentBudget).await.unwrap();
    assert!(summary.text.contains("Current amount: -10.00€"));
    assert!(summary.text.contains("exceeded your budget by 10.00€"));
    assert!(summary.text.contains("total spend is 110.00€"));

    let budget = h.store.inner.find_active(1, chat.id).await.unwrap().unwrap();
    assert_eq!(budget.current_amount, dec!(-10));
    assert!(budget.balance_holds());
}

#[tokio::test]
async fn test_bad_amounts_reprompt_at_same_step() {
    let h = Harness::new();
    let chat = private(1);
    h.press(&chat, &alice(), Action::CreateBudget).await;
    h.text(&chat, &alice(), "Groceries").await;

    for input in ["-3", "0", "abc"] {
        let reply = h.text(&chat, &alice(), input).await.unwrap();
        assert_eq!(
            reply.text,
            report::invalid_input(ValidationError::NonPositiveAmount),
            "input: {input}"
        );
        assert_eq!(
            h.state(&chat, &alice()).await,
            DialogState::AwaitingBudgetAmount
        );
    }
    assert!(h.store.inner.find_active(1, chat.id).await.unwrap().is_none());

    let reply = h.text(&chat, &alice(), "12,50").await.unwrap();
    assert!(reply.text.contains("12.50€"));
}

#[tokio::test]
async fn test_register_expense_without_budget() {
    let h = Harness::new();
    let chat = private(1);
    let reply = h
        .press(&chat, &alice(), Action::RegisterExpense)
        .await
        .unwrap();
    assert_eq!(reply.text, report::NO_ACTIVE_BUDGET);
    assert_eq!(h.state(&chat, &alice()).await, DialogState::Idle);
}

#[tokio::test]
async fn test_idle_text_hint_only_in_private() {
    let h = Harness::new();
    let reply = h.text(&private(1), &alice(), "hello").await.unwrap();
    assert_eq!(reply.text, report::IDLE_HINT);
    assert!(h.text(&group(), &alice(), "hello").await.is_none());
}

#[tokio::test]
async fn test_action_discards_draft_in_flight() {
    let h = Harness::new();
    let chat = private(1);
    h.create(&chat, &alice(), "Groceries", "100").await;
    h.press(&chat, &alice(), Action::RegisterExpense).await;
    h.text(&chat, &alice(), "30").await;

    h.press(&chat, &alice(), Action::RegisterExpense).await;
    assert_eq!(
        h.state(&chat, &alice()).await,
        DialogState::AwaitingExpenseAmount
    );
    assert!(h.router.sessions.get(chat.id, 1).await.draft_expense().amount.is_none());
}

#[tokio::test]
async fn test_abandon_returns_to_idle() {
    let h = Harness::new();
    let chat = private(1);
    h.press(&chat, &alice(), Action::CreateBudget).await;
    h.router.abandon(chat.id, 1).await;
    assert_eq!(h.state(&chat, &alice()).await, DialogState::Idle);
}

// ── Replacing a budget ────────────────────────────────────────

#[tokio::test]
async fn test_create_while_active_asks_first() {
    let h = Harness::new();
    let chat = private(1);
    h.create(&chat, &alice(), "Groceries", "100").await;

    let prompt = h.press(&chat, &alice(), Action::CreateBudget).await.unwrap();
    assert!(prompt.text.contains("Groceries"));
    assert_eq!(actions(&prompt), [Action::ConfirmCancel, Action::DenyCancel]);
    assert_eq!(h.state(&chat, &alice()).await, DialogState::Idle);

    let reply = h.press(&chat, &alice(), Action::DenyCancel).await.unwrap();
    assert_eq!(reply.text, report::BUDGET_KEPT);
    let active = h.store.inner.find_active(1, chat.id).await.unwrap().unwrap();
    assert_eq!(active.name, "Groceries");
    assert_eq!(h.store.inner.budgets_of(1, chat.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_confirm_cancel_then_new_budget() {
    let h = Harness::new();
    let chat = private(1);
    h.create(&chat, &alice(), "Groceries", "100").await;
    h.press(&chat, &alice(), Action::CreateBudget).await;

    let reply = h.press(&chat, &alice(), Action::ConfirmCancel).await.unwrap();
    assert_eq!(reply.text, report::BUDGET_REPLACED);
    assert_eq!(h.state(&chat, &alice()).await, DialogState::AwaitingBudgetName);
    assert!(h.store.inner.find_active(1, chat.id).await.unwrap().is_none());

    h.text(&chat, &alice(), "Holiday").await;
    h.text(&chat, &alice(), "900").await;

    let history = h.store.inner.budgets_of(1, chat.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(!history[0].active);
    assert!(history[0].end_at.is_some());
    assert!(history[1].active);
    assert_eq!(history[1].name, "Holiday");
}

#[tokio::test]
async fn test_conflict_at_amount_step_prompts_and_keeps_dialog() {
    let h = Harness::new();
    let chat = private(1);
    h.press(&chat, &alice(), Action::CreateBudget).await;
    h.text(&chat, &alice(), "Groceries").await;

    // Another path opened a budget while this dialog was waiting.
    h.router
        .ledger
        .create_budget(NewBudget {
            name: "Rent".into(),
            amount: dec!(700),
            user_id: 1,
            chat_id: chat.id,
            user_name: "Alice".into(),
        })
        .await
        .unwrap();

    let reply = h.text(&chat, &alice(), "100").await.unwrap();
    assert!(reply.text.contains("Rent"));
    assert_eq!(actions(&reply), [Action::ConfirmCancel, Action::DenyCancel]);
    let session = h.router.sessions.get(chat.id, 1).await;
    assert_eq!(session.draft_budget().name.as_deref(), Some("Groceries"));
}

// ── Group chats ───────────────────────────────────────────────

#[tokio::test]
async fn test_group_member_registers_on_owners_budget() {
    let h = Harness::new();
    let chat = group();
    h.create(&chat, &alice(), "Household", "200").await;

    let receipt = h.spend(&chat, &bob(), "25", "Detergent").await;
    assert!(receipt.text.contains("175.00€ left"));

    let budget = h.store.inner.find_active(1, chat.id).await.unwrap().unwrap();
    assert_eq!(budget.user_id, 1);
    assert_eq!(budget.user_name, "Alice");
    assert_eq!(budget.expenses[0].user_name, "Bob");

    let summary = h.press(&chat, &bob(), Action::CurrentBudget).await.unwrap();
    assert!(summary.text.contains("👤 User: Alice"));
    let report = h.press(&chat, &bob(), Action::ExpenseReport).await.unwrap();
    assert!(report.text.contains("👤 User: Bob"));
}

#[tokio::test]
async fn test_group_dialogs_are_per_participant() {
    let h = Harness::new();
    let chat = group();
    h.create(&chat, &alice(), "Household", "200").await;

    h.press(&chat, &alice(), Action::RegisterExpense).await;
    h.press(&chat, &bob(), Action::RegisterExpense).await;
    h.text(&chat, &alice(), "10").await;
    h.text(&chat, &bob(), "20").await;
    h.text(&chat, &bob(), "Bob's lunch").await;
    h.text(&chat, &alice(), "Alice's coffee").await;

    let budget = h.store.inner.find_active(1, chat.id).await.unwrap().unwrap();
    let spent: Vec<(String, Decimal)> = budget
        .expenses
        .iter()
        .map(|e| (e.user_name.clone(), e.amount))
        .collect();
    assert_eq!(
        spent,
        [("Bob".to_string(), dec!(20)), ("Alice".to_string(), dec!(10))]
    );
    assert_eq!(budget.current_amount, dec!(170));
}

// ── Reports ───────────────────────────────────────────────────

#[tokio::test]
async fn test_expense_report_states() {
    let h = Harness::new();
    let chat = private(1);
    let reply = h.press(&chat, &alice(), Action::ExpenseReport).await.unwrap();
    assert_eq!(reply.text, report::NO_ACTIVE_BUDGET);
    let reply = h.press(&chat, &alice(), Action::CurrentBudget).await.unwrap();
    assert_eq!(reply.text, report::NO_ACTIVE_BUDGET);

    h.create(&chat, &alice(), "Groceries", "100").await;
    let reply = h.press(&chat, &alice(), Action::ExpenseReport).await.unwrap();
    assert_eq!(reply.text, report::NO_EXPENSES);

    h.spend(&chat, &alice(), "30", "Milk").await;
    h.spend(&chat, &alice(), "2,5", "Bread").await;
    let reply = h.press(&chat, &alice(), Action::ExpenseReport).await.unwrap();
    assert!(reply.text.ends_with("Total spent: 32.50€"));
}

// ── Failures and redelivery ───────────────────────────────────

#[tokio::test]
async fn test_store_failure_leaves_session_untouched() {
    let h = Harness::new();
    let chat = private(1);
    h.press(&chat, &alice(), Action::CreateBudget).await;
    h.text(&chat, &alice(), "Groceries").await;

    h.store.set_failing(true);
    let reply = h.text(&chat, &alice(), "100").await.unwrap();
    assert_eq!(reply.text, report::REQUEST_FAILED);
    let session = h.router.sessions.get(chat.id, 1).await;
    assert_eq!(session.state(), DialogState::AwaitingBudgetAmount);
    assert_eq!(session.draft_budget().name.as_deref(), Some("Groceries"));

    let reply = h.press(&chat, &alice(), Action::CurrentBudget).await.unwrap();
    assert_eq!(reply.text, report::REQUEST_FAILED);

    h.store.set_failing(false);
    let reply = h.text(&chat, &alice(), "100").await.unwrap();
    assert!(reply.text.contains("Congratulations"));
}

#[tokio::test]
async fn test_busy_store_does_not_record_expense_twice() {
    let h = Harness::over(FlakyStore::with_lock_timeout(Duration::from_millis(50)));
    let chat = private(1);
    h.create(&chat, &alice(), "Groceries", "100").await;
    h.press(&chat, &alice(), Action::RegisterExpense).await;
    h.text(&chat, &alice(), "30").await;

    h.store.hold_next_append(Duration::from_millis(200));
    let reply = h.text(&chat, &alice(), "Milk").await.unwrap();
    assert_eq!(reply.text, report::REQUEST_FAILED);
    assert_eq!(
        h.state(&chat, &alice()).await,
        DialogState::AwaitingExpenseDescription
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    let budget = h.store.inner.find_active(1, chat.id).await.unwrap().unwrap();
    assert!(budget.expenses.is_empty());
    assert_eq!(budget.current_amount, dec!(100));

    let reply = h.text(&chat, &alice(), "Milk").await.unwrap();
    assert!(reply.text.contains("70.00€ left"));
    let budget = h.store.inner.find_active(1, chat.id).await.unwrap().unwrap();
    assert_eq!(budget.expenses.len(), 1);
    assert_eq!(budget.current_amount, dec!(70));
}

#[tokio::test]
async fn test_budget_closed_mid_dialog_resets() {
    let h = Harness::new();
    let chat = private(1);
    h.create(&chat, &alice(), "Groceries", "100").await;
    h.press(&chat, &alice(), Action::RegisterExpense).await;
    h.text(&chat, &alice(), "30").await;

    h.router.ledger.deactivate_budget(1, chat.id).await.unwrap();

    let reply = h.text(&chat, &alice(), "Milk").await.unwrap();
    assert_eq!(reply.text, report::NO_ACTIVE_BUDGET);
    assert_eq!(h.state(&chat, &alice()).await, DialogState::Idle);
}

#[tokio::test]
async fn test_redelivered_update_is_not_applied_twice() {
    let h = Harness::new();
    let chat = private(1);
    h.create(&chat, &alice(), "Groceries", "100").await;
    h.press(&chat, &alice(), Action::RegisterExpense).await;
    h.text(&chat, &alice(), "30").await;

    let update = h.update(&chat, &alice(), UpdateKind::Text("Milk".into()));
    let first = h.router.handle(&update).await;
    let second = h.router.handle(&update).await;
    assert!(first.is_some());
    assert_eq!(first, second);

    let budget = h.store.inner.find_active(1, chat.id).await.unwrap().unwrap();
    assert_eq!(budget.expenses.len(), 1);
    assert_eq!(budget.current_amount, dec!(70));
}

#[tokio::test]
async fn test_late_redelivery_does_not_consume_newer_draft() {
    let h = Harness::new();
    let chat = private(1);
    h.create(&chat, &alice(), "Groceries", "100").await;
    h.press(&chat, &alice(), Action::RegisterExpense).await;
    h.text(&chat, &alice(), "30").await;

    let milk = h.update(&chat, &alice(), UpdateKind::Text("Milk".into()));
    let first = h.router.handle(&milk).await;

    // The participant moves on before the redelivery arrives.
    h.press(&chat, &alice(), Action::RegisterExpense).await;
    h.text(&chat, &alice(), "5").await;
    let again = h.router.handle(&milk).await;
    assert_eq!(first, again);

    let budget = h.store.inner.find_active(1, chat.id).await.unwrap().unwrap();
    let recorded: Vec<_> = budget
        .expenses
        .iter()
        .map(|e| (e.amount, e.description.as_str()))
        .collect();
    assert_eq!(recorded, vec![(dec!(30), "Milk")]);
    assert_eq!(budget.current_amount, dec!(70));

    let session = h.router.session(chat.id, 1).await;
    assert_eq!(session.state(), DialogState::AwaitingExpenseDescription);
    assert_eq!(session.draft_expense().amount, Some(dec!(5)));
}

#[tokio::test]
async fn test_failed_update_is_retried_on_redelivery() {
    let h = Harness::new();
    let chat = private(1);
    h.press(&chat, &alice(), Action::CreateBudget).await;
    h.text(&chat, &alice(), "Groceries").await;

    let update = h.update(&chat, &alice(), UpdateKind::Text("100".into()));
    h.store.set_failing(true);
    assert_eq!(
        h.router.handle(&update).await.unwrap().text,
        report::REQUEST_FAILED
    );
    h.store.set_failing(false);
    let reply = h.router.handle(&update).await.unwrap();
    assert!(reply.text.contains("Congratulations"));
}

#[tokio::test]
async fn test_concurrent_participants_in_separate_chats() {
    let h = Harness::new();
    let (chat_a, chat_b) = (private(1), private(2));

    let a = async {
        h.create(&chat_a, &alice(), "Groceries", "100").await;
        h.spend(&chat_a, &alice(), "30", "Milk").await
    };
    let b = async {
        h.create(&chat_b, &bob(), "Books", "40").await;
        h.spend(&chat_b, &bob(), "15", "Novel").await
    };
    let (receipt_a, receipt_b) = tokio::join!(a, b);
    assert!(receipt_a.text.contains("70.00€ left"));
    assert!(receipt_b.text.contains("25.00€ left"));

    let books = h.store.inner.find_active(2, chat_b.id).await.unwrap().unwrap();
    assert_eq!(books.name, "Books");
    assert_eq!(books.expenses.len(), 1);
}
