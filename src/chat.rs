//! Inbound updates and outbound replies as exchanged with the chat transport.

use crate::router::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChatKind {
    Private,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Chat {
    pub(crate) id: i64,
    pub(crate) kind: ChatKind,
    /// Only groups carry a title.
    pub(crate) title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Sender {
    pub(crate) id: i64,
    pub(crate) name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UpdateKind {
    /// `/name`, without the slash.
    Command(String),
    /// An inline button press carrying the button's action name.
    Action(String),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Update {
    /// Transport-assigned; a redelivered update keeps its id.
    pub(crate) id: u64,
    pub(crate) chat: Chat,
    pub(crate) from: Sender,
    pub(crate) kind: UpdateKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Button {
    pub(crate) label: &'static str,
    pub(crate) action: Action,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    pub(crate) text: String,
    pub(crate) buttons: Vec<Button>,
}

impl Reply {
    pub(crate) fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            buttons: Vec::new(),
        }
    }

    pub(crate) fn with_buttons(mut self, actions: &[Action]) -> Self {
        self.buttons = actions
            .iter()
            .map(|&action| Button {
                label: action.label(),
                action,
            })
            .collect();
        self
    }
}
