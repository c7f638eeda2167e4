//! Line-oriented transport over stdin/stdout, for running the bot locally.
//!
//! Each line is one update: `/name` sends a command, `#name` presses a
//! button, anything else is a text message. A leading
//! `@chat/user[/name[/title]]` switches who is talking; the switch sticks for
//! the following lines. `?` shows the speaker's dialog step and `!reset`
//! abandons it.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin, Stdout};
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use super::{Inbound, Transport};
use crate::chat::{Chat, Reply, Sender, Update, UpdateKind};
use crate::config::console_chat;
use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Speaker {
    pub(crate) chat: Chat,
    pub(crate) sender: Sender,
}

#[derive(Debug, Clone, PartialEq)]
enum Input {
    Kind(UpdateKind),
    Inspect,
    Abandon,
}

pub(crate) struct Console {
    lines: AsyncMutex<Lines<BufReader<Stdin>>>,
    out: AsyncMutex<Stdout>,
    speaker: Mutex<Speaker>,
    next_id: AtomicU64,
}

impl Console {
    pub(crate) fn new(chat: Chat, sender: Sender) -> Self {
        Self {
            lines: AsyncMutex::new(BufReader::new(tokio::io::stdin()).lines()),
            out: AsyncMutex::new(tokio::io::stdout()),
            speaker: Mutex::new(Speaker { chat, sender }),
            next_id: AtomicU64::new(1),
        }
    }

    async fn write(&self, text: &str) -> Result<(), TransportError> {
        let mut out = self.out.lock().await;
        let written = async {
            out.write_all(text.as_bytes()).await?;
            out.flush().await
        }
        .await;
        written.map_err(|e| match e.kind() {
            ErrorKind::BrokenPipe => TransportError::Closed,
            _ => TransportError::Io(e),
        })
    }
}

#[async_trait]
impl Transport for Console {
    async fn next_update(&self) -> Result<Option<Inbound>, TransportError> {
        loop {
            let Some(line) = self.lines.lock().await.next_line().await? else {
                return Ok(None);
            };

            let parsed = {
                let mut speaker = self.speaker.lock().unwrap_or_else(PoisonError::into_inner);
                parse_line(&line, &mut speaker).map(|input| (input, speaker.clone()))
            };
            let (input, speaker) = match parsed {
                Ok((Some(input), speaker)) => (input, speaker),
                Ok((None, _)) => continue,
                Err(problem) => {
                    warn!(%line, %problem, "unreadable console line");
                    self.write(&format!("!! {problem}\n")).await?;
                    continue;
                }
            };

            let (chat_id, user_id) = (speaker.chat.id, speaker.sender.id);
            return Ok(Some(match input {
                Input::Inspect => Inbound::Inspect { chat_id, user_id },
                Input::Abandon => Inbound::Abandon { chat_id, user_id },
                Input::Kind(kind) => Inbound::Update(Update {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    chat: speaker.chat,
                    from: speaker.sender,
                    kind,
                }),
            }));
        }
    }

    async fn send(&self, chat_id: i64, reply: &Reply) -> Result<(), TransportError> {
        self.write(&render(chat_id, reply)).await
    }
}

/// Read one console line, applying any speaker switch to `speaker`.
/// `Ok(None)` means there is nothing to deliver.
fn parse_line(line: &str, speaker: &mut Speaker) -> Result<Option<Input>, String> {
    let line = line.trim();
    let rest = match line.strip_prefix('@') {
        Some(prefixed) => {
            let (who, rest) = prefixed.split_once(char::is_whitespace).unwrap_or((prefixed, ""));
            *speaker = parse_speaker(who, speaker)?;
            rest.trim()
        }
        None => line,
    };

    let input = match rest {
        "" => return Ok(None),
        "?" => Input::Inspect,
        "!reset" => Input::Abandon,
        _ => {
            if let Some(command) = rest.strip_prefix('/') {
                Input::Kind(UpdateKind::Command(command.to_string()))
            } else if let Some(action) = rest.strip_prefix('#') {
                Input::Kind(UpdateKind::Action(action.trim().to_string()))
            } else {
                Input::Kind(UpdateKind::Text(rest.to_string()))
            }
        }
    };
    Ok(Some(input))
}

/// `chat/user[/name[/title]]`. A missing name keeps the current one when the
/// user id is unchanged.
fn parse_speaker(spec: &str, current: &Speaker) -> Result<Speaker, String> {
    let mut parts = spec.split('/');
    let chat_id = parse_id(parts.next(), "chat id", spec)?;
    let user_id = parse_id(parts.next(), "user id", spec)?;
    let name = match parts.next().filter(|n| !n.is_empty()) {
        Some(name) => name.to_string(),
        None if user_id == current.sender.id => current.sender.name.clone(),
        None => format!("user-{user_id}"),
    };
    let title = parts.next().filter(|t| !t.is_empty()).map(str::to_string);
    if parts.next().is_some() {
        return Err(format!("too many parts in participant {spec:?}"));
    }

    Ok(Speaker {
        chat: console_chat(chat_id, title),
        sender: Sender {
            id: user_id,
            name,
        },
    })
}

fn parse_id(part: Option<&str>, what: &str, spec: &str) -> Result<i64, String> {
    part.and_then(|p| p.parse().ok())
        .ok_or_else(|| format!("missing or invalid {what} in participant {spec:?}"))
}

fn render(chat_id: i64, reply: &Reply) -> String {
    let mut out = format!("[{chat_id}] {}\n", reply.text);
    for button in &reply.buttons {
        out.push_str(&format!("    [{}] #{}\n", button.label, button.action.name()));
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::chat::ChatKind;
    use crate::router::Action;

    fn alice_private() -> Speaker {
        Speaker {
            chat: console_chat(1, None),
            sender: Sender {
                id: 1,
                name: "Alice".into(),
            },
        }
    }

    fn parse(line: &str, speaker: &mut Speaker) -> Option<Input> {
        parse_line(line, speaker).unwrap()
    }

    #[test]
    fn test_line_kinds() {
        let mut speaker = alice_private();
        assert_eq!(
            parse("/start", &mut speaker),
            Some(Input::Kind(UpdateKind::Command("start".into())))
        );
        assert_eq!(
            parse("# createBudget", &mut speaker),
            Some(Input::Kind(UpdateKind::Action("createBudget".into())))
        );
        assert_eq!(
            parse("  12,50 ", &mut speaker),
            Some(Input::Kind(UpdateKind::Text("12,50".into())))
        );
        assert_eq!(parse("?", &mut speaker), Some(Input::Inspect));
        assert_eq!(parse("!reset", &mut speaker), Some(Input::Abandon));
        assert_eq!(parse("   ", &mut speaker), None);
        assert_eq!(speaker, alice_private());
    }

    #[test]
    fn test_prefix_switches_speaker() {
        let mut speaker = alice_private();
        let input = parse("@-100/2/Bob/Flatmates #registerExpense", &mut speaker);
        assert_eq!(
            input,
            Some(Input::Kind(UpdateKind::Action("registerExpense".into())))
        );
        assert_eq!(speaker.chat.id, -100);
        assert_eq!(speaker.chat.kind, ChatKind::Group);
        assert_eq!(speaker.chat.title.as_deref(), Some("Flatmates"));
        assert_eq!(speaker.sender.name, "Bob");

        // The switch sticks, and a bare prefix delivers nothing.
        assert_eq!(parse("@-100/2", &mut speaker), None);
        assert_eq!(speaker.sender.name, "Bob");
        parse("@5/7 hi", &mut speaker);
        assert_eq!(speaker.chat.kind, ChatKind::Private);
        assert_eq!(speaker.sender.name, "user-7");
    }

    #[test]
    fn test_bad_prefix_keeps_speaker() {
        let mut speaker = alice_private();
        assert!(parse_line("@abc/1 hi", &mut speaker).is_err());
        assert!(parse_line("@1 hi", &mut speaker).is_err());
        assert!(parse_line("@1/2/a/b/c hi", &mut speaker).is_err());
        assert_eq!(speaker, alice_private());
    }

    #[test]
    fn test_render_lists_buttons() {
        let reply = Reply::text("Pick one").with_buttons(&[Action::ConfirmCancel, Action::DenyCancel]);
        assert_eq!(
            render(-100, &reply),
            "[-100] Pick one\n    [Yes] #confirmCancel\n    [No] #denyCancel\n"
        );
    }
}
