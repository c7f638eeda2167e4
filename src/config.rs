use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::chat::{Chat, ChatKind, Sender};

const DEFAULT_STORE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Config {
    pub(crate) db_path: PathBuf,
    pub(crate) store_timeout: Duration,
    pub(crate) retry_delay: Duration,
    pub(crate) max_in_flight: usize,
    /// Who the console speaks as until a line says otherwise.
    pub(crate) chat: Chat,
    pub(crate) sender: Sender,
}

/// What the command line asked for.
#[derive(Debug, PartialEq)]
pub(crate) enum Invocation {
    Serve(Config),
    Help,
    Version,
}

impl Config {
    /// Read configuration from `BUDGETBOT_*` variables, then apply
    /// command-line overrides.
    pub(crate) fn load(args: &[String]) -> Result<Invocation> {
        Self::from_sources(args, |key| std::env::var(key).ok())
    }

    fn from_sources(args: &[String], env: impl Fn(&str) -> Option<String>) -> Result<Invocation> {
        let mut db_path = env("BUDGETBOT_DB").map(PathBuf::from);

        let mut rest = args.iter().skip(1);
        while let Some(arg) = rest.next() {
            match arg.as_str() {
                "--help" | "-h" => return Ok(Invocation::Help),
                "--version" | "-V" => return Ok(Invocation::Version),
                "--db" => {
                    let path = rest.next().context("--db needs a path")?;
                    db_path = Some(PathBuf::from(path));
                }
                other => bail!("Unknown argument: {other}"),
            }
        }

        let db_path = match db_path {
            Some(path) => path,
            None => default_db_path()?,
        };
        let store_timeout = Duration::from_millis(
            parse_var(&env, "BUDGETBOT_STORE_TIMEOUT_MS")?.unwrap_or(DEFAULT_STORE_TIMEOUT_MS),
        );
        let retry_delay = Duration::from_millis(
            parse_var(&env, "BUDGETBOT_RETRY_DELAY_MS")?.unwrap_or(DEFAULT_RETRY_DELAY_MS),
        );
        let max_in_flight: usize = parse_var(&env, "BUDGETBOT_MAX_IN_FLIGHT")?.unwrap_or(1);
        if max_in_flight == 0 {
            bail!("BUDGETBOT_MAX_IN_FLIGHT must be at least 1");
        }

        let user_id: i64 = parse_var(&env, "BUDGETBOT_USER_ID")?.unwrap_or(1);
        let chat_id: i64 = parse_var(&env, "BUDGETBOT_CHAT_ID")?.unwrap_or(user_id);
        let user_name = env("BUDGETBOT_USER_NAME").unwrap_or_else(|| "You".to_string());

        Ok(Invocation::Serve(Config {
            db_path,
            store_timeout,
            retry_delay,
            max_in_flight,
            chat: console_chat(chat_id, None),
            sender: Sender {
                id: user_id,
                name: user_name,
            },
        }))
    }
}

/// Negative ids are groups, as on the usual chat platforms.
pub(crate) fn console_chat(id: i64, title: Option<String>) -> Chat {
    let kind = if id < 0 {
        ChatKind::Group
    } else {
        ChatKind::Private
    };
    Chat { id, kind, title }
}

fn parse_var<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .with_context(|| format!("Invalid value for {key}: {raw:?}"))
        })
        .transpose()
}

fn default_db_path() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "budgetbot", "BudgetBot")
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
    let data_dir = proj_dirs.data_dir();
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    Ok(data_dir.join("budgetbot.db"))
}

pub(crate) fn print_usage() {
    println!("BudgetBot - chat-driven budgets and expenses");
    println!();
    println!("Usage: budgetbot [--db <path>]");
    println!();
    println!("Reads chat lines from stdin and prints replies to stdout:");
    println!("  /command                      Send a command (/start, /menu, /help)");
    println!("  #action                       Press a button (e.g. #createBudget)");
    println!("  anything else                 Send it as a text message");
    println!("  @chat/user[/name[/title]] ... Speak as another participant");
    println!("  ?                             Show the current dialog step");
    println!("  !reset                        Abandon the current dialog");
    println!();
    println!("Options:");
    println!("  --db <path>                   SQLite file (env BUDGETBOT_DB)");
    println!("  --help, -h                    Show this help");
    println!("  --version, -V                 Show version");
    println!();
    println!("Environment:");
    println!("  BUDGETBOT_STORE_TIMEOUT_MS    Bound on store reads and lock waits (default {DEFAULT_STORE_TIMEOUT_MS})");
    println!("  BUDGETBOT_RETRY_DELAY_MS      Delay before redelivery (default {DEFAULT_RETRY_DELAY_MS})");
    println!("  BUDGETBOT_MAX_IN_FLIGHT       Updates handled at once (default 1)");
    println!("  BUDGETBOT_CHAT_ID             Console chat id (default: the user id)");
    println!("  BUDGETBOT_USER_ID             Console user id (default 1)");
    println!("  BUDGETBOT_USER_NAME           Console user name");
    println!("  RUST_LOG                      Log filter (default budgetbot=info)");
}
