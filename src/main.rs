mod chat;
mod config;
mod db;
mod error;
mod ledger;
mod models;
mod report;
mod router;
mod run;
mod session;
#[cfg(test)]
mod testutil;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{Config, Invocation};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config = match Config::load(&args)? {
        Invocation::Serve(config) => config,
        Invocation::Help => {
            config::print_usage();
            return Ok(());
        }
        Invocation::Version => {
            println!("budgetbot {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("budgetbot=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let store = db::SqliteStore::open(&config.db_path, config.store_timeout)?;
    info!(path = %config.db_path.display(), "ledger store opened");

    let ledger = ledger::BudgetLedger::new(Arc::new(store), config.store_timeout);
    let router = Arc::new(router::Router::new(ledger, Arc::new(report::EuroLocale)));
    let console = Arc::new(run::Console::new(config.chat.clone(), config.sender.clone()));

    run::serve(
        router,
        console,
        run::ServeOptions {
            retry_delay: config.retry_delay,
            max_in_flight: config.max_in_flight,
        },
    )
    .await
}
