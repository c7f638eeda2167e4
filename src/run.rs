mod console;

pub(crate) use console::Console;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::chat::{Reply, Update};
use crate::error::TransportError;
use crate::router::Router;
use crate::session::Session;

/// Something read from the transport.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inbound {
    Update(Update),
    /// Operator asks which dialog step a participant is in.
    Inspect { chat_id: i64, user_id: i64 },
    /// Operator drops a participant's dialog.
    Abandon { chat_id: i64, user_id: i64 },
}

/// The chat delivery mechanism: where updates come from and replies go.
#[async_trait]
pub(crate) trait Transport: Send + Sync {
    /// `Ok(None)` once there is nothing more to read.
    async fn next_update(&self) -> Result<Option<Inbound>, TransportError>;

    async fn send(&self, chat_id: i64, reply: &Reply) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ServeOptions {
    pub(crate) retry_delay: Duration,
    pub(crate) max_in_flight: usize,
}

/// Pull updates until the transport runs dry, handling at most
/// `max_in_flight` at a time. With one in flight, updates are handled in
/// arrival order.
pub(crate) async fn serve(
    router: Arc<Router>,
    transport: Arc<dyn Transport>,
    options: ServeOptions,
) -> Result<()> {
    let permits = Arc::new(Semaphore::new(options.max_in_flight.max(1)));
    let mut tasks = JoinSet::new();
    info!(max_in_flight = options.max_in_flight, "serving updates");

    let outcome = loop {
        let inbound = match transport.next_update().await {
            Ok(Some(inbound)) => inbound,
            Ok(None) | Err(TransportError::Closed) => break Ok(()),
            Err(TransportError::Conflict) => {
                warn!(delay = ?options.retry_delay, "receive conflicted, backing off");
                tokio::time::sleep(options.retry_delay).await;
                continue;
            }
            Err(err) => break Err(anyhow::Error::new(err).context("Failed to read updates")),
        };

        let permit = Arc::clone(&permits)
            .acquire_owned()
            .await
            .context("Update limiter closed")?;
        match inbound {
            Inbound::Update(update) => {
                let router = Arc::clone(&router);
                let transport = Arc::clone(&transport);
                tasks.spawn(async move {
                    deliver(&router, transport.as_ref(), &update, options.retry_delay).await;
                    drop(permit);
                });
            }
            Inbound::Inspect { chat_id, user_id } => {
                let session = router.session(chat_id, user_id).await;
                notify(transport.as_ref(), chat_id, describe(&session)).await;
            }
            Inbound::Abandon { chat_id, user_id } => {
                router.abandon(chat_id, user_id).await;
                notify(transport.as_ref(), chat_id, "dialog abandoned".to_string()).await;
            }
        }

        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "update task failed");
            }
        }
    };

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "update task failed");
        }
    }
    info!("update stream ended");
    outcome
}

/// Handle one update and send its reply. A send that conflicts is retried
/// once after `retry_delay`; the router replays the reply it already
/// produced instead of handling the update again.
async fn deliver(router: &Router, transport: &dyn Transport, update: &Update, retry_delay: Duration) {
    let Some(reply) = router.handle(update).await else {
        debug!(update_id = update.id, "no reply");
        return;
    };
    match transport.send(update.chat.id, &reply).await {
        Ok(()) => {}
        Err(TransportError::Conflict) => {
            warn!(update_id = update.id, delay = ?retry_delay, "send conflicted, redelivering once");
            tokio::time::sleep(retry_delay).await;
            let Some(reply) = router.handle(update).await else {
                return;
            };
            if let Err(e) = transport.send(update.chat.id, &reply).await {
                error!(update_id = update.id, error = %e, "redelivery failed");
            }
        }
        Err(e) => error!(update_id = update.id, error = %e, "failed to send reply"),
    }
}

fn describe(session: &Session) -> String {
    let mut text = format!("dialog step: {}", session.state());
    if let Some(name) = session.draft_budget().name {
        text.push_str(&format!(", budget name: {name}"));
    }
    if let Some(amount) = session.draft_expense().amount {
        text.push_str(&format!(", expense amount: {amount}"));
    }
    text
}

async fn notify(transport: &dyn Transport, chat_id: i64, text: String) {
    if let Err(e) = transport.send(chat_id, &Reply::text(text)).await {
        error!(chat_id, error = %e, "failed to send notice");
    }
}
