//! Gateway listener: the event-driven trigger path. Long-polls the chat
//! provider, filters by the chat-id whitelist, and dispatches accepted
//! messages through the same executor as scheduled jobs. The result goes
//! back to the originating chat regardless of any other configured
//! destination.

pub mod api;
#[cfg(test)]
mod tests;

use crate::config::GatewayConfig;
use crate::executor::{Executor, Invocation};
use crate::jobs::OutputDestination;
use crate::output::Router;
use anyhow::Result;
use api::{TelegramApi, Update};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Whitelist gate. Rejected messages get no dispatch and no reply.
fn accept(config: &GatewayConfig, update: &Update) -> Option<(i64, String)> {
    if !config.is_available() {
        return None;
    }
    let text = update.text.as_deref()?;
    if !config.allowed_chat_ids.contains(&update.chat_id) {
        tracing::warn!(chat_id = update.chat_id, "ignoring message from non-whitelisted chat");
        return None;
    }
    Some((update.chat_id, text.to_string()))
}

pub struct GatewayListener {
    config: GatewayConfig,
    api: TelegramApi,
    executor: Arc<Executor>,
    router: Arc<Router>,
}

impl GatewayListener {
    pub fn new(config: GatewayConfig, executor: Arc<Executor>, router: Arc<Router>) -> Result<Self> {
        if !config.is_available() {
            anyhow::bail!("gateway is disabled or the bot token is unset");
        }
        let api = TelegramApi::new(&config.bot_token);
        Ok(Self {
            config,
            api,
            executor,
            router,
        })
    }

    /// Poll until cancelled. Transient network errors are retried with
    /// exponential backoff and never terminate the daemon.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        kill: CancellationToken,
        tracker: TaskTracker,
    ) -> Result<()> {
        tracing::info!(
            whitelisted = self.config.allowed_chat_ids.len(),
            "gateway listening for messages"
        );

        let mut offset: i64 = 0;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let updates = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                result = self.api.get_updates(offset, self.config.poll_timeout_secs) => result,
            };

            let updates = match updates {
                Ok(updates) => {
                    backoff = INITIAL_BACKOFF;
                    updates
                }
                Err(error) => {
                    tracing::warn!(%error, "gateway poll failed, retrying in {}s", backoff.as_secs());
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                let Some((chat_id, text)) = accept(&self.config, &update) else {
                    continue;
                };
                self.dispatch(chat_id, text, &kill, &tracker);
            }
        }
    }

    /// Fire-and-forget: each accepted message executes on its own task so
    /// a slow session never blocks the poll loop.
    fn dispatch(&self, chat_id: i64, text: String, kill: &CancellationToken, tracker: &TaskTracker) {
        tracing::info!(chat_id, "dispatching gateway message");

        let invocation = Invocation::for_chat(chat_id, &text, &self.config);
        let executor = Arc::clone(&self.executor);
        let router = Arc::clone(&self.router);
        let kill = kill.clone();

        tracker.spawn(async move {
            let result = executor.execute(&invocation, &kill).await;
            let outcomes = router
                .route(&result, &[OutputDestination::Chat(chat_id)])
                .await;
            for outcome in outcomes {
                if let Err(error) = outcome.delivery {
                    tracing::warn!(chat_id, %error, "gateway reply delivery failed");
                }
            }
        });
    }
}
