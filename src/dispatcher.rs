//! Long-polling update loop.
//!
//! The [`Dispatcher`] owns the update offset, pulls batches through
//! [`BotApi::get_updates`] and hands every message to its own task. A message
//! is routed to the [`CommandRouter`] when it starts with `/`, otherwise it
//! gets the default reply.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::BotApi;
use crate::commands::{CommandHandler, CommandRouter, COMMAND_MARKER};
use crate::config::PollingConfig;
use crate::error::DispatchError;
use crate::types::Message;

/// Reply sent for plain text when no default handler is installed.
pub fn default_reply(text: &str) -> String {
    format!("Received your message: {}", text)
}

/// Per-message behavior: command routing, or the default action.
#[derive(Clone, Default)]
pub struct MessageHandler {
    router: Option<Arc<CommandRouter>>,
    fallback: Option<Arc<dyn CommandHandler>>,
}

impl MessageHandler {
    pub fn new(router: Option<Arc<CommandRouter>>) -> Self {
        Self {
            router,
            fallback: None,
        }
    }

    /// Commands go to the router (dropped silently without one). Other
    /// non-empty text goes to the fallback handler, or is echoed back.
    /// Failures are logged and never returned.
    pub async fn handle(&self, cancel: &CancellationToken, bot: Arc<dyn BotApi>, message: Arc<Message>) {
        info!(
            chat_id = message.chat.id,
            message_id = message.message_id,
            "Message from {}: {}",
            message.sender_name(),
            message.text
        );

        if message.text.starts_with(COMMAND_MARKER) {
            if let Some(router) = &self.router {
                if !router.execute(cancel, bot, message).await {
                    debug!("No handler for command");
                }
            }
            return;
        }

        if message.text.is_empty() {
            return;
        }

        if let Some(fallback) = &self.fallback {
            fallback.handle(cancel.clone(), bot, message).await;
            return;
        }

        let reply = default_reply(&message.text);
        if let Err(e) = bot.send_message(message.chat.id, &reply, cancel).await {
            error!(chat_id = message.chat.id, "Error sending reply: {}", e);
        }
    }
}

pub struct DispatcherBuilder {
    api: Arc<dyn BotApi>,
    handler: MessageHandler,
    config: PollingConfig,
    offset: i64,
}

impl DispatcherBuilder {
    pub fn router(mut self, router: Arc<CommandRouter>) -> Self {
        self.handler.router = Some(router);
        self
    }

    /// Replaces the echo reply for non-command text.
    pub fn default_handler<H>(mut self, handler: H) -> Self
    where
        H: CommandHandler + 'static,
    {
        self.handler.fallback = Some(Arc::new(handler));
        self
    }

    pub fn polling(mut self, config: PollingConfig) -> Self {
        self.config = config;
        self
    }

    /// Starting offset. Only useful when the caller tracked it elsewhere.
    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = offset.max(0);
        self
    }

    pub fn build(self) -> Dispatcher {
        let in_flight = self
            .config
            .max_in_flight
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

        Dispatcher {
            api: self.api,
            handler: Arc::new(self.handler),
            config: self.config,
            offset: self.offset,
            in_flight,
        }
    }
}

pub struct Dispatcher {
    api: Arc<dyn BotApi>,
    handler: Arc<MessageHandler>,
    config: PollingConfig,
    /// Lowest update id not yet consumed. Only `run` writes it.
    offset: i64,
    in_flight: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    pub fn builder(api: Arc<dyn BotApi>) -> DispatcherBuilder {
        DispatcherBuilder {
            api,
            handler: MessageHandler::default(),
            config: PollingConfig::default(),
            offset: 0,
        }
    }

    pub fn new(api: Arc<dyn BotApi>, router: Option<Arc<CommandRouter>>) -> Self {
        let mut builder = Self::builder(api);
        builder.handler = MessageHandler::new(router);
        builder.build()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Verifies the token, then polls until `cancel` fires.
    ///
    /// Returns `Ok(())` once cancelled and `Err` only when the credential
    /// check fails; fetch errors are logged and retried after a pause.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), DispatchError> {
        info!("Starting bot...");

        let me = match self.api.get_me(&cancel).await {
            Ok(me) => me,
            Err(_) if cancel.is_cancelled() => {
                info!("Shutdown signaled before the bot was verified");
                return Ok(());
            }
            Err(e) => return Err(DispatchError::Verification(e)),
        };
        info!(
            "Bot started: @{} ({})",
            me.username.as_deref().unwrap_or_default(),
            me.first_name
        );

        // With a drain window, handlers outlive the shutdown signal until the
        // window closes; otherwise they share the loop's token.
        let drain_timeout = self.config.drain_timeout();
        let task_cancel = match drain_timeout {
            Some(_) => CancellationToken::new(),
            None => cancel.clone(),
        };

        let mut tasks = JoinSet::new();
        info!("Waiting for messages...");

        'poll: loop {
            if cancel.is_cancelled() {
                break;
            }
            reap(&mut tasks);

            let updates = match self.api.get_updates(self.offset, &cancel).await {
                Ok(updates) => updates,
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let backoff = self.config.error_backoff();
                    error!(offset = self.offset, transient = e.is_transient(), "Error fetching updates: {} (retrying in {:?})", e, backoff);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => continue,
                    }
                }
            };

            for update in updates {
                self.advance(update.update_id);

                let Some(message) = update.message else {
                    debug!(update_id = update.update_id, "Update without message");
                    continue;
                };

                let Some(permit) = self.acquire_slot(&cancel).await else {
                    break 'poll;
                };

                let api = self.api.clone();
                let handler = self.handler.clone();
                let task_cancel = task_cancel.clone();
                let message = Arc::new(message);
                tasks.spawn(async move {
                    let _permit = permit;
                    handler.handle(&task_cancel, api, message).await;
                });
            }

            debug!(offset = self.offset, in_flight = tasks.len(), "Batch dispatched");
        }

        info!("Shutdown signaled, stopping bot...");
        drain(tasks, drain_timeout, &task_cancel).await;
        Ok(())
    }

    /// Moves the offset past `update_id`. Never moves it backwards, and
    /// saturates at `i64::MAX`.
    fn advance(&mut self, update_id: i64) {
        self.offset = self.offset.max(update_id.saturating_add(1));
    }

    /// Waits for a free handler slot when concurrency is bounded.
    /// `Some(None)` means unbounded; `None` means shutdown won the race.
    async fn acquire_slot(
        &self,
        cancel: &CancellationToken,
    ) -> Option<Option<OwnedSemaphorePermit>> {
        let Some(semaphore) = &self.in_flight else {
            return Some(None);
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = semaphore.clone().acquire_owned() => permit.ok().map(Some),
        }
    }
}

/// Collects finished message tasks so the set does not grow without bound.
fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            error!("Message task failed: {}", e);
        }
    }
}

/// Gives in-flight message tasks up to `timeout` to finish, then detaches the
/// rest. Tasks are never aborted.
async fn drain(mut tasks: JoinSet<()>, timeout: Option<Duration>, task_cancel: &CancellationToken) {
    reap(&mut tasks);

    if let Some(limit) = timeout {
        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "Waiting for in-flight messages");
            let finished = tokio::time::timeout(limit, async {
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        error!("Message task failed: {}", e);
                    }
                }
            })
            .await;

            if finished.is_err() {
                warn!(remaining = tasks.len(), "Drain timeout elapsed, detaching message tasks");
            }
        }
        task_cancel.cancel();
    }

    tasks.detach_all();
}
