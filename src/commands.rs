//! Slash-command routing.
//!
//! A command is a message whose first whitespace-separated token starts with
//! `/`. An optional `@botname` suffix on that token is ignored when matching,
//! so `/start@mybot` reaches the handler registered as `start`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::BotApi;
use crate::types::Message;

pub const COMMAND_MARKER: char = '/';
pub const SELECTOR_SEPARATOR: char = '@';

/// Behavior bound to a command name.
///
/// Handlers run inside the message's own task, concurrently with handlers for
/// other messages. Shared state they touch must be synchronized by the handler.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, cancel: CancellationToken, bot: Arc<dyn BotApi>, message: Arc<Message>);
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(CancellationToken, Arc<dyn BotApi>, Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, cancel: CancellationToken, bot: Arc<dyn BotApi>, message: Arc<Message>) {
        (self)(cancel, bot, message).await
    }
}

/// Extracts the command name from `text`: marker and selector suffix removed.
///
/// Returns `None` for text that is not a command or whose name is empty
/// (`"/"`, `"/@bot"`, `"/ start"`). An empty name never reaches the router,
/// so a handler registered under `""` is never called.
pub fn parse_command(text: &str) -> Option<&str> {
    if !text.starts_with(COMMAND_MARKER) {
        return None;
    }

    let first = text.split_whitespace().next()?;
    let name = first.strip_prefix(COMMAND_MARKER)?;
    let name = name.split(SELECTOR_SEPARATOR).next().unwrap_or_default();

    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Name-to-handler table. Safe to share across tasks; registration may happen
/// while messages are being routed.
#[derive(Default)]
pub struct CommandRouter {
    commands: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name` (without `/` or `@suffix`) to `handler`, replacing any
    /// previous binding. Names are not validated; an empty name is stored but
    /// can never match (see [`parse_command`]).
    pub fn register<H>(&self, name: impl Into<String>, handler: H)
    where
        H: CommandHandler + 'static,
    {
        let name = name.into();
        debug!(command = %name, "Registered command");
        self.commands
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(handler));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_command<H>(self, name: impl Into<String>, handler: H) -> Self
    where
        H: CommandHandler + 'static,
    {
        self.register(name, handler);
        self
    }

    /// Registered command names, sorted.
    pub fn commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Runs the handler for the command in `message.text`, if any.
    ///
    /// Returns `false` when the text is not a command or names an unknown
    /// command; nothing is invoked in that case. The handler is awaited
    /// inline and receives the whole message, arguments included.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        bot: Arc<dyn BotApi>,
        message: Arc<Message>,
    ) -> bool {
        let Some(name) = parse_command(&message.text) else {
            return false;
        };

        let Some(handler) = self.lookup(name) else {
            debug!(command = name, "Unknown command");
            return false;
        };

        debug!(command = name, chat_id = message.chat.id, "Executing command");
        handler.handle(cancel.clone(), bot, message).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::types::{Chat, ChatKind, Update, User};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct NullBot;

    #[async_trait]
    impl BotApi for NullBot {
        async fn get_me(&self, _cancel: &CancellationToken) -> Result<User> {
            Ok(User {
                id: 1,
                is_bot: true,
                first_name: "Null".to_string(),
                last_name: None,
                username: Some("nullbot".to_string()),
            })
        }

        async fn get_updates(&self, _offset: i64, _cancel: &CancellationToken) -> Result<Vec<Update>> {
            Ok(Vec::new())
        }

        async fn send_message(&self, _chat_id: i64, _text: &str, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    fn bot() -> Arc<dyn BotApi> {
        Arc::new(NullBot)
    }

    fn message(text: &str) -> Arc<Message> {
        Arc::new(Message {
            message_id: 1,
            from: None,
            chat: Chat {
                id: 123,
                kind: ChatKind::Private,
                title: None,
                username: None,
            },
            date: Default::default(),
            text: text.to_string(),
        })
    }

    /// Handler that counts invocations and remembers the last text it saw.
    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<AtomicUsize>,
        last_text: Arc<Mutex<Option<String>>>,
    }

    #[async_trait]
    impl CommandHandler for Recorder {
        async fn handle(&self, _cancel: CancellationToken, _bot: Arc<dyn BotApi>, message: Arc<Message>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_text.lock().unwrap() = Some(message.text.clone());
        }
    }

    impl Recorder {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    async fn run(router: &CommandRouter, text: &str) -> bool {
        router
            .execute(&CancellationToken::new(), bot(), message(text))
            .await
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("/start"), Some("start"));
        assert_eq!(parse_command("/start@mybot"), Some("start"));
        assert_eq!(parse_command("/help@mybot arg1 arg2"), Some("help"));
        assert_eq!(parse_command("/start   arg"), Some("start"));
        assert_eq!(parse_command("/Start"), Some("Start"));
        assert_eq!(parse_command("start"), None);
        assert_eq!(parse_command(" /start"), None);
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("/"), None);
        assert_eq!(parse_command("/ start"), None);
        assert_eq!(parse_command("/@mybot"), None);
    }

    #[tokio::test]
    async fn test_execute_literal_cases() {
        let cases = [
            ("/start", true),
            ("/start@mybot", true),
            ("/start arg1 arg2", true),
            ("/unknown", false),
            ("start", false),
            ("", false),
            ("/", false),
            ("/START", false),
        ];

        for (text, expected) in cases {
            let router = CommandRouter::new();
            let recorder = Recorder::default();
            router.register("start", recorder.clone());

            assert_eq!(run(&router, text).await, expected, "text: {:?}", text);
            assert_eq!(recorder.calls(), usize::from(expected), "text: {:?}", text);
        }
    }

    #[tokio::test]
    async fn test_handler_receives_full_message() {
        let router = CommandRouter::new();
        let recorder = Recorder::default();
        router.register("start", recorder.clone());

        assert!(run(&router, "/start arg1 arg2").await);
        assert_eq!(
            recorder.last_text.lock().unwrap().as_deref(),
            Some("/start arg1 arg2")
        );
    }

    #[tokio::test]
    async fn test_handler_receives_same_message_and_bot() {
        let router = CommandRouter::new();
        let seen: Arc<Mutex<Option<(Arc<dyn BotApi>, Arc<Message>)>>> = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        router.register("start", move |_cancel: CancellationToken, bot: Arc<dyn BotApi>, msg: Arc<Message>| {
            let sink = sink.clone();
            async move {
                *sink.lock().unwrap() = Some((bot, msg));
            }
        });

        let bot = bot();
        let msg = message("/start");
        assert!(router.execute(&CancellationToken::new(), bot.clone(), msg.clone()).await);

        let guard = seen.lock().unwrap();
        let (got_bot, got_msg) = guard.as_ref().unwrap();
        assert!(Arc::ptr_eq(got_bot, &bot));
        assert!(Arc::ptr_eq(got_msg, &msg));
    }

    #[tokio::test]
    async fn test_register_overwrites() {
        let router = CommandRouter::new();
        let first = Recorder::default();
        let second = Recorder::default();

        router.register("start", first.clone());
        router.register("start", second.clone());

        assert_eq!(router.len(), 1);
        assert!(run(&router, "/start").await);
        assert_eq!(first.calls(), 0);
        assert_eq!(second.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_name_never_matches() {
        let router = CommandRouter::new();
        let recorder = Recorder::default();
        router.register("", recorder.clone());

        for text in ["/", "/@mybot", "/ start"] {
            assert!(!run(&router, text).await, "{:?} should not match", text);
        }
        assert_eq!(recorder.calls(), 0);
        assert_eq!(router.commands(), vec![String::new()]);
    }

    #[test]
    fn test_commands_listing() {
        let router = CommandRouter::new()
            .with_command("start", Recorder::default())
            .with_command("help", Recorder::default());

        assert_eq!(router.commands(), vec!["help".to_string(), "start".to_string()]);
        assert!(!router.is_empty());
        assert!(CommandRouter::new().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_execute() {
        let router = Arc::new(CommandRouter::new());
        let recorder = Recorder::default();
        router.register("start", recorder.clone());

        let mut tasks = Vec::new();
        for _ in 0..100 {
            let router = router.clone();
            tasks.push(tokio::spawn(async move { run(&router, "/start").await }));
        }

        for result in futures::future::join_all(tasks).await {
            assert!(result.unwrap());
        }
        assert_eq!(recorder.calls(), 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_register_while_executing() {
        let router = Arc::new(CommandRouter::new());
        let recorder = Recorder::default();
        router.register("start", recorder.clone());

        let writer = {
            let router = router.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    router.register(format!("cmd{}", i), Recorder::default());
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let router = router.clone();
            tasks.push(tokio::spawn(async move { run(&router, "/start").await }));
        }

        writer.await.unwrap();
        for result in futures::future::join_all(tasks).await {
            assert!(result.unwrap());
        }
        assert_eq!(recorder.calls(), 50);
        assert_eq!(router.len(), 51);
    }
}
