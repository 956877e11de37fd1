//! # pollbot
//!
//! Long-polling client for the Telegram Bot API: a [`Dispatcher`] that pulls
//! updates and runs one task per message, and a [`CommandRouter`] mapping
//! `/command` names to handlers.

pub mod api;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod types;

pub use api::{BotApi, TelegramApi};
pub use commands::{parse_command, CommandHandler, CommandRouter};
pub use config::{Config, PollingConfig, TelegramConfig};
pub use dispatcher::{default_reply, Dispatcher, DispatcherBuilder, MessageHandler};
pub use error::{BotError, DispatchError};
pub use types::{Chat, ChatKind, Message, Update, User};
