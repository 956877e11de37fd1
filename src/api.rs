//! Bot API transport.
//!
//! [`BotApi`] is the capability handed to the dispatch loop and to every
//! handler; [`TelegramApi`] implements it with plain JSON POSTs over reqwest.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{PollingConfig, TelegramConfig};
use crate::error::{BotError, Result};
use crate::types::{ApiResponse, GetUpdatesRequest, SendMessageRequest, Update, User};

pub const DEFAULT_API_URL: &str = "https://api.telegram.org";
/// Timeout for calls other than `getUpdates` (seconds)
const API_TIMEOUT_SECS: u64 = 30;

/// Operations the dispatch loop and handlers need from the remote side.
///
/// Every call races `cancel`; a fired token resolves the call with
/// [`BotError::Cancelled`]. Callers wanting a tighter bound on a single call
/// can pass a child token and cancel it from a timer.
#[async_trait]
pub trait BotApi: Send + Sync {
    /// Identity of the bot behind the token ("who am I").
    async fn get_me(&self, cancel: &CancellationToken) -> Result<User>;

    /// Long-polls for updates with `update_id >= offset`, ascending.
    /// An empty batch means nothing arrived during the wait window.
    async fn get_updates(&self, offset: i64, cancel: &CancellationToken) -> Result<Vec<Update>>;

    async fn send_message(&self, chat_id: i64, text: &str, cancel: &CancellationToken)
        -> Result<()>;
}

pub struct TelegramApi {
    client: Client,
    token: String,
    api_url: String,
    long_poll_timeout: Duration,
    request_timeout: Duration,
}

impl TelegramApi {
    pub fn new(token: impl Into<String>) -> Self {
        Self::from_config(
            &TelegramConfig {
                bot_token: token.into(),
                api_url: DEFAULT_API_URL.to_string(),
            },
            &PollingConfig::default(),
        )
    }

    pub fn from_config(telegram: &TelegramConfig, polling: &PollingConfig) -> Self {
        Self {
            client: Client::new(),
            token: telegram.bot_token.clone(),
            api_url: telegram.api_url.trim_end_matches('/').to_string(),
            long_poll_timeout: polling.long_poll_timeout(),
            request_timeout: polling.request_timeout(),
        }
    }

    /// Point the client at another server (a local Bot API server, or a mock).
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.token, method)
    }

    /// POSTs `payload` to `method` and unwraps the response envelope.
    async fn call<P, R>(
        &self,
        method: &str,
        payload: Option<&P>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<R>
    where
        P: Serialize + Sync + ?Sized,
        R: DeserializeOwned + Send,
    {
        let mut request = self
            .client
            .post(self.method_url(method))
            .header(CONTENT_TYPE, "application/json")
            .timeout(timeout);
        if let Some(payload) = payload {
            request = request.json(payload);
        }

        debug!(method = %method, "Calling Bot API");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BotError::Cancelled),
            result = Self::exchange(request) => result,
        }
    }

    async fn exchange<R>(request: RequestBuilder) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        let envelope: ApiResponse<R> = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(e) if !status.is_success() => {
                return Err(BotError::Status {
                    status: status.as_u16(),
                    detail: status
                        .canonical_reason()
                        .map(str::to_string)
                        .unwrap_or_else(|| e.to_string()),
                });
            }
            Err(e) => return Err(BotError::Decode(format!("HTTP {}: {}", status, e))),
        };

        if !envelope.ok {
            return Err(BotError::Api {
                description: envelope.description.unwrap_or_default(),
            });
        }

        envelope
            .result
            .ok_or_else(|| BotError::Decode("ok response without result".to_string()))
    }
}

#[async_trait]
impl BotApi for TelegramApi {
    async fn get_me(&self, cancel: &CancellationToken) -> Result<User> {
        self.call::<(), User>(
            "getMe",
            None,
            Duration::from_secs(API_TIMEOUT_SECS),
            cancel,
        )
        .await
    }

    async fn get_updates(&self, offset: i64, cancel: &CancellationToken) -> Result<Vec<Update>> {
        let params = GetUpdatesRequest {
            offset,
            timeout: self.long_poll_timeout.as_secs(),
        };
        self.call("getUpdates", Some(&params), self.request_timeout, cancel)
            .await
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let payload = SendMessageRequest {
            chat_id,
            text: text.to_string(),
        };
        self.call::<_, serde_json::Value>(
            "sendMessage",
            Some(&payload),
            Duration::from_secs(API_TIMEOUT_SECS),
            cancel,
        )
        .await?;
        Ok(())
    }
}
