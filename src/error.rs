use thiserror::Error;

/// Failure of a single Bot API call.
#[derive(Error, Debug)]
pub enum BotError {
    /// The request URL is stripped before wrapping: it carries the bot token.
    #[error("Request failed: {0}")]
    Transport(reqwest::Error),

    /// Non-2xx reply whose body is not a Bot API envelope, e.g. a proxy's
    /// HTML error page.
    #[error("HTTP {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("API error: {description}")]
    Api { description: String },

    #[error("Request cancelled")]
    Cancelled,
}

impl BotError {
    /// Network trouble that may resolve by itself. `Decode` and `Api` mean the
    /// remote side understood the request and refused or garbled it.
    pub fn is_transient(&self) -> bool {
        matches!(self, BotError::Transport(_) | BotError::Status { .. })
    }
}

impl From<reqwest::Error> for BotError {
    fn from(err: reqwest::Error) -> Self {
        BotError::Transport(err.without_url())
    }
}

impl From<serde_json::Error> for BotError {
    fn from(err: serde_json::Error) -> Self {
        BotError::Decode(err.to_string())
    }
}

/// Terminal failure of the dispatch loop. Cancellation is not an error and
/// never shows up here.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("failed to verify bot credentials: {0}")]
    Verification(#[source] BotError),
}

pub type Result<T> = std::result::Result<T, BotError>;
