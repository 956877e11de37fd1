use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::api::DEFAULT_API_URL;

pub const TOKEN_ENV_VAR: &str = "TELEGRAM_BOT_TOKEN";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_url: default_api_url(),
        }
    }
}

/// Tuning for the long-polling loop. All values are in seconds.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PollingConfig {
    /// How long the server holds `getUpdates` open waiting for traffic.
    #[serde(default = "default_long_poll_timeout")]
    pub long_poll_timeout_secs: u64,
    /// Client-side HTTP timeout for `getUpdates`; should exceed the long-poll wait.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Pause after a failed fetch before polling again.
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
    /// Upper bound on concurrently running message tasks. Unbounded when absent.
    #[serde(default)]
    pub max_in_flight: Option<usize>,
    /// How long shutdown waits for in-flight message tasks. No wait when absent.
    #[serde(default)]
    pub drain_timeout_secs: Option<u64>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            long_poll_timeout_secs: default_long_poll_timeout(),
            request_timeout_secs: default_request_timeout(),
            error_backoff_secs: default_error_backoff(),
            max_in_flight: None,
            drain_timeout_secs: None,
        }
    }
}

impl PollingConfig {
    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.long_poll_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_secs.map(Duration::from_secs)
    }
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_long_poll_timeout() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    70
}

fn default_error_backoff() -> u64 {
    3
}

impl Config {
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;

        if config.polling.request_timeout_secs <= config.polling.long_poll_timeout_secs {
            anyhow::bail!(
                "polling.request_timeout_secs ({}) must be greater than polling.long_poll_timeout_secs ({})",
                config.polling.request_timeout_secs,
                config.polling.long_poll_timeout_secs
            );
        }
        if config.polling.max_in_flight == Some(0) {
            anyhow::bail!("polling.max_in_flight must be at least 1");
        }

        Ok(config)
    }

    /// Loads `path` if it exists, otherwise starts from defaults. The token
    /// from `TELEGRAM_BOT_TOKEN` fills in an empty `bot_token`.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_env_token(path, std::env::var(TOKEN_ENV_VAR).ok())
    }

    fn load_with_env_token(path: &Path, env_token: Option<String>) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Invalid config file: {}", path.display()))?
        } else {
            Config::default()
        };

        if config.telegram.bot_token.is_empty() {
            if let Some(token) = env_token {
                config.telegram.bot_token = token;
            }
        }

        if config.telegram.bot_token.trim().is_empty() {
            anyhow::bail!(
                "No bot token: set telegram.bot_token in {} or {}",
                path.display(),
                TOKEN_ENV_VAR
            );
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.telegram.api_url, "https://api.telegram.org");
        assert_eq!(config.polling, PollingConfig::default());
        assert_eq!(config.polling.long_poll_timeout(), Duration::from_secs(60));
        assert_eq!(config.polling.request_timeout(), Duration::from_secs(70));
        assert_eq!(config.polling.error_backoff(), Duration::from_secs(3));
        assert_eq!(config.polling.drain_timeout(), None);
    }

    #[test]
    fn test_overrides() {
        let config = Config::parse(
            r#"
            [telegram]
            bot_token = "123:ABC"
            api_url = "http://localhost:8081"

            [polling]
            long_poll_timeout_secs = 30
            request_timeout_secs = 40
            max_in_flight = 8
            drain_timeout_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.telegram.bot_token, "123:ABC");
        assert_eq!(config.telegram.api_url, "http://localhost:8081");
        assert_eq!(config.polling.long_poll_timeout_secs, 30);
        assert_eq!(config.polling.request_timeout_secs, 40);
        assert_eq!(config.polling.error_backoff_secs, 3);
        assert_eq!(config.polling.max_in_flight, Some(8));
        assert_eq!(config.polling.drain_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_request_timeout_must_exceed_long_poll() {
        let err = Config::parse(
            r#"
            [polling]
            long_poll_timeout_secs = 60
            request_timeout_secs = 60
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("request_timeout_secs"));
    }

    #[test]
    fn test_zero_in_flight_rejected() {
        assert!(Config::parse("[polling]\nmax_in_flight = 0\n").is_err());
    }

    fn temp_config(name: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "pollbot-{}-{}.toml",
            name,
            std::process::id()
        ));
        std::fs::write(&path, content).unwrap();
        path
    }

    fn missing_config() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("pollbot-missing-{}.toml", std::process::id()))
    }

    #[test]
    fn test_load_reads_file() {
        let path = temp_config("reads-file", "[telegram]\nbot_token = \"from-file\"\n");

        let config = Config::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.telegram.bot_token, "from-file");
    }

    #[test]
    fn test_missing_file_uses_defaults_and_env_token() {
        let config =
            Config::load_with_env_token(&missing_config(), Some("from-env".to_string())).unwrap();

        assert_eq!(config.telegram.bot_token, "from-env");
        assert_eq!(config.telegram.api_url, "https://api.telegram.org");
        assert_eq!(config.polling, PollingConfig::default());
    }

    #[test]
    fn test_missing_token_is_rejected() {
        let err = Config::load_with_env_token(&missing_config(), None).unwrap_err();
        assert!(err.to_string().contains("No bot token"));

        let err =
            Config::load_with_env_token(&missing_config(), Some("   ".to_string())).unwrap_err();
        assert!(err.to_string().contains(TOKEN_ENV_VAR));
    }

    #[test]
    fn test_env_token_fills_empty_bot_token() {
        let path = temp_config(
            "env-fills",
            "[telegram]\nbot_token = \"\"\n\n[polling]\nerror_backoff_secs = 7\n",
        );

        let config = Config::load_with_env_token(&path, Some("from-env".to_string())).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.telegram.bot_token, "from-env");
        assert_eq!(config.polling.error_backoff_secs, 7);
    }

    #[test]
    fn test_file_token_wins_over_env() {
        let path = temp_config("file-wins", "[telegram]\nbot_token = \"from-file\"\n");

        let config = Config::load_with_env_token(&path, Some("from-env".to_string())).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.telegram.bot_token, "from-file");
    }
}
