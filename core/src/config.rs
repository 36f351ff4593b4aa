/// Configuration management
use crate::error::{Result, SwapError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000";
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Flags understood by `Config::from_args`, as shown in usage text
pub const FLAG_USAGE: &str = "[--api-url URL] [--ws-url URL] [--token TOKEN] [--timeout-secs N]";

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the REST backend
    pub api_base_url: String,

    /// Base URL of the realtime chat endpoint
    pub ws_base_url: String,

    /// Bearer token issued by the login flow (never refreshed here)
    pub token: Option<String>,

    /// Timeout applied to every backend request
    pub request_timeout: Duration,

    /// Timeout for opening a chat channel
    pub connect_timeout: Duration,

    /// Capacity of the UI event broadcast
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            ws_base_url: DEFAULT_WS_URL.to_string(),
            token: None,
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl Config {
    /// Parse `--flag value` pairs; anything else is returned as positional args.
    ///
    /// `args` excludes the program name.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = Self::default();
        let mut positional = Vec::new();

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--api-url" => {
                    config.api_base_url = flag_value(args, i, "--api-url")?.to_string();
                    i += 2;
                }
                "--ws-url" => {
                    config.ws_base_url = flag_value(args, i, "--ws-url")?.to_string();
                    i += 2;
                }
                "--token" => {
                    config.token = Some(flag_value(args, i, "--token")?.to_string());
                    i += 2;
                }
                "--timeout-secs" => {
                    let secs = flag_value(args, i, "--timeout-secs")?
                        .parse::<u64>()
                        .map_err(|_| {
                            SwapError::Config("--timeout-secs must be a whole number".to_string())
                        })?;
                    config.request_timeout = Duration::from_secs(secs);
                    config.connect_timeout = Duration::from_secs(secs);
                    i += 2;
                }
                other => {
                    positional.push(other.to_string());
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("SWAPCHAT_API_URL") {
            config.api_base_url = url;
        }
        if let Ok(url) = std::env::var("SWAPCHAT_WS_URL") {
            config.ws_base_url = url;
        }
        if let Ok(token) = std::env::var("SWAPCHAT_TOKEN") {
            config.token = Some(token);
        }

        config.validate()?;
        Ok((config, positional))
    }

    /// Check URL schemes and timeouts
    pub fn validate(&self) -> Result<()> {
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://"))
        {
            return Err(SwapError::Config(format!(
                "api url must be http(s): {}",
                self.api_base_url
            )));
        }
        if !(self.ws_base_url.starts_with("ws://") || self.ws_base_url.starts_with("wss://")) {
            return Err(SwapError::Config(format!(
                "ws url must be ws(s): {}",
                self.ws_base_url
            )));
        }
        if self.request_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(SwapError::Config("timeouts must be non-zero".to_string()));
        }
        if self.event_buffer == 0 {
            return Err(SwapError::Config("event buffer must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Join a path onto the REST base URL
    pub fn api_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Channel URL for one chat, scoped to the user's handle
    pub fn chat_url(&self, username: &str, chat: &str) -> String {
        format!(
            "{}/ws/chat?username={}&chat={}",
            self.ws_base_url.trim_end_matches('/'),
            urlencoding::encode(username),
            urlencoding::encode(chat)
        )
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| SwapError::Config(format!("{} requires a value", flag)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_flags_and_positional() {
        let (config, rest) = Config::from_args(&args(&[
            "--api-url",
            "http://books.local:9000/",
            "chat",
            "--timeout-secs",
            "3",
            "42",
        ]))
        .unwrap();

        assert_eq!(config.api_url("/sessions/42/"), "http://books.local:9000/sessions/42/");
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(rest, vec!["chat".to_string(), "42".to_string()]);
    }

    #[test]
    fn test_usage_lists_every_flag() {
        let (config, rest) = Config::from_args(&args(&[
            "--ws-url",
            "wss://books.local/",
            "--token",
            "abc",
            "--timeout-secs",
            "5",
        ]))
        .unwrap();
        assert!(rest.is_empty());
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.token.as_deref(), Some("abc"));

        for flag in ["--api-url", "--ws-url", "--token", "--timeout-secs"] {
            assert!(FLAG_USAGE.contains(flag), "{} missing from usage", flag);
        }
    }

    #[test]
    fn test_missing_flag_value() {
        let err = Config::from_args(&args(&["--token"])).unwrap_err();
        assert!(matches!(err, SwapError::Config(_)));
    }

    #[test]
    fn test_bad_scheme_rejected() {
        let config = Config {
            ws_base_url: "http://127.0.0.1:8000".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chat_url_encodes_handle() {
        let config = Config::default();
        assert_eq!(
            config.chat_url("ana maria", "7"),
            "ws://127.0.0.1:8000/ws/chat?username=ana%20maria&chat=7"
        );
    }
}
