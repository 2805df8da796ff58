/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SERVER_URL: &str = "http://localhost:8000";
const DEFAULT_GREETING: &str = "Hi";

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the chat server (plain http)
    pub server_url: String,

    /// Directory holding the persisted session (defaults to `.parley`)
    pub data_dir: PathBuf,

    /// Timeout for each state query
    pub request_timeout: Duration,

    /// Keepalive ping interval on the push channel
    pub keepalive_interval: Duration,

    /// Quiet period before a peer search hits the network
    pub search_debounce: Duration,

    /// Content of the first message sent when starting a chat from search
    pub greeting: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            data_dir: PathBuf::from(".parley"),
            request_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            search_debounce: Duration::from_millis(250),
            greeting: DEFAULT_GREETING.to_string(),
        }
    }
}

impl Config {
    /// Parse flags out of the command line; returns the config and the
    /// remaining positional arguments (program name excluded).
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = Self::default();
        let mut positional = Vec::new();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--server" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--server requires a URL argument".to_string())
                    })?;
                    config.server_url = url.clone();
                    i += 2;
                }
                "--data-dir" => {
                    let path = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--data-dir requires a path argument".to_string())
                    })?;
                    config.data_dir = PathBuf::from(path);
                    i += 2;
                }
                "--timeout-ms" => {
                    config.request_timeout = Duration::from_millis(parse_millis(args, i)?);
                    i += 2;
                }
                "--debounce-ms" => {
                    config.search_debounce = Duration::from_millis(parse_millis(args, i)?);
                    i += 2;
                }
                "--greeting" => {
                    let text = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--greeting requires a text argument".to_string())
                    })?;
                    config.greeting = text.clone();
                    i += 2;
                }
                other => {
                    positional.push(other.to_string());
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("PARLEY_SERVER_URL") {
            config.server_url = url;
        }
        if let Ok(dir) = std::env::var("PARLEY_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok((config, positional))
    }

    /// Check the server URL scheme and trim a trailing slash
    pub fn validate(&mut self) -> Result<()> {
        while self.server_url.ends_with('/') {
            self.server_url.pop();
        }
        // No TLS connector in the HTTP or push channel clients
        if !self.server_url.starts_with("http://") {
            return Err(ChatError::Config(format!(
                "Server URL must start with http://, got {}",
                self.server_url
            )));
        }
        if self.greeting.trim().is_empty() {
            return Err(ChatError::Config("Greeting must not be empty".to_string()));
        }
        Ok(())
    }

    /// Push channel base URL derived from the server URL
    pub fn ws_url(&self) -> Result<String> {
        self.server_url
            .strip_prefix("http://")
            .map(|rest| format!("ws://{}", rest))
            .ok_or_else(|| {
                ChatError::Config(format!(
                    "Cannot derive push channel URL from {}",
                    self.server_url
                ))
            })
    }
}

fn parse_millis(args: &[String], i: usize) -> Result<u64> {
    let flag = &args[i];
    args.get(i + 1)
        .ok_or_else(|| ChatError::Config(format!("{} requires a number argument", flag)))?
        .parse::<u64>()
        .map_err(|_| ChatError::Config(format!("{} must be a whole number of milliseconds", flag)))
}
