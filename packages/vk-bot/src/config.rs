use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use vk_api::ApiConfig;

/// Bot configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Community access tokens, one session each
    pub tokens: Vec<String>,
    pub api: ApiConfig,
}

impl BotConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let tokens: Vec<String> = var("VK_TOKENS")
            .context("VK_TOKENS must be set")?
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(String::from)
            .collect();
        if tokens.is_empty() {
            bail!("VK_TOKENS must contain at least one token");
        }

        let mut api = ApiConfig::default();
        if let Some(url) = var("VK_API_URL") {
            api = api.with_api_url(url);
        }
        if let Some(version) = var("VK_API_VERSION") {
            api = api.with_version(version);
        }
        if let Some(wait) = var("VK_LONGPOLL_WAIT") {
            api = api.with_longpoll_wait(
                wait.parse()
                    .context("VK_LONGPOLL_WAIT must be a number of seconds")?,
            );
        }

        Ok(Self { tokens, api })
    }
}
