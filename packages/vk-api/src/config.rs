//! Client configuration.

use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.vk.com/method";
pub const DEFAULT_API_VERSION: &str = "5.92";

/// Tuning for the client, the batch executor and long polling.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiConfig {
    /// Base URL for method calls (`{api_url}/{method}`)
    pub api_url: String,
    /// API version sent as `v` with every call
    pub version: String,
    /// Pause before each drain of the request queue. 1/19 s keeps a single
    /// token under the 20 calls per second quota.
    pub batch_pause: Duration,
    /// Maximum number of calls packed into one `execute`
    pub batch_size: usize,
    /// Server-side wait window for long poll requests, in seconds
    pub longpoll_wait: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            version: DEFAULT_API_VERSION.to_string(),
            batch_pause: Duration::from_secs(1) / 19,
            batch_size: 25,
            longpoll_wait: 25,
        }
    }
}

impl ApiConfig {
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_batch_pause(mut self, pause: Duration) -> Self {
        self.batch_pause = pause;
        self
    }

    /// Clamped to at least one call per batch.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_longpoll_wait(mut self, seconds: u64) -> Self {
        self.longpoll_wait = seconds;
        self
    }

    pub(crate) fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.api_url.trim_end_matches('/'), method)
    }
}
