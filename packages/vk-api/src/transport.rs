//! HTTP transport abstraction.
//!
//! Every call the client makes is a form-encoded POST answered with JSON.
//! The [`Transport`] trait lets tests swap the network for an in-memory fake.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::error::TransportError;

/// Method arguments. Values must be scalars (or arrays of scalars).
pub type Params = serde_json::Map<String, Value>;

/// Encoded form body.
pub type Form = Vec<(String, String)>;

/// Build [`Params`] from `key: value` pairs.
///
/// ```rust,ignore
/// let args = params! { "peer_id": 2000000107, "message": "hey" };
/// ```
#[macro_export]
macro_rules! params {
    () => { $crate::Params::new() };
    ($($key:literal : $value:expr),+ $(,)?) => {{
        let mut map = $crate::Params::new();
        $( map.insert($key.to_string(), ::serde_json::json!($value)); )+
        map
    }};
}

/// A single POST with a form body returning decoded JSON.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Post `form` to `url` and decode the body as JSON.
    async fn post(&self, url: &str, form: &Form) -> Result<Value, TransportError>;

    /// Release held connections. Called once when the owner shuts down.
    async fn close(&self) {}
}

/// reqwest-backed transport.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Use a preconfigured client (proxies, timeouts).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, url: &str, form: &Form) -> Result<Value, TransportError> {
        let response = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        // Content type is not trusted, the poll servers answer text/javascript.
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        serde_json::from_str(&body).map_err(|e| {
            debug!(url, body = %body, "response is not JSON");
            TransportError::Decode(e.to_string())
        })
    }
}

/// Encode arguments as form fields. `null` values are skipped.
pub fn encode_form(params: &Params) -> Form {
    params
        .iter()
        .filter_map(|(key, value)| encode_value(value).map(|v| (key.clone(), v)))
        .collect()
}

fn encode_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(encode_value)
                .collect::<Vec<_>>()
                .join(","),
        ),
        Value::Object(_) => Some(value.to_string()),
    }
}
