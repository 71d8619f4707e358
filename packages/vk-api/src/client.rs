//! Direct (unbatched) method calls.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ApiConfig;
use crate::error::{ApiError, Result};
use crate::transport::{encode_form, Form, Params, Transport};

/// One access token bound to a shared transport.
///
/// Cheap to clone. Every call carries `v` and `access_token`; caller
/// arguments with the same names take precedence.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    token: String,
    config: Arc<ApiConfig>,
}

impl ApiClient {
    pub fn new(token: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self::with_config(token, transport, Arc::new(ApiConfig::default()))
    }

    pub fn with_config(
        token: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: Arc<ApiConfig>,
    ) -> Self {
        Self {
            transport,
            token: token.into(),
            config,
        }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Call a method and return its `response`, or `None` on any failure.
    ///
    /// Failures are logged here so callers only deal with the absent value.
    pub async fn submit(&self, method: &str, args: Params) -> Option<Value> {
        match self.try_submit(method, args).await {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(method, error = %e, "VK request failed");
                None
            }
        }
    }

    /// Call a method and return its `response`.
    pub async fn try_submit(&self, method: &str, args: Params) -> Result<Value> {
        debug!(method, args = ?args, "VK request");

        let url = self.config.method_url(method);
        let form = self.form(args);
        let body = self.transport.post(&url, &form).await?;

        unwrap_response(method, body)
    }

    fn form(&self, args: Params) -> Form {
        let mut merged = Params::new();
        merged.insert("v".into(), Value::String(self.config.version.clone()));
        merged.insert("access_token".into(), Value::String(self.token.clone()));
        merged.extend(args);
        encode_form(&merged)
    }
}

fn unwrap_response(method: &str, mut body: Value) -> Result<Value> {
    if let Some(errors) = body.get("execute_errors") {
        debug!(method, errors = %errors, "execute reported errors for some calls");
    }

    match body.get_mut("response").map(Value::take) {
        Some(Value::Null) | None => {
            if let Some(error) = body.get("error") {
                return Err(ApiError::Platform {
                    code: error.get("error_code").and_then(Value::as_i64).unwrap_or(0),
                    message: error
                        .get("error_msg")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
            Err(ApiError::EmptyResponse)
        }
        Some(response) => Ok(response),
    }
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("api_url", &self.config.api_url)
            .field("version", &self.config.version)
            .finish_non_exhaustive()
    }
}
