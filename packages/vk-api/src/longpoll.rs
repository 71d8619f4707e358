//! Bots Long Poll receiver.
//!
//! Polling credentials (`server`, `key`, `ts`) are issued by
//! `groups.getLongPollServer`, requested through the batch executor. The poll
//! itself is a long-held POST straight to the issued server, so it bypasses
//! the queue.
//!
//! | Poll answer              | Effect                                     |
//! |--------------------------|--------------------------------------------|
//! | `{ts, updates}`          | advance `ts`, return updates               |
//! | `{failed: 1, ts?}`       | advance `ts` if present, return nothing    |
//! | `{failed: 2 \| 3 \| ..}` | clear credentials, return nothing          |
//! | transport/decode error   | clear credentials, return nothing          |

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::batch::BatchExecutor;
use crate::error::LifecycleError;
use crate::transport::{encode_form, Params};

/// Current polling credentials. Empty fields mean a refresh is needed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollState {
    pub server: String,
    pub key: String,
    pub ts: String,
}

impl PollState {
    pub fn new(server: impl Into<String>, key: impl Into<String>, ts: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            key: key.into(),
            ts: ts.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.server.is_empty() && !self.key.is_empty() && !self.ts.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Move the timestamp forward. Numeric timestamps never go back.
    fn advance(&mut self, ts: String) {
        if let (Ok(current), Ok(next)) = (self.ts.parse::<u64>(), ts.parse::<u64>()) {
            if next < current {
                warn!(current, next, "ignoring long poll timestamp rollback");
                return;
            }
        }
        self.ts = ts;
    }

    fn from_server_response(response: &Value) -> Option<Self> {
        let state = Self {
            server: scalar_string(response.get("server")?)?,
            key: scalar_string(response.get("key")?)?,
            ts: scalar_string(response.get("ts")?)?,
        };
        state.is_complete().then_some(state)
    }
}

/// One update as delivered by the poll server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawUpdate {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub object: Value,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub event_id: Option<String>,
}

/// Where the receiver is in its refresh/poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    NeedRefresh,
    Polling,
}

/// Long poll receiver for one group.
pub struct LongPoll {
    executor: Arc<BatchExecutor>,
    group_id: i64,
    state: PollState,
}

impl LongPoll {
    pub fn new(executor: Arc<BatchExecutor>, group_id: i64) -> Self {
        Self::with_state(executor, group_id, PollState::default())
    }

    /// Start from known credentials instead of refreshing first.
    pub fn with_state(executor: Arc<BatchExecutor>, group_id: i64, state: PollState) -> Self {
        Self {
            executor,
            group_id,
            state,
        }
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    pub fn phase(&self) -> PollPhase {
        if self.state.is_complete() {
            PollPhase::Polling
        } else {
            PollPhase::NeedRefresh
        }
    }

    /// Fetch new credentials. Returns `false` when none were issued.
    pub async fn refresh(&mut self) -> Result<bool, LifecycleError> {
        let mut params = Params::new();
        params.insert("group_id".into(), Value::from(self.group_id));

        let response = self
            .executor
            .enqueue("groups.getLongPollServer", params)
            .await?;

        match response.as_ref().and_then(PollState::from_server_response) {
            Some(state) => {
                debug!(group_id = self.group_id, server = %state.server, "long poll credentials refreshed");
                self.state = state;
                Ok(true)
            }
            None => {
                if let Some(response) = response {
                    warn!(group_id = self.group_id, response = %response, "malformed long poll server response");
                }
                Ok(false)
            }
        }
    }

    /// Wait for the next batch of updates.
    ///
    /// Refreshes credentials until some are issued, then polls once. Returns
    /// `None` when this round produced no updates (failure or expired
    /// credentials) or when the executor is no longer running. Dropping the
    /// future abandons the in-flight poll.
    pub async fn poll(&mut self) -> Option<Vec<RawUpdate>> {
        while !self.state.is_complete() {
            if let Err(e) = self.refresh().await {
                debug!(group_id = self.group_id, error = %e, "long poll refresh stopped");
                return None;
            }
        }

        let client = self.executor.client();
        let mut params = Params::new();
        params.insert("act".into(), Value::from("a_check"));
        params.insert("key".into(), Value::from(self.state.key.clone()));
        params.insert("ts".into(), Value::from(self.state.ts.clone()));
        params.insert("wait".into(), Value::from(client.config().longpoll_wait));

        let response = match client
            .transport()
            .post(&self.state.server, &encode_form(&params))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(group_id = self.group_id, error = %e, "long poll request failed");
                self.state.clear();
                return None;
            }
        };

        self.handle_response(response)
    }

    fn handle_response(&mut self, mut response: Value) -> Option<Vec<RawUpdate>> {
        if let Some(ts) = response.get("ts").and_then(scalar_string) {
            self.state.advance(ts);
        }

        if let Some(failed) = response.get("failed") {
            if failed.as_i64() != Some(1) {
                debug!(group_id = self.group_id, failed = %failed, "long poll credentials expired");
                self.state.clear();
            }
            return None;
        }

        let Some(Value::Array(updates)) = response.get_mut("updates").map(Value::take) else {
            warn!(group_id = self.group_id, response = %response, "long poll response without updates");
            return None;
        };

        let updates = updates
            .into_iter()
            .filter_map(|update| match serde_json::from_value::<RawUpdate>(update) {
                Ok(update) => Some(update),
                Err(e) => {
                    warn!(group_id = self.group_id, error = %e, "skipping malformed update");
                    None
                }
            })
            .collect();

        Some(updates)
    }
}

impl std::fmt::Debug for LongPoll {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongPoll")
            .field("group_id", &self.group_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
