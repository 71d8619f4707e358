//! Account sessions: one access token, its community and its batch loop.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use vk_api::{
    params, ApiClient, ApiConfig, ApiError, BatchExecutor, LongPoll, Params, Transport,
};

use crate::error::{BotError, Result};

/// A community resolved from its access token.
pub struct AccountSession {
    index: usize,
    group_id: i64,
    group_name: String,
    screen_name: String,
    executor: Arc<BatchExecutor>,
}

#[derive(Debug, Deserialize)]
struct Group {
    id: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    screen_name: String,
}

impl AccountSession {
    /// Resolve the token's community and enable Bots Long Poll for it.
    ///
    /// Uses direct calls: the batch loop is not running yet. A token that
    /// cannot be resolved fails the whole start; failing to enable long
    /// poll is only logged, as it may already be enabled.
    pub async fn initialize(
        index: usize,
        token: &str,
        transport: Arc<dyn Transport>,
        config: Arc<ApiConfig>,
    ) -> Result<Self> {
        let client = ApiClient::with_config(token, transport, config);
        let initialization = |source| BotError::Initialization { index, source };

        let groups = client
            .try_submit("groups.getById", Params::new())
            .await
            .map_err(initialization)?;
        let group = serde_json::from_value::<Vec<Group>>(groups)
            .ok()
            .and_then(|groups| groups.into_iter().next())
            .ok_or_else(|| initialization(ApiError::EmptyResponse))?;

        let version = client.config().version.clone();
        client
            .submit(
                "groups.setLongPollSettings",
                params! {
                    "group_id": group.id,
                    "api_version": version,
                    "enabled": 1,
                },
            )
            .await;

        tracing::info!(index, group_id = group.id, name = %group.name, "session initialized");

        Ok(Self {
            index,
            group_id: group.id,
            group_name: group.name,
            screen_name: group.screen_name,
            executor: Arc::new(BatchExecutor::new(client)),
        })
    }

    /// Position of this session's token in the configured list.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn group_id(&self) -> i64 {
        self.group_id
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn screen_name(&self) -> &str {
        &self.screen_name
    }

    pub fn executor(&self) -> &Arc<BatchExecutor> {
        &self.executor
    }

    /// Fresh receiver for this session's community.
    pub fn longpoll(&self) -> LongPoll {
        LongPoll::new(self.executor.clone(), self.group_id)
    }
}

impl fmt::Debug for AccountSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountSession")
            .field("index", &self.index)
            .field("group_id", &self.group_id)
            .field("group_name", &self.group_name)
            .field("executor", &self.executor)
            .finish()
    }
}

/// Sessions grouped by community.
#[derive(Debug, Clone, Default)]
pub struct SessionPool {
    inner: Arc<RwLock<HashMap<i64, Vec<Arc<AccountSession>>>>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<AccountSession>) {
        let mut sessions = self.inner.write().unwrap_or_else(|e| e.into_inner());
        sessions.entry(session.group_id).or_default().push(session);
    }

    /// A uniformly random session for `group_id`.
    pub fn get(&self, group_id: i64) -> Option<Arc<AccountSession>> {
        let sessions = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let candidates = sessions.get(&group_id)?;
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[fastrand::usize(..candidates.len())].clone())
    }

    /// The first session of every community, ordered by group id.
    pub fn primaries(&self) -> Vec<Arc<AccountSession>> {
        let sessions = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut primaries: Vec<_> = sessions
            .values()
            .filter_map(|group| group.first().cloned())
            .collect();
        primaries.sort_by_key(|s| s.group_id);
        primaries
    }

    pub fn all(&self) -> Vec<Arc<AccountSession>> {
        let sessions = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = sessions.values().flatten().cloned().collect();
        all.sort_by_key(|s| s.index);
        all
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Remove and return every session.
    pub fn drain(&self) -> Vec<Arc<AccountSession>> {
        let mut sessions = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = sessions.drain().flat_map(|(_, group)| group).collect();
        all.sort_by_key(|s| s.index);
        all
    }
}
