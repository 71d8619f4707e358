//! Typed events built from long poll updates.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::warn;
use vk_api::{params, Outcome, Params, RawUpdate};

use crate::error::{BotError, Result};
use crate::objects::Message;
use crate::session::AccountSession;

/// Fallback name for every update without a typed variant.
pub const RAW_EVENT: &str = "vk:raw";

/// A new incoming message.
pub const MESSAGE_NEW: &str = "vk:message_new";

/// Registered handler. Returning `Err` aborts the rest of the chain.
pub type Callback = Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub(crate) fn callback<F, Fut>(f: F) -> Callback
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Raw,
    MessageNew(Message),
}

/// One update for one group.
#[derive(Debug, Clone)]
pub struct Event {
    pub group_id: i64,
    /// Update type as sent by the platform
    pub kind: String,
    /// The update's `object`, untouched
    pub source: Value,
    pub event_id: Option<String>,
    pub payload: Payload,
    session: Option<Arc<AccountSession>>,
}

impl Event {
    /// Build an event from an update. Updates that fail to decode into
    /// their typed variant fall back to [`Payload::Raw`].
    pub fn decode(group_id: i64, update: RawUpdate) -> Self {
        let payload = match update.kind.as_str() {
            "message_new" => match Message::from_value(&update.object) {
                Ok(message) => Payload::MessageNew(message),
                Err(e) => {
                    warn!(group_id, error = %e, "undecodable message_new, dispatching as raw");
                    Payload::Raw
                }
            },
            _ => Payload::Raw,
        };

        Self {
            group_id: update.group_id.unwrap_or(group_id),
            kind: update.kind,
            source: update.object,
            event_id: update.event_id,
            payload,
            session: None,
        }
    }

    /// Name callbacks are registered under.
    pub fn name(&self) -> &'static str {
        match self.payload {
            Payload::Raw => RAW_EVENT,
            Payload::MessageNew(_) => MESSAGE_NEW,
        }
    }

    pub fn message(&self) -> Option<&Message> {
        match &self.payload {
            Payload::MessageNew(message) => Some(message),
            Payload::Raw => None,
        }
    }

    /// Session bound at dispatch time.
    pub fn session(&self) -> Option<&Arc<AccountSession>> {
        self.session.as_ref()
    }

    pub(crate) fn bind(&mut self, session: Option<Arc<AccountSession>>) {
        self.session = session;
    }

    /// Queue a method call on this event's session.
    pub async fn request(&self, method: &str, arguments: Params) -> Result<Outcome> {
        let session = self
            .session
            .as_ref()
            .ok_or(BotError::NoSession(self.group_id))?;
        Ok(session.executor().enqueue(method, arguments).await?)
    }

    /// Send `text` back to the peer the message came from.
    pub async fn respond(&self, text: &str) -> Result<Outcome> {
        let message = self.message().ok_or(BotError::NoPeer(self.name()))?;
        self.request(
            "messages.send",
            params! {
                "message": text,
                "peer_id": message.peer_id,
                "random_id": fastrand::i32(..),
            },
        )
        .await
    }
}
