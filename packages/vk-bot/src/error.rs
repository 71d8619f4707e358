//! Error types for the bot runtime.
//!
//! Remote call failures never show up here: they are `Ok(None)` outcomes.
//! These errors cover lifecycle misuse and callbacks that returned `Err`.

use thiserror::Error;
use vk_api::{ApiError, LifecycleError};

pub type Result<T> = std::result::Result<T, BotError>;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("dispatcher is already running")]
    AlreadyRunning,

    /// A token could not be resolved to its community.
    #[error("failed to initialize session #{index}: {source}")]
    Initialization {
        index: usize,
        #[source]
        source: ApiError,
    },

    #[error("no session for group {0}")]
    NoSession(i64),

    /// The event has no message to answer.
    #[error("event {0} has no peer to respond to")]
    NoPeer(&'static str),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// A callback returned an error. The rest of its chain was skipped.
#[derive(Debug, Error)]
#[error("callback #{position} for {event} failed: {source}")]
pub struct CallbackError {
    pub event: &'static str,
    pub position: usize,
    #[source]
    pub source: anyhow::Error,
}
