//! VK API client.
//!
//! A small client for the VK platform built around three pieces:
//!
//! - [`ApiClient`]: direct method calls (`POST {api_url}/{method}`)
//! - [`BatchExecutor`]: queues calls and packs up to 25 of them into a single
//!   `execute` request, which keeps bots under the per-token rate limit
//! - [`LongPoll`]: Bots Long Poll receiver with automatic credential refresh
//!
//! All network access goes through the [`Transport`] trait.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vk_api::{params, ApiClient, BatchExecutor, HttpTransport, LongPoll};
//!
//! let client = ApiClient::new(token, Arc::new(HttpTransport::new()));
//! let executor = Arc::new(BatchExecutor::new(client));
//! executor.start()?;
//!
//! let users = executor.enqueue("users.get", params! { "user_ids": 1 }).await?;
//!
//! let mut longpoll = LongPoll::new(executor.clone(), group_id);
//! while let Some(updates) = longpoll.poll().await {
//!     for update in updates {
//!         println!("{}: {}", update.kind, update.object);
//!     }
//! }
//! ```

pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod longpoll;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use batch::{BatchExecutor, Outcome};
pub use client::ApiClient;
pub use config::ApiConfig;
pub use error::{ApiError, LifecycleError, Result, TransportError};
pub use longpoll::{LongPoll, PollPhase, PollState, RawUpdate};
pub use transport::{encode_form, Form, HttpTransport, Params, Transport};
