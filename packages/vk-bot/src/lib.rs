//! Runtime for VK community bots.
//!
//! Register callbacks by event name, then start the [`Dispatcher`]: it
//! resolves every token to its community, polls for updates and runs each
//! update through its callback chain. Calls made from callbacks go through
//! the session's batch loop (see [`vk_api::BatchExecutor`]).
//!
//! ```rust,ignore
//! use vk_bot::{Dispatcher, MESSAGE_NEW};
//!
//! let dispatcher = Dispatcher::builder(["token"]).build();
//! dispatcher.on(MESSAGE_NEW, |event| async move {
//!     event.respond("hey").await?;
//!     Ok::<_, anyhow::Error>(())
//! });
//!
//! dispatcher.start().await?;
//! tokio::signal::ctrl_c().await?;
//! dispatcher.stop().await;
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod objects;
pub mod session;

pub use config::BotConfig;
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use error::{BotError, CallbackError, Result};
pub use events::{Callback, Event, Payload, MESSAGE_NEW, RAW_EVENT};
pub use objects::{Attachment, Message};
pub use session::{AccountSession, SessionPool};
