//! Event dispatcher.
//!
//! Owns the account sessions, drives one long poll loop per community and
//! runs every update through the callbacks registered for its event name.
//!
//! # Lifecycle
//!
//! ```text
//! start():  initialize sessions ─► start batch loops ─► spawn poll loops
//! stop():   cancel poll loops ─► join dispatch tasks ─► stop batch loops ─► close transport
//! ```
//!
//! Dispatch tasks may still call into their session, so sessions are torn
//! down only after every task has finished.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::anyhow;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, Instrument, Span};
use vk_api::{ApiConfig, HttpTransport, Transport};

use crate::error::{BotError, CallbackError, Result};
use crate::events::{callback, Callback, Event};
use crate::session::{AccountSession, SessionPool};

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    tokens: Vec<String>,
    transport: Option<Arc<dyn Transport>>,
    config: ApiConfig,
    span: Option<Span>,
}

impl DispatcherBuilder {
    /// Share `transport` between all sessions. Defaults to [`HttpTransport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn config(mut self, config: ApiConfig) -> Self {
        self.config = config;
        self
    }

    /// Span every background task runs in. Defaults to a `vk_bot` span.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> Dispatcher {
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new()));
        let span = self
            .span
            .unwrap_or_else(|| tracing::info_span!("vk_bot"));

        Dispatcher {
            inner: Arc::new(Inner {
                tokens: self.tokens,
                transport,
                config: Arc::new(self.config),
                span,
                callbacks: RwLock::new(HashMap::new()),
                sessions: SessionPool::new(),
                tracker: TaskTracker::new(),
                running: Mutex::new(None),
            }),
        }
    }
}

/// Runs callbacks for updates from one or more communities.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    tokens: Vec<String>,
    transport: Arc<dyn Transport>,
    config: Arc<ApiConfig>,
    span: Span,
    callbacks: RwLock<HashMap<String, Vec<Callback>>>,
    sessions: SessionPool,
    tracker: TaskTracker,
    running: Mutex<Option<Running>>,
}

struct Running {
    shutdown: CancellationToken,
    pollers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// One session is created per token on [`start`](Self::start).
    pub fn builder<I, T>(tokens: I) -> DispatcherBuilder
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        DispatcherBuilder {
            tokens: tokens.into_iter().map(Into::into).collect(),
            transport: None,
            config: ApiConfig::default(),
            span: None,
        }
    }

    /// Append `f` to the chain for `event_name`.
    ///
    /// Events already dispatched keep the chain they were dispatched with.
    pub fn on<F, Fut>(&self, event_name: &str, f: F)
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut callbacks = self
            .inner
            .callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner());
        callbacks
            .entry(event_name.to_string())
            .or_default()
            .push(callback(f));
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// A random session for `group_id` among the active ones.
    pub fn get_session(&self, group_id: i64) -> Option<Arc<AccountSession>> {
        self.inner.sessions.get(group_id)
    }

    /// Run `event` through its callback chain on a new task.
    ///
    /// Returns `None`, dropping the event, when nothing is registered for
    /// its name or the dispatcher is not running.
    pub fn dispatch(&self, mut event: Event) -> Option<JoinHandle<std::result::Result<(), CallbackError>>> {
        // Held until the task is tracked so `stop()` cannot slip in between.
        let running = self.lock_running();
        if running.is_none() {
            debug!(event = event.name(), "dispatcher stopped, dropping event");
            return None;
        }

        let chain: Vec<Callback> = {
            let callbacks = self
                .inner
                .callbacks
                .read()
                .unwrap_or_else(|e| e.into_inner());
            callbacks.get(event.name())?.clone()
        };
        if chain.is_empty() {
            return None;
        }

        event.bind(self.get_session(event.group_id));

        let task = run_chain(Arc::new(event), chain).instrument(self.inner.span.clone());
        let handle = self.inner.tracker.spawn(task);
        drop(running);
        Some(handle)
    }

    /// Initialize sessions and start polling.
    ///
    /// Fails without side effects on running loops when any token cannot
    /// be resolved.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Err(BotError::AlreadyRunning);
        }

        let mut sessions = Vec::with_capacity(self.inner.tokens.len());
        for (index, token) in self.inner.tokens.iter().enumerate() {
            let session = AccountSession::initialize(
                index,
                token,
                self.inner.transport.clone(),
                self.inner.config.clone(),
            )
            .await?;
            sessions.push(Arc::new(session));
        }

        let mut running = self.lock_running();
        if running.is_some() {
            return Err(BotError::AlreadyRunning);
        }

        for session in sessions {
            session.executor().start()?;
            self.inner.sessions.insert(session);
        }

        let shutdown = CancellationToken::new();
        self.inner.tracker.reopen();

        let pollers = self
            .inner
            .sessions
            .primaries()
            .into_iter()
            .map(|session| {
                let task = poll_loop(self.clone(), session, shutdown.clone());
                tokio::spawn(task.instrument(self.inner.span.clone()))
            })
            .collect();

        *running = Some(Running { shutdown, pollers });
        info!(sessions = self.inner.tokens.len(), "dispatcher started");
        Ok(())
    }

    /// Stop polling, wait for dispatched callbacks, then shut sessions down.
    ///
    /// A no-op when not running.
    pub async fn stop(&self) {
        let Some(running) = self.lock_running().take() else {
            return;
        };

        running.shutdown.cancel();
        for poller in running.pollers {
            if let Err(e) = poller.await {
                error!(error = %e, "poll loop terminated abnormally");
            }
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        for session in self.inner.sessions.drain() {
            session.executor().stop().await;
        }

        self.inner.transport.close().await;
        info!("dispatcher stopped");
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.inner.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("tokens", &self.inner.tokens.len())
            .field("running", &self.is_running())
            .field("in_flight", &self.inner.tracker.len())
            .finish_non_exhaustive()
    }
}

async fn run_chain(event: Arc<Event>, chain: Vec<Callback>) -> std::result::Result<(), CallbackError> {
    for (position, callback) in chain.iter().enumerate() {
        // Callbacks are not UnwindSafe; a panic is reported like any other failure
        let result = match AssertUnwindSafe(callback(event.clone())).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(anyhow!("callback panicked: {}", panic_message(panic.as_ref()))),
        };

        if let Err(source) = result {
            error!(
                group_id = event.group_id,
                event = event.name(),
                kind = %event.kind,
                position,
                source = %event.source,
                error = ?source,
                "callback failed"
            );
            return Err(CallbackError {
                event: event.name(),
                position,
                source,
            });
        }
    }
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

async fn poll_loop(dispatcher: Dispatcher, session: Arc<AccountSession>, shutdown: CancellationToken) {
    let group_id = session.group_id();
    let mut longpoll = session.longpoll();
    info!(group_id, "poll loop started");

    loop {
        let updates = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            updates = longpoll.poll() => updates,
        };

        // Failed rounds are retried; the receiver already reset its state.
        let Some(updates) = updates else {
            if !session.executor().is_running() {
                break;
            }
            continue;
        };

        for update in updates {
            dispatcher.dispatch(Event::decode(group_id, update));
        }
    }

    info!(group_id, "poll loop stopped");
}
