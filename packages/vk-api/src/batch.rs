//! Request batching through the `execute` method.
//!
//! Callers enqueue single method calls and await their own result. A
//! background loop drains the queue every [`ApiConfig::batch_pause`], packs
//! up to [`ApiConfig::batch_size`] calls into one VKScript program and
//! resolves each caller with the value at its position in the answer.
//!
//! ```text
//! enqueue() ─► queue ─► drain loop ─► execute("return [API.a(..),API.b(..),];")
//!    ▲                                        │
//!    └──────────── oneshot per request ◄──────┘  (positional)
//! ```
//!
//! At most one `execute` is in flight per executor. Failed calls, and the
//! whole batch on transport errors, resolve to `None`.

use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::client::ApiClient;
use crate::error::LifecycleError;
use crate::transport::Params;

/// Result of a queued call. `None` when the call or its batch failed.
pub type Outcome = Option<Value>;

/// A call waiting in the queue.
#[derive(Debug)]
struct Request {
    method: String,
    arguments: Params,
    respond_to: oneshot::Sender<Outcome>,
}

struct Running {
    sender: mpsc::UnboundedSender<Request>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Batching executor for one access token.
pub struct BatchExecutor {
    client: ApiClient,
    state: Mutex<Option<Running>>,
}

impl BatchExecutor {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            state: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn is_running(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|running| !running.shutdown.is_cancelled())
    }

    /// Start the drain loop on the current tokio runtime.
    pub fn start(&self) -> Result<(), LifecycleError> {
        let mut state = self.lock();
        if state.is_some() {
            return Err(LifecycleError::AlreadyRunning);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            drain_loop(self.client.clone(), receiver, shutdown.clone())
                .instrument(tracing::Span::current()),
        );

        *state = Some(Running {
            sender,
            shutdown,
            handle,
        });
        Ok(())
    }

    /// Signal the loop to stop and wait for it to drain the queue.
    ///
    /// A no-op when the loop is not running.
    pub async fn stop(&self) {
        let Some(running) = self.lock().take() else {
            return;
        };

        running.shutdown.cancel();
        drop(running.sender);

        if let Err(e) = running.handle.await {
            error!(error = %e, "batch loop terminated abnormally");
        }
    }

    /// Queue a call and wait for its result.
    ///
    /// Fails only when the loop is not running. Remote failures are `Ok(None)`.
    pub async fn enqueue(&self, method: &str, arguments: Params) -> Result<Outcome, LifecycleError> {
        let sender = {
            let state = self.lock();
            match state.as_ref() {
                Some(running) if !running.shutdown.is_cancelled() => running.sender.clone(),
                _ => return Err(LifecycleError::NotRunning),
            }
        };

        let (respond_to, response) = oneshot::channel();
        sender
            .send(Request {
                method: method.to_string(),
                arguments,
                respond_to,
            })
            .map_err(|_| LifecycleError::NotRunning)?;

        // The loop dropped the request without answering: treat as failed.
        Ok(response.await.unwrap_or(None))
    }

    /// Call `method` directly, bypassing the queue. Works while stopped.
    pub async fn submit(&self, method: &str, arguments: Params) -> Outcome {
        self.client.submit(method, arguments).await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for BatchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchExecutor")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

async fn drain_loop(
    client: ApiClient,
    mut queue: mpsc::UnboundedReceiver<Request>,
    shutdown: CancellationToken,
) {
    let pause = client.config().batch_pause;
    let cap = client.config().batch_size;

    info!("batch loop started");

    loop {
        tokio::time::sleep(pause).await;

        // Queued requests win over the stop signal so nothing is abandoned.
        let first = tokio::select! {
            biased;
            Some(request) = queue.recv() => request,
            _ = shutdown.cancelled() => break,
        };

        let mut batch = Vec::with_capacity(cap);
        batch.push(first);
        while batch.len() < cap {
            match queue.try_recv() {
                Ok(request) => batch.push(request),
                Err(_) => break,
            }
        }

        execute_batch(&client, batch).await;
    }

    reject_pending(&mut queue);

    info!("batch loop stopped");
}

/// Close the queue and answer whatever slipped in after the final check
/// with `None`, so no caller is left waiting.
fn reject_pending(queue: &mut mpsc::UnboundedReceiver<Request>) -> usize {
    queue.close();
    let mut rejected = 0;
    while let Ok(request) = queue.try_recv() {
        let _ = request.respond_to.send(None);
        rejected += 1;
    }
    if rejected > 0 {
        debug!(rejected, "answered requests queued after stop");
    }
    rejected
}

async fn execute_batch(client: &ApiClient, batch: Vec<Request>) {
    let code = compose_script(&batch);
    debug!(batch_size = batch.len(), "executing batch");

    let mut params = Params::new();
    params.insert("code".into(), Value::String(code));

    let responses = match client.submit("execute", params).await {
        Some(Value::Array(responses)) => responses,
        Some(other) => {
            warn!(response = %other, "execute returned a non-array response");
            Vec::new()
        }
        None => Vec::new(),
    };

    if !responses.is_empty() && responses.len() != batch.len() {
        warn!(
            expected = batch.len(),
            received = responses.len(),
            "execute response length mismatch"
        );
    }

    let mut responses = responses.into_iter();
    for request in batch {
        let outcome = match responses.next() {
            Some(Value::Bool(false)) | None => None,
            Some(value) => Some(value),
        };
        // The caller may have given up waiting.
        let _ = request.respond_to.send(outcome);
    }
}

/// VKScript program returning the results of all calls in order.
fn compose_script(batch: &[Request]) -> String {
    let mut code = String::from("return [");
    for request in batch {
        code.push_str("API.");
        code.push_str(&request.method);
        code.push('(');
        code.push_str(&Value::Object(request.arguments.clone()).to_string());
        code.push_str("),");
    }
    code.push_str("];");
    code
}
