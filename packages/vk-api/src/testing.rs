//! In-memory fake of the VK platform for tests.
//!
//! Enable with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! vk-api = { path = "../vk-api", features = ["testing"] }
//! ```
//!
//! [`MockTransport`] records every POST and answers:
//! - `execute`: runs the VKScript calls one by one against the method table
//! - other methods: `{"response": <method table entry>}`
//! - [`LONGPOLL_SERVER`]: scripted poll answers, then empty polls after a
//!   short idle sleep so polling loops do not spin

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::DEFAULT_API_URL;
use crate::error::TransportError;
use crate::transport::{Form, Transport};

/// Poll server URL issued by the fake `groups.getLongPollServer`.
pub const LONGPOLL_SERVER: &str = "https://lp.vk.test/wh1";

/// A recorded POST.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub url: String,
    pub form: Form,
}

impl RecordedCall {
    /// Form field by name.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Method name for calls to the method endpoint.
    pub fn method(&self) -> Option<&str> {
        self.url.strip_prefix(DEFAULT_API_URL)?.strip_prefix('/')
    }

    /// `(method, arguments)` for every call packed into an `execute` script.
    pub fn invocations(&self) -> Vec<(String, Value)> {
        self.param("code").map(parse_script).unwrap_or_default()
    }
}

/// Scriptable fake platform.
pub struct MockTransport {
    calls: Mutex<Vec<RecordedCall>>,
    responses: Mutex<HashMap<String, Value>>,
    failing_methods: Mutex<HashSet<String>>,
    transport_failure: Mutex<Option<TransportError>>,
    longpoll: Mutex<VecDeque<Result<Value, TransportError>>>,
    idle_poll: Duration,
    ts: Mutex<u64>,
    closed: Mutex<bool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            failing_methods: Mutex::new(HashSet::new()),
            transport_failure: Mutex::new(None),
            longpoll: Mutex::new(VecDeque::new()),
            idle_poll: Duration::from_millis(20),
            ts: Mutex::new(1),
            closed: Mutex::new(false),
        }
    }

    /// Answer `method` with `response` (directly and inside `execute`).
    pub fn with_response(self, method: &str, response: Value) -> Self {
        self.set_response(method, response);
        self
    }

    /// How long an unscripted poll is held before returning no updates.
    pub fn with_idle_poll(mut self, idle: Duration) -> Self {
        self.idle_poll = idle;
        self
    }

    pub fn set_response(&self, method: &str, response: Value) {
        lock(&self.responses).insert(method.to_string(), response);
    }

    /// Make `method` answer with a platform `error` object.
    pub fn fail_method(&self, method: &str) {
        lock(&self.failing_methods).insert(method.to_string());
    }

    /// Make every POST fail with `error`.
    pub fn fail_transport(&self, error: TransportError) {
        *lock(&self.transport_failure) = Some(error);
    }

    /// Queue the answer for the next poll.
    pub fn push_longpoll(&self, response: Result<Value, TransportError>) {
        lock(&self.longpoll).push_back(response);
    }

    /// Queue a successful poll carrying `updates`.
    pub fn push_updates(&self, updates: Vec<Value>) {
        let ts = self.next_ts();
        self.push_longpoll(Ok(json!({ "ts": ts.to_string(), "updates": updates })));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Calls to a method endpoint.
    pub fn calls_to(&self, method: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.method() == Some(method))
            .collect()
    }

    pub fn calls_to_url(&self, url: &str) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.url == url).collect()
    }

    /// Every `(method, arguments)` sent through `execute`, in order.
    pub fn executed(&self) -> Vec<(String, Value)> {
        self.calls_to("execute")
            .iter()
            .flat_map(RecordedCall::invocations)
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        *lock(&self.closed)
    }

    fn next_ts(&self) -> u64 {
        let mut ts = lock(&self.ts);
        *ts += 1;
        *ts
    }

    fn method_response(&self, method: &str) -> Value {
        if let Some(response) = lock(&self.responses).get(method) {
            return response.clone();
        }
        match method {
            "groups.getById" => json!([{ "id": 1, "name": "Group", "screen_name": "club1" }]),
            "groups.getLongPollServer" => {
                json!({ "server": LONGPOLL_SERVER, "key": "key", "ts": "1" })
            }
            "groups.setLongPollSettings" => json!(1),
            "messages.send" => json!(7347),
            _ => json!(1),
        }
    }

    fn answer_method(&self, method: &str, form: &Form) -> Value {
        if lock(&self.failing_methods).contains(method) {
            return json!({ "error": { "error_code": 10, "error_msg": "Internal server error" } });
        }

        if method == "execute" {
            let code = form
                .iter()
                .find(|(k, _)| k == "code")
                .map(|(_, v)| v.as_str())
                .unwrap_or_default();
            let results: Vec<Value> = parse_script(code)
                .iter()
                .map(|(method, _)| {
                    if lock(&self.failing_methods).contains(method) {
                        Value::Bool(false)
                    } else {
                        self.method_response(method)
                    }
                })
                .collect();
            return json!({ "response": results });
        }

        json!({ "response": self.method_response(method) })
    }

    async fn answer_longpoll(&self) -> Result<Value, TransportError> {
        let scripted = lock(&self.longpoll).pop_front();
        if let Some(response) = scripted {
            return response;
        }

        tokio::time::sleep(self.idle_poll).await;
        Ok(json!({ "ts": self.next_ts().to_string(), "updates": [] }))
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn post(&self, url: &str, form: &Form) -> Result<Value, TransportError> {
        lock(&self.calls).push(RecordedCall {
            url: url.to_string(),
            form: form.clone(),
        });

        let failure = lock(&self.transport_failure).clone();
        if let Some(error) = failure {
            return Err(error);
        }

        if url == LONGPOLL_SERVER {
            return self.answer_longpoll().await;
        }

        let method = url.rsplit('/').next().unwrap_or_default();
        Ok(self.answer_method(method, form))
    }

    async fn close(&self) {
        *lock(&self.closed) = true;
    }
}

/// Split `return [API.a({..}),API.b({..}),];` into calls.
fn parse_script(code: &str) -> Vec<(String, Value)> {
    code.split("API.")
        .skip(1)
        .filter_map(|part| {
            let open = part.find('(')?;
            let close = part.rfind(')')?;
            let arguments = serde_json::from_str(&part[open + 1..close]).unwrap_or(Value::Null);
            Some((part[..open].to_string(), arguments))
        })
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
