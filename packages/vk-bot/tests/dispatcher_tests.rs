//! Integration tests for the dispatcher against the in-memory platform.
//!
//! Covers the dispatch contract (chains, ordering, failures), the long poll
//! to callback path, and the start/stop lifecycle.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use vk_api::testing::{MockTransport, LONGPOLL_SERVER};
use vk_api::{ApiConfig, RawUpdate};
use vk_bot::{BotError, Dispatcher, Event, MESSAGE_NEW, RAW_EVENT};

fn config() -> ApiConfig {
    ApiConfig::default().with_batch_pause(Duration::from_millis(5))
}

fn dispatcher(tokens: &[&str], transport: &Arc<MockTransport>) -> Dispatcher {
    Dispatcher::builder(tokens.iter().copied())
        .transport(transport.clone())
        .config(config())
        .build()
}

fn update(kind: &str, object: Value) -> RawUpdate {
    serde_json::from_value(json!({ "type": kind, "object": object, "group_id": 1 }))
        .expect("valid update")
}

fn raw_event(object: Value) -> Event {
    Event::decode(1, update("wall_post_new", object))
}

async fn within<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

// =============================================================================
// Dispatch
// =============================================================================

#[tokio::test]
async fn dispatch_without_callbacks_returns_none() {
    let transport = Arc::new(MockTransport::new());
    let dispatcher = dispatcher(&["token"], &transport);
    dispatcher.start().await.unwrap();
    dispatcher.on(MESSAGE_NEW, |_| async { Ok(()) });

    let handle = dispatcher.dispatch(raw_event(json!({})));

    assert!(handle.is_none());
    dispatcher.stop().await;
}

#[tokio::test]
async fn dispatch_before_start_returns_none() {
    let transport = Arc::new(MockTransport::new());
    let dispatcher = dispatcher(&["token"], &transport);
    dispatcher.on(RAW_EVENT, |_| async { Ok(()) });

    assert!(dispatcher.dispatch(raw_event(json!({}))).is_none());
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn respond_sends_message_through_execute() {
    // Arrange
    let transport = Arc::new(MockTransport::new());
    let dispatcher = dispatcher(&["token"], &transport);
    let sent = Arc::new(Mutex::new(None));
    let recorded = sent.clone();
    dispatcher.on(MESSAGE_NEW, move |event| {
        let recorded = recorded.clone();
        async move {
            let outcome = event.respond("hey").await?;
            *recorded.lock().unwrap() = Some(outcome);
            Ok::<_, anyhow::Error>(())
        }
    });
    dispatcher.start().await.unwrap();

    // Act
    let event = Event::decode(
        1,
        update("message_new", json!({ "id": 1, "peer_id": 2000000107, "text": "hi" })),
    );
    let handle = dispatcher.dispatch(event).expect("callbacks registered");
    within(handle).await.unwrap().unwrap();

    // Assert
    assert_eq!(*sent.lock().unwrap(), Some(Some(json!(7347))));

    let sends: Vec<Value> = transport
        .executed()
        .into_iter()
        .filter(|(method, _)| method == "messages.send")
        .map(|(_, arguments)| arguments)
        .collect();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0]["message"], "hey");
    assert_eq!(sends[0]["peer_id"], 2000000107);
    assert!(sends[0]["random_id"].is_i64());

    let code = transport
        .calls_to("execute")
        .into_iter()
        .filter_map(|call| call.param("code").map(String::from))
        .find(|code| code.contains("messages.send"))
        .unwrap();
    assert!(code.contains(r#"API.messages.send({"message":"hey","peer_id":2000000107,"#));

    dispatcher.stop().await;
}

#[tokio::test]
async fn callbacks_run_in_registration_order() {
    let transport = Arc::new(MockTransport::new());
    let dispatcher = dispatcher(&["token"], &transport);
    let order = Arc::new(Mutex::new(Vec::new()));
    for position in 0..3 {
        let order = order.clone();
        dispatcher.on(RAW_EVENT, move |_| {
            let order = order.clone();
            async move {
                order.lock().unwrap().push(position);
                Ok(())
            }
        });
    }
    dispatcher.start().await.unwrap();

    let handle = dispatcher.dispatch(raw_event(json!({}))).unwrap();
    within(handle).await.unwrap().unwrap();

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    dispatcher.stop().await;
}

#[tokio::test]
async fn failing_callback_aborts_only_its_chain() {
    // Arrange
    let transport = Arc::new(MockTransport::new());
    let dispatcher = dispatcher(&["token"], &transport);
    let skipped = Arc::new(Mutex::new(0));
    let handled = Arc::new(Mutex::new(0));

    dispatcher.on(RAW_EVENT, |event| async move {
        if event.source["fail"] == true {
            anyhow::bail!("cannot handle {}", event.kind);
        }
        Ok(())
    });
    let counter = skipped.clone();
    dispatcher.on(RAW_EVENT, move |_| {
        let counter = counter.clone();
        async move {
            *counter.lock().unwrap() += 1;
            Ok(())
        }
    });
    let counter = handled.clone();
    dispatcher.on(MESSAGE_NEW, move |_| {
        let counter = counter.clone();
        async move {
            *counter.lock().unwrap() += 1;
            Ok(())
        }
    });
    dispatcher.start().await.unwrap();

    // Act
    let failing = dispatcher.dispatch(raw_event(json!({ "fail": true }))).unwrap();
    let sibling = dispatcher
        .dispatch(Event::decode(1, update("message_new", json!({ "peer_id": 1 }))))
        .unwrap();
    let failure = within(failing).await.unwrap().unwrap_err();
    within(sibling).await.unwrap().unwrap();

    // Assert
    assert_eq!(failure.event, RAW_EVENT);
    assert_eq!(failure.position, 0);
    assert_eq!(failure.source.to_string(), "cannot handle wall_post_new");
    assert_eq!(*skipped.lock().unwrap(), 0);
    assert_eq!(*handled.lock().unwrap(), 1);

    // Later events still run the whole chain
    let next = dispatcher.dispatch(raw_event(json!({}))).unwrap();
    within(next).await.unwrap().unwrap();
    assert_eq!(*skipped.lock().unwrap(), 1);

    dispatcher.stop().await;
}

#[tokio::test]
async fn panicking_callback_is_reported_with_its_position() {
    // Arrange
    let transport = Arc::new(MockTransport::new());
    let dispatcher = dispatcher(&["token"], &transport);
    let reached = Arc::new(Mutex::new(false));

    dispatcher.on(RAW_EVENT, |_| async { Ok(()) });
    dispatcher.on(RAW_EVENT, |event| async move {
        if event.source["explode"] == true {
            panic!("exploded");
        }
        Ok::<_, anyhow::Error>(())
    });
    let flag = reached.clone();
    dispatcher.on(RAW_EVENT, move |_| {
        let flag = flag.clone();
        async move {
            *flag.lock().unwrap() = true;
            Ok::<_, anyhow::Error>(())
        }
    });
    dispatcher.start().await.unwrap();

    // Act
    let handle = dispatcher.dispatch(raw_event(json!({ "explode": true }))).unwrap();
    let failure = within(handle).await.unwrap().unwrap_err();

    // Assert
    assert_eq!(failure.event, RAW_EVENT);
    assert_eq!(failure.position, 1);
    assert_eq!(failure.source.to_string(), "callback panicked: exploded");
    assert!(!*reached.lock().unwrap());

    dispatcher.stop().await;
}

#[tokio::test]
async fn late_registration_does_not_affect_dispatched_events() {
    let transport = Arc::new(MockTransport::new());
    let dispatcher = dispatcher(&["token"], &transport);
    let calls = Arc::new(Mutex::new(Vec::new()));
    let record = |name: &'static str| {
        let calls = calls.clone();
        move |_: Arc<Event>| {
            let calls = calls.clone();
            async move {
                calls.lock().unwrap().push(name);
                Ok::<_, anyhow::Error>(())
            }
        }
    };
    dispatcher.on(RAW_EVENT, record("first"));
    dispatcher.start().await.unwrap();

    let handle = dispatcher.dispatch(raw_event(json!({}))).unwrap();
    dispatcher.on(RAW_EVENT, record("late"));
    within(handle).await.unwrap().unwrap();

    assert_eq!(*calls.lock().unwrap(), vec!["first"]);

    let handle = dispatcher.dispatch(raw_event(json!({}))).unwrap();
    within(handle).await.unwrap().unwrap();
    assert_eq!(*calls.lock().unwrap(), vec!["first", "first", "late"]);

    dispatcher.stop().await;
}

// =============================================================================
// Long poll
// =============================================================================

#[tokio::test]
async fn polled_updates_reach_callbacks() {
    // Arrange
    let transport = Arc::new(MockTransport::new());
    let dispatcher = dispatcher(&["token"], &transport);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let raw_tx = tx.clone();
    dispatcher.on(RAW_EVENT, move |event| {
        let tx = raw_tx.clone();
        async move {
            tx.send((event.kind.clone(), event.source.clone())).ok();
            Ok(())
        }
    });
    dispatcher.on(MESSAGE_NEW, move |event| {
        let tx = tx.clone();
        async move {
            let text = event.message().map(|m| m.text.clone()).unwrap_or_default();
            tx.send((event.kind.clone(), Value::String(text))).ok();
            Ok(())
        }
    });

    let object = json!({ "id": 5, "owner_id": -1, "attachments": [{ "type": "poll" }] });
    transport.push_updates(vec![
        json!({ "type": "wall_post_new", "object": object.clone(), "group_id": 1 }),
        json!({ "type": "message_new", "object": { "peer_id": 1, "text": "кста" }, "group_id": 1 }),
    ]);

    // Act
    dispatcher.start().await.unwrap();
    let mut received = vec![within(rx.recv()).await.unwrap(), within(rx.recv()).await.unwrap()];
    received.sort_by(|a, b| a.0.cmp(&b.0));

    // Assert
    assert_eq!(
        received,
        vec![
            ("message_new".to_string(), json!("кста")),
            ("wall_post_new".to_string(), object),
        ]
    );

    let refreshes = transport
        .executed()
        .into_iter()
        .filter(|(method, _)| method == "groups.getLongPollServer")
        .collect::<Vec<_>>();
    assert_eq!(refreshes.len(), 1);
    assert_eq!(refreshes[0].1, json!({ "group_id": 1 }));

    dispatcher.stop().await;
}

#[tokio::test]
async fn expired_key_is_refreshed_transparently() {
    let transport = Arc::new(MockTransport::new());
    let dispatcher = dispatcher(&["token"], &transport);
    let (tx, mut rx) = mpsc::unbounded_channel();
    dispatcher.on(RAW_EVENT, move |event| {
        let tx = tx.clone();
        async move {
            tx.send(event.source.clone()).ok();
            Ok(())
        }
    });
    transport.push_longpoll(Ok(json!({ "failed": 2 })));
    transport.push_updates(vec![json!({ "type": "group_join", "object": { "user_id": 3 } })]);

    dispatcher.start().await.unwrap();
    let source = within(rx.recv()).await.unwrap();

    assert_eq!(source, json!({ "user_id": 3 }));
    let refreshes = transport
        .executed()
        .into_iter()
        .filter(|(method, _)| method == "groups.getLongPollServer")
        .count();
    assert_eq!(refreshes, 2);

    dispatcher.stop().await;
}

// =============================================================================
// Sessions and lifecycle
// =============================================================================

#[tokio::test]
async fn sessions_are_chosen_at_random() {
    let transport = Arc::new(MockTransport::new());
    let dispatcher = dispatcher(&["first", "second"], &transport);
    dispatcher.start().await.unwrap();

    let chosen: HashSet<usize> = (0..200)
        .filter_map(|_| dispatcher.get_session(1))
        .map(|session| session.index())
        .collect();

    assert_eq!(chosen, HashSet::from([0, 1]));
    assert!(dispatcher.get_session(2).is_none());

    // One poll loop per community, not per token
    within(async {
        while transport.calls_to_url(LONGPOLL_SERVER).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    let refreshes = transport
        .executed()
        .into_iter()
        .filter(|(method, _)| method == "groups.getLongPollServer")
        .count();
    assert_eq!(refreshes, 1);

    dispatcher.stop().await;
}

#[tokio::test]
async fn start_fails_when_token_is_rejected() {
    let transport = Arc::new(MockTransport::new());
    transport.fail_method("groups.getById");
    let dispatcher = dispatcher(&["token"], &transport);

    let result = dispatcher.start().await;

    assert!(matches!(result, Err(BotError::Initialization { index: 0, .. })));
    assert!(!dispatcher.is_running());
    assert!(dispatcher.get_session(1).is_none());
}

#[tokio::test]
async fn start_twice_fails() {
    let transport = Arc::new(MockTransport::new());
    let dispatcher = dispatcher(&["token"], &transport);
    dispatcher.start().await.unwrap();

    assert!(matches!(dispatcher.start().await, Err(BotError::AlreadyRunning)));

    dispatcher.stop().await;
}

#[tokio::test]
async fn stop_waits_for_callbacks_before_closing_sessions() {
    // Arrange
    let transport = Arc::new(MockTransport::new());
    let dispatcher = dispatcher(&["token"], &transport);
    let outcome = Arc::new(Mutex::new(None));
    let recorded = outcome.clone();
    dispatcher.on(MESSAGE_NEW, move |event| {
        let recorded = recorded.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let result = event.respond("late reply").await?;
            *recorded.lock().unwrap() = Some(result);
            Ok::<_, anyhow::Error>(())
        }
    });
    dispatcher.start().await.unwrap();
    let session = dispatcher.get_session(1).unwrap();

    // Act
    let handle = dispatcher
        .dispatch(Event::decode(1, update("message_new", json!({ "peer_id": 4 }))))
        .unwrap();
    within(dispatcher.stop()).await;

    // Assert
    within(handle).await.unwrap().unwrap();
    assert_eq!(*outcome.lock().unwrap(), Some(Some(json!(7347))));
    assert!(!dispatcher.is_running());
    assert!(!session.executor().is_running());
    assert!(dispatcher.get_session(1).is_none());
    assert!(transport.is_closed());
    assert!(dispatcher.dispatch(raw_event(json!({}))).is_none());
}

#[tokio::test]
async fn stop_abandons_a_pending_poll() {
    let transport = Arc::new(MockTransport::new().with_idle_poll(Duration::from_secs(30)));
    let dispatcher = dispatcher(&["token"], &transport);
    dispatcher.start().await.unwrap();

    within(async {
        while transport.calls_to_url(LONGPOLL_SERVER).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    tokio::time::timeout(Duration::from_secs(1), dispatcher.stop())
        .await
        .expect("stop waited for the held poll");

    assert!(transport.is_closed());
    assert_eq!(transport.calls_to_url(LONGPOLL_SERVER).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_dispatched_during_stop_keep_their_session() {
    // Arrange
    let transport = Arc::new(MockTransport::new());
    let dispatcher = dispatcher(&["token"], &transport);
    dispatcher.on(RAW_EVENT, |event| async move {
        let outcome = event.request("utils.getServerTime", vk_api::params!()).await?;
        anyhow::ensure!(outcome.is_some(), "no outcome for {}", event.kind);
        Ok::<_, anyhow::Error>(())
    });
    dispatcher.start().await.unwrap();

    let producer = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let mut handles = Vec::new();
            while let Some(handle) = dispatcher.dispatch(raw_event(json!({}))) {
                handles.push(handle);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            handles
        })
    };

    // Act
    tokio::time::sleep(Duration::from_millis(20)).await;
    within(dispatcher.stop()).await;

    // Assert: every accepted event ran against a live session
    let handles = within(producer).await.unwrap();
    assert!(!handles.is_empty());
    for handle in handles {
        within(handle).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn stop_without_start_is_noop() {
    let transport = Arc::new(MockTransport::new());
    let dispatcher = dispatcher(&["token"], &transport);

    dispatcher.stop().await;

    assert!(!transport.is_closed());
}

#[tokio::test]
async fn dispatcher_restarts_after_stop() {
    let transport = Arc::new(MockTransport::new());
    let dispatcher = dispatcher(&["token"], &transport);
    dispatcher.on(RAW_EVENT, |_| async { Ok(()) });

    dispatcher.start().await.unwrap();
    dispatcher.stop().await;
    dispatcher.start().await.unwrap();

    let handle = dispatcher.dispatch(raw_event(json!({}))).unwrap();
    within(handle).await.unwrap().unwrap();
    assert!(dispatcher.get_session(1).is_some());

    dispatcher.stop().await;
}
