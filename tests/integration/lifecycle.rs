//! Integration tests for the exchange lifecycle.
//!
//! Drives a full [`Engine`] against the in-memory backend, with both the
//! direct write path and the change feed active, and verifies:
//!
//! 1. A send produces exactly two messages that end `sent` and `completed`.
//! 2. The UI sees each status transition once, in lifecycle order.
//! 3. Only one exchange runs at a time.
//! 4. Write failures abort the exchange, mark what they must, and free the
//!    guard.
//! 5. Duplicate feed delivery never duplicates messages.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use fulcrum::chat::delay::FixedDelays;
use fulcrum::chat::responses::CANNED_RESPONSES;
use fulcrum::chat::{ExchangeError, ExchangeStep, SendRejected};
use fulcrum::engine::{Engine, EngineConfig};
use fulcrum::persistence::memory::InMemoryBackend;
use fulcrum::sync::StoreEvent;
use fulcrum::sync::feed::{Connectivity, ResubscribeConfig};
use fulcrum_proto::message::{Message, MessageStatus, Role};

const TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fast_config() -> EngineConfig {
    EngineConfig {
        resubscribe: ResubscribeConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            multiplier: 2,
        },
        ..EngineConfig::default()
    }
}

/// Start an engine and wait until its feed is connected.
async fn start(
    backend: &InMemoryBackend,
    delays: FixedDelays,
) -> (Engine<InMemoryBackend, FixedDelays>, mpsc::Receiver<StoreEvent>) {
    let (engine, events) = Engine::init(Arc::new(backend.clone()), fast_config(), delays);
    let mut connectivity = engine.subscribe_connectivity();
    tokio::time::timeout(TIMEOUT, connectivity.wait_for(|c| *c == Connectivity::Connected))
        .await
        .expect("engine never connected")
        .unwrap();
    (engine, events)
}

/// Wait until the published snapshot satisfies `pred`.
async fn wait_for_snapshot<F>(rx: &mut watch::Receiver<Vec<Message>>, description: &str, pred: F) -> Vec<Message>
where
    F: Fn(&[Message]) -> bool,
{
    match tokio::time::timeout(TIMEOUT, rx.wait_for(|s| pred(s))).await {
        Ok(Ok(snapshot)) => snapshot.clone(),
        Ok(Err(_)) => panic!("snapshot channel closed while waiting for {description}"),
        Err(_) => panic!("timed out waiting for {description}"),
    }
}

fn settled(snapshot: &[Message]) -> bool {
    snapshot.len() == 2
        && snapshot[0].status == MessageStatus::Sent
        && snapshot[1].status == MessageStatus::Completed
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hello_produces_user_and_assistant_messages() {
    let backend = InMemoryBackend::new();
    let (engine, _events) = start(&backend, FixedDelays::zero()).await;

    let report = engine.send_message("Hello").unwrap().outcome().await.unwrap();

    let mut snapshots = engine.subscribe_snapshots();
    let snapshot = wait_for_snapshot(&mut snapshots, "exchange to settle", settled).await;

    assert_eq!(snapshot[0].id, report.user_id);
    assert_eq!(snapshot[0].role, Role::User);
    assert_eq!(snapshot[0].content, "Hello");
    assert_eq!(snapshot[1].id, report.assistant_id);
    assert_eq!(snapshot[1].role, Role::Assistant);
    assert!(CANNED_RESPONSES.contains(&snapshot[1].content.as_str()));
    assert!(snapshot[0].created_at < snapshot[1].created_at);

    assert_eq!(backend.rows(), snapshot, "local view matches the store");
    assert!(!engine.is_processing());
    engine.teardown().await;
}

#[tokio::test]
async fn store_events_follow_lifecycle_order() {
    let backend = InMemoryBackend::new();
    let (engine, mut events) = start(&backend, FixedDelays::zero()).await;

    engine.send_message("Hello").unwrap().outcome().await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 4 {
        let event = tokio::time::timeout(TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for store events")
            .unwrap();
        seen.push(event);
    }

    let StoreEvent::Inserted(user) = &seen[0] else {
        panic!("expected user insert, got {:?}", seen[0]);
    };
    assert_eq!((user.role, user.status), (Role::User, MessageStatus::Sending));
    assert_eq!(
        seen[1],
        StoreEvent::StatusChanged {
            message_id: user.id.clone(),
            from: MessageStatus::Sending,
            to: MessageStatus::Sent,
        }
    );

    let StoreEvent::Inserted(assistant) = &seen[2] else {
        panic!("expected assistant insert, got {:?}", seen[2]);
    };
    assert_eq!(
        (assistant.role, assistant.status),
        (Role::Assistant, MessageStatus::Processing)
    );
    assert_eq!(
        seen[3],
        StoreEvent::StatusChanged {
            message_id: assistant.id.clone(),
            from: MessageStatus::Processing,
            to: MessageStatus::Completed,
        }
    );

    // Feed echoes of the same writes must not produce more events.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
    engine.teardown().await;
}

#[tokio::test]
async fn consecutive_exchanges_keep_order() {
    let backend = InMemoryBackend::new();
    let (engine, _events) = start(&backend, FixedDelays::zero()).await;

    for text in ["one", "two", "three"] {
        engine.send_message(text).unwrap().outcome().await.unwrap();
    }

    let mut snapshots = engine.subscribe_snapshots();
    let snapshot = wait_for_snapshot(&mut snapshots, "three exchanges", |s| {
        s.len() == 6 && s.iter().all(|m| m.status.is_terminal())
    })
    .await;

    let user_texts: Vec<&str> = snapshot
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(user_texts, vec!["one", "two", "three"]);
    assert!(snapshot.windows(2).all(|w| w[0].role != w[1].role));
    engine.teardown().await;
}

// ---------------------------------------------------------------------------
// Single-exchange guard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn send_is_rejected_while_exchange_in_flight() {
    let backend = InMemoryBackend::new();
    let (engine, _events) = start(
        &backend,
        FixedDelays {
            ack: Duration::from_millis(100),
            think: Duration::from_millis(100),
        },
    )
    .await;

    let first = engine.send_message("first").unwrap();
    assert!(engine.is_processing());
    assert_eq!(
        engine.send_message("second").unwrap_err(),
        SendRejected::ExchangeInFlight
    );

    first.outcome().await.unwrap();
    assert!(!engine.is_processing());

    let mut snapshots = engine.subscribe_snapshots();
    let snapshot = wait_for_snapshot(&mut snapshots, "first exchange", settled).await;
    assert_eq!(snapshot[0].content, "first");
    engine.teardown().await;
}

#[tokio::test]
async fn empty_send_writes_nothing() {
    let backend = InMemoryBackend::new();
    let (engine, _events) = start(&backend, FixedDelays::zero()).await;

    assert_eq!(engine.send_message("   ").unwrap_err(), SendRejected::EmptyText);
    assert!(backend.rows().is_empty());
    assert!(!engine.is_processing());
    engine.teardown().await;
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn assistant_create_failure_leaves_user_sent() {
    let backend = InMemoryBackend::new();
    let (engine, _events) = start(&backend, FixedDelays::zero()).await;
    backend.fail_next_create(Role::Assistant);

    let err = engine.send_message("Hello").unwrap().outcome().await.unwrap_err();
    assert!(matches!(
        err,
        ExchangeError::Write {
            step: ExchangeStep::CreateAssistant,
            ..
        }
    ));
    assert!(!engine.is_processing());

    let mut snapshots = engine.subscribe_snapshots();
    let snapshot = wait_for_snapshot(&mut snapshots, "user message sent", |s| {
        s.len() == 1 && s[0].status == MessageStatus::Sent
    })
    .await;
    assert_eq!(snapshot[0].role, Role::User);

    // The guard is free again and the next exchange runs normally.
    engine.send_message("again").unwrap().outcome().await.unwrap();
    let snapshot = wait_for_snapshot(&mut snapshots, "second exchange", |s| {
        s.len() == 3 && s[2].status == MessageStatus::Completed
    })
    .await;
    assert_eq!(snapshot[0].status, MessageStatus::Sent);
    engine.teardown().await;
}

#[tokio::test]
async fn completion_write_failure_marks_assistant_error() {
    let backend = InMemoryBackend::new();
    let (engine, _events) = start(&backend, FixedDelays::zero()).await;
    backend.fail_next_status_update(MessageStatus::Completed);

    let err = engine.send_message("Hello").unwrap().outcome().await.unwrap_err();
    assert!(matches!(
        err,
        ExchangeError::Write {
            step: ExchangeStep::MarkCompleted,
            ..
        }
    ));

    let mut snapshots = engine.subscribe_snapshots();
    let snapshot = wait_for_snapshot(&mut snapshots, "assistant marked error", |s| {
        s.len() == 2 && s[1].status == MessageStatus::Error
    })
    .await;
    assert_eq!(snapshot[0].status, MessageStatus::Sent);
    assert_eq!(backend.rows()[1].status, MessageStatus::Error);
    engine.teardown().await;
}

#[tokio::test]
async fn teardown_mid_exchange_fails_the_exchange() {
    let backend = InMemoryBackend::new();
    let (engine, _events) = start(
        &backend,
        FixedDelays {
            ack: Duration::ZERO,
            think: Duration::from_millis(200),
        },
    )
    .await;

    let handle = engine.send_message("Hello").unwrap();
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while backend.rows().len() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "assistant never created");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    engine.teardown().await;
    let err = handle.outcome().await.unwrap_err();
    assert!(matches!(err, ExchangeError::ReconcilerClosed(_)));
}

// ---------------------------------------------------------------------------
// At-least-once feed delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_feed_delivery_does_not_duplicate_messages() {
    let backend = InMemoryBackend::new();
    backend.set_duplicate_delivery(true);
    let (engine, _events) = start(&backend, FixedDelays::zero()).await;

    engine.send_message("Hello").unwrap().outcome().await.unwrap();

    let mut snapshots = engine.subscribe_snapshots();
    wait_for_snapshot(&mut snapshots, "exchange to settle", settled).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.snapshot().len(), 2);
    engine.teardown().await;
}
