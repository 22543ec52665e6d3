//! Integration tests for change-feed connectivity and resynchronization.
//!
//! Verifies:
//! 1. Existing history is loaded when the engine starts.
//! 2. Writes by other clients reach the local view through the feed.
//! 3. A lost subscription is reported as `Degraded`, and the reload on
//!    resubscription recovers everything written during the outage.
//! 4. Events dropped by a full feed buffer are recovered by the next resync.
//! 5. Subscribe and load failures degrade connectivity without blocking
//!    sends; the direct write path keeps the local view current.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use fulcrum::chat::delay::FixedDelays;
use fulcrum::engine::{Engine, EngineConfig};
use fulcrum::persistence::PersistenceGateway;
use fulcrum::persistence::memory::InMemoryBackend;
use fulcrum::sync::feed::{Connectivity, ResubscribeConfig};
use fulcrum_proto::message::{Message, MessageStatus, Role};

const TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fast_config() -> EngineConfig {
    EngineConfig {
        resubscribe: ResubscribeConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2,
        },
        ..EngineConfig::default()
    }
}

fn init(backend: &InMemoryBackend) -> Engine<InMemoryBackend, FixedDelays> {
    let (engine, _events) = Engine::init(
        Arc::new(backend.clone()),
        fast_config(),
        FixedDelays::zero(),
    );
    engine
}

async fn wait_for_connectivity(rx: &mut watch::Receiver<Connectivity>, want: Connectivity) {
    match tokio::time::timeout(TIMEOUT, rx.wait_for(|c| *c == want)).await {
        Ok(Ok(_)) => {}
        Ok(Err(_)) => panic!("connectivity channel closed while waiting for {want}"),
        Err(_) => panic!("timed out waiting for {want}"),
    }
}

async fn wait_for_snapshot<F>(engine: &Engine<InMemoryBackend, FixedDelays>, description: &str, pred: F) -> Vec<Message>
where
    F: Fn(&[Message]) -> bool,
{
    let mut rx = engine.subscribe_snapshots();
    match tokio::time::timeout(TIMEOUT, rx.wait_for(|s| pred(s))).await {
        Ok(Ok(snapshot)) => snapshot.clone(),
        Ok(Err(_)) => panic!("snapshot channel closed while waiting for {description}"),
        Err(_) => panic!("timed out waiting for {description}"),
    }
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn existing_history_is_loaded_in_order() {
    let backend = InMemoryBackend::new();
    for (role, text, status) in [
        (Role::User, "earlier question", MessageStatus::Sent),
        (Role::Assistant, "earlier answer", MessageStatus::Completed),
    ] {
        backend.create_message(role, text.into(), status).await.unwrap();
    }

    let engine = init(&backend);
    let mut connectivity = engine.subscribe_connectivity();
    wait_for_connectivity(&mut connectivity, Connectivity::Connected).await;

    let snapshot = wait_for_snapshot(&engine, "history load", |s| s.len() == 2).await;
    assert_eq!(snapshot[0].content, "earlier question");
    assert_eq!(snapshot[1].content, "earlier answer");
    engine.teardown().await;
}

#[tokio::test]
async fn engine_starts_connecting() {
    let backend = InMemoryBackend::new();
    backend.fail_subscribes(usize::MAX);

    let engine = init(&backend);
    assert_eq!(engine.connectivity(), Connectivity::Connecting);
    engine.teardown().await;
}

// ---------------------------------------------------------------------------
// Live feed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn writes_by_other_clients_arrive_through_feed() {
    let backend = InMemoryBackend::new();
    let engine = init(&backend);
    let mut connectivity = engine.subscribe_connectivity();
    wait_for_connectivity(&mut connectivity, Connectivity::Connected).await;

    let other = backend
        .create_message(Role::User, "from another tab".into(), MessageStatus::Sending)
        .await
        .unwrap();
    backend
        .update_message_status(&other.id, MessageStatus::Sent)
        .await
        .unwrap();

    let snapshot = wait_for_snapshot(&engine, "foreign message sent", |s| {
        s.len() == 1 && s[0].status == MessageStatus::Sent
    })
    .await;
    assert_eq!(snapshot[0].id, other.id);
    engine.teardown().await;
}

// ---------------------------------------------------------------------------
// Outage and recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dropped_feed_resyncs_missed_writes() {
    let backend = InMemoryBackend::new();
    let engine = init(&backend);
    let mut connectivity = engine.subscribe_connectivity();
    wait_for_connectivity(&mut connectivity, Connectivity::Connected).await;

    // Keep the outage open long enough to write behind the listener's back.
    backend.fail_subscribes(3);
    backend.drop_subscriptions();
    wait_for_connectivity(&mut connectivity, Connectivity::Degraded).await;

    let missed = backend
        .create_message(Role::Assistant, "written during outage".into(), MessageStatus::Completed)
        .await
        .unwrap();

    wait_for_connectivity(&mut connectivity, Connectivity::Connected).await;
    let snapshot = wait_for_snapshot(&engine, "missed write", |s| s.len() == 1).await;
    assert_eq!(snapshot[0], missed);
    assert_eq!(backend.subscriber_count(), 1);
    engine.teardown().await;
}

#[tokio::test]
async fn lossy_feed_gap_is_closed_by_resync() {
    // One-slot subscriber buffer: a burst of writes overflows it.
    let backend = InMemoryBackend::with_feed_buffer(1);
    let engine = init(&backend);
    let mut connectivity = engine.subscribe_connectivity();
    wait_for_connectivity(&mut connectivity, Connectivity::Connected).await;

    let writers: Vec<_> = (0..16)
        .map(|i| {
            let backend = backend.clone();
            tokio::spawn(async move {
                let message = backend
                    .create_message(Role::User, format!("burst {i}"), MessageStatus::Sending)
                    .await
                    .unwrap();
                backend
                    .update_message_status(&message.id, MessageStatus::Sent)
                    .await
                    .unwrap();
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let rows = backend.rows();
    assert_eq!(rows.len(), 16);
    backend.drop_subscriptions();

    let snapshot = wait_for_snapshot(&engine, "resync after lossy feed", |s| s == rows.as_slice()).await;
    assert!(snapshot.iter().all(|m| m.status == MessageStatus::Sent));
    engine.teardown().await;
}

#[tokio::test]
async fn load_failure_reports_degraded_not_connected() {
    let backend = InMemoryBackend::new();
    backend.fail_queries(2);

    let engine = init(&backend);
    let mut connectivity = engine.subscribe_connectivity();
    wait_for_connectivity(&mut connectivity, Connectivity::Degraded).await;
    wait_for_connectivity(&mut connectivity, Connectivity::Connected).await;
    engine.teardown().await;
}

#[tokio::test]
async fn sends_work_while_degraded() {
    let backend = InMemoryBackend::new();
    backend.fail_subscribes(usize::MAX);

    let engine = init(&backend);
    let mut connectivity = engine.subscribe_connectivity();
    wait_for_connectivity(&mut connectivity, Connectivity::Degraded).await;

    engine.send_message("offline hello").unwrap().outcome().await.unwrap();

    let snapshot = wait_for_snapshot(&engine, "direct writes applied", |s| {
        s.len() == 2 && s[1].status == MessageStatus::Completed
    })
    .await;
    assert_eq!(snapshot[0].status, MessageStatus::Sent);
    assert_eq!(engine.connectivity(), Connectivity::Degraded);
    engine.teardown().await;
}

#[tokio::test]
async fn recovery_after_degraded_sends_converges() {
    let backend = InMemoryBackend::new();
    backend.fail_subscribes(5);

    let engine = init(&backend);
    let mut connectivity = engine.subscribe_connectivity();
    wait_for_connectivity(&mut connectivity, Connectivity::Degraded).await;

    engine.send_message("before recovery").unwrap().outcome().await.unwrap();
    wait_for_connectivity(&mut connectivity, Connectivity::Connected).await;

    // The reload re-delivers rows the direct path already applied.
    let snapshot = wait_for_snapshot(&engine, "converged view", |s| {
        s.len() == 2 && s.iter().all(|m| m.status.is_terminal())
    })
    .await;
    assert_eq!(snapshot, backend.rows());
    engine.teardown().await;
}
