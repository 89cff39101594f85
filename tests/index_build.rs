mod common;

use common::{message, open_engine, test_config, FakeMailbox};
use sealsearch::config::EngineConfig;
use sealsearch::indexer::{estimate_minutes_remaining, BuildOutcome, LAST_BUILT_KEY};
use sealsearch::mailbox::{MailboxEvent, NetworkStatus, SystemSignal, ThermalState};
use sealsearch::types::{now_ts, BuildPhase, IndexState};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn three_messages() -> Vec<(sealsearch::mailbox::MessageMetadata, String)> {
    vec![
        message("m100", 100, "First", "alpha body"),
        message("m200", 200, "Second", "beta body"),
        message("m300", 300, "Third", "gamma body"),
    ]
}

#[tokio::test]
async fn builds_three_message_mailbox() {
    let tmp = TempDir::new().unwrap();
    let mailbox = Arc::new(FakeMailbox::new(2, three_messages()));
    let (engine, background) = open_engine(tmp.path(), test_config(tmp.path()), mailbox.clone()).await;

    let outcome = engine.build().await.unwrap();
    assert_eq!(outcome, BuildOutcome::Complete);

    let store = engine.store().await;
    assert_eq!(store.count().await.unwrap(), 3);
    assert_eq!(store.oldest().await.unwrap().unwrap().1, 100);
    assert_eq!(store.newest().await.unwrap().unwrap().1, 300);

    let progress = engine.progress().await;
    assert_eq!(progress.phase, BuildPhase::Idle);
    assert_eq!(progress.processed, 3);
    assert_eq!(progress.total, 3);
    assert_eq!(progress.percent, 100.0);
    assert_eq!(engine.index_state().await, IndexState::Complete);

    assert_eq!(background.begins.load(Ordering::SeqCst), 1);
    assert_eq!(background.ends.load(Ordering::SeqCst), 1);
    assert_eq!(mailbox.total_detail_calls(), 3);
    assert_eq!(mailbox.page_requests(), vec![None, Some(200)]);

    let built_at: i64 = store
        .get_meta(LAST_BUILT_KEY)
        .await
        .unwrap()
        .expect("build time recorded")
        .parse()
        .unwrap();
    assert!((built_at - now_ts()).abs() < 60);
}

#[tokio::test]
async fn enable_starts_a_background_build_only_when_behind() {
    let tmp = TempDir::new().unwrap();
    let mailbox = Arc::new(FakeMailbox::new(2, three_messages()));
    let (engine, _) = open_engine(tmp.path(), test_config(tmp.path()), mailbox).await;

    assert!(engine.enable().await.unwrap());
    let progress = engine.builder().await.wait_until_settled().await;
    assert_eq!(progress.phase, BuildPhase::Idle);
    assert_eq!(engine.store().await.count().await.unwrap(), 3);

    assert!(!engine.enable().await.unwrap());
}

#[tokio::test]
async fn thermal_pause_resumes_from_watermark() {
    let tmp = TempDir::new().unwrap();
    let mailbox = Arc::new(FakeMailbox::new(
        2,
        vec![
            message("m100", 100, "One", "first"),
            message("m200", 200, "Two", "second"),
            message("m300", 300, "Three", "third"),
            message("m400", 400, "Four", "fourth"),
        ],
    ));
    let (engine, _) = open_engine(tmp.path(), test_config(tmp.path()), mailbox.clone()).await;
    let builder = engine.builder().await;

    let hook_builder = builder.clone();
    mailbox.on_page(move |call| {
        if call == 2 {
            hook_builder.handle_signal(SystemSignal::Thermal(ThermalState::Critical));
        }
    });

    let outcome = builder.build().await.unwrap();
    match outcome {
        BuildOutcome::Paused(reasons) => assert!(reasons.thermal),
        other => panic!("expected paused build, got {other:?}"),
    }
    assert_eq!(builder.progress().phase, BuildPhase::Paused);
    assert_eq!(engine.index_state().await, IndexState::Paused);
    assert_eq!(engine.store().await.count().await.unwrap(), 2);
    assert_eq!(builder.watermark(), Some(300));

    // Serious is not a clearing state.
    builder.handle_signal(SystemSignal::Thermal(ThermalState::Serious));
    assert!(builder.pause_reasons().thermal);

    builder.handle_signal(SystemSignal::Thermal(ThermalState::Nominal));
    let progress = builder.wait_until_settled().await;
    assert_eq!(progress.phase, BuildPhase::Idle);
    assert_eq!(engine.store().await.count().await.unwrap(), 4);

    for id in ["m100", "m200", "m300", "m400"] {
        assert_eq!(mailbox.detail_calls(id), 1, "{id} fetched more than once");
    }
    let requests = mailbox.page_requests();
    assert_eq!(requests[0], None);
    assert_eq!(requests[1], Some(300));
    assert_eq!(requests[2], Some(300));
    assert!(requests.iter().all(|r| r.map_or(true, |end| end <= 300)));
}

#[tokio::test]
async fn pause_reasons_are_tracked_independently() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig {
        wifi_only: true,
        ..test_config(tmp.path())
    };
    let mailbox = Arc::new(FakeMailbox::new(2, three_messages()));
    let (engine, _) = open_engine(tmp.path(), config, mailbox).await;
    let builder = engine.builder().await;

    builder.handle_signal(SystemSignal::Network(NetworkStatus::Cellular));
    builder.handle_signal(SystemSignal::BackgroundTimeExpired);
    builder.pause();

    let outcome = builder.build().await.unwrap();
    let BuildOutcome::Paused(reasons) = outcome else {
        panic!("expected paused build");
    };
    assert!(reasons.network && reasons.background_time && reasons.user);
    assert_eq!(engine.store().await.count().await.unwrap(), 0);

    builder.handle_signal(SystemSignal::Network(NetworkStatus::Wifi));
    builder.handle_signal(SystemSignal::BackgroundTimeRenewed);
    assert!(builder.pause_reasons().user);

    builder.resume();
    assert!(builder.pause_reasons().is_empty());
    builder.wait_until_settled().await;
    assert_eq!(engine.store().await.count().await.unwrap(), 3);
}

#[tokio::test]
async fn repeated_fetch_failures_pause_with_retryable_error() {
    let tmp = TempDir::new().unwrap();
    let mailbox = Arc::new(FakeMailbox::new(2, three_messages()));
    let (engine, _) = open_engine(tmp.path(), test_config(tmp.path()), mailbox.clone()).await;
    let builder = engine.builder().await;

    mailbox.fail_next_pages(3);
    let err = builder.build().await.unwrap_err();
    assert!(err.is_retryable());
    assert!(builder.pause_reasons().fetch_failures);
    assert_eq!(builder.progress().phase, BuildPhase::Paused);
    assert!(builder.progress().last_error.is_some());
    assert_eq!(mailbox.page_requests().len(), 3);
    assert_eq!(engine.store().await.count().await.unwrap(), 0);

    builder.resume();
    builder.wait_until_settled().await;
    assert_eq!(engine.store().await.count().await.unwrap(), 3);
    assert_eq!(engine.index_state().await, IndexState::Complete);
}

#[tokio::test]
async fn transient_fetch_failure_is_retried() {
    let tmp = TempDir::new().unwrap();
    let mailbox = Arc::new(FakeMailbox::new(2, three_messages()));
    let (engine, _) = open_engine(tmp.path(), test_config(tmp.path()), mailbox.clone()).await;

    mailbox.fail_next_pages(2);
    assert_eq!(engine.build().await.unwrap(), BuildOutcome::Complete);
    assert_eq!(engine.store().await.count().await.unwrap(), 3);
}

#[tokio::test]
async fn undecryptable_message_is_indexed_as_failed() {
    let tmp = TempDir::new().unwrap();
    let mut messages = three_messages();
    messages.push((message("bad", 250, "Broken", "x").0, "CORRUPT payload".to_string()));
    let mailbox = Arc::new(FakeMailbox::new(10, messages));
    let (engine, _) = open_engine(tmp.path(), test_config(tmp.path()), mailbox).await;

    assert_eq!(engine.build().await.unwrap(), BuildOutcome::Complete);
    let store = engine.store().await;
    assert_eq!(store.count().await.unwrap(), 4);

    let bad = store.get("bad").await.unwrap().unwrap();
    assert!(bad.decryption_failed);
    assert!(!bad.has_body);
    assert!(store.get("m200").await.unwrap().unwrap().is_searchable());
    assert!(engine.search("broken", 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn storage_limit_leaves_partial_index() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig {
        storage_limit_bytes: Some(1),
        ..test_config(tmp.path())
    };
    let mailbox = Arc::new(FakeMailbox::new(2, three_messages()));
    let (engine, background) = open_engine(tmp.path(), config, mailbox).await;

    assert_eq!(engine.build().await.unwrap(), BuildOutcome::Partial);
    let progress = engine.progress().await;
    assert!(progress.partial);
    assert_eq!(progress.processed, 2);
    assert_eq!(engine.index_state().await, IndexState::Partial);
    assert_eq!(background.ends.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn watermark_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig {
        storage_limit_bytes: Some(1),
        ..test_config(tmp.path())
    };
    let mailbox = Arc::new(FakeMailbox::new(2, three_messages()));
    {
        let (engine, _) = open_engine(tmp.path(), config.clone(), mailbox.clone()).await;
        assert_eq!(engine.build().await.unwrap(), BuildOutcome::Partial);
    }

    let (engine, _) = open_engine(tmp.path(), test_config(tmp.path()), mailbox.clone()).await;
    assert_eq!(engine.build().await.unwrap(), BuildOutcome::Complete);
    assert_eq!(engine.store().await.count().await.unwrap(), 3);

    let requests = mailbox.page_requests();
    assert_eq!(requests.last().copied().flatten(), Some(200));
    assert_eq!(mailbox.total_detail_calls(), 3);
}

#[tokio::test]
async fn events_apply_immediately_when_idle() {
    let tmp = TempDir::new().unwrap();
    let mailbox = Arc::new(FakeMailbox::new(2, three_messages()));
    let (engine, _) = open_engine(tmp.path(), test_config(tmp.path()), mailbox).await;
    engine.build().await.unwrap();
    let builder = engine.builder().await;
    let store = engine.store().await;

    let (mut fresh, body) = message("m400", 400, "Invoice 42", "please pay");
    fresh.detail_downloaded = true;
    fresh.body = Some(body);
    engine.handle_event(MailboxEvent::Insert(fresh.clone())).await;
    engine
        .handle_event(MailboxEvent::Move {
            message_id: "m100".into(),
            label_ids: common::labels(&["3"]),
            location: 3,
        })
        .await;
    engine
        .handle_event(MailboxEvent::Delete {
            message_id: "m200".into(),
        })
        .await;

    let mut renamed = fresh.clone();
    renamed.timestamp = 450;
    engine
        .handle_event(MailboxEvent::Update {
            message: renamed,
            body_changed: false,
        })
        .await;
    builder.flush_events().await;

    assert_eq!(store.count().await.unwrap(), 3);
    assert!(!store.contains("m200").await.unwrap());
    let moved = store.get("m100").await.unwrap().unwrap();
    assert_eq!(moved.label_ids, common::labels(&["3"]));
    assert_eq!(moved.location, 3);
    let updated = store.get("m400").await.unwrap().unwrap();
    assert_eq!(updated.timestamp, 450);
    assert!(updated.is_searchable());

    let hits = engine.search("invoice", 0).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].message_id, "m400");
}

#[tokio::test]
async fn events_apply_while_build_is_paused() {
    let tmp = TempDir::new().unwrap();
    let mailbox = Arc::new(FakeMailbox::new(2, three_messages()));
    let (engine, _) = open_engine(tmp.path(), test_config(tmp.path()), mailbox).await;
    engine.build().await.unwrap();
    let builder = engine.builder().await;
    let store = engine.store().await;

    builder.pause();
    let outcome = builder.spawn_build().await.unwrap().unwrap();
    assert!(matches!(outcome, BuildOutcome::Paused(reasons) if reasons.user));
    assert_eq!(builder.progress().phase, BuildPhase::Paused);

    engine
        .handle_event(MailboxEvent::Delete {
            message_id: "m100".into(),
        })
        .await;
    tokio::time::timeout(Duration::from_secs(5), builder.flush_events())
        .await
        .expect("events flushed while paused");

    assert!(!store.contains("m100").await.unwrap());
    assert_eq!(store.count().await.unwrap(), 2);
    assert_eq!(builder.progress().phase, BuildPhase::Paused);
}

#[tokio::test]
async fn events_during_a_build_apply_afterwards_in_arrival_order() {
    let tmp = TempDir::new().unwrap();
    let mailbox = Arc::new(FakeMailbox::new(1, three_messages()));
    let (engine, _) = open_engine(tmp.path(), test_config(tmp.path()), mailbox.clone()).await;
    let builder = engine.builder().await;

    let (mut late, body) = message("m050", 50, "Late arrival", "short lived");
    late.detail_downloaded = true;
    late.body = Some(body);

    let phases = Arc::new(std::sync::Mutex::new(Vec::new()));
    let hook_builder = builder.clone();
    let hook_phases = phases.clone();
    mailbox.on_page(move |call| {
        hook_phases.lock().unwrap().push(hook_builder.progress().phase);
        if call == 1 {
            // m300 is not stored yet; applying the move now would be lost
            // when the first page inserts it.
            hook_builder.submit_event(MailboxEvent::Insert(late.clone()));
            hook_builder.submit_event(MailboxEvent::Delete {
                message_id: "m050".into(),
            });
            hook_builder.submit_event(MailboxEvent::Move {
                message_id: "m300".into(),
                label_ids: common::labels(&["3"]),
                location: 3,
            });
        }
    });

    assert_eq!(builder.build().await.unwrap(), BuildOutcome::Complete);
    builder.flush_events().await;

    assert!(phases
        .lock()
        .unwrap()
        .iter()
        .all(|phase| *phase == BuildPhase::Building));

    let store = engine.store().await;
    assert_eq!(store.count().await.unwrap(), 3);
    assert!(!store.contains("m050").await.unwrap());
    let moved = store.get("m300").await.unwrap().unwrap();
    assert_eq!(moved.label_ids, common::labels(&["3"]));
    assert_eq!(moved.location, 3);
}

#[tokio::test]
async fn delete_index_stops_a_queued_build() {
    let tmp = TempDir::new().unwrap();
    let messages = (1..=40)
        .map(|i| message(&format!("m{i:02}"), i * 10, "Bulk", "filler"))
        .collect();
    let mailbox = Arc::new(FakeMailbox::new(10, messages));
    let (engine, _) = open_engine(tmp.path(), test_config(tmp.path()), mailbox.clone()).await;

    assert!(engine.enable().await.unwrap());
    engine.delete_index().await.unwrap();

    assert!(mailbox.total_detail_calls() <= 10);
    assert_eq!(engine.store().await.count().await.unwrap(), 0);
    assert_eq!(engine.progress().await.phase, BuildPhase::Idle);

    assert_eq!(engine.build().await.unwrap(), BuildOutcome::Complete);
    assert_eq!(engine.store().await.count().await.unwrap(), 40);
}

#[tokio::test]
async fn delete_index_resets_engine() {
    let tmp = TempDir::new().unwrap();
    let mailbox = Arc::new(FakeMailbox::new(2, three_messages()));
    let (engine, _) = open_engine(tmp.path(), test_config(tmp.path()), mailbox).await;
    engine.build().await.unwrap();

    engine.delete_index().await.unwrap();
    engine.delete_index().await.unwrap();
    assert_eq!(engine.store().await.count().await.unwrap(), 0);
    assert_eq!(engine.index_state().await, IndexState::Disabled);

    assert_eq!(engine.build().await.unwrap(), BuildOutcome::Complete);
    assert_eq!(engine.store().await.count().await.unwrap(), 3);
}

#[test]
fn eta_rounds_up_to_whole_minutes() {
    assert_eq!(estimate_minutes_remaining(Duration::from_secs(30), 0, 50), 0);
    assert_eq!(estimate_minutes_remaining(Duration::from_secs(1), 10, 50), 1);
    assert_eq!(estimate_minutes_remaining(Duration::from_secs(30), 500, 50), 5);
}
