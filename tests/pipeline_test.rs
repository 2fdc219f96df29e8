//! End-to-end tests for detection, cooldown and dispatch

mod common;

use arrival_notifier::domain::types::{ChatId, DeliveryStatus, Role, TransitionType, Trigger};
use arrival_notifier::infra::{Config, Store};
use arrival_notifier::services::EvaluationOutcome;
use common::*;
use std::sync::Arc;
use std::time::Duration;

fn add_recipients(h: &Harness, chats: &[i64]) {
    for &chat in chats {
        h.store.upsert_contact(&contact(chat, Role::Recipient, Some(SUBJECT))).unwrap();
    }
}

#[tokio::test]
async fn test_arrival_notifies_reachable_recipients() {
    let h = in_memory(&quiet_config(), RecordingSender::new().failing(ChatId(30)));
    add_recipients(&h, &[10, 20, 30]);

    let away = h.pipeline.append_at(SUBJECT, AWAY.0, AWAY.1, at(0)).unwrap();
    let home = h.pipeline.append_at(SUBJECT, CENTER.0, CENTER.1, at(30)).unwrap();
    assert!(!away.in_zone);
    assert!(home.in_zone);

    let outcome = h.pipeline.evaluate_at(SUBJECT, Trigger::Inline, at(30)).await.unwrap();
    let EvaluationOutcome::Dispatched(event) = outcome else {
        panic!("expected dispatch, got {outcome:?}");
    };
    assert_eq!(event.transition, TransitionType::Arrival);
    assert_eq!(event.sent_count, 2);
    assert_eq!(event.failed_count, 1);
    assert!(event.success());
    assert!(event.is_complete());
    assert_eq!(h.sender.total(), 2);

    // Outcomes are durable and match the in-memory event
    let stored = h.store.event(&event.id).unwrap().unwrap();
    assert_eq!(stored.sent_count, 2);
    assert_eq!(stored.failed_count, 1);
    let failed = stored.recipients.iter().find(|r| r.recipient == ChatId(30)).unwrap();
    assert_eq!(failed.status, DeliveryStatus::Failed);
    assert!(failed.error.as_deref().unwrap_or_default().contains("blocked"));
    assert!(stored.recipients.iter().all(|r| r.status != DeliveryStatus::Pending));
}

#[tokio::test]
async fn test_departure_detected() {
    let h = in_memory(&quiet_config(), RecordingSender::new());
    add_recipients(&h, &[10]);

    h.pipeline.append_at(SUBJECT, CENTER.0, CENTER.1, at(0)).unwrap();
    h.pipeline.append_at(SUBJECT, AWAY.0, AWAY.1, at(30)).unwrap();

    let outcome = h.pipeline.evaluate_at(SUBJECT, Trigger::Background, at(30)).await.unwrap();
    assert_eq!(outcome.event().unwrap().transition, TransitionType::Departure);
    assert_eq!(outcome.event().unwrap().trigger, Trigger::Background);
}

#[tokio::test]
async fn test_no_transition_when_staying_inside() {
    let h = in_memory(&quiet_config(), RecordingSender::new());
    add_recipients(&h, &[10]);

    h.pipeline.append_at(SUBJECT, CENTER.0, CENTER.1, at(0)).unwrap();
    h.pipeline.append_at(SUBJECT, CENTER.0 + 0.0001, CENTER.1, at(30)).unwrap();

    assert_eq!(
        h.pipeline.evaluate_at(SUBJECT, Trigger::Inline, at(30)).await.unwrap(),
        EvaluationOutcome::NoChange
    );
    assert_eq!(h.sender.total(), 0);
}

#[tokio::test]
async fn test_cooldown_blocks_then_releases_at_boundary() {
    let config = quiet_config().with_cooldown_secs(600, 600);
    let h = in_memory(&config, RecordingSender::new());
    add_recipients(&h, &[10]);

    h.pipeline.append_at(SUBJECT, AWAY.0, AWAY.1, at(0)).unwrap();
    h.pipeline.append_at(SUBJECT, CENTER.0, CENTER.1, at(1)).unwrap();
    let first = h.pipeline.evaluate_at(SUBJECT, Trigger::Inline, at(1)).await.unwrap();
    assert!(matches!(first, EvaluationOutcome::Dispatched(_)));

    // Bounce out and back in shortly after
    h.pipeline.append_at(SUBJECT, AWAY.0, AWAY.1, at(100)).unwrap();
    h.pipeline.append_at(SUBJECT, CENTER.0, CENTER.1, at(200)).unwrap();
    let second = h.pipeline.evaluate_at(SUBJECT, Trigger::Inline, at(200)).await.unwrap();
    let EvaluationOutcome::CooldownActive { kind, remaining } = second else {
        panic!("expected cooldown, got {second:?}");
    };
    assert_eq!(kind, TransitionType::Arrival);
    assert_eq!(remaining, Duration::from_secs(401));

    // Exactly one cooldown later the next arrival goes out
    h.pipeline.append_at(SUBJECT, AWAY.0, AWAY.1, at(300)).unwrap();
    h.pipeline.append_at(SUBJECT, CENTER.0, CENTER.1, at(601)).unwrap();
    let third = h.pipeline.evaluate_at(SUBJECT, Trigger::Inline, at(601)).await.unwrap();
    assert!(matches!(third, EvaluationOutcome::Dispatched(_)));

    assert_eq!(h.sender.sent_to(ChatId(10)), 2);
    assert_eq!(h.metrics.cooldown_suppressed(), 1);
}

#[tokio::test]
async fn test_cooldowns_are_per_transition_type() {
    let h = in_memory(&quiet_config(), RecordingSender::new());
    add_recipients(&h, &[10]);

    h.pipeline.append_at(SUBJECT, AWAY.0, AWAY.1, at(0)).unwrap();
    h.pipeline.append_at(SUBJECT, CENTER.0, CENTER.1, at(1)).unwrap();
    h.pipeline.evaluate_at(SUBJECT, Trigger::Inline, at(1)).await.unwrap();

    h.pipeline.append_at(SUBJECT, AWAY.0, AWAY.1, at(60)).unwrap();
    let departure = h.pipeline.evaluate_at(SUBJECT, Trigger::Inline, at(60)).await.unwrap();
    assert_eq!(departure.event().unwrap().transition, TransitionType::Departure);
    assert_eq!(h.sender.sent_to(ChatId(10)), 2);
}

#[tokio::test]
async fn test_zero_recipients_is_recorded() {
    let h = in_memory(&quiet_config(), RecordingSender::new());

    h.pipeline.append_at(SUBJECT, AWAY.0, AWAY.1, at(0)).unwrap();
    h.pipeline.append_at(SUBJECT, CENTER.0, CENTER.1, at(1)).unwrap();

    let outcome = h.pipeline.evaluate_at(SUBJECT, Trigger::Inline, at(1)).await.unwrap();
    let EvaluationOutcome::NoEligibleRecipients(event) = outcome else {
        panic!("expected empty dispatch, got {outcome:?}");
    };
    assert_eq!(event.sent_count, 0);
    assert_eq!(event.failed_count, 0);
    assert!(event.success());
    assert_eq!(h.store.history(SUBJECT, 10).unwrap().len(), 1);
    assert_eq!(h.sender.total(), 0);
}

#[tokio::test]
async fn test_drivers_and_admins_are_not_recipients() {
    let h = in_memory(&quiet_config(), RecordingSender::new());
    add_recipients(&h, &[10]);
    h.store.upsert_contact(&contact(50, Role::Driver, Some(SUBJECT))).unwrap();
    h.store.upsert_contact(&contact(60, Role::Admin, None)).unwrap();

    h.pipeline.append_at(SUBJECT, AWAY.0, AWAY.1, at(0)).unwrap();
    h.pipeline.append_at(SUBJECT, CENTER.0, CENTER.1, at(1)).unwrap();
    let outcome = h.pipeline.evaluate_at(SUBJECT, Trigger::Inline, at(1)).await.unwrap();

    assert_eq!(outcome.event().unwrap().recipients.len(), 1);
    assert_eq!(h.sender.sent_to(ChatId(50)), 0);
    assert_eq!(h.sender.sent_to(ChatId(60)), 0);
}

#[tokio::test]
async fn test_confirmations_go_to_driver_and_admin() {
    let config = Config::default().with_confirmations(true);
    let h = in_memory(&config, RecordingSender::new());
    add_recipients(&h, &[10]);
    h.store.upsert_contact(&contact(50, Role::Driver, Some(SUBJECT))).unwrap();
    h.store.upsert_contact(&contact(60, Role::Admin, None)).unwrap();

    h.pipeline.append_at(SUBJECT, AWAY.0, AWAY.1, at(0)).unwrap();
    h.pipeline.append_at(SUBJECT, CENTER.0, CENTER.1, at(1)).unwrap();
    let outcome = h.pipeline.evaluate_at(SUBJECT, Trigger::Inline, at(1)).await.unwrap();

    let event = outcome.event().unwrap();
    assert!(event.confirmation_sent);
    assert_eq!(h.sender.sent_to(ChatId(50)), 1);
    assert_eq!(h.sender.sent_to(ChatId(60)), 1);
    assert!(h.store.event(&event.id).unwrap().unwrap().confirmation_sent);
}

#[tokio::test]
async fn test_slow_recipient_times_out_without_blocking_others() {
    let config = quiet_config().with_send_timeout_ms(50);
    let h = in_memory(&config, RecordingSender::new().slow(ChatId(20), Duration::from_secs(5)));
    add_recipients(&h, &[10, 20]);

    h.pipeline.append_at(SUBJECT, AWAY.0, AWAY.1, at(0)).unwrap();
    h.pipeline.append_at(SUBJECT, CENTER.0, CENTER.1, at(1)).unwrap();

    let started = std::time::Instant::now();
    let outcome = h.pipeline.evaluate_at(SUBJECT, Trigger::Inline, at(1)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(4));

    let event = outcome.event().unwrap();
    assert_eq!(event.sent_count, 1);
    assert_eq!(event.failed_count, 1);
    let slow = event.recipients.iter().find(|r| r.recipient == ChatId(20)).unwrap();
    assert!(slow.error.as_deref().unwrap_or_default().contains("timed out"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_evaluations_dispatch_once() {
    let h = in_memory(&quiet_config(), RecordingSender::new());
    add_recipients(&h, &[10]);

    h.pipeline.append_at(SUBJECT, AWAY.0, AWAY.1, at(0)).unwrap();
    h.pipeline.append_at(SUBJECT, CENTER.0, CENTER.1, at(1)).unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let pipeline = Arc::clone(&h.pipeline);
        let trigger = if i % 2 == 0 { Trigger::Inline } else { Trigger::Background };
        handles.push(tokio::spawn(async move { pipeline.evaluate_at(SUBJECT, trigger, at(1)).await }));
    }

    let mut dispatched = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            EvaluationOutcome::Dispatched(_) => dispatched += 1,
            EvaluationOutcome::AlreadyEvaluated => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(dispatched, 1);
    assert_eq!(h.sender.sent_to(ChatId(10)), 1);
    assert_eq!(h.store.history(SUBJECT, 10).unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_manual_triggers_pass_cooldown_once() {
    let h = in_memory(&quiet_config(), RecordingSender::new());
    add_recipients(&h, &[10]);
    h.store.upsert_contact(&contact(50, Role::Driver, Some(SUBJECT))).unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pipeline = Arc::clone(&h.pipeline);
        handles.push(tokio::spawn(async move {
            pipeline.notify_manual_at(SUBJECT, ChatId(50), at(0)).await
        }));
    }

    let mut dispatched = 0;
    for handle in handles {
        if let EvaluationOutcome::Dispatched(_) = handle.await.unwrap().unwrap() {
            dispatched += 1;
        }
    }
    assert_eq!(dispatched, 1);
    assert_eq!(h.sender.sent_to(ChatId(10)), 1);
}

#[tokio::test]
async fn test_manual_and_detected_arrivals_share_cooldown() {
    let h = in_memory(&quiet_config(), RecordingSender::new());
    add_recipients(&h, &[10]);
    h.store.upsert_contact(&contact(60, Role::Admin, None)).unwrap();

    let manual = h.pipeline.notify_manual_at(SUBJECT, ChatId(60), at(0)).await.unwrap();
    assert_eq!(manual.event().unwrap().trigger, Trigger::Manual);

    h.pipeline.append_at(SUBJECT, AWAY.0, AWAY.1, at(10)).unwrap();
    h.pipeline.append_at(SUBJECT, CENTER.0, CENTER.1, at(20)).unwrap();
    let detected = h.pipeline.evaluate_at(SUBJECT, Trigger::Inline, at(20)).await.unwrap();
    assert!(matches!(detected, EvaluationOutcome::CooldownActive { .. }));
    assert_eq!(h.sender.sent_to(ChatId(10)), 1);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("driver.db");
    let config = quiet_config();

    {
        let h = harness(&config, Store::open(&path).unwrap(), RecordingSender::new());
        add_recipients(&h, &[10]);
        h.pipeline.append_at(SUBJECT, AWAY.0, AWAY.1, at(0)).unwrap();
        h.pipeline.append_at(SUBJECT, CENTER.0, CENTER.1, at(1)).unwrap();
        let outcome = h.pipeline.evaluate_at(SUBJECT, Trigger::Inline, at(1)).await.unwrap();
        assert!(matches!(outcome, EvaluationOutcome::Dispatched(_)));
    }

    let h = harness(&config, Store::open(&path).unwrap(), RecordingSender::new());

    // The evaluated pair is not replayed
    assert_eq!(
        h.pipeline.evaluate_at(SUBJECT, Trigger::Background, at(5)).await.unwrap(),
        EvaluationOutcome::AlreadyEvaluated
    );

    // The arrival cooldown still holds
    h.pipeline.append_at(SUBJECT, AWAY.0, AWAY.1, at(10)).unwrap();
    h.pipeline.append_at(SUBJECT, CENTER.0, CENTER.1, at(20)).unwrap();
    let outcome = h.pipeline.evaluate_at(SUBJECT, Trigger::Background, at(20)).await.unwrap();
    assert!(matches!(outcome, EvaluationOutcome::CooldownActive { kind: TransitionType::Arrival, .. }));

    assert_eq!(h.store.history(SUBJECT, 10).unwrap().len(), 1);
    assert_eq!(h.sender.total(), 0);
}

#[tokio::test]
async fn test_failed_evaluation_is_retried_on_next_tick() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("driver.db");
    let h = harness(&quiet_config(), Store::open(&path).unwrap(), RecordingSender::new());
    add_recipients(&h, &[10]);

    h.pipeline.append_at(SUBJECT, AWAY.0, AWAY.1, at(0)).unwrap();
    h.pipeline.append_at(SUBJECT, CENTER.0, CENTER.1, at(30)).unwrap();

    rename_table(&path, "tracking", "tracking_moved");
    let err = h.pipeline.evaluate_at(SUBJECT, Trigger::Inline, at(30)).await.unwrap_err();
    assert!(err.is_persistence());
    assert_eq!(h.store.last_evaluated(SUBJECT).unwrap(), None);
    rename_table(&path, "tracking_moved", "tracking");

    let outcome = h.pipeline.evaluate_at(SUBJECT, Trigger::Background, at(60)).await.unwrap();
    assert_eq!(outcome.event().unwrap().transition, TransitionType::Arrival);
    assert_eq!(h.sender.sent_to(ChatId(10)), 1);
}

#[tokio::test]
async fn test_failed_dispatch_gives_back_cooldown_slot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("driver.db");
    let h = harness(&quiet_config(), Store::open(&path).unwrap(), RecordingSender::new());
    add_recipients(&h, &[10]);

    h.pipeline.append_at(SUBJECT, AWAY.0, AWAY.1, at(0)).unwrap();
    h.pipeline.append_at(SUBJECT, CENTER.0, CENTER.1, at(30)).unwrap();

    // recipient lookup runs after the cooldown slot is taken
    rename_table(&path, "contacts", "contacts_moved");
    assert!(h.pipeline.evaluate_at(SUBJECT, Trigger::Inline, at(30)).await.is_err());
    assert_eq!(h.store.last_fired(SUBJECT, TransitionType::Arrival).unwrap(), None);
    assert!(h.store.history(SUBJECT, 10).unwrap().is_empty());
    rename_table(&path, "contacts_moved", "contacts");

    let outcome = h.pipeline.evaluate_at(SUBJECT, Trigger::Background, at(60)).await.unwrap();
    assert!(matches!(outcome, EvaluationOutcome::Dispatched(_)));
    assert_eq!(h.sender.sent_to(ChatId(10)), 1);
    assert_eq!(h.store.last_fired(SUBJECT, TransitionType::Arrival).unwrap(), Some(at(60)));
}
