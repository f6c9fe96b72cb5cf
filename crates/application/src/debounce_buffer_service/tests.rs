use std::sync::Arc;

use chatflow_core::{AppError, TenantId};
use chatflow_domain::{ConversationKey, CoordinationKeys};

use crate::coordination_config::CoordinationConfig;
use crate::coordination_ports::{AtomicBatch, CoordinationStore, StoreCommand};
use crate::test_support::{FakeCoordinationStore, ManualClock, epoch, epoch_millis};

use super::{DebounceBuffer, EnqueueOutcome};

struct Fixture {
    store: Arc<FakeCoordinationStore>,
    clock: Arc<ManualClock>,
    buffer: DebounceBuffer,
}

fn fixture() -> Fixture {
    let store = Arc::new(FakeCoordinationStore::new());
    let clock = Arc::new(ManualClock::at_epoch_seconds(0));
    let buffer = DebounceBuffer::new(
        store.clone(),
        clock.clone(),
        CoordinationKeys::default(),
        &CoordinationConfig::default(),
    );

    Fixture {
        store,
        clock,
        buffer,
    }
}

fn conversation(chat_id: &str) -> ConversationKey {
    ConversationKey::new(TenantId::new(), chat_id).unwrap_or_else(|_| unreachable!())
}

async fn enqueue_text(fixture: &Fixture, key: &ConversationKey, text: &str) -> EnqueueOutcome {
    fixture
        .buffer
        .enqueue(key, &text.to_owned(), 5, None)
        .await
        .unwrap_or_else(|error| panic!("enqueue failed: {error}"))
}

async fn pop_texts(fixture: &Fixture, key: &ConversationKey) -> Vec<String> {
    fixture
        .buffer
        .pop_batch::<String>(key)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|entry| entry.payload)
        .collect()
}

#[tokio::test]
async fn burst_fires_one_window_after_last_entry() {
    let fixture = fixture();
    let c1 = conversation("C1");

    for (second, text) in [(0, "p0"), (2, "p2"), (4, "p4")] {
        fixture.clock.set_epoch_seconds(second);
        enqueue_text(&fixture, &c1, text).await;
    }

    assert!(fixture.buffer.get_due(epoch(7)).await.unwrap_or_default().is_empty());
    assert!(fixture.buffer.get_due(epoch(8)).await.unwrap_or_default().is_empty());
    assert_eq!(
        fixture.buffer.get_due(epoch(9)).await.unwrap_or_default(),
        vec![c1.clone()]
    );
    assert_eq!(pop_texts(&fixture, &c1).await, vec!["p0", "p2", "p4"]);
}

#[tokio::test]
async fn enqueue_reports_rearmed_due_time() {
    let fixture = fixture();
    let c1 = conversation("C1");

    assert_eq!(
        enqueue_text(&fixture, &c1, "first").await,
        EnqueueOutcome::Buffered { due_at: epoch(5) }
    );
    fixture.clock.advance_seconds(3);
    assert_eq!(
        enqueue_text(&fixture, &c1, "second").await,
        EnqueueOutcome::Buffered { due_at: epoch(8) }
    );

    let list_key = fixture.buffer.keys().list_key(&c1);
    assert_eq!(
        fixture
            .store
            .score(fixture.buffer.keys().due_index_key().as_str(), list_key.as_str())
            .await,
        Some(8)
    );
}

#[tokio::test]
async fn sub_second_enqueue_never_fires_before_window_ends() {
    let fixture = fixture();
    let c1 = conversation("C1");
    fixture.clock.set_epoch_millis(4_900);

    assert_eq!(
        enqueue_text(&fixture, &c1, "late").await,
        EnqueueOutcome::Buffered {
            due_at: epoch_millis(9_900)
        }
    );

    assert!(fixture.buffer.get_due(epoch(9)).await.unwrap_or_default().is_empty());
    assert!(
        fixture
            .buffer
            .get_due(epoch_millis(9_899))
            .await
            .unwrap_or_default()
            .is_empty()
    );
    assert_eq!(
        fixture.buffer.get_due(epoch(10)).await.unwrap_or_default(),
        vec![c1.clone()]
    );

    let list_key = fixture.buffer.keys().list_key(&c1);
    assert_eq!(
        fixture
            .store
            .score(fixture.buffer.keys().due_index_key().as_str(), list_key.as_str())
            .await,
        Some(10)
    );
}

#[tokio::test]
async fn entry_list_gets_safety_ttl() {
    let fixture = fixture();
    let c1 = conversation("C1");

    enqueue_text(&fixture, &c1, "hello").await;

    let list_key = fixture.buffer.keys().list_key(&c1);
    assert_eq!(fixture.store.ttl(list_key.as_str()).await, Some(86_400));
}

#[tokio::test]
async fn zero_window_is_clamped_to_one_second() {
    let fixture = fixture();
    let c1 = conversation("C1");

    let outcome = fixture.buffer.enqueue(&c1, &"x", 0, None).await;

    assert!(matches!(
        outcome,
        Ok(EnqueueOutcome::Buffered { due_at }) if due_at == epoch(1)
    ));
}

#[tokio::test]
async fn overflow_keeps_newest_entries_in_order() {
    let fixture = fixture();
    let c1 = conversation("C1");

    for index in 0..5 {
        let outcome = fixture
            .buffer
            .enqueue(&c1, &format!("m{index}"), 5, Some(3))
            .await;
        assert!(outcome.is_ok());
    }

    assert_eq!(pop_texts(&fixture, &c1).await, vec!["m2", "m3", "m4"]);
}

#[tokio::test]
async fn zero_batch_cap_is_ignored() {
    let fixture = fixture();
    let c1 = conversation("C1");

    for index in 0..3 {
        let outcome = fixture
            .buffer
            .enqueue(&c1, &format!("m{index}"), 5, Some(0))
            .await;
        assert!(outcome.is_ok());
    }

    assert_eq!(pop_texts(&fixture, &c1).await.len(), 3);
}

#[tokio::test]
async fn configured_window_and_cap_apply_by_default() {
    let store = Arc::new(FakeCoordinationStore::new());
    let buffer = DebounceBuffer::new(
        store.clone(),
        Arc::new(ManualClock::at_epoch_seconds(100)),
        CoordinationKeys::default(),
        &CoordinationConfig {
            debounce_window_seconds: 7,
            max_batch_size: Some(2),
            ..CoordinationConfig::default()
        },
    );
    let c1 = conversation("C1");

    let mut last = None;
    for text in ["a", "b", "c"] {
        last = buffer.enqueue_with_defaults(&c1, &text.to_owned()).await.ok();
    }

    assert_eq!(last, Some(EnqueueOutcome::Buffered { due_at: epoch(107) }));
    assert!(buffer.get_due(epoch(106)).await.unwrap_or_default().is_empty());
    let texts: Vec<String> = buffer
        .pop_batch::<String>(&c1)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|entry| entry.payload)
        .collect();
    assert_eq!(texts, vec!["b", "c"]);
}

#[tokio::test]
async fn unset_batch_cap_keeps_every_entry_by_default() {
    let fixture = fixture();
    let c1 = conversation("C1");

    for index in 0..4 {
        let outcome = fixture
            .buffer
            .enqueue_with_defaults(&c1, &format!("m{index}"))
            .await;
        assert_eq!(outcome.ok(), Some(EnqueueOutcome::Buffered { due_at: epoch(5) }));
    }

    assert_eq!(pop_texts(&fixture, &c1).await.len(), 4);
}

#[tokio::test]
async fn due_conversations_are_ordered_earliest_first() {
    let fixture = fixture();
    let late = conversation("late");
    let early = conversation("early");

    fixture.clock.set_epoch_seconds(10);
    enqueue_text(&fixture, &late, "b").await;
    fixture.clock.set_epoch_seconds(1);
    enqueue_text(&fixture, &early, "a").await;

    assert_eq!(
        fixture.buffer.get_due(epoch(100)).await.unwrap_or_default(),
        vec![early, late]
    );
}

#[tokio::test]
async fn malformed_due_members_are_skipped() {
    let fixture = fixture();
    let c1 = conversation("C1");
    enqueue_text(&fixture, &c1, "hello").await;

    let stray = AtomicBatch::new().with(StoreCommand::SortedSetUpsert {
        key: fixture.buffer.keys().due_index_key(),
        member: "buf:list:garbage".to_owned(),
        score: 0,
    });
    assert!(fixture.store.execute_atomic(stray).await.is_ok());

    assert_eq!(
        fixture.buffer.get_due(epoch(100)).await.unwrap_or_default(),
        vec![c1]
    );
}

#[tokio::test]
async fn pop_batch_drops_undecodable_entries() {
    let fixture = fixture();
    let c1 = conversation("C1");

    enqueue_text(&fixture, &c1, "before").await;
    let list_key = fixture.buffer.keys().list_key(&c1);
    fixture.store.push_raw(list_key.as_str(), "{not json").await;
    enqueue_text(&fixture, &c1, "after").await;

    assert_eq!(pop_texts(&fixture, &c1).await, vec!["before", "after"]);
    assert!(fixture.store.list(list_key.as_str()).await.is_empty());
}

#[tokio::test]
async fn pop_batch_leaves_due_marker_until_cleared() {
    let fixture = fixture();
    let c1 = conversation("C1");
    enqueue_text(&fixture, &c1, "hello").await;

    assert_eq!(pop_texts(&fixture, &c1).await, vec!["hello"]);
    assert_eq!(
        fixture.buffer.get_due(epoch(100)).await.unwrap_or_default(),
        vec![c1.clone()]
    );

    assert!(fixture.buffer.clear_due(&c1).await.is_ok());
    assert!(fixture.buffer.get_due(epoch(100)).await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn clear_due_does_not_touch_entries() {
    let fixture = fixture();
    let c1 = conversation("C1");
    enqueue_text(&fixture, &c1, "hello").await;

    assert!(fixture.buffer.clear_due(&c1).await.is_ok());

    assert!(fixture.buffer.get_due(epoch(100)).await.unwrap_or_default().is_empty());
    assert_eq!(pop_texts(&fixture, &c1).await, vec!["hello"]);
}

#[tokio::test]
async fn pop_and_clear_drains_entries_and_marker_together() {
    let fixture = fixture();
    let c1 = conversation("C1");
    enqueue_text(&fixture, &c1, "hello").await;

    let batch = fixture.buffer.pop_batch_and_clear_due::<String>(&c1).await;
    assert_eq!(batch.map(|entries| entries.len()).ok(), Some(1));
    assert!(fixture.buffer.get_due(epoch(100)).await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn enqueue_after_pop_starts_fresh_buffer() {
    let fixture = fixture();
    let c1 = conversation("C1");
    enqueue_text(&fixture, &c1, "first").await;

    let drained = fixture.buffer.pop_batch_and_clear_due::<String>(&c1).await;
    assert!(drained.is_ok());

    fixture.clock.set_epoch_seconds(20);
    enqueue_text(&fixture, &c1, "second").await;

    assert!(fixture.buffer.get_due(epoch(24)).await.unwrap_or_default().is_empty());
    assert_eq!(
        fixture.buffer.get_due(epoch(25)).await.unwrap_or_default(),
        vec![c1.clone()]
    );
    assert_eq!(pop_texts(&fixture, &c1).await, vec!["second"]);
}

#[tokio::test]
async fn pause_discards_pending_entries_and_drops_new_ones() {
    let fixture = fixture();
    let c1 = conversation("C1");
    enqueue_text(&fixture, &c1, "pending").await;

    assert!(fixture.buffer.pause(&c1, 60).await.is_ok());
    assert!(matches!(fixture.buffer.is_paused(&c1).await, Ok(true)));
    assert_eq!(enqueue_text(&fixture, &c1, "ignored").await, EnqueueOutcome::Paused);

    assert!(fixture.buffer.get_due(epoch(1_000)).await.unwrap_or_default().is_empty());
    assert!(pop_texts(&fixture, &c1).await.is_empty());

    let pause_key = fixture.buffer.keys().pause_key(&c1);
    assert_eq!(fixture.store.ttl(pause_key.as_str()).await, Some(60));
}

#[tokio::test]
async fn pause_only_affects_its_conversation() {
    let fixture = fixture();
    let paused = conversation("paused");
    let active = conversation("active");

    assert!(fixture.buffer.pause(&paused, 60).await.is_ok());
    enqueue_text(&fixture, &active, "hi").await;

    assert_eq!(
        fixture.buffer.get_due(epoch(100)).await.unwrap_or_default(),
        vec![active]
    );
}

#[tokio::test]
async fn default_pause_uses_configured_ttl() {
    let store = Arc::new(FakeCoordinationStore::new());
    let buffer = DebounceBuffer::new(
        store.clone(),
        Arc::new(ManualClock::at_epoch_seconds(0)),
        CoordinationKeys::default(),
        &CoordinationConfig {
            pause_ttl_seconds: 120,
            ..CoordinationConfig::default()
        },
    );
    let c1 = conversation("C1");

    assert!(buffer.pause_with_defaults(&c1).await.is_ok());

    assert!(matches!(buffer.is_paused(&c1).await, Ok(true)));
    let pause_key = buffer.keys().pause_key(&c1);
    assert_eq!(store.ttl(pause_key.as_str()).await, Some(120));
}

#[tokio::test]
async fn pause_requires_positive_ttl() {
    let fixture = fixture();
    let c1 = conversation("C1");

    assert!(matches!(
        fixture.buffer.pause(&c1, 0).await,
        Err(AppError::Validation(_))
    ));
}

#[tokio::test]
async fn reconcile_rearms_stranded_lists_only() {
    let fixture = fixture();
    let stranded = conversation("stranded");
    let armed = conversation("armed");

    enqueue_text(&fixture, &stranded, "lost").await;
    assert!(fixture.buffer.clear_due(&stranded).await.is_ok());
    enqueue_text(&fixture, &armed, "fine").await;

    let rearmed = fixture.buffer.reconcile_orphans(epoch(50)).await;
    assert_eq!(rearmed.ok(), Some(1));

    let due_key = fixture.buffer.keys().due_index_key();
    let stranded_key = fixture.buffer.keys().list_key(&stranded);
    let armed_key = fixture.buffer.keys().list_key(&armed);
    assert_eq!(
        fixture.store.score(due_key.as_str(), stranded_key.as_str()).await,
        Some(50)
    );
    assert_eq!(
        fixture.store.score(due_key.as_str(), armed_key.as_str()).await,
        Some(5)
    );
}

#[tokio::test]
async fn store_outage_surfaces_as_unavailable() {
    let fixture = fixture();
    let c1 = conversation("C1");
    fixture.store.set_offline(true);

    assert!(matches!(
        fixture.buffer.enqueue(&c1, &"x", 5, None).await,
        Err(AppError::Unavailable(_))
    ));
    assert!(matches!(
        fixture.buffer.get_due(epoch(0)).await,
        Err(AppError::Unavailable(_))
    ));
}
