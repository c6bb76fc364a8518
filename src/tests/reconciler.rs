use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::broker;
use crate::broker::CompletionBroker;
use crate::dispatcher::Dispatcher;
use crate::notes::NoteId;
use crate::reconciler::Reconciler;
use crate::reconciler::Reconciliation;
use crate::storage;
use crate::storage::NoteStore;
use crate::tests::helper;
use crate::tests::helper::FailingStore;
use crate::tests::helper::Journal;
use crate::tests::helper::RecordingDelivery;
use crate::users::UserId;

async fn is_deleted(store: &impl NoteStore, note_id: i64, user_id: i64) -> bool {
    store
        .find_single_note(NoteId(note_id), UserId(user_id))
        .await
        .unwrap()
        .is_some_and(|note| note.is_deleted())
}

#[tokio::test]
async fn test_deletes_each_note_once() {
    let store = storage::Memory::new();
    store.insert_note(helper::note(5, 9, "2024-05-01 12:00:10")).await;

    let reconciler = Reconciler::new(store.clone(), broker::Memory::new());

    assert_eq!(
        Reconciliation::Deleted(UserId(9), NoteId(5)),
        reconciler.reconcile(&helper::record("9", "5")).await
    );
    assert!(is_deleted(&store, 5, 9).await);

    // a redelivered record is harmless
    assert_eq!(
        Reconciliation::AlreadyGone(UserId(9), NoteId(5)),
        reconciler.reconcile(&helper::record("9", "5")).await
    );
}

#[tokio::test]
async fn test_only_deletes_notes_of_the_named_user() {
    let store = storage::Memory::new();
    store.insert_note(helper::note(5, 9, "2024-05-01 12:00:10")).await;

    let reconciler = Reconciler::new(store.clone(), broker::Memory::new());

    assert_eq!(
        Reconciliation::AlreadyGone(UserId(10), NoteId(5)),
        reconciler.reconcile(&helper::record("10", "5")).await
    );
    assert!(!is_deleted(&store, 5, 9).await);

    assert_eq!(
        Reconciliation::AlreadyGone(UserId(9), NoteId(404)),
        reconciler.reconcile(&helper::record("9", "404")).await
    );
}

#[tokio::test]
async fn test_drops_malformed_records() {
    let store = storage::Memory::new();
    store.insert_note(helper::note(5, 9, "2024-05-01 12:00:10")).await;

    let reconciler = Reconciler::new(store.clone(), broker::Memory::new());

    for (key, value) in [("alice", "5"), ("9", "five"), ("9", "0"), ("9", "-5"), ("", "")] {
        assert_eq!(
            Reconciliation::Malformed,
            reconciler.reconcile(&helper::record(key, value)).await
        );
    }

    assert!(!is_deleted(&store, 5, 9).await);
}

#[tokio::test]
async fn test_store_failure_drops_the_record() {
    let store = FailingStore::default();
    store
        .inner
        .insert_note(helper::note(5, 9, "2024-05-01 12:00:10"))
        .await;
    store.fail_delete(true);

    let reconciler = Reconciler::new(store.clone(), broker::Memory::new());

    assert_eq!(
        Reconciliation::Failed(UserId(9), NoteId(5)),
        reconciler.reconcile(&helper::record("9", "5")).await
    );
    assert!(!is_deleted(&store, 5, 9).await);
}

#[tokio::test]
async fn test_run_keeps_going_after_a_malformed_record() {
    let store = storage::Memory::new();
    store.insert_note(helper::note(5, 9, "2024-05-01 12:00:10")).await;

    let broker = broker::Memory::new();
    broker
        .publish(&helper::record("nobody", "5"), helper::deadline())
        .await
        .unwrap();
    broker
        .publish(&helper::record("9", "5"), helper::deadline())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let reconciler = tokio::spawn(Reconciler::new(store.clone(), broker.clone()).run(cancel.clone()));

    let mut deleted = false;
    for _ in 0..100 {
        if is_deleted(&store, 5, 9).await {
            deleted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cancel.cancel();
    reconciler.await.unwrap();

    assert!(deleted);
    assert!(helper::drain(&broker).await.is_empty());
}

#[tokio::test]
async fn test_run_stops_when_the_broker_closes() {
    let broker = broker::Memory::new();
    let reconciler = tokio::spawn(
        Reconciler::new(storage::Memory::new(), broker.clone()).run(CancellationToken::new()),
    );

    broker.close().await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), reconciler)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_delivered_notes_are_deleted_and_not_sent_again() {
    let journal = Journal::default();
    let store = storage::Memory::new();
    store.insert_note(helper::note(5, 9, "2024-05-01 12:00:10")).await;
    store.insert_note(helper::note(6, 9, "2024-05-01 12:00:30")).await;

    let broker = broker::Memory::new();
    let mut dispatcher = Dispatcher::new(
        store.clone(),
        RecordingDelivery::new(&journal),
        broker.clone(),
        helper::dispatcher_config(),
    );
    let reconciler = Reconciler::new(store.clone(), broker.clone());

    dispatcher
        .tick(helper::at("2024-05-01 12:00:45"), helper::deadline())
        .await;

    for record in helper::drain(&broker).await {
        assert!(matches!(
            reconciler.reconcile(&record).await,
            Reconciliation::Deleted(..)
        ));
    }

    assert!(is_deleted(&store, 5, 9).await);
    assert!(is_deleted(&store, 6, 9).await);
    assert!(
        store
            .receive_due_notes(
                &helper::at("2024-05-01 12:00:00"),
                &helper::at("2024-05-01 12:01:00")
            )
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(2, helper::events(&journal).len());
}
