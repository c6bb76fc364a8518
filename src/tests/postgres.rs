use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::broker;
use crate::broker::BrokerConfig;
use crate::broker::CompletionBroker;
use crate::storage;
use crate::storage::CreateNoteValues;
use crate::storage::CreateUserValues;
use crate::storage::NoteStore;
use crate::tests::helper;
use crate::users::UserId;

fn broker_config(group_id: &str) -> BrokerConfig {
    BrokerConfig {
        topic: "notifications".to_string(),
        group_id: group_id.to_string(),
        partitions: 2,
        replication_factor: 1,
        poll_interval: Duration::from_millis(10),
    }
}

#[sqlx::test]
#[ignore = "Requires external Postgres. Set DATABASE_URL to run."]
async fn test_note_lifecycle(pool: sqlx::PgPool) {
    let store = storage::Postgres::new_with_pool(pool);

    assert!(!store.user_exists(UserId(9)).await.unwrap());
    store
        .create_user(&CreateUserValues {
            id: UserId(9),
            login: Some("alice"),
        })
        .await
        .unwrap();
    assert!(store.user_exists(UserId(9)).await.unwrap());

    let due = store
        .create_note(&CreateNoteValues {
            user_id: UserId(9),
            text: "Dentist",
            notify_at: &helper::at("2024-05-01 12:00:10"),
        })
        .await
        .unwrap();
    let later = store
        .create_note(&CreateNoteValues {
            user_id: UserId(9),
            text: "Groceries",
            notify_at: &helper::at("2024-05-01 12:01:00"),
        })
        .await
        .unwrap();

    let notes = store
        .receive_due_notes(
            &helper::at("2024-05-01 12:00:00"),
            &helper::at("2024-05-01 12:01:00"),
        )
        .await
        .unwrap();
    assert_eq!(vec![due.id], notes.iter().map(|note| note.id).collect::<Vec<_>>());

    store.delete_note(due.id, UserId(9)).await.unwrap();
    assert!(
        store
            .delete_note(due.id, UserId(9))
            .await
            .unwrap_err()
            .is_not_found()
    );
    assert!(
        store
            .delete_note(later.id, UserId(10))
            .await
            .unwrap_err()
            .is_not_found()
    );

    // deleted notes stay visible to their owner
    let note = store
        .find_single_note(due.id, UserId(9))
        .await
        .unwrap()
        .unwrap();
    assert!(note.is_deleted());

    assert!(
        store
            .receive_due_notes(
                &helper::at("2024-05-01 12:00:00"),
                &helper::at("2024-05-01 12:01:00"),
            )
            .await
            .unwrap()
            .is_empty()
    );

    let active = store.find_all_notes_by_user(UserId(9), false).await.unwrap();
    assert_eq!(vec![later.id], active.iter().map(|note| note.id).collect::<Vec<_>>());

    let all = store.find_all_notes_by_user(UserId(9), true).await.unwrap();
    assert_eq!(
        vec![later.id, due.id],
        all.iter().map(|note| note.id).collect::<Vec<_>>()
    );
}

#[sqlx::test]
#[ignore = "Requires external Postgres. Set DATABASE_URL to run."]
async fn test_broker_hands_out_each_record_once_per_group(pool: sqlx::PgPool) {
    let producer = broker::Postgres::provision(pool.clone(), &broker_config("reconcilers"))
        .await
        .unwrap();
    // provisioning again is harmless
    let consumer = broker::Postgres::provision(pool.clone(), &broker_config("reconcilers"))
        .await
        .unwrap();
    let auditor = broker::Postgres::provision(pool, &broker_config("auditors"))
        .await
        .unwrap();

    producer
        .publish(&helper::record("9", "5"), helper::deadline())
        .await
        .unwrap();
    producer
        .publish(&helper::record("9", "6"), helper::deadline())
        .await
        .unwrap();

    let cancel = CancellationToken::new();

    // same key, same partition, so order holds
    assert_eq!(helper::record("9", "5"), consumer.consume(&cancel).await.unwrap());
    assert_eq!(helper::record("9", "6"), consumer.consume(&cancel).await.unwrap());

    // nothing left for this group
    let waiting = tokio::time::timeout(Duration::from_millis(100), consumer.consume(&cancel)).await;
    assert!(waiting.is_err());

    // another group reads from the start
    assert_eq!(helper::record("9", "5"), auditor.consume(&cancel).await.unwrap());

    cancel.cancel();
    assert!(matches!(
        consumer.consume(&cancel).await,
        Err(broker::Error::Canceled)
    ));

    consumer.close().await.unwrap();
    assert!(matches!(
        consumer.consume(&CancellationToken::new()).await,
        Err(broker::Error::Closed)
    ));
    assert!(matches!(
        consumer
            .publish(&helper::record("9", "7"), helper::deadline())
            .await,
        Err(broker::Error::Closed)
    ));
}

#[sqlx::test]
#[ignore = "Requires external Postgres. Set DATABASE_URL to run."]
async fn test_broker_prunes_what_every_group_consumed(pool: sqlx::PgPool) {
    let reconciler = broker::Postgres::provision(pool.clone(), &broker_config("reconcilers"))
        .await
        .unwrap();
    let auditor = broker::Postgres::provision(pool.clone(), &broker_config("auditors"))
        .await
        .unwrap();

    reconciler
        .publish(&helper::record("9", "5"), helper::deadline())
        .await
        .unwrap();
    reconciler
        .publish(&helper::record("9", "6"), helper::deadline())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    reconciler.consume(&cancel).await.unwrap();
    reconciler.consume(&cancel).await.unwrap();

    // the auditors still need both
    assert_eq!(0, reconciler.prune().await.unwrap());

    assert_eq!(helper::record("9", "5"), auditor.consume(&cancel).await.unwrap());
    assert_eq!(1, auditor.prune().await.unwrap());

    let left = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM broker_records")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(1, left);

    // pruning never moves a group past what it has not read
    assert_eq!(helper::record("9", "6"), auditor.consume(&cancel).await.unwrap());
    assert_eq!(1, auditor.prune().await.unwrap());
    assert_eq!(0, auditor.prune().await.unwrap());
}
