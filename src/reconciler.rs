//! Reconciliation loop
//!
//! Consumes completion records and retires the notes they point at. Every
//! record gets at most one deletion attempt; nothing is requeued.

use tokio_util::sync::CancellationToken;

use crate::broker;
use crate::broker::CompletionBroker;
use crate::broker::CompletionRecord;
use crate::notes::NoteId;
use crate::storage::NoteStore;
use crate::users::UserId;

/// Outcome of reconciling a single record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reconciliation {
    /// The note was deleted
    Deleted(UserId, NoteId),

    /// The note was deleted before, or never existed for this user
    AlreadyGone(UserId, NoteId),

    /// The record does not name a user and a note, it is dropped
    Malformed,

    /// The store failed, the record is dropped
    Failed(UserId, NoteId),
}

pub struct Reconciler<S, B> {
    store: S,
    broker: B,
}

impl<S, B> Reconciler<S, B>
where
    S: NoteStore,
    B: CompletionBroker,
{
    pub fn new(store: S, broker: B) -> Self {
        Self { store, broker }
    }

    /// Consume and reconcile records until `cancel` fires or the broker closes
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("Reconciler started");

        loop {
            match self.broker.consume(&cancel).await {
                Ok(record) => {
                    self.reconcile(&record).await;
                }
                Err(broker::Error::Canceled | broker::Error::Closed) => break,
                Err(err) => {
                    // the broker client backs off on its own
                    tracing::warn!(error = %err, "Could not consume completion record");
                }
            }
        }

        tracing::info!("Reconciler stopped");
    }

    /// Apply a single completion record to the store
    pub async fn reconcile(&self, record: &CompletionRecord) -> Reconciliation {
        let (user_id, note_id) = match record.parse() {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(
                    key = %record.key,
                    value = %record.value,
                    error = %err,
                    "Dropping malformed completion record"
                );

                return Reconciliation::Malformed;
            }
        };

        match self.store.delete_note(note_id, user_id).await {
            Ok(()) => {
                tracing::info!(%note_id, %user_id, "Note retired after delivery");

                Reconciliation::Deleted(user_id, note_id)
            }
            Err(err) if err.is_not_found() => {
                tracing::info!(%note_id, %user_id, "Note already gone, nothing to retire");

                Reconciliation::AlreadyGone(user_id, note_id)
            }
            Err(err) => {
                tracing::warn!(
                    %note_id,
                    %user_id,
                    error = %err,
                    "Could not retire note, dropping completion record"
                );

                Reconciliation::Failed(user_id, note_id)
            }
        }
    }
}
