//! Dispatch loop
//!
//! Every period: find the notes due in the current window, deliver each to its
//! owner and publish a completion record for every delivered note. Deleting
//! the note is left to the reconciliation loop.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::time::Duration;

use chrono::TimeDelta;
use chrono::Utc;
use chrono::naive::NaiveDateTime;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio::time::timeout_at;
use tokio_util::sync::CancellationToken;

use crate::broker::CompletionBroker;
use crate::broker::CompletionRecord;
use crate::delivery::Delivery;
use crate::notes::Note;
use crate::notes::NoteId;
use crate::notes::format_message;
use crate::storage::NoteStore;
use crate::window::DispatchWindow;

pub use Config as DispatcherConfig;

/// Dispatch loop settings
#[derive(Clone, Debug)]
pub struct Config {
    /// Length of a window, and time between ticks
    pub period: Duration,

    /// Budget of a single tick
    pub tick_timeout: Duration,

    /// Delivery attempts per note before it is given up on
    pub max_attempts: u32,
}

/// What a single tick did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Window that was scanned, if any
    pub window: Option<DispatchWindow>,

    /// Notes that reached their owner
    pub delivered: usize,

    /// Completion records published
    pub published: usize,

    /// Notes whose delivery failed and will be retried
    pub retrying: usize,

    /// Notes given up on
    pub dead_lettered: usize,

    /// Notes not started before the deadline
    pub deferred: usize,
}

/// A note waiting for a delivery attempt
#[derive(Clone, Debug)]
struct Pending {
    note: Note,
    attempts: u32,
}

/// Notes selected by a scan that did not reach their owner yet
///
/// Not durable: pending retries are lost when the process stops.
#[derive(Debug, Default)]
struct RetryLedger {
    pending: BTreeMap<NoteId, Pending>,
}

impl RetryLedger {
    fn push(&mut self, pending: Pending) {
        self.pending.insert(pending.note.id, pending);
    }

    /// Everything pending, oldest reminder first
    fn drain(&mut self) -> Vec<Pending> {
        let mut pending = std::mem::take(&mut self.pending)
            .into_values()
            .collect::<Vec<_>>();

        pending.sort_by(|a, b| (a.note.notify_at, a.note.id).cmp(&(b.note.notify_at, b.note.id)));

        pending
    }
}

/// The dispatch loop and its state between ticks
pub struct Dispatcher<S, D, B> {
    store: S,
    delivery: D,
    broker: B,
    config: Config,

    /// Last window that was scanned successfully
    last_window: Option<DispatchWindow>,

    ledger: RetryLedger,
}

impl<S, D, B> Dispatcher<S, D, B>
where
    S: NoteStore,
    D: Delivery,
    B: CompletionBroker,
{
    pub fn new(store: S, delivery: D, broker: B, config: Config) -> Self {
        Self {
            store,
            delivery,
            broker,
            config,
            last_window: None,
            ledger: RetryLedger::default(),
        }
    }

    /// Tick right away, then once every period until `cancel` fires
    ///
    /// A running tick is never interrupted, the tick timeout bounds how long
    /// shutdown waits for it.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(period = ?self.config.period, "Dispatcher started");

        let mut ticker = tokio::time::interval(self.config.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let deadline = Instant::now() + self.config.tick_timeout;
                    let summary = self.tick(Utc::now().naive_utc(), deadline).await;

                    tracing::debug!(?summary, "Dispatch tick done");
                }
            }
        }

        tracing::info!(
            pending = self.ledger.pending.len(),
            "Dispatcher stopped, pending retries are dropped"
        );
    }

    /// A single tick at wall-clock time `now`, bounded by `deadline`
    pub async fn tick(&mut self, now: NaiveDateTime, deadline: Instant) -> TickSummary {
        let mut summary = TickSummary::default();

        // retries go first, their reminder time is older than anything new
        let retries = self.ledger.drain();
        let mut queue = self.still_due(retries, deadline).await;

        if let Some(window) = self.next_window(now) {
            tracing::debug!(
                window_start = %window.start,
                window_end = %window.end,
                "Receiving due notes"
            );

            match timeout_at(
                deadline,
                self.store.receive_due_notes(&window.start, &window.end),
            )
            .await
            {
                Ok(Ok(notes)) => {
                    self.last_window = Some(window);
                    summary.window = Some(window);

                    let queued = queue
                        .iter()
                        .map(|pending| pending.note.id)
                        .chain(self.ledger.pending.keys().copied())
                        .collect::<HashSet<_>>();

                    queue.extend(
                        notes
                            .into_iter()
                            .filter(|note| !queued.contains(&note.id))
                            .map(|note| Pending { note, attempts: 0 }),
                    );
                }
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "Could not receive due notes, skipping window");
                }
                Err(_) => {
                    tracing::warn!("Timed out receiving due notes, skipping window");
                }
            }
        }

        let mut queue = queue.into_iter();

        while let Some(pending) = queue.next() {
            if Instant::now() >= deadline {
                let deferred = std::iter::once(pending).chain(queue.by_ref()).collect::<Vec<_>>();

                tracing::warn!(
                    count = deferred.len(),
                    "Tick deadline reached, deferring remaining notes"
                );

                summary.deferred = deferred.len();
                for pending in deferred {
                    self.ledger.push(pending);
                }

                break;
            }

            self.dispatch(pending, deadline, &mut summary).await;
        }

        summary
    }

    /// Retries whose note is still active, read fresh from the store
    ///
    /// Notes deleted since their last attempt are dropped. When the store
    /// can not tell, the retry waits in the ledger for the next tick.
    async fn still_due(&mut self, retries: Vec<Pending>, deadline: Instant) -> Vec<Pending> {
        let mut due = Vec::with_capacity(retries.len());

        for pending in retries {
            let Note { id, user_id, .. } = pending.note;

            match timeout_at(deadline, self.store.find_single_note(id, user_id)).await {
                Ok(Ok(Some(note))) if !note.is_deleted() => due.push(Pending {
                    note,
                    attempts: pending.attempts,
                }),
                Ok(Ok(_)) => {
                    tracing::debug!(note_id = %id, %user_id, "Note deleted before its retry, dropping it");
                }
                Ok(Err(err)) => {
                    tracing::warn!(note_id = %id, %user_id, error = %err, "Could not check note before retry");
                    self.ledger.push(pending);
                }
                Err(_) => {
                    tracing::warn!(note_id = %id, %user_id, "Timed out checking note before retry");
                    self.ledger.push(pending);
                }
            }
        }

        due
    }

    /// The window to scan at `now`, unless it was scanned already
    fn next_window(&self, now: NaiveDateTime) -> Option<DispatchWindow> {
        let period = match TimeDelta::from_std(self.config.period) {
            Ok(period) => period,
            Err(err) => {
                tracing::error!(error = %err, "Dispatch period out of range");
                return None;
            }
        };

        let window = match DispatchWindow::containing(now, period) {
            Ok(window) => window,
            Err(err) => {
                tracing::error!(error = %err, "Could not compute dispatch window");
                return None;
            }
        };

        if self.last_window == Some(window) {
            tracing::debug!(window_start = %window.start, "Window already dispatched");
            return None;
        }

        Some(window)
    }

    /// Deliver one note, then publish its completion record
    async fn dispatch(&mut self, mut pending: Pending, deadline: Instant, summary: &mut TickSummary) {
        pending.attempts += 1;

        let note = &pending.note;
        let message = format_message(note);

        let delivery_error = match timeout_at(deadline, self.delivery.send(note.user_id, &message))
            .await
        {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some("timed out".to_string()),
        };

        if let Some(error) = delivery_error {
            if pending.attempts >= self.config.max_attempts {
                tracing::error!(
                    note_id = %note.id,
                    user_id = %note.user_id,
                    attempts = pending.attempts,
                    %error,
                    "Giving up on delivering note, it stays undeleted"
                );

                summary.dead_lettered += 1;
            } else {
                tracing::warn!(
                    note_id = %note.id,
                    user_id = %note.user_id,
                    attempts = pending.attempts,
                    %error,
                    "Could not deliver note, retrying next tick"
                );

                summary.retrying += 1;
                self.ledger.push(pending);
            }

            return;
        }

        tracing::info!(note_id = %note.id, user_id = %note.user_id, "Reminder delivered");
        summary.delivered += 1;

        // delivery happened, a failed publish only means the note is not retired
        match self
            .broker
            .publish(&CompletionRecord::for_note(note), deadline)
            .await
        {
            Ok(()) => summary.published += 1,
            Err(err) => {
                tracing::warn!(
                    note_id = %note.id,
                    user_id = %note.user_id,
                    error = %err,
                    "Could not publish completion record, note stays undeleted"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::users::UserId;

    fn note(id: i64, notify_at: &str) -> Note {
        let notify_at = NaiveDateTime::parse_from_str(notify_at, "%Y-%m-%d %H:%M:%S").unwrap();

        Note {
            id: NoteId(id),
            user_id: UserId(1),
            text: format!("note {id}"),
            notify_at,
            created_at: notify_at,
            deleted_at: None,
        }
    }

    #[test]
    fn ledger_drains_oldest_reminder_first() {
        let mut ledger = RetryLedger::default();

        ledger.push(Pending {
            note: note(3, "2024-05-01 12:00:10"),
            attempts: 1,
        });
        ledger.push(Pending {
            note: note(1, "2024-05-01 12:00:50"),
            attempts: 1,
        });
        ledger.push(Pending {
            note: note(2, "2024-05-01 11:59:00"),
            attempts: 2,
        });

        let drained = ledger
            .drain()
            .into_iter()
            .map(|pending| pending.note.id)
            .collect::<Vec<_>>();

        assert_eq!(vec![NoteId(2), NoteId(3), NoteId(1)], drained);
        assert!(ledger.drain().is_empty());
    }

    #[test]
    fn ledger_keeps_one_entry_per_note() {
        let mut ledger = RetryLedger::default();

        ledger.push(Pending {
            note: note(1, "2024-05-01 12:00:10"),
            attempts: 1,
        });
        ledger.push(Pending {
            note: note(1, "2024-05-01 12:00:10"),
            attempts: 2,
        });

        let drained = ledger.drain();

        assert_eq!(1, drained.len());
        assert_eq!(2, drained[0].attempts);
    }
}
