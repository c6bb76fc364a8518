//! Completion broker
//!
//! Durable hand-off between the dispatch loop, which produces one completion
//! record per delivered reminder, and the reconciliation loop, which consumes
//! them and retires the notes. A crash between both sides leaves an already
//! notified note undeleted, never the other way around.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::notes::Note;
use crate::notes::NoteId;
use crate::notes::ParseNoteIdError;
use crate::users::UserId;

pub use Config as BrokerConfig;
pub use memory::Memory;
pub use postgres::Postgres;

mod memory;
mod postgres;

/// Broker errors
#[derive(Debug, Error)]
pub enum Error {
    /// The caller's deadline passed before the record was appended
    #[error("Publish timed out")]
    Timeout,

    /// The consumer was asked to stop
    #[error("Consume canceled")]
    Canceled,

    /// The broker was closed
    #[error("Broker is closed")]
    Closed,

    /// The underlying transport failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// The topic could not be created
    #[error("Could not provision topic `{topic}`: {reason}")]
    Provisioning {
        /// Name of the topic
        topic: String,

        /// What went wrong
        reason: String,
    },
}

/// Result type for all broker interactions
pub type Result<T> = core::result::Result<T, Error>;

/// Topic and consumer group settings
#[derive(Clone, Debug)]
pub struct Config {
    /// Name of the topic completion records go to
    pub topic: String,

    /// Consumer group of the reconciliation loop
    pub group_id: String,

    /// Number of partitions when the topic is created
    pub partitions: i32,

    /// Replication factor when the topic is created
    pub replication_factor: i16,

    /// Pause between empty reads of a polling consumer
    pub poll_interval: Duration,
}

/// A record asserting that the reminder of a note was delivered
///
/// Key is the decimal user ID, value the decimal note ID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionRecord {
    pub key: String,
    pub value: String,
}

/// A completion record that can never be acted upon
#[derive(Debug, Error)]
pub enum MalformedRecord {
    /// Key is not a user ID
    #[error("Invalid user ID `{key}`: {source}")]
    Key {
        key: String,
        source: core::num::ParseIntError,
    },

    /// Value is not a note ID
    #[error("Invalid note ID `{value}`: {source}")]
    Value {
        value: String,
        source: ParseNoteIdError,
    },
}

impl CompletionRecord {
    /// The record for a delivered note
    pub fn for_note(note: &Note) -> Self {
        Self {
            key: note.user_id.to_string(),
            value: note.id.to_string(),
        }
    }

    /// Read the user and note back
    ///
    /// # Errors
    ///
    /// Will return `Err` when key or value are not decimal IDs
    pub fn parse(&self) -> core::result::Result<(UserId, NoteId), MalformedRecord> {
        let user_id = self
            .key
            .parse::<UserId>()
            .map_err(|source| MalformedRecord::Key {
                key: self.key.clone(),
                source,
            })?;

        let note_id = self
            .value
            .parse::<NoteId>()
            .map_err(|source| MalformedRecord::Value {
                value: self.value.clone(),
                source,
            })?;

        Ok((user_id, note_id))
    }
}

/// Publish/consume capability used as a work queue
#[async_trait]
pub trait CompletionBroker: Clone + Send + Sync + 'static {
    /// Append a single record
    ///
    /// Gives up with [`Error::Timeout`] when `deadline` passes first
    async fn publish(&self, record: &CompletionRecord, deadline: Instant) -> Result<()>;

    /// Wait for the next record
    ///
    /// The record counts as consumed once returned. Returns
    /// [`Error::Canceled`] when `cancel` fires first.
    async fn consume(&self, cancel: &CancellationToken) -> Result<CompletionRecord>;

    /// Release the producer and the consumer
    ///
    /// Closing twice is a no-op
    async fn close(&self) -> Result<()>;
}
