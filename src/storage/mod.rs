//! All things related to the storage of users and notes

use std::time::Duration;

use async_trait::async_trait;
use chrono::naive::NaiveDateTime;
use sqlx::PgPool;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use crate::notes::Note;
use crate::notes::NoteId;
use crate::users::User;
use crate::users::UserId;

pub use memory::Memory;
pub use postgres::Postgres;

mod memory;
mod postgres;

/// Migrator to run migrations on startup
pub static MIGRATOR: Migrator = sqlx::migrate!();

/// Storage errors
#[derive(Debug, Error)]
pub enum Error {
    /// A connection error with the storage
    #[error("Connection error: {0}")]
    Connection(String),

    /// No active note with this ID for this user
    #[error("Note {note_id} not found for user {user_id}")]
    NotFound {
        /// The requested note
        note_id: NoteId,

        /// The user the note was requested for
        user_id: UserId,
    },
}

impl Error {
    /// Is this the benign "nothing to do" outcome of a lookup or delete?
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for all storage interactions
pub type Result<T> = core::result::Result<T, Error>;

/// Connect to Postgres and run the migrations
///
/// # Errors
///
/// Will return `Err` when the database can not be reached or migrated
pub async fn connect(database_url: &str) -> Result<PgPool> {
    let connection_pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(3))
        .connect(database_url)
        .await
        .map_err(connection_error)?;

    MIGRATOR
        .run(&connection_pool)
        .await
        .map_err(connection_error)?;

    Ok(connection_pool)
}

/// Values to create a User
pub struct CreateUserValues<'a> {
    /// ID on the messaging platform
    pub id: UserId,

    /// Login on the messaging platform, when it has one
    pub login: Option<&'a str>,
}

/// Values to create a Note
pub struct CreateNoteValues<'a> {
    /// Owner of the note
    pub user_id: UserId,

    /// Content of the note, never empty
    pub text: &'a str,

    /// When to remind the owner, in UTC
    pub notify_at: &'a NaiveDateTime,
}

/// Storage with all supported operations
///
/// Implementations are shared between the dispatch loop, the reconciliation
/// loop and the conversation flow, so they must be safe for concurrent use.
#[async_trait]
pub trait NoteStore: Clone + Send + Sync + 'static {
    /// Does the user exist?
    ///
    /// Respects the soft-delete
    async fn user_exists(&self, id: UserId) -> Result<bool>;

    /// Create a single user
    async fn create_user(&self, values: &CreateUserValues<'_>) -> Result<User>;

    /// Create a note
    async fn create_note(&self, values: &CreateNoteValues<'_>) -> Result<Note>;

    /// Find a single note of a user
    ///
    /// DOES NOT respect the soft-delete, deleted notes are returned as well
    async fn find_single_note(&self, note_id: NoteId, user_id: UserId) -> Result<Option<Note>>;

    /// Find all notes of a user
    ///
    /// Active notes first, ordered by reminder time; deleted notes only when asked
    async fn find_all_notes_by_user(&self, user_id: UserId, show_deleted: bool)
    -> Result<Vec<Note>>;

    /// Find the active notes with a reminder time in `[start, end)`
    ///
    /// Ordered by reminder time, oldest first
    async fn receive_due_notes(
        &self,
        start: &NaiveDateTime,
        end: &NaiveDateTime,
    ) -> Result<Vec<Note>>;

    /// Soft-delete an active note of a user
    ///
    /// Fails with [`Error::NotFound`] when there is no such active note, which
    /// includes a note that is already deleted
    async fn delete_note(&self, note_id: NoteId, user_id: UserId) -> Result<()>;
}

/// Convert `SQLx` to storage connection error
pub(crate) fn connection_error<E>(err: E) -> Error
where
    E: std::error::Error,
{
    Error::Connection(err.to_string())
}
