use core::fmt;
use core::num::ParseIntError;
use core::str::FromStr;

use chrono::naive::NaiveDateTime;
use thiserror::Error;

use crate::users::UserId;

/// Identity of a note, assigned by the store
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct NoteId(pub i64);

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure to read a note ID from text
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseNoteIdError {
    /// Not a number
    #[error("Note ID is not a number: {0}")]
    NotANumber(#[from] ParseIntError),

    /// Note IDs start at 1
    #[error("Note ID must be positive, got {0}")]
    NotPositive(i64),
}

impl FromStr for NoteId {
    type Err = ParseNoteIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let id = value.trim().parse::<i64>()?;

        if id < 1 {
            return Err(ParseNoteIdError::NotPositive(id));
        }

        Ok(Self(id))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct Note {
    pub id: NoteId,
    pub user_id: UserId,
    pub text: String,
    pub notify_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

impl Note {
    /// Is the note soft-deleted?
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// The reminder text sent to the owner of the note
pub fn format_message(note: &Note) -> String {
    format!("{} (id {})", note.text, note.id)
}
