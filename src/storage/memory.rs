//! Memory storage
//!
//! Will be destroyed on system shutdown

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use chrono::Utc;
use chrono::naive::NaiveDateTime;
use tokio::sync::Mutex;

use crate::notes::Note;
use crate::notes::NoteId;
use crate::users::User;
use crate::users::UserId;
use crate::window::DispatchWindow;

use super::CreateNoteValues;
use super::CreateUserValues;
use super::Error;
use super::NoteStore;
use super::Result;

/// An in-memory storage
///
/// Will be destroyed on system shutdown
#[derive(Clone, Debug, Default)]
pub struct Memory {
    /// All users in storage
    users: Arc<Mutex<HashMap<UserId, User>>>,

    /// All notes in storage
    notes: Arc<Mutex<HashMap<NoteId, Note>>>,

    /// Last assigned note ID
    last_note_id: Arc<AtomicI64>,
}

impl Memory {
    /// Create a new empty Memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a note in storage as-is, keeping its ID
    #[cfg(test)]
    pub async fn insert_note(&self, note: Note) {
        self.last_note_id.fetch_max(note.id.0, Ordering::SeqCst);
        self.notes.lock().await.insert(note.id, note);
    }
}

#[async_trait]
impl NoteStore for Memory {
    async fn user_exists(&self, id: UserId) -> Result<bool> {
        Ok(self
            .users
            .lock()
            .await
            .get(&id)
            .is_some_and(|user| user.deleted_at.is_none()))
    }

    async fn create_user(&self, values: &CreateUserValues<'_>) -> Result<User> {
        let user = User {
            id: values.id,
            login: values.login.map(ToString::to_string),
            created_at: Utc::now().naive_utc(),
            deleted_at: None,
        };

        self.users.lock().await.insert(user.id, user.clone());

        Ok(user)
    }

    async fn create_note(&self, values: &CreateNoteValues<'_>) -> Result<Note> {
        let note = Note {
            id: NoteId(self.last_note_id.fetch_add(1, Ordering::SeqCst) + 1),
            user_id: values.user_id,
            text: values.text.to_string(),
            notify_at: *values.notify_at,
            created_at: Utc::now().naive_utc(),
            deleted_at: None,
        };

        self.notes.lock().await.insert(note.id, note.clone());

        Ok(note)
    }

    async fn find_single_note(&self, note_id: NoteId, user_id: UserId) -> Result<Option<Note>> {
        Ok(self
            .notes
            .lock()
            .await
            .get(&note_id)
            .filter(|note| note.user_id == user_id)
            .cloned())
    }

    async fn find_all_notes_by_user(
        &self,
        user_id: UserId,
        show_deleted: bool,
    ) -> Result<Vec<Note>> {
        let mut notes = self
            .notes
            .lock()
            .await
            .values()
            .filter(|note| note.user_id == user_id && (show_deleted || !note.is_deleted()))
            .cloned()
            .collect::<Vec<_>>();

        // active first, then by reminder time
        notes.sort_by(|a, b| {
            (a.is_deleted(), a.notify_at, a.id).cmp(&(b.is_deleted(), b.notify_at, b.id))
        });

        Ok(notes)
    }

    async fn receive_due_notes(
        &self,
        start: &NaiveDateTime,
        end: &NaiveDateTime,
    ) -> Result<Vec<Note>> {
        let window = DispatchWindow {
            start: *start,
            end: *end,
        };

        let mut notes = self
            .notes
            .lock()
            .await
            .values()
            .filter(|note| !note.is_deleted() && window.contains(&note.notify_at))
            .cloned()
            .collect::<Vec<_>>();

        notes.sort_by(|a, b| (a.notify_at, a.id).cmp(&(b.notify_at, b.id)));

        Ok(notes)
    }

    async fn delete_note(&self, note_id: NoteId, user_id: UserId) -> Result<()> {
        match self.notes.lock().await.get_mut(&note_id) {
            Some(note) if note.user_id == user_id && note.deleted_at.is_none() => {
                note.deleted_at = Some(Utc::now().naive_utc());

                Ok(())
            }
            _ => Err(Error::NotFound { note_id, user_id }),
        }
    }
}
