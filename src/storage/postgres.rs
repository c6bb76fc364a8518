//! Postgres storage

use async_trait::async_trait;
use chrono::naive::NaiveDateTime;
use sqlx::PgPool;

use crate::notes::Note;
use crate::notes::NoteId;
use crate::users::User;
use crate::users::UserId;

use super::CreateNoteValues;
use super::CreateUserValues;
use super::Error;
use super::NoteStore;
use super::Result;
use super::connection_error;

/// Postgres storage
#[derive(Clone, Debug)]
pub struct Postgres {
    /// Pool of connections
    connection_pool: PgPool,
}

impl Postgres {
    /// Create Postgres storage with existing pool
    ///
    /// Migrations are expected to have run, see [`super::connect`]
    pub fn new_with_pool(connection_pool: PgPool) -> Self {
        Self { connection_pool }
    }
}

#[async_trait]
impl NoteStore for Postgres {
    async fn user_exists(&self, id: UserId) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r"
            SELECT EXISTS (
                SELECT 1
                FROM users
                WHERE id = $1
                    AND deleted_at IS NULL
            )
            ",
        )
        .bind(id)
        .fetch_one(&self.connection_pool)
        .await
        .map_err(connection_error)?;

        Ok(exists)
    }

    async fn create_user(&self, values: &CreateUserValues<'_>) -> Result<User> {
        let user = sqlx::query_as::<_, User>(
            r"
            INSERT INTO users (id, login)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE
                SET login = EXCLUDED.login, deleted_at = NULL
            RETURNING id, login, created_at, deleted_at
            ",
        )
        .bind(values.id)
        .bind(values.login)
        .fetch_one(&self.connection_pool)
        .await
        .map_err(connection_error)?;

        Ok(user)
    }

    async fn create_note(&self, values: &CreateNoteValues<'_>) -> Result<Note> {
        let note = sqlx::query_as::<_, Note>(
            r"
            INSERT INTO notes (user_id, text, notify_at)
            VALUES ($1, $2, $3)
            RETURNING id, user_id, text, notify_at, created_at, deleted_at
            ",
        )
        .bind(values.user_id)
        .bind(values.text)
        .bind(values.notify_at)
        .fetch_one(&self.connection_pool)
        .await
        .map_err(connection_error)?;

        Ok(note)
    }

    async fn find_single_note(&self, note_id: NoteId, user_id: UserId) -> Result<Option<Note>> {
        let note = sqlx::query_as::<_, Note>(
            r"
            SELECT id, user_id, text, notify_at, created_at, deleted_at
            FROM notes
            WHERE id = $1
                AND user_id = $2
            LIMIT 1
            ",
        )
        .bind(note_id)
        .bind(user_id)
        .fetch_optional(&self.connection_pool)
        .await
        .map_err(connection_error)?;

        Ok(note)
    }

    async fn find_all_notes_by_user(
        &self,
        user_id: UserId,
        show_deleted: bool,
    ) -> Result<Vec<Note>> {
        let notes = sqlx::query_as::<_, Note>(
            r"
            SELECT id, user_id, text, notify_at, created_at, deleted_at
            FROM notes
            WHERE user_id = $1
                AND ($2 OR deleted_at IS NULL)
            ORDER BY deleted_at IS NOT NULL, notify_at, id
            ",
        )
        .bind(user_id)
        .bind(show_deleted)
        .fetch_all(&self.connection_pool)
        .await
        .map_err(connection_error)?;

        Ok(notes)
    }

    async fn receive_due_notes(
        &self,
        start: &NaiveDateTime,
        end: &NaiveDateTime,
    ) -> Result<Vec<Note>> {
        let notes = sqlx::query_as::<_, Note>(
            r"
            SELECT id, user_id, text, notify_at, created_at, deleted_at
            FROM notes
            WHERE deleted_at IS NULL
                AND notify_at >= $1
                AND notify_at < $2
            ORDER BY notify_at, id
            ",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.connection_pool)
        .await
        .map_err(connection_error)?;

        Ok(notes)
    }

    async fn delete_note(&self, note_id: NoteId, user_id: UserId) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE notes
            SET deleted_at = timezone('utc', now())
            WHERE id = $1
                AND user_id = $2
                AND deleted_at IS NULL
            ",
        )
        .bind(note_id)
        .bind(user_id)
        .execute(&self.connection_pool)
        .await
        .map_err(connection_error)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound { note_id, user_id });
        }

        Ok(())
    }
}
