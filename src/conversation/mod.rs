//! Conversations with the writer bot
//!
//! Users create, inspect and delete their notes here. Each user has a session
//! per chat holding the draft of a note; sessions expire when left idle.

use std::time::Duration;

use chrono::Datelike;
use chrono::FixedOffset;
use chrono::TimeZone;
use chrono::naive::NaiveDateTime;
use moka::future::Cache;

use crate::notes::Note;
use crate::notes::NoteId;
use crate::storage::CreateNoteValues;
use crate::storage::NoteStore;
use crate::users::UserId;
use crate::users::ensure_user_exists;

pub use command::Command;
pub use wizard::Draft;
pub use wizard::Outcome;

mod command;
mod wizard;

/// Upper bound of concurrent sessions
const MAX_SESSIONS: u64 = 10_000;

const HELP: &str = "\
/new - create a note with a reminder
/get <id> - show a note
/list - list your notes, /list -a includes deleted ones
/delete <id> - delete a note
/help - show this message";

const TRY_LATER: &str = "Something went wrong, please try again later.";

type SessionKey = (i64, UserId);

/// A text message from a user
#[derive(Clone, Debug)]
pub struct Incoming {
    pub chat_id: i64,
    pub user_id: UserId,
    pub login: Option<String>,
    pub text: String,
}

impl Incoming {
    fn session_key(&self) -> SessionKey {
        (self.chat_id, self.user_id)
    }
}

/// Sessions of all chats, cheap to clone
#[derive(Clone)]
pub struct Conversations<S> {
    store: S,

    /// Drafts by chat and author, group members never share one
    sessions: Cache<SessionKey, Draft>,

    /// Offset of the users' local time to UTC
    offset: FixedOffset,
}

impl<S: NoteStore> Conversations<S> {
    pub fn new(store: S, offset: FixedOffset, session_idle: Duration) -> Self {
        let sessions = Cache::builder()
            .max_capacity(MAX_SESSIONS)
            .time_to_idle(session_idle)
            .build();

        Self {
            store,
            sessions,
            offset,
        }
    }

    /// Handle a message at UTC time `now`, returns the reply if there is one
    pub async fn handle(&self, incoming: &Incoming, now: NaiveDateTime) -> Option<String> {
        let reply = match Command::parse(&incoming.text) {
            Command::Help => HELP.to_string(),
            Command::New => {
                self.sessions.insert(incoming.session_key(), Draft::new()).await;

                Draft::prompt().to_string()
            }
            Command::Delete(argument) => self.delete(incoming.user_id, argument).await,
            Command::Get(argument) => self.get(incoming.user_id, argument).await,
            Command::List { show_deleted } => self.list(incoming.user_id, show_deleted).await,
            Command::Unknown(name) => format!("Unknown command /{name}, see /help"),
            Command::Text(text) => return self.advance(incoming, text, now).await,
        };

        Some(reply)
    }

    /// Feed plain text into the draft of its author, ignored without one
    async fn advance(&self, incoming: &Incoming, text: &str, now: NaiveDateTime) -> Option<String> {
        let mut draft = self.sessions.get(&incoming.session_key()).await?;
        let year = self.offset.from_utc_datetime(&now).year();

        match draft.advance(text, year) {
            Outcome::Ask(question) => {
                self.sessions.insert(incoming.session_key(), draft).await;

                Some(question)
            }
            Outcome::Save { text, notify_at } => match self.save(incoming, &text, &notify_at).await
            {
                Ok(note) => {
                    self.sessions.invalidate(&incoming.session_key()).await;

                    Some(format!(
                        "Saved note \"{}\" with ID {}, reminder on {}",
                        note.text,
                        note.id,
                        self.local(&note.notify_at)
                    ))
                }
                Err(reply) => {
                    // keep the confirmed draft, answering yes again retries
                    self.sessions.insert(incoming.session_key(), draft).await;

                    Some(reply)
                }
            },
        }
    }

    /// Store a confirmed draft, `notify_at` is local time
    async fn save(
        &self,
        incoming: &Incoming,
        text: &str,
        notify_at: &NaiveDateTime,
    ) -> Result<Note, String> {
        let notify_at = self
            .offset
            .from_local_datetime(notify_at)
            .single()
            .map(|at| at.naive_utc())
            .ok_or_else(|| "This time does not exist, start over with /new".to_string())?;

        if let Err(err) =
            ensure_user_exists(&self.store, incoming.user_id, incoming.login.as_deref()).await
        {
            tracing::error!(user_id = %incoming.user_id, error = %err, "Could not register user");

            return Err(TRY_LATER.to_string());
        }

        self.store
            .create_note(&CreateNoteValues {
                user_id: incoming.user_id,
                text,
                notify_at: &notify_at,
            })
            .await
            .inspect(|note| {
                tracing::info!(note_id = %note.id, user_id = %note.user_id, "Note created");
            })
            .map_err(|err| {
                tracing::error!(user_id = %incoming.user_id, error = %err, "Could not create note");

                TRY_LATER.to_string()
            })
    }

    async fn delete(&self, user_id: UserId, argument: Option<&str>) -> String {
        let note_id = match parse_note_id(argument) {
            Ok(note_id) => note_id,
            Err(reply) => return reply,
        };

        match self.store.delete_note(note_id, user_id).await {
            Ok(()) => {
                tracing::info!(%note_id, %user_id, "Note deleted by its owner");

                format!("Note {note_id} deleted")
            }
            Err(err) if err.is_not_found() => format!("Note {note_id} not found"),
            Err(err) => {
                tracing::error!(%note_id, %user_id, error = %err, "Could not delete note");

                TRY_LATER.to_string()
            }
        }
    }

    async fn get(&self, user_id: UserId, argument: Option<&str>) -> String {
        let note_id = match parse_note_id(argument) {
            Ok(note_id) => note_id,
            Err(reply) => return reply,
        };

        match self.store.find_single_note(note_id, user_id).await {
            Ok(Some(note)) => {
                let deleted = note
                    .deleted_at
                    .map_or_else(|| "no".to_string(), |at| self.local(&at));

                format!(
                    "{}\nID: {}\nCreated: {}\nReminder: {}\nDeleted: {deleted}",
                    note.text,
                    note.id,
                    self.local(&note.created_at),
                    self.local(&note.notify_at),
                )
            }
            Ok(None) => format!("Note {note_id} not found"),
            Err(err) => {
                tracing::error!(%note_id, %user_id, error = %err, "Could not find note");

                TRY_LATER.to_string()
            }
        }
    }

    async fn list(&self, user_id: UserId, show_deleted: bool) -> String {
        let notes = match self.store.find_all_notes_by_user(user_id, show_deleted).await {
            Ok(notes) => notes,
            Err(err) => {
                tracing::error!(%user_id, error = %err, "Could not list notes");

                return TRY_LATER.to_string();
            }
        };

        if notes.is_empty() {
            return "You have no notes, create one with /new".to_string();
        }

        let mut lines = Vec::with_capacity(notes.len() + 2);
        let mut in_deleted = false;

        for (index, note) in notes.iter().enumerate() {
            if index == 0 && !note.is_deleted() {
                lines.push("Active notes:".to_string());
            }
            if note.is_deleted() && !in_deleted {
                in_deleted = true;
                lines.push("Deleted notes:".to_string());
            }

            lines.push(format!(
                "{}. {} (ID {}, reminder on {})",
                index + 1,
                note.text,
                note.id,
                self.local(&note.notify_at)
            ));
        }

        lines.join("\n")
    }

    /// A UTC timestamp in the users' local time
    fn local(&self, at: &NaiveDateTime) -> String {
        self.offset
            .from_utc_datetime(at)
            .format("%Y-%m-%d %H:%M")
            .to_string()
    }
}

fn parse_note_id(argument: Option<&str>) -> Result<NoteId, String> {
    let Some(argument) = argument else {
        return Err("The note ID is missing, for example /get 12".to_string());
    };

    argument
        .parse::<NoteId>()
        .map_err(|_| format!("`{argument}` is not a valid note ID"))
}
