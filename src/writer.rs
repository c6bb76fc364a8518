//! Long polling loop of the writer bot

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::conversation::Conversations;
use crate::conversation::Incoming;
use crate::storage::NoteStore;
use crate::telegram::Bot;
use crate::telegram::Message;
use crate::users::UserId;

/// How long a single `getUpdates` call waits for something to happen
const POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed poll
const RETRY_PAUSE: Duration = Duration::from_secs(5);

pub struct Writer<S> {
    bot: Bot,
    conversations: Conversations<S>,
}

impl<S: NoteStore> Writer<S> {
    pub fn new(bot: Bot, conversations: Conversations<S>) -> Self {
        Self { bot, conversations }
    }

    /// Poll for messages and answer them until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("Writer started");

        let mut offset = None;

        loop {
            let updates = tokio::select! {
                () = cancel.cancelled() => break,
                updates = self.bot.get_updates(offset, POLL_TIMEOUT) => updates,
            };

            match updates {
                Ok(updates) => {
                    for update in updates {
                        // acknowledged with the next poll, whatever happens to it
                        offset = Some(update.update_id + 1);

                        if let Some(message) = update.message {
                            self.handle(message).await;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Could not poll for updates");

                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(RETRY_PAUSE) => {}
                    }
                }
            }
        }

        tracing::info!("Writer stopped");
    }

    async fn handle(&self, message: Message) {
        let Some(incoming) = incoming(message) else {
            return;
        };

        tracing::debug!(chat_id = incoming.chat_id, user_id = %incoming.user_id, "Message received");

        let Some(reply) = self
            .conversations
            .handle(&incoming, Utc::now().naive_utc())
            .await
        else {
            return;
        };

        if let Err(err) = self.bot.send_message(incoming.chat_id, &reply).await {
            tracing::warn!(chat_id = incoming.chat_id, error = %err, "Could not reply");
        }
    }
}

/// Only text messages with a sender are part of a conversation
fn incoming(message: Message) -> Option<Incoming> {
    let sender = message.from?;
    let text = message.text?;

    Some(Incoming {
        chat_id: message.chat.id,
        user_id: UserId(sender.id),
        login: sender.username,
        text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::telegram::Update;

    fn message(json: &str) -> Message {
        serde_json::from_str::<Update>(json)
            .unwrap()
            .message
            .unwrap()
    }

    #[test]
    fn takes_text_messages_with_a_sender() {
        let incoming = incoming(message(
            r#"{ "update_id": 1, "message": { "chat": { "id": 7 }, "from": { "id": 9, "username": "alice" }, "text": "/list" } }"#,
        ))
        .unwrap();

        assert_eq!(7, incoming.chat_id);
        assert_eq!(UserId(9), incoming.user_id);
        assert_eq!(Some("alice"), incoming.login.as_deref());
        assert_eq!("/list", incoming.text);
    }

    #[test]
    fn skips_everything_else() {
        assert!(
            incoming(message(
                r#"{ "update_id": 1, "message": { "chat": { "id": 7 }, "from": { "id": 9 } } }"#,
            ))
            .is_none()
        );
        assert!(
            incoming(message(
                r#"{ "update_id": 1, "message": { "chat": { "id": 7 }, "text": "hi" } }"#,
            ))
            .is_none()
        );
    }
}
