//! Delivery of reminders to their owner

use async_trait::async_trait;
use thiserror::Error;

use crate::telegram::Bot;
use crate::users::UserId;

/// Delivery errors
#[derive(Debug, Error)]
pub enum Error {
    /// The messaging endpoint did not accept the message
    #[error("Delivery to user {user_id} failed: {reason}")]
    Failed {
        /// Intended recipient
        user_id: UserId,

        /// What went wrong
        reason: String,
    },
}

/// Fire-and-forget channel to an external messaging endpoint
#[async_trait]
pub trait Delivery: Send + Sync + 'static {
    /// Send a text to a user
    async fn send(&self, user_id: UserId, text: &str) -> Result<(), Error>;
}

#[async_trait]
impl Delivery for Bot {
    async fn send(&self, user_id: UserId, text: &str) -> Result<(), Error> {
        // a private chat with a user has the ID of that user
        self.send_message(user_id.0, text)
            .await
            .map(|_| ())
            .map_err(|err| Error::Failed {
                user_id,
                reason: err.to_string(),
            })
    }
}
