use core::fmt;
use core::num::ParseIntError;
use core::str::FromStr;

use chrono::naive::NaiveDateTime;

use crate::storage::CreateUserValues;
use crate::storage::NoteStore;
use crate::storage::Result;

/// Identity of a user, assigned by the messaging platform
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = ParseIntError;

    fn from_str(value: &str) -> core::result::Result<Self, Self::Err> {
        value.trim().parse::<i64>().map(Self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct User {
    pub id: UserId,
    pub login: Option<String>,
    pub created_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

/// Make sure the user is known before notes are attached to it
pub async fn ensure_user_exists<S: NoteStore>(
    storage: &S,
    id: UserId,
    login: Option<&str>,
) -> Result<()> {
    if !storage.user_exists(id).await? {
        tracing::info!(user_id = %id, "Registering new user");

        storage.create_user(&CreateUserValues { id, login }).await?;
    }

    Ok(())
}
