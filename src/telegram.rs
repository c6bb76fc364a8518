//! Minimal Telegram Bot API client
//!
//! Only what the reminders and the conversation flow need: `sendMessage` and
//! long polling with `getUpdates`.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

/// Slack on top of the long poll timeout before the HTTP request gives up
const REQUEST_TIMEOUT_SLACK: Duration = Duration::from_secs(10);

/// Telegram errors
#[derive(Debug, Error)]
pub enum Error {
    /// The request did not make it, or the response was not understood
    #[error("Request to Telegram failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Telegram answered with `ok: false`
    #[error("Telegram rejected `{method}`: {description}")]
    Api {
        /// Bot API method
        method: &'static str,

        /// Reason given by Telegram
        description: String,
    },
}

/// Envelope of every Bot API response
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GetUpdates {
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<i64>,
    timeout: u64,
    allowed_updates: &'static [&'static str],
}

/// An incoming update
#[derive(Clone, Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Message {
    pub chat: Chat,
    pub from: Option<Sender>,
    pub text: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Sender {
    pub id: i64,
    pub username: Option<String>,
}

/// A bot, identified by its token
#[derive(Clone)]
pub struct Bot {
    client: reqwest::Client,
    api_url: Url,
    token: String,
}

impl core::fmt::Debug for Bot {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        // the token is a credential
        f.debug_struct("Bot")
            .field("api_url", &self.api_url.as_str())
            .finish_non_exhaustive()
    }
}

impl Bot {
    /// Create a bot talking to the Bot API at `api_url`
    pub fn new(api_url: Url, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
            token: token.to_string(),
        }
    }

    /// Send a text message to a chat
    ///
    /// # Errors
    ///
    /// Will return `Err` when Telegram can not be reached or refuses the message
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<Message, Error> {
        let body = SendMessage { chat_id, text };

        self.call("sendMessage", &body, REQUEST_TIMEOUT_SLACK).await
    }

    /// Long poll for updates after `offset`
    ///
    /// # Errors
    ///
    /// Will return `Err` when Telegram can not be reached or refuses the poll
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
    ) -> Result<Vec<Update>, Error> {
        let body = GetUpdates {
            offset,
            timeout: timeout.as_secs(),
            allowed_updates: &["message"],
        };

        self.call("getUpdates", &body, timeout + REQUEST_TIMEOUT_SLACK)
            .await
    }

    async fn call<B, T>(&self, method: &'static str, body: &B, timeout: Duration) -> Result<T, Error>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .post(self.method_url(method))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(reqwest::Error::without_url)?
            .json::<ApiResponse<T>>()
            .await
            .map_err(reqwest::Error::without_url)?;

        match response {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            ApiResponse { description, .. } => Err(Error::Api {
                method,
                description: description.unwrap_or_else(|| "no description".to_string()),
            }),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_url.as_str().trim_end_matches('/'),
            self.token
        )
    }
}
