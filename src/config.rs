//! Configuration from the environment

use core::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;
use thiserror::Error;
use url::Url;

use crate::broker::BrokerConfig;
use crate::dispatcher::DispatcherConfig;
use crate::utils::env_var;
use crate::utils::env_var_or;

const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";
const DEFAULT_BROKER_TOPIC: &str = "notifications";
const DEFAULT_BROKER_GROUP_ID: &str = "notification-consumers";
const DEFAULT_BROKER_PARTITIONS: &str = "1";
const DEFAULT_BROKER_REPLICATION_FACTOR: &str = "1";
const DEFAULT_BROKER_POLL_INTERVAL_MS: &str = "500";
const DEFAULT_DISPATCH_PERIOD_SECONDS: &str = "60";
const DEFAULT_DISPATCH_TICK_TIMEOUT_SECONDS: &str = "5";
const DEFAULT_DELIVERY_MAX_ATTEMPTS: &str = "3";
const DEFAULT_TIMEZONE_OFFSET: &str = "+00:00";

/// Configuration errors
#[derive(Debug, Error)]
pub enum Error {
    /// A required variable is not set
    #[error("`{0}` is not set")]
    Missing(&'static str),

    /// A variable is set to something unusable
    #[error("`{name}` is invalid: {reason}")]
    Invalid {
        /// Name of the variable
        name: &'static str,

        /// What is wrong with it
        reason: String,
    },
}

/// Telegram settings
#[derive(Clone)]
pub struct TelegramConfig {
    /// Bot API base
    pub api_url: Url,

    /// Token of the bot sending reminders
    pub notify_token: String,

    /// Token of the bot users write notes to, the conversation flow is off without one
    pub write_token: Option<String>,
}

impl core::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("api_url", &self.api_url.as_str())
            .field("write_bot", &self.write_token.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Config {
    pub telegram: TelegramConfig,

    /// Postgres, the in-memory store and broker are used without it
    pub database_url: Option<String>,

    pub broker: BrokerConfig,
    pub dispatcher: DispatcherConfig,

    /// Offset of the users' local time to UTC
    pub timezone_offset: FixedOffset,
}

impl Config {
    /// Read the configuration from the environment
    ///
    /// # Errors
    ///
    /// Will return `Err` when a required variable is missing or a variable
    /// can not be parsed
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(env_var)
    }

    /// Read the configuration through `lookup`, which returns non-empty values only
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let var_or = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let telegram = TelegramConfig {
            api_url: parse(
                "TELEGRAM_API_URL",
                &var_or("TELEGRAM_API_URL", DEFAULT_TELEGRAM_API_URL),
            )?,
            notify_token: lookup("TOKEN_NOTIFY_BOT").ok_or(Error::Missing("TOKEN_NOTIFY_BOT"))?,
            write_token: lookup("TOKEN_WRITE_BOT"),
        };

        let broker = BrokerConfig {
            topic: var_or("BROKER_TOPIC", DEFAULT_BROKER_TOPIC),
            group_id: var_or("BROKER_GROUP_ID", DEFAULT_BROKER_GROUP_ID),
            partitions: positive(
                "BROKER_PARTITIONS",
                parse(
                    "BROKER_PARTITIONS",
                    &var_or("BROKER_PARTITIONS", DEFAULT_BROKER_PARTITIONS),
                )?,
            )?,
            replication_factor: positive(
                "BROKER_REPLICATION_FACTOR",
                parse(
                    "BROKER_REPLICATION_FACTOR",
                    &var_or(
                        "BROKER_REPLICATION_FACTOR",
                        DEFAULT_BROKER_REPLICATION_FACTOR,
                    ),
                )?,
            )?,
            poll_interval: Duration::from_millis(positive(
                "BROKER_POLL_INTERVAL_MS",
                parse(
                    "BROKER_POLL_INTERVAL_MS",
                    &var_or("BROKER_POLL_INTERVAL_MS", DEFAULT_BROKER_POLL_INTERVAL_MS),
                )?,
            )?),
        };

        let dispatcher = DispatcherConfig {
            period: Duration::from_secs(positive(
                "DISPATCH_PERIOD_SECONDS",
                parse(
                    "DISPATCH_PERIOD_SECONDS",
                    &var_or("DISPATCH_PERIOD_SECONDS", DEFAULT_DISPATCH_PERIOD_SECONDS),
                )?,
            )?),
            tick_timeout: Duration::from_secs(positive(
                "DISPATCH_TICK_TIMEOUT_SECONDS",
                parse(
                    "DISPATCH_TICK_TIMEOUT_SECONDS",
                    &var_or(
                        "DISPATCH_TICK_TIMEOUT_SECONDS",
                        DEFAULT_DISPATCH_TICK_TIMEOUT_SECONDS,
                    ),
                )?,
            )?),
            max_attempts: positive(
                "DELIVERY_MAX_ATTEMPTS",
                parse(
                    "DELIVERY_MAX_ATTEMPTS",
                    &var_or("DELIVERY_MAX_ATTEMPTS", DEFAULT_DELIVERY_MAX_ATTEMPTS),
                )?,
            )?,
        };

        Ok(Self {
            telegram,
            database_url: lookup("DATABASE_URL"),
            broker,
            dispatcher,
            timezone_offset: parse(
                "TIMEZONE_OFFSET",
                &var_or("TIMEZONE_OFFSET", DEFAULT_TIMEZONE_OFFSET),
            )?,
        })
    }
}

fn parse<T>(name: &'static str, value: &str) -> Result<T, Error>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    value.trim().parse::<T>().map_err(|err| Error::Invalid {
        name,
        reason: format!("`{value}`: {err}"),
    })
}

fn positive<T>(name: &'static str, value: T) -> Result<T, Error>
where
    T: PartialOrd + Default + core::fmt::Display,
{
    if value > T::default() {
        Ok(value)
    } else {
        Err(Error::Invalid {
            name,
            reason: format!("`{value}` must be greater than zero"),
        })
    }
}
