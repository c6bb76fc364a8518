#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
// easier to use when using the functions as callback of foreign functions
#![allow(clippy::needless_pass_by_value)]

use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

use crate::broker::CompletionBroker;
use crate::config::Config;
use crate::conversation::Conversations;
use crate::dispatcher::Dispatcher;
use crate::reconciler::Reconciler;
use crate::storage::NoteStore;
use crate::telegram::Bot;
use crate::utils::env_var_or;
use crate::writer::Writer;

mod broker;
mod config;
mod conversation;
mod delivery;
mod dispatcher;
mod graceful_shutdown;
mod notes;
mod reconciler;
mod storage;
mod telegram;
#[cfg(test)]
mod tests;
mod users;
mod utils;
mod window;
mod writer;

const DEFAULT_RUST_LOG: &str = "remindly=debug";

/// Idle time after which a conversation forgets its draft
const SESSION_IDLE: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    setup_environment();
    setup_tracing();

    let config = Config::from_env()?;

    match config.database_url.clone() {
        Some(database_url) => {
            let connection_pool = storage::connect(&database_url).await?;

            let store = storage::Postgres::new_with_pool(connection_pool.clone());
            let broker = broker::Postgres::provision(connection_pool, &config.broker).await?;

            serve(config, store, broker).await
        }
        None => {
            tracing::warn!(
                "`DATABASE_URL` is not set, notes and completion records are kept in memory only"
            );

            serve(config, storage::Memory::new(), broker::Memory::new()).await
        }
    }
}

/// Run all loops until a terminate signal arrives
///
/// # Errors
///
/// Will return `Err` when the broker can not be closed cleanly
async fn serve<S, B>(config: Config, store: S, broker: B) -> Result<()>
where
    S: NoteStore,
    B: CompletionBroker,
{
    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let notify_bot = Bot::new(
        config.telegram.api_url.clone(),
        &config.telegram.notify_token,
    );
    let dispatcher = Dispatcher::new(
        store.clone(),
        notify_bot,
        broker.clone(),
        config.dispatcher,
    );
    tasks.spawn(dispatcher.run(cancel.clone()));

    let reconciler = Reconciler::new(store.clone(), broker.clone());
    tasks.spawn(reconciler.run(cancel.clone()));

    if let Some(write_token) = &config.telegram.write_token {
        let write_bot = Bot::new(config.telegram.api_url.clone(), write_token);
        let conversations = Conversations::new(store, config.timezone_offset, SESSION_IDLE);

        tasks.spawn(Writer::new(write_bot, conversations).run(cancel.clone()));
    } else {
        tracing::info!("`TOKEN_WRITE_BOT` is not set, users can not write notes");
    }

    graceful_shutdown::handler().await;
    cancel.cancel();

    while let Some(result) = tasks.join_next().await {
        if let Err(err) = result {
            tracing::error!(error = %err, "Task did not finish cleanly");
        }
    }

    broker.close().await?;

    tracing::info!("Shutdown complete");

    Ok(())
}

fn setup_environment() {
    dotenvy::dotenv().ok();
}

fn setup_tracing() {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::registry;

    registry()
        .with(EnvFilter::new(env_var_or("RUST_LOG", DEFAULT_RUST_LOG)))
        .with(fmt::layer())
        .init();
}
