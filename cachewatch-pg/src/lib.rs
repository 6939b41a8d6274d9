//! Cachewatch PG - PostgreSQL notification plumbing
//!
//! Connects [`EventQueue`](cachewatch_events::EventQueue)s to PostgreSQL
//! `LISTEN`/`NOTIFY`:
//! - [`PgNotificationSource`]: one dedicated session per subscription
//! - [`emit_event`]: publish an event with `pg_notify`
//! - [`DbConfig`]: connection settings from the environment
//!
//! Producer triggers are expected to send a JSON object with `operation`,
//! `table` and `sent_at` keys on the channel.

mod config;
mod listener;
mod publish;

pub use config::DbConfig;
pub use listener::{quote_identifier, PgNotificationSource};
pub use publish::emit_event;

/// Open a plain client connection and drive it in the background.
///
/// # Errors
///
/// Returns [`SourceError::ConnectFailed`](cachewatch_core::SourceError::ConnectFailed)
/// if the connection cannot be established.
pub async fn connect(config: &DbConfig) -> cachewatch_core::CacheWatchResult<tokio_postgres::Client> {
    let (client, connection) =
        tokio_postgres::connect(&config.to_connection_string(), tokio_postgres::NoTls)
            .await
            .map_err(|e| cachewatch_core::SourceError::ConnectFailed {
                reason: e.to_string(),
            })?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "PostgreSQL connection error");
        }
    });
    Ok(client)
}
