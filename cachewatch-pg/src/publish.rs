//! Publishing change events with `pg_notify`.

use cachewatch_core::{CacheWatchResult, Event, SourceError};
use tokio_postgres::Client;
use tracing::debug;

/// Publish `event` on its channel, in the same payload format the producer
/// triggers use. Mostly useful for tests and for mock events.
///
/// # Errors
///
/// Returns [`SourceError::PublishFailed`] if the statement fails.
pub async fn emit_event(client: &Client, event: &Event) -> CacheWatchResult<()> {
    let payload = event.to_payload();
    client
        .execute("SELECT pg_notify($1, $2)", &[&event.channel().as_str(), &payload])
        .await
        .map_err(|e| SourceError::PublishFailed {
            reason: e.to_string(),
        })?;

    debug!(
        channel = %event.channel(),
        table = event.table(),
        operation = %event.operation(),
        "Event emitted"
    );
    Ok(())
}
