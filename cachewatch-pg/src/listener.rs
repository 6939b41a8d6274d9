//! PostgreSQL `LISTEN` notification source.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cachewatch_core::{CacheWatchResult, Channel, SourceError};
use cachewatch_events::{NotificationSink, NotificationSource, SourceLink};
use futures_util::{stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, NoTls};
use tracing::{debug, error, warn};

use crate::config::DbConfig;

const PENDING: u8 = 0;
const LISTENING: u8 = 1;
const CLOSED: u8 = 2;

/// Handshake between `subscribe` and the connection driver. The first side
/// to leave `PENDING` decides whether a close fails the subscription or
/// terminates it.
#[derive(Debug, Default)]
struct Handshake(AtomicU8);

impl Handshake {
    /// LISTEN succeeded. False if the connection already closed.
    fn listen(&self) -> bool {
        self.0
            .compare_exchange(PENDING, LISTENING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The connection closed. True if the subscription was live.
    fn close(&self) -> bool {
        self.0.swap(CLOSED, Ordering::AcqRel) == LISTENING
    }
}

/// Source that opens a dedicated connection per subscription and runs
/// `LISTEN` on the channel.
///
/// The subscription terminates when the server closes the connection or
/// the connection reports an error.
#[derive(Debug, Clone)]
pub struct PgNotificationSource {
    connection_string: String,
}

impl PgNotificationSource {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
        }
    }

    pub fn from_config(config: &DbConfig) -> Self {
        Self::new(config.to_connection_string())
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn subscribe(
        &self,
        channel: &Channel,
        sink: NotificationSink,
    ) -> CacheWatchResult<Box<dyn SourceLink>> {
        let (client, mut connection) = tokio_postgres::connect(&self.connection_string, NoTls)
            .await
            .map_err(|e| SourceError::ConnectFailed {
                reason: e.to_string(),
            })?;

        let handshake = Arc::new(Handshake::default());
        let driver_state = Arc::clone(&handshake);
        let name = channel.as_str().to_string();

        let driver = tokio::spawn(async move {
            let mut messages = stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        if notification.channel() == name {
                            sink.deliver(notification.payload().as_bytes());
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        debug!(channel = %sink.channel(), notice = %notice, "Server notice");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(channel = %sink.channel(), error = %e, "PostgreSQL connection failed");
                        break;
                    }
                }
            }
            if driver_state.close() {
                sink.terminate();
            }
        });

        let statement = format!("LISTEN {}", quote_identifier(channel.as_str()));
        if let Err(e) = client.batch_execute(&statement).await {
            driver.abort();
            warn!(channel = %channel, error = %e, "LISTEN failed");
            return Err(SourceError::ListenFailed {
                channel: channel.to_string(),
                reason: e.to_string(),
            }
            .into());
        }
        if !handshake.listen() {
            return Err(SourceError::ListenFailed {
                channel: channel.to_string(),
                reason: "connection closed".to_string(),
            }
            .into());
        }

        debug!(channel = %channel, "Listening for notifications");
        Ok(Box::new(PgLink { client, driver }))
    }
}

/// Keeps the client (and so the session) alive for the subscription.
struct PgLink {
    client: Client,
    driver: JoinHandle<()>,
}

impl SourceLink for PgLink {
    fn is_open(&self) -> bool {
        !self.client.is_closed() && !self.driver.is_finished()
    }
}

impl Drop for PgLink {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Quote a channel name as a PostgreSQL identifier, so `LISTEN` matches the
/// exact string passed to `pg_notify`.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
