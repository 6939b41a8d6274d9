//! WebSocket notification source.
//!
//! Subscribes to a relay that republishes a notification channel over
//! WebSocket, one text frame per payload, at `{base_url}/{channel}`.

use async_trait::async_trait;
use cachewatch_core::{CacheWatchResult, Channel, SourceError};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{NotificationSource, SourceLink};
use crate::queue::NotificationSink;

/// Source reading payloads from a WebSocket relay.
#[derive(Debug, Clone)]
pub struct WsNotificationSource {
    base_url: String,
}

impl WsNotificationSource {
    /// `base_url` is the relay prefix, e.g. `ws://localhost:8000/pgpubsub`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn channel_url(&self, channel: &Channel) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), channel)
    }
}

#[async_trait]
impl NotificationSource for WsNotificationSource {
    async fn subscribe(
        &self,
        channel: &Channel,
        sink: NotificationSink,
    ) -> CacheWatchResult<Box<dyn SourceLink>> {
        let url = self.channel_url(channel);
        let (mut stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| SourceError::ConnectFailed {
                reason: format!("{}: {}", url, e),
            })?;

        let pump = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => sink.deliver(text.as_bytes()),
                    Ok(Message::Binary(data)) => sink.deliver(&data),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(channel = %sink.channel(), error = %e, "WebSocket receive failed");
                        break;
                    }
                }
            }
            debug!(channel = %sink.channel(), "WebSocket stream ended");
            sink.terminate();
        });

        Ok(Box::new(WsLink { pump }))
    }
}

struct WsLink {
    pump: JoinHandle<()>,
}

impl SourceLink for WsLink {
    fn is_open(&self) -> bool {
        !self.pump.is_finished()
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
