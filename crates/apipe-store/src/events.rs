//! Job lifecycle event sinks for the notify path.

use std::pin::Pin;

use apipe_models::{JobEvent, JobId};
use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::StoreResult;

/// Receives an event for every persisted state change.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &JobEvent) -> StoreResult<()>;
}

/// Discards events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvents;

#[async_trait]
impl EventSink for NoopEvents {
    async fn publish(&self, _event: &JobEvent) -> StoreResult<()> {
        Ok(())
    }
}

/// In-process fan-out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastEvents {
    tx: broadcast::Sender<JobEvent>,
}

impl BroadcastEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEvents {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventSink for BroadcastEvents {
    async fn publish(&self, event: &JobEvent) -> StoreResult<()> {
        // No subscribers is not an error
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// Publishes events on a Redis pub/sub channel per job.
pub struct RedisEvents {
    client: redis::Client,
    prefix: String,
}

impl RedisEvents {
    pub fn new(redis_url: &str, prefix: impl Into<String>) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            prefix: prefix.into(),
        })
    }

    /// Get the channel name for a job.
    pub fn channel_name(&self, job_id: &JobId) -> String {
        format!("{}:events:{}", self.prefix, job_id)
    }

    /// Subscribe to events for a job.
    /// Returns a pinned stream that can be polled with `.next()`.
    pub async fn subscribe(
        &self,
        job_id: &JobId,
    ) -> StoreResult<Pin<Box<dyn futures_util::Stream<Item = JobEvent> + Send>>> {
        use futures_util::StreamExt;

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.channel_name(job_id)).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str(&payload).ok()
        });

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl EventSink for RedisEvents {
    async fn publish(&self, event: &JobEvent) -> StoreResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let channel = self.channel_name(&event.job_id);
        let payload = serde_json::to_string(event)?;

        debug!("Publishing job event to {}", channel);
        conn.publish::<_, _, ()>(channel, payload).await?;

        Ok(())
    }
}
