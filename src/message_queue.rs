/*!
 * # Fulfillment Queue
 *
 * Durable, at-least-once message channel carrying fulfillment jobs from
 * order intake to the worker. Consumers acknowledge explicitly: `ack` on
 * success, `nack(requeue=true)` for retryable failures, and
 * `nack(requeue=false)` to discard poison messages.
 */

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Message queue errors
#[derive(Error, Debug)]
pub enum MessageQueueError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Connection error: {0}")]
    ConnectionError(#[from] redis::RedisError),
    #[error("Publish timed out after {0:?}")]
    PublishTimeout(Duration),
    #[error("Unknown delivery: {0}")]
    UnknownDelivery(String),
}

/// Message envelope for queue items
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

impl Message {
    pub fn new(queue: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

/// Wire payload of a fulfillment job: `{"order_id": N}`. Extra fields from
/// newer producers are tolerated; serde ignores unknown keys by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentJob {
    pub order_id: i32,
}

impl FulfillmentJob {
    pub fn new(order_id: i32) -> Self {
        Self { order_id }
    }

    /// Wraps the job in a queue envelope for the given channel.
    pub fn into_message(self, queue: &str) -> Result<Message, MessageQueueError> {
        Ok(Message::new(queue, serde_json::to_value(self)?))
    }
}

/// A received message together with its broker-side receipt. The receipt is
/// what `ack`/`nack` use to settle the delivery.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    receipt: String,
}

impl Delivery {
    pub fn new(message: Message, receipt: impl Into<String>) -> Self {
        Self {
            message,
            receipt: receipt.into(),
        }
    }
}

/// Message queue trait for different broker backends
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Durably persists the message before returning success.
    async fn publish(&self, message: Message) -> Result<(), MessageQueueError>;

    /// Pulls the next message off the channel, if any. Implementations may
    /// block up to their configured receive timeout.
    async fn receive(&self, queue: &str) -> Result<Option<Delivery>, MessageQueueError>;

    /// Settles a delivery as successfully processed.
    async fn ack(&self, delivery: &Delivery) -> Result<(), MessageQueueError>;

    /// Settles a delivery as failed: requeued for redelivery, or discarded
    /// to the dead-letter channel for poison messages.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), MessageQueueError>;

    /// Requeues deliveries left in-flight by a crashed consumer. Must run
    /// before consumers start pulling, otherwise it would steal live
    /// in-flight messages. Returns the number of messages reclaimed.
    async fn recover(&self, _queue: &str) -> Result<u64, MessageQueueError> {
        Ok(0)
    }
}

/// Redis-backed queue: a pending list plus a per-channel processing list.
///
/// `publish` pushes onto `{ns}:{queue}`; `receive` atomically moves an entry
/// to `{ns}:{queue}:processing` with BRPOPLPUSH, so a consumer crash leaves
/// the entry in the processing list where `recover` finds it. `ack` removes
/// the entry; `nack` removes it and either requeues it or pushes it to
/// `{ns}:{queue}:dead`.
pub struct RedisMessageQueue {
    conn: redis::aio::ConnectionManager,
    // BRPOPLPUSH holds its connection for up to `block_timeout`; giving the
    // consumer its own connection keeps publishes off that blocked socket.
    blocking_conn: redis::aio::ConnectionManager,
    namespace: String,
    block_timeout: Duration,
    publish_timeout: Duration,
}

impl RedisMessageQueue {
    pub async fn new(
        client: Arc<redis::Client>,
        namespace: String,
        block_timeout: Duration,
        publish_timeout: Duration,
    ) -> Result<Self, MessageQueueError> {
        // ConnectionManager reconnects with backoff on broken connections.
        let conn = client.get_tokio_connection_manager().await?;
        let blocking_conn = client.get_tokio_connection_manager().await?;
        Ok(Self {
            conn,
            blocking_conn,
            namespace,
            block_timeout,
            publish_timeout,
        })
    }

    fn pending_key(&self, queue: &str) -> String {
        format!("{}:{}", self.namespace, queue)
    }

    fn processing_key(&self, queue: &str) -> String {
        format!("{}:{}:processing", self.namespace, queue)
    }

    fn dead_key(&self, queue: &str) -> String {
        format!("{}:{}:dead", self.namespace, queue)
    }
}

#[async_trait]
impl MessageQueue for RedisMessageQueue {
    async fn publish(&self, message: Message) -> Result<(), MessageQueueError> {
        let key = self.pending_key(&message.queue);
        let raw = serde_json::to_string(&message)?;
        let mut conn = self.conn.clone();

        tokio::time::timeout(self.publish_timeout, async {
            conn.lpush::<_, _, ()>(&key, &raw).await
        })
        .await
        .map_err(|_| MessageQueueError::PublishTimeout(self.publish_timeout))??;

        debug!(queue = %message.queue, message_id = %message.id, "message published");
        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>, MessageQueueError> {
        let pending = self.pending_key(queue);
        let processing = self.processing_key(queue);
        let mut conn = self.blocking_conn.clone();

        let raw: Option<String> = conn
            .brpoplpush(&pending, &processing, self.block_timeout.as_secs() as usize)
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<Message>(&raw) {
            Ok(message) => Ok(Some(Delivery::new(message, raw))),
            Err(e) => {
                // An unparseable envelope can never be processed; move it to
                // the dead list instead of crash-looping on it.
                warn!(queue, error = %e, "discarding malformed queue envelope");
                let dead = self.dead_key(queue);
                let _: () = conn.lrem(&processing, 1, &raw).await?;
                let _: () = conn.lpush(&dead, &raw).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), MessageQueueError> {
        let processing = self.processing_key(&delivery.message.queue);
        let mut conn = self.conn.clone();
        let _: () = conn.lrem(&processing, 1, &delivery.receipt).await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), MessageQueueError> {
        let queue = &delivery.message.queue;
        let processing = self.processing_key(queue);
        let mut conn = self.conn.clone();

        let _: () = conn.lrem(&processing, 1, &delivery.receipt).await?;
        if requeue {
            // RPUSH so redeliveries go to the head of consumption order.
            let _: () = conn.rpush(&self.pending_key(queue), &delivery.receipt).await?;
        } else {
            let _: () = conn.lpush(&self.dead_key(queue), &delivery.receipt).await?;
        }
        Ok(())
    }

    async fn recover(&self, queue: &str) -> Result<u64, MessageQueueError> {
        let pending = self.pending_key(queue);
        let processing = self.processing_key(queue);
        let mut conn = self.conn.clone();

        let stale: Vec<String> = conn.lrange(&processing, 0, -1).await?;
        let count = stale.len() as u64;
        for raw in stale {
            let _: () = conn.rpush(&pending, &raw).await?;
        }
        let _: () = conn.del(&processing).await?;

        if count > 0 {
            warn!(queue, count, "requeued messages left in-flight by a previous consumer");
        }
        Ok(count)
    }
}

#[derive(Default)]
struct InMemoryState {
    queues: HashMap<String, VecDeque<Message>>,
    in_flight: HashMap<String, Message>,
    dead: HashMap<String, Vec<Message>>,
}

/// In-memory queue with the same ack/nack semantics as the Redis backend.
/// Used in tests and local development without a broker.
#[derive(Clone, Default)]
pub struct InMemoryMessageQueue {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting on a channel (not counting in-flight).
    pub fn len(&self, queue: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Number of poison-discarded messages on a channel.
    pub fn dead_letter_count(&self, queue: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.dead.get(queue).map_or(0, Vec::len)
    }

    /// Number of received-but-unsettled deliveries.
    pub fn in_flight_count(&self) -> usize {
        self.state.lock().unwrap().in_flight.len()
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn publish(&self, message: Message) -> Result<(), MessageQueueError> {
        let mut state = self.state.lock().unwrap();
        state
            .queues
            .entry(message.queue.clone())
            .or_default()
            .push_back(message);
        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>, MessageQueueError> {
        let mut state = self.state.lock().unwrap();
        let Some(message) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        let receipt = message.id.to_string();
        state.in_flight.insert(receipt.clone(), message.clone());
        Ok(Some(Delivery::new(message, receipt)))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), MessageQueueError> {
        let mut state = self.state.lock().unwrap();
        state
            .in_flight
            .remove(&delivery.receipt)
            .map(|_| ())
            .ok_or_else(|| MessageQueueError::UnknownDelivery(delivery.receipt.clone()))
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), MessageQueueError> {
        let mut state = self.state.lock().unwrap();
        let message = state
            .in_flight
            .remove(&delivery.receipt)
            .ok_or_else(|| MessageQueueError::UnknownDelivery(delivery.receipt.clone()))?;

        if requeue {
            state
                .queues
                .entry(message.queue.clone())
                .or_default()
                .push_back(message);
        } else {
            state
                .dead
                .entry(message.queue.clone())
                .or_default()
                .push(message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_receive_preserves_fifo_order() {
        let queue = InMemoryMessageQueue::new();
        for order_id in 1..=3 {
            let message = FulfillmentJob::new(order_id)
                .into_message("orders_queue")
                .unwrap();
            queue.publish(message).await.unwrap();
        }

        for expected in 1..=3 {
            let delivery = queue.receive("orders_queue").await.unwrap().unwrap();
            let job: FulfillmentJob =
                serde_json::from_value(delivery.message.payload.clone()).unwrap();
            assert_eq!(job.order_id, expected);
            queue.ack(&delivery).await.unwrap();
        }

        assert!(queue.receive("orders_queue").await.unwrap().is_none());
        assert_eq!(queue.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        let queue = InMemoryMessageQueue::new();
        let message = FulfillmentJob::new(42).into_message("orders_queue").unwrap();
        queue.publish(message).await.unwrap();

        let delivery = queue.receive("orders_queue").await.unwrap().unwrap();
        queue.nack(&delivery, true).await.unwrap();

        let redelivered = queue.receive("orders_queue").await.unwrap().unwrap();
        assert_eq!(redelivered.message.id, delivery.message.id);
    }

    #[tokio::test]
    async fn nack_without_requeue_dead_letters() {
        let queue = InMemoryMessageQueue::new();
        let message = Message::new("orders_queue", serde_json::json!({"bogus": true}));
        queue.publish(message).await.unwrap();

        let delivery = queue.receive("orders_queue").await.unwrap().unwrap();
        queue.nack(&delivery, false).await.unwrap();

        assert!(queue.receive("orders_queue").await.unwrap().is_none());
        assert_eq!(queue.dead_letter_count("orders_queue"), 1);
    }

    #[test]
    fn job_payload_tolerates_unknown_fields() {
        let job: FulfillmentJob =
            serde_json::from_value(serde_json::json!({"order_id": 7, "source": "v2"})).unwrap();
        assert_eq!(job.order_id, 7);
    }

    #[test]
    fn job_payload_rejects_missing_order_id() {
        let result: Result<FulfillmentJob, _> =
            serde_json::from_value(serde_json::json!({"order": 7}));
        assert!(result.is_err());
    }
}
