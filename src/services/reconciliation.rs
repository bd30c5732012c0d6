//! Reconciliation sweep for stuck PENDING orders.
//!
//! An order can sit in PENDING forever if its fulfillment job was lost: a
//! failed publish at intake, a broker wipe, or a poison-discarded envelope.
//! The sweep periodically finds PENDING orders older than a threshold and
//! re-enqueues a fulfillment job for each. Re-enqueueing an order whose job
//! is merely slow is harmless: the worker resolves the second delivery as a
//! duplicate.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::db::DbPool;
use crate::entities::{order, OrderStatus};
use crate::errors::ServiceError;
use crate::message_queue::{FulfillmentJob, MessageQueue};

pub struct ReconciliationSweep {
    db: Arc<DbPool>,
    queue: Arc<dyn MessageQueue>,
    queue_name: String,
    /// Minimum age of a PENDING order before it is considered stuck.
    threshold: Duration,
    interval: Duration,
}

impl ReconciliationSweep {
    pub fn new(
        db: Arc<DbPool>,
        queue: Arc<dyn MessageQueue>,
        queue_name: String,
        threshold: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            db,
            queue,
            queue_name,
            threshold,
            interval,
        }
    }

    /// Runs the sweep on its interval until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            threshold_secs = self.threshold.as_secs(),
            interval_secs = self.interval.as_secs(),
            "reconciliation sweep started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("reconciliation sweep shutting down");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "re-enqueued stuck pending orders"),
                        Err(e) => warn!(error = %e, "reconciliation sweep failed"),
                    }
                }
            }
        }
    }

    /// One pass: re-enqueues every PENDING order older than the threshold.
    /// Returns the number of jobs published.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<u64, ServiceError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.threshold)
                .map_err(|e| ServiceError::InternalError(e.to_string()))?;

        // Served by the (status, created_at) index; oldest first so the
        // longest-stuck orders are retried before the cutoff stragglers.
        let stuck = order::Entity::find()
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .filter(order::Column::CreatedAt.lt(cutoff))
            .order_by_asc(order::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        let mut published = 0u64;
        for order in stuck {
            let message = FulfillmentJob::new(order.id)
                .into_message(&self.queue_name)
                .map_err(|e| ServiceError::QueueError(e.to_string()))?;
            match self.queue.publish(message).await {
                Ok(()) => {
                    info!(order_id = order.id, age_secs = (Utc::now() - order.created_at).num_seconds(), "re-enqueued stuck pending order");
                    published += 1;
                }
                Err(e) => {
                    // Leave the rest for the next pass rather than hammering
                    // a broker that is already failing.
                    warn!(order_id = order.id, error = %e, "failed to re-enqueue stuck order");
                    break;
                }
            }
        }

        Ok(published)
    }
}
