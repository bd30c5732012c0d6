//! Fulfillment worker: consumes fulfillment jobs and settles PENDING orders.
//!
//! Each job is processed inside one database transaction. Every line is
//! deducted with the conditional decrement; if any line comes up short the
//! transaction rolls back and the order is marked BACKORDERED, otherwise the
//! order is confirmed in the same transaction as the deductions. Derived
//! views (cache, search index) are refreshed after commit, best-effort.
//!
//! Processing is idempotent over redelivery: a redelivered job finds the
//! order already out of PENDING and acks without touching stock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set, TransactionTrait};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::cache::StockCache;
use crate::db::DbPool;
use crate::entities::{medicine, order, order_item, OrderStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::message_queue::{Delivery, FulfillmentJob, MessageQueue};
use crate::search::SearchIndex;
use crate::services::stock::{self, DecrementOutcome};

/// How a fulfillment job resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every line was deducted; the order is CONFIRMED.
    Confirmed,
    /// At least one line was short; nothing was deducted and the order is
    /// BACKORDERED.
    Backordered,
    /// The order had already left PENDING (redelivered job).
    Duplicate,
    /// The order row no longer exists.
    OrderMissing,
    /// The order was cancelled before the job ran.
    Cancelled,
}

/// Long-running consumer of the fulfillment queue.
pub struct FulfillmentWorker {
    db: Arc<DbPool>,
    queue: Arc<dyn MessageQueue>,
    cache: StockCache,
    search: Arc<dyn SearchIndex>,
    event_sender: EventSender,
    queue_name: String,
}

impl FulfillmentWorker {
    pub fn new(
        db: Arc<DbPool>,
        queue: Arc<dyn MessageQueue>,
        cache: StockCache,
        search: Arc<dyn SearchIndex>,
        event_sender: EventSender,
        queue_name: String,
    ) -> Self {
        Self {
            db,
            queue,
            cache,
            search,
            event_sender,
            queue_name,
        }
    }

    /// Consumes jobs until the shutdown signal flips. Reclaims deliveries
    /// left in-flight by a previous process before pulling new work.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        match self.queue.recover(&self.queue_name).await {
            Ok(0) => {}
            Ok(count) => info!(count, "reclaimed in-flight fulfillment jobs"),
            Err(e) => warn!(error = %e, "queue recovery failed; continuing"),
        }

        info!(queue = %self.queue_name, "fulfillment worker started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("fulfillment worker shutting down");
                        return;
                    }
                }
                received = self.queue.receive(&self.queue_name) => {
                    match received {
                        Ok(Some(delivery)) => self.handle_delivery(delivery).await,
                        Ok(None) => {
                            // Receive timeout with nothing pending; loop back
                            // into the blocking pop.
                        }
                        Err(e) => {
                            error!(error = %e, "failed to receive from fulfillment queue");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }

    /// Settles one delivery: ack on any definitive outcome, requeue on
    /// transient failure, discard unparseable payloads.
    pub async fn handle_delivery(&self, delivery: Delivery) {
        let job: FulfillmentJob = match serde_json::from_value(delivery.message.payload.clone()) {
            Ok(job) => job,
            Err(e) => {
                warn!(
                    message_id = %delivery.message.id,
                    error = %e,
                    "discarding fulfillment job with malformed payload"
                );
                if let Err(e) = self.queue.nack(&delivery, false).await {
                    error!(error = %e, "failed to discard malformed job");
                }
                return;
            }
        };

        match self.process_order(job.order_id).await {
            Ok(outcome) => {
                if let Err(e) = self.queue.ack(&delivery).await {
                    // The job will be redelivered; processing is idempotent,
                    // so the redelivery resolves as a duplicate.
                    error!(order_id = job.order_id, error = %e, "failed to ack fulfillment job");
                    return;
                }
                self.emit_outcome_events(job.order_id, outcome).await;
            }
            Err(e) => {
                warn!(order_id = job.order_id, error = %e, "fulfillment failed; requeueing job");
                if let Err(e) = self.queue.nack(&delivery, true).await {
                    error!(order_id = job.order_id, error = %e, "failed to requeue fulfillment job");
                }
            }
        }
    }

    /// Resolves one PENDING order against the stock ledger.
    #[instrument(skip(self))]
    pub async fn process_order(&self, order_id: i32) -> Result<JobOutcome, ServiceError> {
        let txn = self.db.begin().await?;

        let Some(order) = order::Entity::find_by_id(order_id).one(&txn).await? else {
            warn!(order_id, "fulfillment job references a missing order");
            return Ok(JobOutcome::OrderMissing);
        };

        match order.status {
            OrderStatus::Pending => {}
            OrderStatus::Cancelled => {
                info!(order_id, "order was cancelled before fulfillment; skipping");
                return Ok(JobOutcome::Cancelled);
            }
            status => {
                info!(order_id, %status, "order already fulfilled; duplicate delivery");
                return Ok(JobOutcome::Duplicate);
            }
        }

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?;

        let mut deducted = Vec::with_capacity(items.len());
        for item in &items {
            match stock::decrement(&txn, item.medicine_id, item.quantity).await? {
                DecrementOutcome::Applied => deducted.push((item.medicine_id, item.quantity)),
                DecrementOutcome::Insufficient => {
                    // Roll back the partial deductions, then mark the order
                    // outside the dropped transaction.
                    txn.rollback().await?;
                    warn!(
                        order_id,
                        medicine_id = item.medicine_id,
                        requested = item.quantity,
                        "insufficient stock at fulfillment time"
                    );
                    self.mark_backordered(order_id).await?;
                    return Ok(JobOutcome::Backordered);
                }
            }
        }

        let mut active: order::ActiveModel = order.into();
        active.status = Set(OrderStatus::Confirmed);
        active.update(&txn).await?;

        txn.commit().await?;

        info!(order_id, lines = deducted.len(), "order confirmed");

        for (medicine_id, quantity) in deducted {
            self.refresh_medicine_views(medicine_id).await;
            if let Err(e) = self
                .event_sender
                .send(Event::StockDecremented {
                    medicine_id,
                    quantity,
                })
                .await
            {
                warn!(medicine_id, error = %e, "failed to send stock decremented event");
            }
        }

        Ok(JobOutcome::Confirmed)
    }

    /// Transitions PENDING → BACKORDERED, guarded on the current status so a
    /// racing cancel is not overwritten.
    async fn mark_backordered(&self, order_id: i32) -> Result<(), ServiceError> {
        let result = order::Entity::update_many()
            .col_expr(
                order::Column::Status,
                Expr::value(OrderStatus::Backordered),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            info!(order_id, "order left pending before backorder could be recorded");
        }
        Ok(())
    }

    /// Post-commit cache invalidation and search refresh for one medicine.
    /// Both views are best-effort; a failure here never un-confirms the
    /// order.
    async fn refresh_medicine_views(&self, medicine_id: i32) {
        if let Err(e) = self.cache.invalidate(medicine_id).await {
            warn!(medicine_id, error = %e, "stock cache invalidation failed");
        }

        match medicine::Entity::find_by_id(medicine_id).one(&*self.db).await {
            Ok(Some(medicine)) => {
                if let Err(e) = self
                    .search
                    .update(
                        medicine.id,
                        serde_json::json!({ "stock_quantity": medicine.stock_quantity }),
                    )
                    .await
                {
                    warn!(medicine_id, error = %e, "search index refresh failed");
                }
            }
            Ok(None) => warn!(medicine_id, "medicine vanished before view refresh"),
            Err(e) => warn!(medicine_id, error = %e, "failed to re-read medicine for view refresh"),
        }
    }

    async fn emit_outcome_events(&self, order_id: i32, outcome: JobOutcome) {
        let event = match outcome {
            JobOutcome::Confirmed => Some(Event::OrderConfirmed(order_id)),
            JobOutcome::Backordered => Some(Event::OrderBackordered(order_id)),
            JobOutcome::Duplicate | JobOutcome::OrderMissing | JobOutcome::Cancelled => None,
        };
        if let Some(event) = event {
            if let Err(e) = self.event_sender.send(event).await {
                warn!(order_id, error = %e, "failed to send fulfillment outcome event");
            }
        }
    }
}
