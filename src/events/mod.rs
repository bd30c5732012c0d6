use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::entities::OrderStatus;

/// Events emitted by the order and stock services. Consumed by a logging
/// processor today; the channel is the seam where notifications would hang.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Order lifecycle
    OrderPlaced(i32),
    OrderConfirmed(i32),
    OrderCancelled(i32),
    OrderBackordered(i32),
    OrderStatusChanged {
        order_id: i32,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },

    // Stock ledger
    StockDecremented {
        medicine_id: i32,
        quantity: i32,
    },
    StockReplenished {
        medicine_id: i32,
        quantity: i32,
        new_quantity: i32,
    },

    /// Intake accepted an order but could not publish its fulfillment job.
    /// The order sits in PENDING until the reconciliation sweep re-enqueues
    /// it; operators alert on this event.
    FulfillmentEnqueueFailed {
        order_id: i32,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Channel wired to a processor, for constructing services in tests.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }
}

/// Drains the event channel and logs each event. Runs for the lifetime of
/// the process; exits when every sender is dropped.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        match &event {
            Event::OrderPlaced(order_id) => info!(order_id, "order placed"),
            Event::OrderConfirmed(order_id) => info!(order_id, "order confirmed"),
            Event::OrderCancelled(order_id) => info!(order_id, "order cancelled"),
            Event::OrderBackordered(order_id) => {
                warn!(order_id, "order backordered: stock depleted at fulfillment time")
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => info!(order_id, %old_status, %new_status, "order status changed"),
            Event::StockDecremented {
                medicine_id,
                quantity,
            } => info!(medicine_id, quantity, "stock decremented"),
            Event::StockReplenished {
                medicine_id,
                quantity,
                new_quantity,
            } => info!(medicine_id, quantity, new_quantity, "stock replenished"),
            Event::FulfillmentEnqueueFailed { order_id, reason } => {
                warn!(order_id, reason, "fulfillment job enqueue failed; order stuck in pending")
            }
        }
    }
    info!("event processor stopped");
}
