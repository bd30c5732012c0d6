//! Order intake and order reads.
//!
//! Intake validates against a point-in-time stock check, persists the order
//! and its lines in one transaction, and only then publishes the
//! fulfillment job. The availability check here is an optimistic,
//! user-facing pre-check; the worker's conditional decrement is the actual
//! enforcement point for the stock invariant.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, Iterable, PaginatorTrait, QueryFilter, QueryOrder,
    Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::auth::{AuthUser, Role};
use crate::db::DbPool;
use crate::entities::{medicine, order, order_item, pharmacy, OrderStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::message_queue::{FulfillmentJob, MessageQueue};

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct PlaceOrderRequest {
    pub pharmacy_id: i32,
    #[validate(length(min = 1, message = "Delivery address is required"))]
    pub delivery_address: String,
    pub delivery_latitude: Option<f64>,
    pub delivery_longitude: Option<f64>,
    pub notes: Option<String>,
    #[validate(length(min = 1, message = "Order must contain at least one item"))]
    pub items: Vec<OrderItemRequest>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct OrderItemRequest {
    pub medicine_id: i32,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: i32,
    pub user_id: i32,
    pub pharmacy_id: i32,
    pub status: OrderStatus,
    pub total_amount: Decimal,
    pub delivery_address: String,
    pub delivery_latitude: Option<f64>,
    pub delivery_longitude: Option<f64>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderItemResponse {
    pub id: i32,
    pub medicine_id: i32,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderDetailResponse {
    #[serde(flatten)]
    pub order: OrderResponse,
    pub items: Vec<OrderItemResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderListResponse {
    pub orders: Vec<OrderResponse>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Service for placing, reading and transitioning orders.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DbPool>,
    queue: Arc<dyn MessageQueue>,
    event_sender: EventSender,
    queue_name: String,
}

impl OrderService {
    pub fn new(
        db: Arc<DbPool>,
        queue: Arc<dyn MessageQueue>,
        event_sender: EventSender,
        queue_name: String,
    ) -> Self {
        Self {
            db,
            queue,
            event_sender,
            queue_name,
        }
    }

    /// Places an order: per-line availability pre-check, atomic persist of
    /// the order and its items, then one fulfillment job publish.
    ///
    /// The order row is committed before the publish; a publish failure is
    /// soft (logged and surfaced as an event) and the order stays PENDING
    /// for the reconciliation sweep to pick up. Availability of order
    /// capture is prioritized over instant fulfillment confirmation.
    #[instrument(skip(self, request), fields(pharmacy_id = request.pharmacy_id))]
    pub async fn place_order(
        &self,
        user_id: i32,
        request: PlaceOrderRequest,
    ) -> Result<OrderDetailResponse, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
        for item in &request.items {
            item.validate()
                .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
        }

        let txn = self.db.begin().await?;

        let mut total_amount = Decimal::ZERO;
        let mut lines = Vec::with_capacity(request.items.len());

        for item in &request.items {
            let medicine = medicine::Entity::find_by_id(item.medicine_id)
                .one(&txn)
                .await?
                .ok_or(ServiceError::MedicineNotFound(item.medicine_id))?;

            if medicine.pharmacy_id != request.pharmacy_id {
                return Err(ServiceError::ValidationError(format!(
                    "Medicine {} does not belong to pharmacy {}",
                    medicine.id, request.pharmacy_id
                )));
            }

            // Point-in-time check only; the worker's conditional decrement
            // is what actually enforces the invariant later.
            if item.quantity > medicine.stock_quantity {
                return Err(ServiceError::InsufficientStock {
                    medicine_id: medicine.id,
                    requested: item.quantity,
                    available: medicine.stock_quantity,
                });
            }

            let subtotal = medicine.unit_price * Decimal::from(item.quantity);
            total_amount += subtotal;
            lines.push((medicine, item.quantity, subtotal));
        }

        let order_model = order::ActiveModel {
            user_id: Set(user_id),
            pharmacy_id: Set(request.pharmacy_id),
            status: Set(OrderStatus::Pending),
            total_amount: Set(total_amount),
            delivery_address: Set(request.delivery_address.clone()),
            delivery_latitude: Set(request.delivery_latitude),
            delivery_longitude: Set(request.delivery_longitude),
            notes: Set(request.notes.clone()),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        let mut item_responses = Vec::with_capacity(lines.len());
        for (medicine, quantity, subtotal) in &lines {
            let item_model = order_item::ActiveModel {
                order_id: Set(order_model.id),
                medicine_id: Set(medicine.id),
                quantity: Set(*quantity),
                unit_price: Set(medicine.unit_price),
                subtotal: Set(*subtotal),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
            item_responses.push(item_model);
        }

        txn.commit().await?;

        info!(
            order_id = order_model.id,
            user_id,
            total = %total_amount,
            "order placed"
        );

        self.publish_fulfillment_job(order_model.id).await;

        if let Err(e) = self.event_sender.send(Event::OrderPlaced(order_model.id)).await {
            warn!(order_id = order_model.id, error = %e, "failed to send order placed event");
        }

        Ok(OrderDetailResponse {
            order: model_to_response(order_model),
            items: item_responses.into_iter().map(item_to_response).collect(),
        })
    }

    /// Publishes the fulfillment job for an order. Broker failure is
    /// non-fatal: the order is already durable, so the failure is logged
    /// and raised as an operator event instead of failing the request.
    pub async fn publish_fulfillment_job(&self, order_id: i32) {
        let publish = async {
            let message = FulfillmentJob::new(order_id).into_message(&self.queue_name)?;
            self.queue.publish(message).await
        };

        if let Err(e) = publish.await {
            warn!(order_id, error = %e, "failed to enqueue fulfillment job; order remains pending");
            if let Err(e) = self
                .event_sender
                .send(Event::FulfillmentEnqueueFailed {
                    order_id,
                    reason: e.to_string(),
                })
                .await
            {
                warn!(order_id, error = %e, "failed to send enqueue-failure event");
            }
        }
    }

    /// Retrieves an order with its items; only the owner (or an admin) may
    /// read it.
    #[instrument(skip(self, actor))]
    pub async fn get_order(
        &self,
        order_id: i32,
        actor: &AuthUser,
    ) -> Result<OrderDetailResponse, ServiceError> {
        let order = self.find_order(order_id).await?;

        if order.user_id != actor.id && actor.role != Role::Admin {
            return Err(ServiceError::Forbidden(
                "You don't have permission to view this order".to_string(),
            ));
        }

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;

        Ok(OrderDetailResponse {
            order: model_to_response(order),
            items: items.into_iter().map(item_to_response).collect(),
        })
    }

    /// Lists a user's orders, newest first.
    #[instrument(skip(self))]
    pub async fn list_orders_for_user(
        &self,
        user_id: i32,
        page: u64,
        per_page: u64,
    ) -> Result<OrderListResponse, ServiceError> {
        let paginator = order::Entity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page);

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;

        Ok(OrderListResponse {
            orders: orders.into_iter().map(model_to_response).collect(),
            total,
            page,
            per_page,
        })
    }

    /// Lists the orders placed against the calling pharmacy owner's
    /// pharmacy, newest first.
    #[instrument(skip(self, actor))]
    pub async fn list_orders_for_pharmacy(
        &self,
        actor: &AuthUser,
        page: u64,
        per_page: u64,
    ) -> Result<OrderListResponse, ServiceError> {
        let pharmacy = self.pharmacy_for_actor(actor).await?;

        let paginator = order::Entity::find()
            .filter(order::Column::PharmacyId.eq(pharmacy.id))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page);

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;

        Ok(OrderListResponse {
            orders: orders.into_iter().map(model_to_response).collect(),
            total,
            page,
            per_page,
        })
    }

    /// Cancels an order on behalf of its owner. Legal from every
    /// non-terminal state; terminal orders fail with an invalid-transition
    /// error. The fulfillment worker re-checks status before decrementing,
    /// so a cancel that races an in-flight job wins or loses cleanly.
    #[instrument(skip(self, actor))]
    pub async fn cancel_order(
        &self,
        order_id: i32,
        actor: &AuthUser,
    ) -> Result<OrderResponse, ServiceError> {
        let order = self.find_order(order_id).await?;

        if order.user_id != actor.id && actor.role != Role::Admin {
            return Err(ServiceError::Forbidden(
                "You don't have permission to cancel this order".to_string(),
            ));
        }

        let old_status = order.status;
        if !old_status.can_transition_to(OrderStatus::Cancelled) {
            return Err(ServiceError::InvalidTransition {
                from: old_status,
                to: OrderStatus::Cancelled,
            });
        }

        let updated = match self.transition_status(order_id, OrderStatus::Cancelled).await? {
            Ok(updated) => updated,
            Err(current) => {
                return Err(ServiceError::InvalidTransition {
                    from: current,
                    to: OrderStatus::Cancelled,
                })
            }
        };

        info!(order_id, %old_status, "order cancelled");

        if let Err(e) = self.event_sender.send(Event::OrderCancelled(order_id)).await {
            warn!(order_id, error = %e, "failed to send order cancelled event");
        }
        self.send_status_changed(order_id, old_status, OrderStatus::Cancelled)
            .await;

        Ok(model_to_response(updated))
    }

    /// Pharmacy-side status update along the delivery path. Confirmation is
    /// reserved for the fulfillment worker, so the reachable targets here
    /// are processing, out_for_delivery and delivered; backward moves and
    /// skips out of pending are rejected.
    #[instrument(skip(self, actor))]
    pub async fn update_order_status(
        &self,
        order_id: i32,
        new_status: OrderStatus,
        actor: &AuthUser,
    ) -> Result<OrderResponse, ServiceError> {
        let order = self.find_order(order_id).await?;

        if actor.role != Role::Admin {
            let pharmacy = self.pharmacy_for_actor(actor).await?;
            if order.pharmacy_id != pharmacy.id {
                return Err(ServiceError::Forbidden(
                    "Order belongs to a different pharmacy".to_string(),
                ));
            }
        }

        let old_status = order.status;
        let pharmacy_reachable = matches!(
            new_status,
            OrderStatus::Processing | OrderStatus::OutForDelivery | OrderStatus::Delivered
        );
        if !pharmacy_reachable || !old_status.can_transition_to(new_status) {
            return Err(ServiceError::InvalidTransition {
                from: old_status,
                to: new_status,
            });
        }

        let updated = match self.transition_status(order_id, new_status).await? {
            Ok(updated) => updated,
            Err(current) => {
                return Err(ServiceError::InvalidTransition {
                    from: current,
                    to: new_status,
                })
            }
        };

        info!(order_id, %old_status, %new_status, "order status updated");
        self.send_status_changed(order_id, old_status, new_status).await;

        Ok(model_to_response(updated))
    }

    /// Writes `new_status` guarded on the set of states it is legally
    /// reachable from, in one conditional UPDATE. A concurrent transition
    /// (a racing cancel, or the worker settling the order) cannot be
    /// overwritten: if the row's status left the legal set between read and
    /// write the guard misses and the current status is returned instead.
    async fn transition_status(
        &self,
        order_id: i32,
        new_status: OrderStatus,
    ) -> Result<Result<order::Model, OrderStatus>, ServiceError> {
        let legal_sources: Vec<OrderStatus> = OrderStatus::iter()
            .filter(|status| status.can_transition_to(new_status))
            .collect();

        let result = order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(new_status))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.is_in(legal_sources))
            .exec(&*self.db)
            .await?;

        let current = self.find_order(order_id).await?;
        if result.rows_affected == 0 {
            Ok(Err(current.status))
        } else {
            Ok(Ok(current))
        }
    }

    async fn find_order(&self, order_id: i32) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))
    }

    async fn pharmacy_for_actor(&self, actor: &AuthUser) -> Result<pharmacy::Model, ServiceError> {
        pharmacy::Entity::find()
            .filter(pharmacy::Column::OwnerId.eq(actor.id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::Forbidden("No pharmacy registered for this account".to_string())
            })
    }

    async fn send_status_changed(
        &self,
        order_id: i32,
        old_status: OrderStatus,
        new_status: OrderStatus,
    ) {
        if let Err(e) = self
            .event_sender
            .send(Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            })
            .await
        {
            warn!(order_id, error = %e, "failed to send status changed event");
        }
    }
}

fn model_to_response(model: order::Model) -> OrderResponse {
    OrderResponse {
        id: model.id,
        user_id: model.user_id,
        pharmacy_id: model.pharmacy_id,
        status: model.status,
        total_amount: model.total_amount,
        delivery_address: model.delivery_address,
        delivery_latitude: model.delivery_latitude,
        delivery_longitude: model.delivery_longitude,
        notes: model.notes,
        created_at: model.created_at,
        updated_at: model.updated_at,
    }
}

fn item_to_response(model: order_item::Model) -> OrderItemResponse {
    OrderItemResponse {
        id: model.id,
        medicine_id: model.medicine_id,
        quantity: model.quantity,
        unit_price: model.unit_price,
        subtotal: model.subtotal,
    }
}
