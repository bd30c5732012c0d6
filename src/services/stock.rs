//! Stock ledger: the authoritative record of medicine stock quantities.
//!
//! The one invariant this module owns is that `stock_quantity` never goes
//! negative, globally, under concurrent fulfillment. All mutation goes
//! through [`decrement`] (a single conditional UPDATE at the storage layer)
//! or [`StockService::restock`]; no code path may read-modify-write stock
//! across two operations.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::auth::{AuthUser, Role};
use crate::cache::{StockCache, StockSnapshot};
use crate::db::DbPool;
use crate::entities::{medicine, pharmacy};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::search::SearchIndex;

/// Result of a conditional decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecrementOutcome {
    /// The quantity was available and has been deducted.
    Applied,
    /// The row held less than the requested quantity; nothing changed.
    Insufficient,
}

/// Atomically deducts `quantity` from a medicine's stock if enough remains:
///
/// ```sql
/// UPDATE medicines SET stock_quantity = stock_quantity - ?
/// WHERE id = ? AND stock_quantity >= ?
/// ```
///
/// Check and update happen in one indivisible statement, so two concurrent
/// fulfillments can never both observe the same quantity and oversubscribe
/// it. Runs on any connection, including an open transaction, which is how
/// the worker makes multi-line decrements all-or-nothing.
pub async fn decrement<C: ConnectionTrait>(
    conn: &C,
    medicine_id: i32,
    quantity: i32,
) -> Result<DecrementOutcome, ServiceError> {
    debug_assert!(quantity > 0);

    let result = medicine::Entity::update_many()
        .col_expr(
            medicine::Column::StockQuantity,
            Expr::col(medicine::Column::StockQuantity).sub(quantity),
        )
        .col_expr(medicine::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(medicine::Column::Id.eq(medicine_id))
        .filter(medicine::Column::StockQuantity.gte(quantity))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        Ok(DecrementOutcome::Insufficient)
    } else {
        Ok(DecrementOutcome::Applied)
    }
}

/// Service over the stock ledger: snapshot reads (through the cache) and
/// administrative restocks.
#[derive(Clone)]
pub struct StockService {
    db: Arc<DbPool>,
    cache: StockCache,
    search: Arc<dyn SearchIndex>,
    event_sender: EventSender,
}

impl StockService {
    pub fn new(
        db: Arc<DbPool>,
        cache: StockCache,
        search: Arc<dyn SearchIndex>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            cache,
            search,
            event_sender,
        }
    }

    /// Read-through snapshot of one medicine's stock. Cache failures are
    /// treated as misses; the database stays authoritative.
    #[instrument(skip(self))]
    pub async fn get_stock_snapshot(&self, medicine_id: i32) -> Result<StockSnapshot, ServiceError> {
        match self.cache.get(medicine_id).await {
            Ok(Some(snapshot)) => return Ok(snapshot),
            Ok(None) => {}
            Err(e) => warn!(medicine_id, error = %e, "stock cache read failed; falling back to database"),
        }

        let medicine = medicine::Entity::find_by_id(medicine_id)
            .one(&*self.db)
            .await?
            .ok_or(ServiceError::MedicineNotFound(medicine_id))?;

        let snapshot = StockSnapshot {
            medicine_id: medicine.id,
            stock_quantity: medicine.stock_quantity,
            unit_price: medicine.unit_price,
            updated_at: medicine.updated_at,
        };

        if let Err(e) = self.cache.put(&snapshot).await {
            warn!(medicine_id, error = %e, "stock cache write failed");
        }

        Ok(snapshot)
    }

    /// Administrative restock: adds `quantity` to the ledger and refreshes
    /// the derived views. Only the medicine's own pharmacy (or an admin)
    /// may restock it.
    #[instrument(skip(self, actor))]
    pub async fn restock(
        &self,
        medicine_id: i32,
        quantity: i32,
        actor: &AuthUser,
    ) -> Result<medicine::Model, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Restock quantity must be positive".to_string(),
            ));
        }

        let existing = medicine::Entity::find_by_id(medicine_id)
            .one(&*self.db)
            .await?
            .ok_or(ServiceError::MedicineNotFound(medicine_id))?;

        if actor.role != Role::Admin {
            let owned = pharmacy::Entity::find()
                .filter(pharmacy::Column::OwnerId.eq(actor.id))
                .one(&*self.db)
                .await?
                .ok_or_else(|| {
                    ServiceError::Forbidden("No pharmacy registered for this account".to_string())
                })?;
            if existing.pharmacy_id != owned.id {
                return Err(ServiceError::Forbidden(
                    "Medicine belongs to a different pharmacy".to_string(),
                ));
            }
        }

        let result = medicine::Entity::update_many()
            .col_expr(
                medicine::Column::StockQuantity,
                Expr::col(medicine::Column::StockQuantity).add(quantity),
            )
            .col_expr(medicine::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(medicine::Column::Id.eq(medicine_id))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::MedicineNotFound(medicine_id));
        }

        let medicine = medicine::Entity::find_by_id(medicine_id)
            .one(&*self.db)
            .await?
            .ok_or(ServiceError::MedicineNotFound(medicine_id))?;

        info!(
            medicine_id,
            quantity,
            new_quantity = medicine.stock_quantity,
            "stock replenished"
        );

        self.refresh_derived_views(&medicine).await;

        if let Err(e) = self
            .event_sender
            .send(Event::StockReplenished {
                medicine_id,
                quantity,
                new_quantity: medicine.stock_quantity,
            })
            .await
        {
            warn!(medicine_id, error = %e, "failed to send stock replenished event");
        }

        Ok(medicine)
    }

    /// Pushes a medicine's current quantity into the cache and search index.
    /// Both are best-effort derived views; failures are logged and the views
    /// converge on the next write or read-miss.
    pub async fn refresh_derived_views(&self, medicine: &medicine::Model) {
        let snapshot = StockSnapshot {
            medicine_id: medicine.id,
            stock_quantity: medicine.stock_quantity,
            unit_price: medicine.unit_price,
            updated_at: medicine.updated_at,
        };
        if let Err(e) = self.cache.put(&snapshot).await {
            warn!(medicine_id = medicine.id, error = %e, "stock cache refresh failed");
        }

        if let Err(e) = self
            .search
            .update(
                medicine.id,
                json!({ "stock_quantity": medicine.stock_quantity }),
            )
            .await
        {
            warn!(medicine_id = medicine.id, error = %e, "search index refresh failed");
        }
    }
}
