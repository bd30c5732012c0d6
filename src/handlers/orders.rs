use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;

use crate::auth::{AuthUser, Role};
use crate::entities::OrderStatus;
use crate::errors::ServiceError;
use crate::services::orders::PlaceOrderRequest;
use crate::{ApiResponse, AppState, ListQuery};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/orders", post(place_order).get(list_my_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/orders/:id/status", put(update_order_status))
        .route("/pharmacy/orders", get(list_pharmacy_orders))
}

/// POST /api/v1/orders
///
/// Accepts the order and returns 201 with the PENDING order; confirmation
/// happens asynchronously.
async fn place_order(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<PlaceOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.orders.place_order(user.id, request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(order))))
}

/// GET /api/v1/orders
async fn list_my_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let orders = state
        .orders
        .list_orders_for_user(user.id, query.page, query.per_page)
        .await?;
    Ok(Json(ApiResponse::success(orders)))
}

/// GET /api/v1/orders/:id
async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.orders.get_order(id, &user).await?;
    Ok(Json(ApiResponse::success(order)))
}

/// POST /api/v1/orders/:id/cancel
async fn cancel_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.orders.cancel_order(id, &user).await?;
    Ok(Json(ApiResponse::success(order)))
}

#[derive(Debug, Deserialize)]
struct UpdateStatusRequest {
    status: OrderStatus,
}

/// PUT /api/v1/orders/:id/status
///
/// Pharmacy-side progression along the delivery path.
async fn update_order_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i32>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    user.require_role(Role::Pharmacy)?;
    let order = state
        .orders
        .update_order_status(id, request.status, &user)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

/// GET /api/v1/pharmacy/orders
async fn list_pharmacy_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    user.require_role(Role::Pharmacy)?;
    let orders = state
        .orders
        .list_orders_for_pharmacy(&user, query.page, query.per_page)
        .await?;
    Ok(Json(ApiResponse::success(orders)))
}
