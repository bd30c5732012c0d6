use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use validator::Validate;

use crate::auth::{AuthUser, Role};
use crate::errors::ServiceError;
use crate::{ApiResponse, AppState};

pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/medicines/:id/stock",
        get(get_stock).put(restock),
    )
}

/// GET /api/v1/medicines/:id/stock
///
/// Served through the stock cache; falls back to the database on a miss.
async fn get_stock(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, ServiceError> {
    let snapshot = state.stock.get_stock_snapshot(id).await?;
    Ok(Json(ApiResponse::success(snapshot)))
}

#[derive(Debug, Deserialize, Validate)]
struct RestockRequest {
    #[validate(range(min = 1, message = "Restock quantity must be at least 1"))]
    quantity: i32,
}

/// PUT /api/v1/medicines/:id/stock
///
/// Adds stock to the ledger. Pharmacy and admin only.
async fn restock(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i32>,
    Json(request): Json<RestockRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    user.require_role(Role::Pharmacy)?;
    request
        .validate()
        .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
    let medicine = state.stock.restock(id, request.quantity, &user).await?;
    Ok(Json(ApiResponse::success(medicine)))
}
