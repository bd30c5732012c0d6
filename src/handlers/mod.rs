//! HTTP handlers, grouped by resource. Route tables live next to the
//! handlers they mount; `routes` assembles the versioned API surface.

use axum::Router;

use crate::AppState;

pub mod health;
pub mod orders;
pub mod stock;

/// All `/api/v1` routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(orders::routes())
        .merge(stock::routes())
}
