mod common;

use std::time::Duration;

use chrono::Utc;
use rust_decimal_macros::dec;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

use common::{user, TestApp, QUEUE};
use medistock_api::auth::Role;
use medistock_api::entities::{order, OrderStatus};
use medistock_api::message_queue::MessageQueue;
use medistock_api::services::orders::{OrderItemRequest, PlaceOrderRequest};

async fn place(app: &TestApp, pharmacy_id: i32, medicine_id: i32) -> i32 {
    app.state
        .orders
        .place_order(
            1,
            PlaceOrderRequest {
                pharmacy_id,
                delivery_address: "12 High Street".to_string(),
                delivery_latitude: None,
                delivery_longitude: None,
                notes: None,
                items: vec![OrderItemRequest {
                    medicine_id,
                    quantity: 1,
                }],
            },
        )
        .await
        .unwrap()
        .order
        .id
}

/// Backdates an order so the sweep sees it as stuck.
async fn backdate(app: &TestApp, order_id: i32, age: Duration) {
    order::Entity::update_many()
        .col_expr(
            order::Column::CreatedAt,
            Expr::value(Utc::now() - chrono::Duration::from_std(age).unwrap()),
        )
        .filter(order::Column::Id.eq(order_id))
        .exec(&*app.db)
        .await
        .unwrap();
}

#[tokio::test]
async fn sweep_reenqueues_stuck_pending_orders() {
    let app = TestApp::new().await;
    let pharmacy = app.seed_pharmacy(100).await;
    let medicine = app
        .seed_medicine(pharmacy.id, "Paracetamol 500mg", dec!(4.50), 40)
        .await;

    let order_id = place(&app, pharmacy.id, medicine.id).await;

    // Simulate a lost job: drop the published message and age the order.
    let delivery = app.queue.receive(QUEUE).await.unwrap().unwrap();
    app.queue.nack(&delivery, false).await.unwrap();
    backdate(&app, order_id, Duration::from_secs(600)).await;

    let published = app.sweep(Duration::from_secs(300)).sweep_once().await.unwrap();
    assert_eq!(published, 1);

    // The worker picks the re-enqueued job up and the order confirms.
    app.run_worker_until_idle().await;
    let status = order::Entity::find_by_id(order_id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap()
        .status;
    assert_eq!(status, OrderStatus::Confirmed);
}

#[tokio::test]
async fn fresh_pending_orders_are_left_alone() {
    let app = TestApp::new().await;
    let pharmacy = app.seed_pharmacy(100).await;
    let medicine = app
        .seed_medicine(pharmacy.id, "Paracetamol 500mg", dec!(4.50), 40)
        .await;

    let _order_id = place(&app, pharmacy.id, medicine.id).await;
    // One job from intake, none added by the sweep.
    let published = app.sweep(Duration::from_secs(300)).sweep_once().await.unwrap();
    assert_eq!(published, 0);
    assert_eq!(app.queue.len(QUEUE), 1);
}

#[tokio::test]
async fn settled_orders_are_never_reenqueued() {
    let app = TestApp::new().await;
    let pharmacy = app.seed_pharmacy(100).await;
    let medicine = app
        .seed_medicine(pharmacy.id, "Paracetamol 500mg", dec!(4.50), 40)
        .await;

    let confirmed = place(&app, pharmacy.id, medicine.id).await;
    app.run_worker_until_idle().await;

    let cancelled = place(&app, pharmacy.id, medicine.id).await;
    app.state
        .orders
        .cancel_order(cancelled, &user(1, Role::Patient))
        .await
        .unwrap();
    // Drop the cancelled order's job so only sweep output remains.
    while let Some(delivery) = app.queue.receive(QUEUE).await.unwrap() {
        app.queue.nack(&delivery, false).await.unwrap();
    }

    backdate(&app, confirmed, Duration::from_secs(600)).await;
    backdate(&app, cancelled, Duration::from_secs(600)).await;

    let published = app.sweep(Duration::from_secs(300)).sweep_once().await.unwrap();
    assert_eq!(published, 0);
    assert!(app.queue.is_empty(QUEUE));
}

#[tokio::test]
async fn double_enqueue_from_sweep_and_broker_is_harmless() {
    let app = TestApp::new().await;
    let pharmacy = app.seed_pharmacy(100).await;
    let medicine = app
        .seed_medicine(pharmacy.id, "Paracetamol 500mg", dec!(4.50), 40)
        .await;

    let order_id = place(&app, pharmacy.id, medicine.id).await;
    backdate(&app, order_id, Duration::from_secs(600)).await;

    // The original job is still queued; the sweep publishes a second one.
    let published = app.sweep(Duration::from_secs(300)).sweep_once().await.unwrap();
    assert_eq!(published, 1);
    assert_eq!(app.queue.len(QUEUE), 2);

    app.run_worker_until_idle().await;

    // One decrement, not two.
    let stock = medistock_api::entities::medicine::Entity::find_by_id(medicine.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap()
        .stock_quantity;
    assert_eq!(stock, 39);
}
