mod common;

use rust_decimal_macros::dec;
use sea_orm::EntityTrait;

use common::{user, TestApp};
use medistock_api::auth::Role;
use medistock_api::entities::{order, OrderStatus};
use medistock_api::errors::ServiceError;
use medistock_api::services::orders::{OrderItemRequest, PlaceOrderRequest};

async fn place(app: &TestApp, user_id: i32, pharmacy_id: i32, medicine_id: i32) -> i32 {
    app.state
        .orders
        .place_order(
            user_id,
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
        .expect("order placed")
        .order
        .id
}

#[tokio::test]
async fn pending_orders_can_be_cancelled_by_their_owner() {
    let app = TestApp::new().await;
    let pharmacy = app.seed_pharmacy(100).await;
    let medicine = app
        .seed_medicine(pharmacy.id, "Paracetamol 500mg", dec!(4.50), 40)
        .await;
    let order_id = place(&app, 1, pharmacy.id, medicine.id).await;

    let cancelled = app
        .state
        .orders
        .cancel_order(order_id, &user(1, Role::Patient))
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);

    // Cancelling twice hits the terminal-state guard.
    assert!(matches!(
        app.state
            .orders
            .cancel_order(order_id, &user(1, Role::Patient))
            .await,
        Err(ServiceError::InvalidTransition {
            from: OrderStatus::Cancelled,
            to: OrderStatus::Cancelled,
        })
    ));
}

#[tokio::test]
async fn strangers_cannot_cancel_someone_elses_order() {
    let app = TestApp::new().await;
    let pharmacy = app.seed_pharmacy(100).await;
    let medicine = app
        .seed_medicine(pharmacy.id, "Paracetamol 500mg", dec!(4.50), 40)
        .await;
    let order_id = place(&app, 1, pharmacy.id, medicine.id).await;

    assert!(matches!(
        app.state
            .orders
            .cancel_order(order_id, &user(2, Role::Patient))
            .await,
        Err(ServiceError::Forbidden(_))
    ));
}

#[tokio::test]
async fn confirmed_orders_walk_the_delivery_path() {
    let app = TestApp::new().await;
    let pharmacy = app.seed_pharmacy(100).await;
    let medicine = app
        .seed_medicine(pharmacy.id, "Paracetamol 500mg", dec!(4.50), 40)
        .await;
    let order_id = place(&app, 1, pharmacy.id, medicine.id).await;
    app.run_worker_until_idle().await;

    let owner = user(100, Role::Pharmacy);
    for status in [
        OrderStatus::Processing,
        OrderStatus::OutForDelivery,
        OrderStatus::Delivered,
    ] {
        let updated = app
            .state
            .orders
            .update_order_status(order_id, status, &owner)
            .await
            .unwrap();
        assert_eq!(updated.status, status);
    }

    // Delivered is terminal.
    assert!(matches!(
        app.state
            .orders
            .update_order_status(order_id, OrderStatus::Processing, &owner)
            .await,
        Err(ServiceError::InvalidTransition { .. })
    ));
    assert!(matches!(
        app.state
            .orders
            .cancel_order(order_id, &user(1, Role::Patient))
            .await,
        Err(ServiceError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn pending_orders_cannot_skip_into_the_delivery_path() {
    let app = TestApp::new().await;
    let pharmacy = app.seed_pharmacy(100).await;
    let medicine = app
        .seed_medicine(pharmacy.id, "Paracetamol 500mg", dec!(4.50), 40)
        .await;
    let order_id = place(&app, 1, pharmacy.id, medicine.id).await;

    // Confirmation belongs to the fulfillment worker; the pharmacy cannot
    // push a still-pending order forward.
    let owner = user(100, Role::Pharmacy);
    assert!(matches!(
        app.state
            .orders
            .update_order_status(order_id, OrderStatus::Processing, &owner)
            .await,
        Err(ServiceError::InvalidTransition {
            from: OrderStatus::Pending,
            to: OrderStatus::Processing,
        })
    ));
}

#[tokio::test]
async fn pharmacies_cannot_touch_other_pharmacies_orders() {
    let app = TestApp::new().await;
    let pharmacy_a = app.seed_pharmacy(100).await;
    let _pharmacy_b = app.seed_pharmacy(200).await;
    let medicine = app
        .seed_medicine(pharmacy_a.id, "Paracetamol 500mg", dec!(4.50), 40)
        .await;
    let order_id = place(&app, 1, pharmacy_a.id, medicine.id).await;
    app.run_worker_until_idle().await;

    let other_owner = user(200, Role::Pharmacy);
    assert!(matches!(
        app.state
            .orders
            .update_order_status(order_id, OrderStatus::Processing, &other_owner)
            .await,
        Err(ServiceError::Forbidden(_))
    ));
}

#[tokio::test]
async fn cancel_racing_a_status_update_never_resurrects_the_order() {
    let app = TestApp::new().await;
    let pharmacy = app.seed_pharmacy(100).await;
    let medicine = app
        .seed_medicine(pharmacy.id, "Paracetamol 500mg", dec!(4.50), 40)
        .await;
    let order_id = place(&app, 1, pharmacy.id, medicine.id).await;
    app.run_worker_until_idle().await;

    let owner = user(100, Role::Pharmacy);
    app.state
        .orders
        .update_order_status(order_id, OrderStatus::Processing, &owner)
        .await
        .unwrap();

    // Fire the cancel and the delivery-path update together. Whatever the
    // interleaving, a committed cancel must never be overwritten.
    let patient = user(1, Role::Patient);
    let (cancel_result, update_result) = tokio::join!(
        app.state.orders.cancel_order(order_id, &patient),
        app.state
            .orders
            .update_order_status(order_id, OrderStatus::OutForDelivery, &owner),
    );

    let final_status = order::Entity::find_by_id(order_id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap()
        .status;

    if cancel_result.is_ok() {
        assert_eq!(final_status, OrderStatus::Cancelled);
    } else {
        assert!(update_result.is_ok());
        assert_eq!(final_status, OrderStatus::OutForDelivery);
    }

    // Once cancelled, the guarded write rejects any further move.
    if final_status == OrderStatus::Cancelled {
        assert!(matches!(
            app.state
                .orders
                .update_order_status(order_id, OrderStatus::Delivered, &owner)
                .await,
            Err(ServiceError::InvalidTransition {
                from: OrderStatus::Cancelled,
                ..
            })
        ));
    }
}

#[tokio::test]
async fn skipping_forward_from_confirmed_is_allowed() {
    let app = TestApp::new().await;
    let pharmacy = app.seed_pharmacy(100).await;
    let medicine = app
        .seed_medicine(pharmacy.id, "Paracetamol 500mg", dec!(4.50), 40)
        .await;
    let order_id = place(&app, 1, pharmacy.id, medicine.id).await;
    app.run_worker_until_idle().await;

    // A pharmacy that hands straight to the courier records delivered
    // without passing through processing.
    let updated = app
        .state
        .orders
        .update_order_status(order_id, OrderStatus::Delivered, &user(100, Role::Pharmacy))
        .await
        .unwrap();
    assert_eq!(updated.status, OrderStatus::Delivered);
}
