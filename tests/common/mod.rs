//! Shared harness: application state over a throwaway SQLite database with
//! in-memory queue, cache and search backends.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use medistock_api::auth::{AuthUser, Claims, Role};
use medistock_api::cache::{CacheBackend, InMemoryCache, StockCache};
use medistock_api::config::AppConfig;
use medistock_api::db::{self, DbPool};
use medistock_api::entities::{medicine, pharmacy};
use medistock_api::events::{self, EventSender};
use medistock_api::message_queue::{InMemoryMessageQueue, MessageQueue};
use medistock_api::search::{InMemorySearchIndex, SearchIndex};
use medistock_api::services::fulfillment::FulfillmentWorker;
use medistock_api::services::orders::OrderService;
use medistock_api::services::reconciliation::ReconciliationSweep;
use medistock_api::services::stock::StockService;
use medistock_api::{app_router, AppState};

pub const TEST_JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";
pub const QUEUE: &str = "orders_queue";

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub db: Arc<DbPool>,
    pub queue: InMemoryMessageQueue,
    pub cache: InMemoryCache,
    pub search: InMemorySearchIndex,
    pub worker: FulfillmentWorker,
    _event_task: tokio::task::JoinHandle<()>,
    _db_dir: TempDir,
}

impl TestApp {
    /// Builds a fresh application with a migrated, empty database.
    pub async fn new() -> Self {
        let db_dir = tempfile::tempdir().expect("tempdir");
        let db_path = db_dir.path().join("medistock_test.db");

        let mut config: AppConfig = serde_json::from_value(json!({
            "database_url": format!("sqlite://{}?mode=rwc", db_path.display()),
            "redis_url": "redis://127.0.0.1:6379",
            "jwt_secret": TEST_JWT_SECRET,
            "environment": "test",
        }))
        .expect("test config");
        config.db_max_connections = 1;
        config.db_min_connections = 1;

        let pool = db::establish_connection_from_app_config(&config)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool).await.expect("migrations");
        let db = Arc::new(pool);

        let queue = InMemoryMessageQueue::new();
        let cache = InMemoryCache::new();
        let search = InMemorySearchIndex::new();

        let queue_dyn: Arc<dyn MessageQueue> = Arc::new(queue.clone());
        let cache_dyn: Arc<dyn CacheBackend> = Arc::new(cache.clone());
        let search_dyn: Arc<dyn SearchIndex> = Arc::new(search.clone());
        let stock_cache = StockCache::new(cache_dyn, Duration::from_secs(3600));

        let (event_sender, event_receiver) = EventSender::channel(256);
        let event_task = tokio::spawn(events::process_events(event_receiver));

        let orders = Arc::new(OrderService::new(
            db.clone(),
            queue_dyn.clone(),
            event_sender.clone(),
            QUEUE.to_string(),
        ));
        let stock = Arc::new(StockService::new(
            db.clone(),
            stock_cache.clone(),
            search_dyn.clone(),
            event_sender.clone(),
        ));

        let worker = FulfillmentWorker::new(
            db.clone(),
            queue_dyn,
            stock_cache,
            search_dyn,
            event_sender.clone(),
            QUEUE.to_string(),
        );

        let state = AppState {
            db: db.clone(),
            config: Arc::new(config),
            event_sender,
            orders,
            stock,
        };

        Self {
            router: app_router(state.clone()),
            state,
            db,
            queue,
            cache,
            search,
            worker,
            _event_task: event_task,
            _db_dir: db_dir,
        }
    }

    /// Reconciliation sweep over this app's database and queue.
    pub fn sweep(&self, threshold: Duration) -> ReconciliationSweep {
        ReconciliationSweep::new(
            self.db.clone(),
            Arc::new(self.queue.clone()),
            QUEUE.to_string(),
            threshold,
            Duration::from_secs(60),
        )
    }

    /// Drains the fulfillment queue through the worker until it is empty.
    pub async fn run_worker_until_idle(&self) {
        loop {
            match self.queue.receive(QUEUE).await.expect("queue receive") {
                Some(delivery) => self.worker.handle_delivery(delivery).await,
                None => return,
            }
        }
    }

    pub async fn seed_pharmacy(&self, owner_id: i32) -> pharmacy::Model {
        pharmacy::ActiveModel {
            name: Set("Central Pharmacy".to_string()),
            address: Set("1 Market Square".to_string()),
            city: Set("Lisbon".to_string()),
            latitude: Set(Some(38.7223)),
            longitude: Set(Some(-9.1393)),
            phone: Set(Some("+351210000000".to_string())),
            is_24_hours: Set(true),
            owner_id: Set(owner_id),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .expect("seed pharmacy")
    }

    pub async fn seed_medicine(
        &self,
        pharmacy_id: i32,
        name: &str,
        unit_price: Decimal,
        stock_quantity: i32,
    ) -> medicine::Model {
        medicine::ActiveModel {
            name: Set(name.to_string()),
            generic_name: Set(None),
            manufacturer: Set(None),
            description: Set(None),
            category: Set(Some("analgesic".to_string())),
            requires_prescription: Set(false),
            unit_price: Set(unit_price),
            stock_quantity: Set(stock_quantity),
            pharmacy_id: Set(pharmacy_id),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .expect("seed medicine")
    }

    pub fn token(&self, user_id: i32, role: Role) -> String {
        let claims = Claims {
            sub: user_id,
            role,
            exp: (Utc::now().timestamp() + 3600) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(TEST_JWT_SECRET.as_bytes()),
        )
        .expect("token")
    }

    /// Sends a JSON request through the router and returns status + body.
    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, body)
    }
}

pub fn user(id: i32, role: Role) -> AuthUser {
    AuthUser { id, role }
}

/// Queue stub whose publish always fails, for exercising the
/// enqueue-failure path at intake.
pub struct FailingQueue;

#[async_trait::async_trait]
impl MessageQueue for FailingQueue {
    async fn publish(
        &self,
        _message: medistock_api::message_queue::Message,
    ) -> Result<(), medistock_api::message_queue::MessageQueueError> {
        Err(medistock_api::message_queue::MessageQueueError::PublishTimeout(
            Duration::from_secs(5),
        ))
    }

    async fn receive(
        &self,
        _queue: &str,
    ) -> Result<Option<medistock_api::message_queue::Delivery>, medistock_api::message_queue::MessageQueueError>
    {
        Ok(None)
    }

    async fn ack(
        &self,
        _delivery: &medistock_api::message_queue::Delivery,
    ) -> Result<(), medistock_api::message_queue::MessageQueueError> {
        Ok(())
    }

    async fn nack(
        &self,
        _delivery: &medistock_api::message_queue::Delivery,
        _requeue: bool,
    ) -> Result<(), medistock_api::message_queue::MessageQueueError> {
        Ok(())
    }
}

/// Cache backend whose every operation fails, for asserting that derived
/// views never gate order fulfillment.
pub struct FailingCache;

#[async_trait::async_trait]
impl CacheBackend for FailingCache {
    async fn get(
        &self,
        _key: &str,
    ) -> Result<Option<String>, medistock_api::cache::CacheError> {
        Err(medistock_api::cache::CacheError::OperationFailed(
            "cache down".to_string(),
        ))
    }

    async fn set(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Option<Duration>,
    ) -> Result<(), medistock_api::cache::CacheError> {
        Err(medistock_api::cache::CacheError::OperationFailed(
            "cache down".to_string(),
        ))
    }

    async fn delete(&self, _key: &str) -> Result<(), medistock_api::cache::CacheError> {
        Err(medistock_api::cache::CacheError::OperationFailed(
            "cache down".to_string(),
        ))
    }

    async fn exists(&self, _key: &str) -> Result<bool, medistock_api::cache::CacheError> {
        Err(medistock_api::cache::CacheError::OperationFailed(
            "cache down".to_string(),
        ))
    }
}
