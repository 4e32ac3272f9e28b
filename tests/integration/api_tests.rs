//! API integration tests
//!
//! Drive the full router in-process against the in-memory store.

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

use lending_server::{
    api,
    config::AppConfig,
    models::{Role, UserClaims},
    repository::memory::MemoryStore,
    services::{clock::Clock, Services},
    AppState,
};

const LIBRARIAN: i64 = 1000;

struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    fn advance(&self, by: Duration) {
        let mut now = self.0.lock().unwrap();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

struct TestApp {
    router: Router,
    clock: Arc<ManualClock>,
    secret: String,
}

impl TestApp {
    async fn new() -> Self {
        let store = MemoryStore::new();
        store.seed_book(1, "Solaris", 1).await;
        store.seed_book(2, "The Cyberiad", 3).await;

        let config = AppConfig::default();
        let clock = Arc::new(ManualClock(Mutex::new(Utc::now())));
        let services = Services::with_clock(Arc::new(store), &config, clock.clone());
        let secret = config.auth.jwt_secret.clone();
        let state = AppState {
            config: Arc::new(config),
            services: Arc::new(services),
        };

        Self {
            router: api::create_router(state),
            clock,
            secret,
        }
    }

    fn token(&self, user_id: i64) -> String {
        let role = if user_id == LIBRARIAN {
            Role::Librarian
        } else {
            Role::Reader
        };
        UserClaims {
            sub: user_id,
            role,
            exp: Utc::now().timestamp() + 3600,
        }
        .create_token(&self.secret)
        .unwrap()
    }

    async fn send(&self, method: Method, uri: &str, user: Option<i64>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user_id) = user {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", self.token(user_id)));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn borrow(&self, user_id: i64, book_id: i64) -> (StatusCode, Value) {
        self.send(
            Method::POST,
            "/api/v1/loans",
            Some(user_id),
            Some(json!({ "user_id": user_id, "book_id": book_id })),
        )
        .await
    }
}

#[tokio::test]
async fn test_health_check() {
    let app = TestApp::new().await;

    let (status, body) = app.send(Method::GET, "/api/v1/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = app.send(Method::GET, "/api/v1/ready", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn test_missing_token_is_rejected() {
    let app = TestApp::new().await;

    let (status, body) = app
        .send(
            Method::POST,
            "/api/v1/loans",
            None,
            Some(json!({ "user_id": 1, "book_id": 1 })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 2);
}

#[tokio::test]
async fn test_returned_copy_goes_to_waiting_reader() {
    let app = TestApp::new().await;

    let (status, loan) = app.borrow(1, 1).await;
    assert_eq!(status, StatusCode::CREATED);
    let loan_id = loan["id"].as_i64().unwrap();

    let (status, reservation) = app
        .send(
            Method::POST,
            "/api/v1/reservations",
            Some(2),
            Some(json!({ "user_id": 2, "book_id": 1, "ttl_days": 7 })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(reservation["status"], "ACTIVE");

    let (status, returned) = app
        .send(Method::POST, &format!("/api/v1/loans/{}/return", loan_id), Some(1), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(returned["loan"]["state"], "RETURNED");
    assert!(returned["fine"].is_null());

    let (status, inventory) = app
        .send(Method::GET, "/api/v1/books/1/inventory", Some(3), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(inventory["book"]["available_copies"], 0);
    assert_eq!(inventory["copies"][0]["status"], "RESERVED");
    assert_eq!(inventory["queue"][0]["position"], 1);

    let (status, body) = app.borrow(3, 1).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], 5);

    let (status, _) = app.borrow(2, 1).await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, reservations) = app
        .send(Method::GET, "/api/v1/users/2/reservations", Some(2), None)
        .await;
    assert_eq!(reservations[0]["status"], "FULFILLED");
}

#[tokio::test]
async fn test_reader_cannot_act_for_someone_else() {
    let app = TestApp::new().await;

    let (status, _) = app
        .send(
            Method::POST,
            "/api/v1/loans",
            Some(1),
            Some(json!({ "user_id": 2, "book_id": 2 })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .send(Method::GET, "/api/v1/users/2/loans", Some(1), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Librarians lend on behalf of readers
    let (status, loan) = app
        .send(
            Method::POST,
            "/api/v1/loans",
            Some(LIBRARIAN),
            Some(json!({ "user_id": 2, "book_id": 2 })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(loan["user_id"], 2);
}

#[tokio::test]
async fn test_late_return_fine_is_paid_once() {
    let app = TestApp::new().await;

    let (_, loan) = app.borrow(1, 2).await;
    let loan_id = loan["id"].as_i64().unwrap();
    app.clock.advance(Duration::days(14 + 3));

    let (status, returned) = app
        .send(Method::POST, &format!("/api/v1/loans/{}/return", loan_id), Some(1), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(returned["fine"]["days_late"], 3);
    assert_eq!(returned["fine"]["amount"], "1.50");
    let fine_id = returned["fine"]["id"].as_i64().unwrap();

    let (status, _) = app
        .send(Method::POST, &format!("/api/v1/loans/{}/return", loan_id), Some(1), None)
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = app
        .send(Method::POST, &format!("/api/v1/fines/{}/pay", fine_id), Some(2), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, fine) = app
        .send(Method::POST, &format!("/api/v1/fines/{}/pay", fine_id), Some(1), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(fine["paid_at"].is_string());

    let (status, body) = app
        .send(Method::POST, &format!("/api/v1/fines/{}/pay", fine_id), Some(1), None)
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], 6);
}

#[tokio::test]
async fn test_sweep_fines_overdue_loans() {
    let app = TestApp::new().await;

    let (_, _) = app.borrow(1, 2).await;
    app.clock.advance(Duration::days(16));

    let (status, _) = app
        .send(Method::POST, "/api/v1/maintenance/sweep", Some(1), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, report) = app
        .send(Method::POST, "/api/v1/maintenance/sweep", Some(LIBRARIAN), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["fines_assessed"], 1);

    let (_, fines) = app
        .send(Method::GET, "/api/v1/users/1/fines", Some(1), None)
        .await;
    assert_eq!(fines[0]["days_late"], 2);
    assert!(fines[0]["paid_at"].is_null());
}

#[tokio::test]
async fn test_copy_management() {
    let app = TestApp::new().await;

    let request = json!({ "inventory_code": "SOL-2", "access_type": "STORAGE" });
    let (status, _) = app
        .send(Method::POST, "/api/v1/books/1/copies", Some(1), Some(request.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, copy) = app
        .send(Method::POST, "/api/v1/books/1/copies", Some(LIBRARIAN), Some(request.clone()))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(copy["status"], "AVAILABLE");
    let copy_id = copy["id"].as_i64().unwrap();

    let (status, _) = app
        .send(Method::POST, "/api/v1/books/1/copies", Some(LIBRARIAN), Some(request))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = app
        .send(
            Method::POST,
            "/api/v1/books/1/copies",
            Some(LIBRARIAN),
            Some(json!({ "inventory_code": "" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, copy) = app
        .send(
            Method::PUT,
            &format!("/api/v1/copies/{}/status", copy_id),
            Some(LIBRARIAN),
            Some(json!({ "status": "MAINTENANCE", "condition": "torn spine" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(copy["status"], "MAINTENANCE");

    let (_, inventory) = app
        .send(Method::GET, "/api/v1/books/1/inventory", Some(1), None)
        .await;
    assert_eq!(inventory["book"]["total_copies"], 2);
    assert_eq!(inventory["book"]["available_copies"], 1);
}

#[tokio::test]
async fn test_unknown_book_is_not_found() {
    let app = TestApp::new().await;

    let (status, body) = app.borrow(1, 999).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 4);
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let app = TestApp::new().await;

    let (status, doc) = app
        .send(Method::GET, "/api-docs/openapi.json", None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(doc["paths"]["/loans/{id}/return"].is_object());
}
