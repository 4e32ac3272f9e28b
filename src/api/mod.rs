//! API handlers for the lending REST endpoints

pub mod books;
pub mod fines;
pub mod health;
pub mod loans;
pub mod maintenance;
pub mod openapi;
pub mod reservations;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{error::AppError, models::UserClaims, AppState};

/// Extractor for authenticated user from JWT token
pub struct AuthenticatedUser(pub UserClaims);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| AppError::Authentication("Missing authorization header".to_string()))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AppError::Authentication("Invalid authorization header format".to_string()))?;

        let claims = UserClaims::from_token(token, &state.config.auth.jwt_secret)
            .map_err(|e| AppError::Authentication(e.to_string()))?;

        Ok(AuthenticatedUser(claims))
    }
}

/// Create the application router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_v1 = Router::new()
        // Health check
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        // Loans
        .route("/loans", post(loans::borrow))
        .route("/loans/:id", get(loans::get_loan))
        .route("/loans/:id", delete(loans::remove_loan))
        .route("/loans/:id/return", post(loans::return_loan))
        .route("/loans/:id/renew", post(loans::renew_loan))
        // Reservations
        .route("/reservations", post(reservations::create_reservation))
        .route("/reservations/:id", delete(reservations::cancel_reservation))
        // Fines
        .route("/fines/:id/pay", post(fines::pay_fine))
        // Per-user views
        .route("/users/:id/loans", get(loans::get_user_loans))
        .route("/users/:id/reservations", get(reservations::get_user_reservations))
        .route("/users/:id/fines", get(fines::get_user_fines))
        // Inventory
        .route("/books/:id/inventory", get(books::get_inventory))
        .route("/books/:id/copies", post(books::admit_copy))
        .route("/copies/:id/status", put(books::update_copy_status))
        // Maintenance
        .route("/maintenance/sweep", post(maintenance::sweep))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_v1)
        .merge(openapi::create_openapi_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
