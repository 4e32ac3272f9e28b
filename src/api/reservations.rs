//! Reservation endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use validator::Validate;

use crate::{
    error::AppResult,
    models::{CreateReservation, Reservation},
    AppState,
};

use super::AuthenticatedUser;

/// Join the waiting queue for a book
#[utoipa::path(
    post,
    path = "/reservations",
    tag = "reservations",
    security(("bearer_auth" = [])),
    request_body = CreateReservation,
    responses(
        (status = 201, description = "Reservation created", body = Reservation),
        (status = 400, description = "Invalid expiry", body = crate::error::ErrorResponse),
        (status = 404, description = "Book not found", body = crate::error::ErrorResponse),
        (status = 409, description = "Already reserved, copies available or reservation limit reached", body = crate::error::ErrorResponse)
    )
)]
pub async fn create_reservation(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(request): Json<CreateReservation>,
) -> AppResult<(StatusCode, Json<Reservation>)> {
    request.validate()?;
    claims.require_self_or_librarian(request.user_id)?;

    let reservation = state.services.lending.enroll_reservation(request).await?;
    Ok((StatusCode::CREATED, Json(reservation)))
}

/// Cancel a reservation
#[utoipa::path(
    delete,
    path = "/reservations/{id}",
    tag = "reservations",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Reservation ID")),
    responses(
        (status = 204, description = "Reservation cancelled"),
        (status = 403, description = "Another user's reservation", body = crate::error::ErrorResponse),
        (status = 404, description = "Reservation not found", body = crate::error::ErrorResponse),
        (status = 422, description = "Reservation no longer active", body = crate::error::ErrorResponse)
    )
)]
pub async fn cancel_reservation(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(reservation_id): Path<i64>,
) -> AppResult<StatusCode> {
    let reservation = state.services.lending.get_reservation(reservation_id).await?;
    claims.require_self_or_librarian(reservation.user_id)?;

    state
        .services
        .lending
        .cancel_reservation(reservation_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Reservations of a user, in request order
#[utoipa::path(
    get,
    path = "/users/{id}/reservations",
    tag = "reservations",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "User ID")),
    responses(
        (status = 200, description = "User's reservations", body = Vec<Reservation>)
    )
)]
pub async fn get_user_reservations(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(user_id): Path<i64>,
) -> AppResult<Json<Vec<Reservation>>> {
    claims.require_self_or_librarian(user_id)?;

    let reservations = state.services.lending.user_reservations(user_id).await?;
    Ok(Json(reservations))
}
