//! Book inventory and copy management endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use validator::Validate;

use crate::{
    error::AppResult,
    models::{AdmitCopy, BookCopy, BookInventory, UpdateCopyStatus},
    AppState,
};

use super::AuthenticatedUser;

/// Copies and waiting queue of a book
#[utoipa::path(
    get,
    path = "/books/{id}/inventory",
    tag = "inventory",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Book ID")),
    responses(
        (status = 200, description = "Book inventory", body = BookInventory),
        (status = 404, description = "Book not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn get_inventory(
    State(state): State<AppState>,
    AuthenticatedUser(_claims): AuthenticatedUser,
    Path(book_id): Path<i64>,
) -> AppResult<Json<BookInventory>> {
    let inventory = state.services.lending.book_inventory(book_id).await?;
    Ok(Json(inventory))
}

/// Add a physical copy to a book
#[utoipa::path(
    post,
    path = "/books/{id}/copies",
    tag = "inventory",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Book ID")),
    request_body = AdmitCopy,
    responses(
        (status = 201, description = "Copy admitted", body = BookCopy),
        (status = 403, description = "Librarian rights required", body = crate::error::ErrorResponse),
        (status = 404, description = "Book not found", body = crate::error::ErrorResponse),
        (status = 409, description = "Inventory code already exists", body = crate::error::ErrorResponse)
    )
)]
pub async fn admit_copy(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(book_id): Path<i64>,
    Json(request): Json<AdmitCopy>,
) -> AppResult<(StatusCode, Json<BookCopy>)> {
    claims.require_librarian()?;
    request.validate()?;

    let copy = state.services.lending.admit_copy(book_id, request).await?;
    Ok((StatusCode::CREATED, Json(copy)))
}

/// Send a copy to maintenance, withdraw it or put it back into circulation
#[utoipa::path(
    put,
    path = "/copies/{id}/status",
    tag = "inventory",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Copy ID")),
    request_body = UpdateCopyStatus,
    responses(
        (status = 200, description = "Copy updated", body = BookCopy),
        (status = 403, description = "Librarian rights required", body = crate::error::ErrorResponse),
        (status = 404, description = "Copy not found", body = crate::error::ErrorResponse),
        (status = 422, description = "Copy is on loan or held for a reader", body = crate::error::ErrorResponse)
    )
)]
pub async fn update_copy_status(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(copy_id): Path<i64>,
    Json(request): Json<UpdateCopyStatus>,
) -> AppResult<Json<BookCopy>> {
    claims.require_librarian()?;

    let copy = state
        .services
        .lending
        .update_copy_status(copy_id, request)
        .await?;
    Ok(Json(copy))
}
