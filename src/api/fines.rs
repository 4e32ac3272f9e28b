//! Fine endpoints

use axum::{
    extract::{Path, State},
    Json,
};

use crate::{error::AppResult, models::Fine, AppState};

use super::AuthenticatedUser;

/// Pay a fine
#[utoipa::path(
    post,
    path = "/fines/{id}/pay",
    tag = "fines",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "Fine ID")),
    responses(
        (status = 200, description = "Fine paid", body = Fine),
        (status = 404, description = "Fine not found", body = crate::error::ErrorResponse),
        (status = 422, description = "Fine already paid", body = crate::error::ErrorResponse)
    )
)]
pub async fn pay_fine(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(fine_id): Path<i64>,
) -> AppResult<Json<Fine>> {
    let (_, owner) = state.services.lending.get_fine(fine_id).await?;
    claims.require_self_or_librarian(owner)?;

    let fine = state.services.lending.pay_fine(fine_id).await?;
    Ok(Json(fine))
}

/// Fines of a user, paid and unpaid
#[utoipa::path(
    get,
    path = "/users/{id}/fines",
    tag = "fines",
    security(("bearer_auth" = [])),
    params(("id" = i64, Path, description = "User ID")),
    responses(
        (status = 200, description = "User's fines", body = Vec<Fine>)
    )
)]
pub async fn get_user_fines(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(user_id): Path<i64>,
) -> AppResult<Json<Vec<Fine>>> {
    claims.require_self_or_librarian(user_id)?;

    let fines = state.services.lending.user_fines(user_id).await?;
    Ok(Json(fines))
}
