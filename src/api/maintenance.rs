//! Maintenance endpoints for an external scheduler

use axum::{extract::State, Json};

use crate::{error::AppResult, models::SweepReport, AppState};

use super::AuthenticatedUser;

/// Expire lapsed reservations and fine overdue loans
#[utoipa::path(
    post,
    path = "/maintenance/sweep",
    tag = "maintenance",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Sweep finished", body = SweepReport),
        (status = 403, description = "Librarian rights required", body = crate::error::ErrorResponse)
    )
)]
pub async fn sweep(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
) -> AppResult<Json<SweepReport>> {
    claims.require_librarian()?;

    let report = state.services.lending.sweep().await?;
    Ok(Json(report))
}
