//! OpenAPI documentation

use axum::Router;
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::api::{books, fines, health, loans, maintenance, reservations};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Lending API",
        version = "1.0.0",
        description = "Library lending, reservation and fines REST API",
        license(name = "AGPL-3.0", url = "https://www.gnu.org/licenses/agpl-3.0.html")
    ),
    servers(
        (url = "/api/v1", description = "API v1")
    ),
    paths(
        // Health
        health::health_check,
        health::readiness_check,
        // Loans
        loans::borrow,
        loans::get_loan,
        loans::return_loan,
        loans::renew_loan,
        loans::remove_loan,
        loans::get_user_loans,
        // Reservations
        reservations::create_reservation,
        reservations::cancel_reservation,
        reservations::get_user_reservations,
        // Fines
        fines::pay_fine,
        fines::get_user_fines,
        // Inventory
        books::get_inventory,
        books::admit_copy,
        books::update_copy_status,
        // Maintenance
        maintenance::sweep,
    ),
    components(
        schemas(
            // Inventory
            crate::models::Book,
            crate::models::BookCopy,
            crate::models::CopyStatus,
            crate::models::AccessType,
            crate::models::AdmitCopy,
            crate::models::UpdateCopyStatus,
            crate::models::BookInventory,
            // Loans
            crate::models::Loan,
            crate::models::LoanState,
            crate::models::LoanDetails,
            crate::models::LoanReturn,
            crate::models::CreateLoan,
            // Reservations
            crate::models::Reservation,
            crate::models::ReservationStatus,
            crate::models::QueueEntry,
            crate::models::CreateReservation,
            // Fines
            crate::models::Fine,
            // Maintenance
            crate::models::SweepReport,
            // Health
            health::HealthResponse,
            // Errors
            crate::error::ErrorResponse,
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "loans", description = "Borrowing, returns and renewals"),
        (name = "reservations", description = "Waiting queues"),
        (name = "fines", description = "Overdue fines"),
        (name = "inventory", description = "Copies and their circulation status"),
        (name = "maintenance", description = "Expiry and overdue sweeps")
    )
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// Create the OpenAPI documentation router
pub fn create_openapi_router() -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}
