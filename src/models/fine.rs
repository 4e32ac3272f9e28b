//! Overdue fine model

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// Monetary penalty tied to one loan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Fine {
    pub id: i64,
    pub loan_id: i64,
    #[schema(value_type = String, example = "1.50")]
    pub amount: Decimal,
    pub currency: String,
    pub reason: String,
    pub days_late: i64,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Fine {
    pub fn is_paid(&self) -> bool {
        self.paid_at.is_some()
    }
}
