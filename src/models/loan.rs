//! Loan (borrow) model and related types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use validator::Validate;

use super::fine::Fine;

/// Derived loan state: a loan is open until `returned_at` is set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoanState {
    Open,
    Overdue,
    Returned,
}

/// Loan model from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Loan {
    pub id: i64,
    pub user_id: i64,
    pub book_id: i64,
    pub copy_id: i64,
    pub borrowed_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub extensions_count: i32,
    pub last_extended_at: Option<DateTime<Utc>>,
}

impl Loan {
    pub fn is_open(&self) -> bool {
        self.returned_at.is_none()
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> LoanState {
        match self.returned_at {
            Some(_) => LoanState::Returned,
            None if now > self.due_at => LoanState::Overdue,
            None => LoanState::Open,
        }
    }
}

/// Loan with its derived state, as returned to API clients
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LoanDetails {
    #[serde(flatten)]
    pub loan: Loan,
    pub state: LoanState,
}

impl LoanDetails {
    pub fn new(loan: Loan, now: DateTime<Utc>) -> Self {
        let state = loan.state_at(now);
        Self { loan, state }
    }
}

/// Outcome of a return: the closed loan and the fine it incurred, if late
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LoanReturn {
    pub loan: LoanDetails,
    pub fine: Option<Fine>,
}

/// Borrow request
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateLoan {
    pub user_id: i64,
    pub book_id: i64,
    /// Loan duration in days; the configured default applies when omitted
    #[validate(range(min = 1, max = 365, message = "Duration must be a positive number of days"))]
    pub duration_days: Option<i64>,
}
