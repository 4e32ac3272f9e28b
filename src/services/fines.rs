//! Fine calculator
//!
//! A loan is charged `daily_rate` for every started day past its due date.
//! A loan carries at most one unpaid fine; recomputation updates it in place
//! and deducts what was already paid for the same loan. Sweeps of loans
//! still out may waive the first `grace_days` of lateness.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::{
    config::FinesConfig,
    error::{AppError, AppResult},
    models::{next_id, BookLedger, Fine},
};

const DAY_MILLIS: i64 = 86_400_000;

#[derive(Debug, Clone)]
pub struct FineCalculator {
    daily_rate: Decimal,
    currency: String,
    grace_days: i64,
}

impl FineCalculator {
    pub fn new(config: &FinesConfig) -> Self {
        Self {
            daily_rate: config.daily_rate,
            currency: config.currency.clone(),
            grace_days: config.grace_days.max(0),
        }
    }

    /// Started days between `due_at` and `at`; zero when not late
    pub fn days_late(due_at: DateTime<Utc>, at: DateTime<Utc>) -> i64 {
        let late = (at - due_at).num_milliseconds();
        if late <= 0 {
            return 0;
        }
        (late + DAY_MILLIS - 1) / DAY_MILLIS
    }

    /// Fine for a loan that has just been returned
    pub fn compute_on_return(
        &self,
        ledger: &mut BookLedger,
        loan_id: i64,
    ) -> AppResult<Option<Fine>> {
        let returned_at = ledger
            .loan(loan_id)
            .and_then(|l| l.returned_at)
            .ok_or_else(|| AppError::InvalidState(format!("Loan {} is not returned", loan_id)))?;
        self.assess(ledger, loan_id, returned_at, 0, "Returned")
    }

    /// Fine for a loan that is still out past its due date
    pub fn assess_overdue(
        &self,
        ledger: &mut BookLedger,
        loan_id: i64,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Fine>> {
        self.assess(ledger, loan_id, now, self.grace_days, "Overdue")
    }

    fn assess(
        &self,
        ledger: &mut BookLedger,
        loan_id: i64,
        at: DateTime<Utc>,
        grace_days: i64,
        label: &str,
    ) -> AppResult<Option<Fine>> {
        let loan = ledger
            .loan(loan_id)
            .ok_or_else(|| AppError::NotFound(format!("Loan {} not found", loan_id)))?;

        let days_late = Self::days_late(loan.due_at, at);
        let chargeable = days_late - grace_days;
        if chargeable <= 0 {
            return Ok(None);
        }

        let paid: Decimal = ledger
            .fines_for_loan(loan_id)
            .filter(|f| f.is_paid())
            .map(|f| f.amount)
            .sum();
        let amount = (self.daily_rate * Decimal::from(chargeable) - paid).round_dp(2);
        if amount <= Decimal::ZERO {
            return Ok(None);
        }
        let reason = format!("{} {} day(s) late", label, days_late);

        let unpaid = ledger
            .fines
            .iter_mut()
            .find(|f| f.loan_id == loan_id && !f.is_paid());
        let fine = match unpaid {
            Some(fine) => {
                fine.amount = amount;
                fine.currency = self.currency.clone();
                fine.days_late = days_late;
                fine.reason = reason;
                fine.created_at = at;
                fine.clone()
            }
            None => {
                let fine = Fine {
                    id: next_id(),
                    loan_id,
                    amount,
                    currency: self.currency.clone(),
                    reason,
                    days_late,
                    created_at: at,
                    paid_at: None,
                };
                ledger.fines.push(fine.clone());
                fine
            }
        };

        tracing::info!(
            loan_id,
            fine_id = fine.id,
            days_late,
            amount = %fine.amount,
            "Fine assessed"
        );
        Ok(Some(fine))
    }

    /// Settle a fine
    pub fn mark_paid(
        &self,
        ledger: &mut BookLedger,
        fine_id: i64,
        now: DateTime<Utc>,
    ) -> AppResult<Fine> {
        let fine = ledger
            .fine_mut(fine_id)
            .ok_or_else(|| AppError::NotFound(format!("Fine {} not found", fine_id)))?;
        if fine.is_paid() {
            return Err(AppError::InvalidState(format!(
                "Fine {} is already paid",
                fine_id
            )));
        }
        fine.paid_at = Some(now);
        Ok(fine.clone())
    }
}
