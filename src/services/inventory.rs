//! Inventory ledger: copy claims, releases and the book counters

use chrono::{DateTime, Utc};

use crate::{
    error::{AppError, AppResult},
    models::{next_id, AdmitCopy, BookCopy, BookLedger, CopyStatus},
};

impl BookLedger {
    /// Borrow the AVAILABLE copy with the lowest inventory code.
    /// `None` is the normal outcome when every copy is taken.
    pub fn claim_copy(&mut self, now: DateTime<Utc>) -> AppResult<Option<i64>> {
        let copy_id = self
            .copies
            .iter()
            .filter(|c| c.status == CopyStatus::Available)
            .min_by(|a, b| a.inventory_code.cmp(&b.inventory_code))
            .map(|c| c.id);

        match copy_id {
            Some(copy_id) => {
                self.claim_specific(copy_id, now)?;
                Ok(Some(copy_id))
            }
            None => Ok(None),
        }
    }

    /// Mark a given copy BORROWED
    pub fn claim_specific(&mut self, copy_id: i64, now: DateTime<Utc>) -> AppResult<()> {
        self.copy_mut(copy_id)
            .ok_or_else(|| AppError::NotFound(format!("Copy {} not found", copy_id)))?
            .transition(CopyStatus::Borrowed, now)
    }

    /// Put a copy back into circulation. The queue gets the first say: the
    /// copy is held for the next waiting reader, otherwise it becomes AVAILABLE.
    /// Returns the reservation that received the copy.
    pub fn release(
        &mut self,
        copy_id: i64,
        now: DateTime<Utc>,
        hold_days: i64,
    ) -> AppResult<Option<i64>> {
        let copy = self
            .copy_mut(copy_id)
            .ok_or_else(|| AppError::NotFound(format!("Copy {} not found", copy_id)))?;
        // A lapsed hold goes back on the shelf before it is offered again
        if copy.status == CopyStatus::Reserved {
            copy.transition(CopyStatus::Available, now)?;
        }

        if let Some(reservation_id) = self.offer(copy_id, now, hold_days)? {
            return Ok(Some(reservation_id));
        }

        if let Some(copy) = self.copy_mut(copy_id) {
            if copy.status != CopyStatus::Available {
                copy.transition(CopyStatus::Available, now)?;
            }
        }
        Ok(None)
    }

    /// Recompute the denormalized counters on the book row
    pub fn recalculate_counters(&mut self) {
        self.book.total_copies = self
            .copies
            .iter()
            .filter(|c| c.status.in_circulation())
            .count() as i32;
        self.book.available_copies = self
            .copies
            .iter()
            .filter(|c| c.status == CopyStatus::Available)
            .count() as i32;
    }

    /// Add a new physical copy and hand it to the queue
    pub fn admit_copy(
        &mut self,
        request: &AdmitCopy,
        now: DateTime<Utc>,
        hold_days: i64,
    ) -> AppResult<i64> {
        if self
            .copies
            .iter()
            .any(|c| c.inventory_code == request.inventory_code)
        {
            return Err(AppError::Conflict(format!(
                "Inventory code {} already exists",
                request.inventory_code
            )));
        }

        let copy = BookCopy {
            id: next_id(),
            book_id: self.book.id,
            inventory_code: request.inventory_code.clone(),
            status: CopyStatus::Available,
            access_type: request.access_type.unwrap_or_default(),
            location: request.location.clone(),
            condition: request.condition.clone(),
            updated_at: now,
        };
        let copy_id = copy.id;
        self.copies.push(copy);
        self.release(copy_id, now, hold_days)?;
        Ok(copy_id)
    }

    /// Send a copy to maintenance, withdraw it, or bring it back
    pub fn set_copy_status(
        &mut self,
        copy_id: i64,
        status: CopyStatus,
        condition: Option<String>,
        now: DateTime<Utc>,
        hold_days: i64,
    ) -> AppResult<()> {
        let copy = self
            .copy_mut(copy_id)
            .ok_or_else(|| AppError::NotFound(format!("Copy {} not found", copy_id)))?;

        match status {
            CopyStatus::Maintenance | CopyStatus::Withdrawn => {
                if matches!(copy.status, CopyStatus::Borrowed | CopyStatus::Reserved) {
                    return Err(AppError::InvalidState(format!(
                        "Copy {} is {} and cannot leave circulation",
                        copy.inventory_code, copy.status
                    )));
                }
                copy.transition(status, now)?;
                if condition.is_some() {
                    copy.condition = condition;
                }
            }
            CopyStatus::Available => {
                if !matches!(copy.status, CopyStatus::Maintenance | CopyStatus::Withdrawn) {
                    return Err(AppError::InvalidState(format!(
                        "Copy {} is {} and already in circulation",
                        copy.inventory_code, copy.status
                    )));
                }
                if condition.is_some() {
                    copy.condition = condition;
                }
                self.release(copy_id, now, hold_days)?;
            }
            CopyStatus::Reserved | CopyStatus::Borrowed => {
                return Err(AppError::Validation(
                    "Copy status can only be set to MAINTENANCE, WITHDRAWN or AVAILABLE"
                        .to_string(),
                ))
            }
        }
        Ok(())
    }
}
