//! Reservation queue
//!
//! Waiting readers are served first come, first served: by `reserved_at`,
//! then by id for identical timestamps. A freed copy goes to the earliest
//! ACTIVE reservation that does not hold a copy yet, which then has
//! `hold_days` to claim it.

use chrono::{DateTime, Duration, Utc};

use crate::{
    error::{AppError, AppResult},
    models::{
        next_id, BookLedger, CopyStatus, Notification, QueueEntry, Reservation, ReservationStatus,
    },
};

impl BookLedger {
    /// ACTIVE reservations in service order with their 1-based position
    pub fn queue(&self) -> Vec<QueueEntry> {
        let mut active: Vec<&Reservation> =
            self.reservations.iter().filter(|r| r.is_active()).collect();
        active.sort_by_key(|r| r.queue_key());
        active
            .into_iter()
            .enumerate()
            .map(|(i, reservation)| QueueEntry {
                position: i + 1,
                reservation: reservation.clone(),
            })
            .collect()
    }

    /// Head of the queue
    pub fn peek_first(&self) -> Option<&Reservation> {
        self.reservations
            .iter()
            .filter(|r| r.is_active())
            .min_by_key(|r| r.queue_key())
    }

    /// The user's ACTIVE reservation for this book
    pub fn active_reservation_of(&self, user_id: i64) -> Option<&Reservation> {
        self.reservations
            .iter()
            .find(|r| r.is_active() && r.user_id == user_id)
    }

    /// Earliest waiting reservation without an assigned copy
    pub fn next_unassigned(&self) -> Option<i64> {
        self.reservations
            .iter()
            .filter(|r| r.is_active() && r.assigned_copy_id.is_none())
            .min_by_key(|r| r.queue_key())
            .map(|r| r.id)
    }

    /// Append a reservation at the end of the queue
    pub fn enroll(&mut self, user_id: i64, ttl_days: i64, now: DateTime<Utc>) -> AppResult<i64> {
        if self.active_reservation_of(user_id).is_some() {
            return Err(AppError::Conflict(format!(
                "User {} already has an active reservation for book {}",
                user_id, self.book.id
            )));
        }
        if self.copies.iter().any(|c| c.status == CopyStatus::Available) {
            return Err(AppError::Conflict(format!(
                "Book {} has available copies and can be borrowed now",
                self.book.id
            )));
        }

        let reservation = Reservation {
            id: next_id(),
            user_id,
            book_id: self.book.id,
            status: ReservationStatus::Active,
            reserved_at: now,
            expires_at: now + Duration::days(ttl_days),
            assigned_copy_id: None,
            closed_at: None,
        };
        let reservation_id = reservation.id;
        self.reservations.push(reservation);

        let position = self
            .queue()
            .iter()
            .position(|entry| entry.reservation.id == reservation_id)
            .map_or(0, |i| i + 1);
        self.outbox.push(Notification::ReservationQueued {
            reservation_id,
            user_id,
            book_id: self.book.id,
            position,
        });
        Ok(reservation_id)
    }

    /// Hold a copy for a reservation for `hold_days`
    pub fn assign(
        &mut self,
        reservation_id: i64,
        copy_id: i64,
        now: DateTime<Utc>,
        hold_days: i64,
    ) -> AppResult<()> {
        self.copy_mut(copy_id)
            .ok_or_else(|| AppError::NotFound(format!("Copy {} not found", copy_id)))?
            .transition(CopyStatus::Reserved, now)?;

        let book_id = self.book.id;
        let reservation = self.reservation_mut(reservation_id).ok_or_else(|| {
            AppError::NotFound(format!("Reservation {} not found", reservation_id))
        })?;
        reservation.assigned_copy_id = Some(copy_id);
        reservation.expires_at = now + Duration::days(hold_days);

        tracing::debug!(reservation_id, copy_id, "Copy assigned to waiting reader");
        let notification = Notification::CopyReady {
            reservation_id,
            user_id: reservation.user_id,
            book_id,
            copy_id,
            expires_at: reservation.expires_at,
        };
        self.outbox.push(notification);
        Ok(())
    }

    /// Give a free copy to the next waiting reader, if any
    pub fn offer(
        &mut self,
        copy_id: i64,
        now: DateTime<Utc>,
        hold_days: i64,
    ) -> AppResult<Option<i64>> {
        match self.next_unassigned() {
            Some(reservation_id) => {
                self.assign(reservation_id, copy_id, now, hold_days)?;
                Ok(Some(reservation_id))
            }
            None => Ok(None),
        }
    }

    /// Close a reservation as FULFILLED once its reader borrowed the book
    pub fn fulfil(&mut self, reservation_id: i64, now: DateTime<Utc>) -> AppResult<()> {
        self.reservation_mut(reservation_id)
            .ok_or_else(|| AppError::NotFound(format!("Reservation {} not found", reservation_id)))?
            .close(ReservationStatus::Fulfilled, now)
    }

    /// Cancel an ACTIVE reservation; a held copy goes to the next reader
    pub fn cancel(
        &mut self,
        reservation_id: i64,
        now: DateTime<Utc>,
        hold_days: i64,
    ) -> AppResult<()> {
        let reservation = self.reservation_mut(reservation_id).ok_or_else(|| {
            AppError::InvalidState(format!("Reservation {} is no longer active", reservation_id))
        })?;
        reservation.close(ReservationStatus::Cancelled, now)?;
        let held = reservation.assigned_copy_id.take();

        if let Some(copy_id) = held {
            self.release(copy_id, now, hold_days)?;
        }
        Ok(())
    }

    /// Expire every ACTIVE reservation whose deadline has passed and put the
    /// copies they held back through the queue. Returns how many expired.
    pub fn expire_stale(&mut self, now: DateTime<Utc>, hold_days: i64) -> AppResult<usize> {
        let mut stale: Vec<&mut Reservation> = self
            .reservations
            .iter_mut()
            .filter(|r| r.is_active() && r.expires_at <= now)
            .collect();
        stale.sort_by_key(|r| r.queue_key());

        let expired = stale.len();
        let mut freed = Vec::new();
        for reservation in stale {
            reservation.close(ReservationStatus::Expired, now)?;
            tracing::info!(
                reservation_id = reservation.id,
                user_id = reservation.user_id,
                "Reservation expired"
            );
            if let Some(copy_id) = reservation.assigned_copy_id.take() {
                freed.push(copy_id);
            }
        }

        for copy_id in freed {
            self.release(copy_id, now, hold_days)?;
        }
        Ok(expired)
    }
}
