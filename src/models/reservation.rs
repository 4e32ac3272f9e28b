//! Reservation (place in a book's waiting queue) model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use utoipa::ToSchema;
use validator::Validate;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Active,
    Cancelled,
    Fulfilled,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "ACTIVE",
            ReservationStatus::Cancelled => "CANCELLED",
            ReservationStatus::Fulfilled => "FULFILLED",
            ReservationStatus::Expired => "EXPIRED",
        }
    }
}

impl FromStr for ReservationStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(ReservationStatus::Active),
            "CANCELLED" => Ok(ReservationStatus::Cancelled),
            "FULFILLED" => Ok(ReservationStatus::Fulfilled),
            "EXPIRED" => Ok(ReservationStatus::Expired),
            other => Err(AppError::Internal(format!("Unknown reservation status: {}", other))),
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

text_enum_sqlx!(ReservationStatus);

/// A reader's place in line for a book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Reservation {
    pub id: i64,
    pub user_id: i64,
    pub book_id: i64,
    pub status: ReservationStatus,
    pub reserved_at: DateTime<Utc>,
    /// End of the reservation's validity, or of the claim window once a copy is assigned
    pub expires_at: DateTime<Utc>,
    pub assigned_copy_id: Option<i64>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }

    /// The reservation as lazy expiry will leave it once its book is next touched
    pub fn as_of(mut self, now: DateTime<Utc>) -> Self {
        if self.is_active() && self.expires_at <= now {
            self.status = ReservationStatus::Expired;
            self.closed_at = Some(self.expires_at);
            self.assigned_copy_id = None;
        }
        self
    }

    /// Queue ordering key: request time, then id for identical timestamps
    pub fn queue_key(&self) -> (DateTime<Utc>, i64) {
        (self.reserved_at, self.id)
    }

    /// Leave the ACTIVE state. Terminal states never change again.
    pub fn close(&mut self, status: ReservationStatus, now: DateTime<Utc>) -> AppResult<()> {
        if !self.is_active() {
            return Err(AppError::InvalidState(format!(
                "Reservation {} is already {}",
                self.id, self.status
            )));
        }
        if status == ReservationStatus::Active {
            return Err(AppError::InvalidState(
                "Reservation cannot be re-activated".to_string(),
            ));
        }
        self.status = status;
        self.closed_at = Some(now);
        Ok(())
    }
}

/// A reservation together with its position in the queue
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct QueueEntry {
    /// 1-based position among the book's ACTIVE reservations
    pub position: usize,
    pub reservation: Reservation,
}

/// Reservation request
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateReservation {
    pub user_id: i64,
    pub book_id: i64,
    /// How long the reservation stays valid while waiting (1 to 14 days)
    #[validate(range(min = 1, max = 14, message = "Reservation expiry must be between 1 and 14 days"))]
    pub ttl_days: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_is_one_way() {
        let now = Utc::now();
        let mut reservation = Reservation {
            id: 7,
            user_id: 1,
            book_id: 2,
            status: ReservationStatus::Active,
            reserved_at: now,
            expires_at: now,
            assigned_copy_id: None,
            closed_at: None,
        };
        reservation.close(ReservationStatus::Cancelled, now).unwrap();
        assert_eq!(reservation.closed_at, Some(now));
        assert!(matches!(
            reservation.close(ReservationStatus::Expired, now),
            Err(AppError::InvalidState(_))
        ));
        assert_eq!(reservation.status, ReservationStatus::Cancelled);
    }

    #[test]
    fn test_lapsed_reservation_reads_as_expired() {
        let now = Utc::now();
        let reservation = Reservation {
            id: 8,
            user_id: 1,
            book_id: 2,
            status: ReservationStatus::Active,
            reserved_at: now - chrono::Duration::days(3),
            expires_at: now - chrono::Duration::hours(1),
            assigned_copy_id: Some(5),
            closed_at: None,
        };

        let still_waiting = reservation.clone().as_of(now - chrono::Duration::days(1));
        assert_eq!(still_waiting, reservation);

        let lapsed = reservation.clone().as_of(now);
        assert_eq!(lapsed.status, ReservationStatus::Expired);
        assert_eq!(lapsed.closed_at, Some(reservation.expires_at));
        assert_eq!(lapsed.assigned_copy_id, None);
    }
}
