//! Per-book lending aggregate
//!
//! A [`BookLedger`] is everything a lending operation may touch for one book:
//! the book row, its copies, the ACTIVE reservations, the open loans (plus an
//! optional focus loan) and the fines of those loans. The store loads it under
//! a per-book lock, services mutate it in memory and the store writes it back
//! in one transaction.

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use super::{
    book::{Book, BookCopy},
    fine::Fine,
    loan::Loan,
    reservation::{QueueEntry, Reservation},
};

/// Events handed to the notifier once the unit of work has committed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    ReservationQueued {
        reservation_id: i64,
        user_id: i64,
        book_id: i64,
        position: usize,
    },
    CopyReady {
        reservation_id: i64,
        user_id: i64,
        book_id: i64,
        copy_id: i64,
        expires_at: DateTime<Utc>,
    },
}

/// Which rows a session loads besides the book's live state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerScope {
    pub book_id: i64,
    /// A loan to load even if it is already returned (removal, fine payment)
    pub focus_loan: Option<i64>,
}

impl LedgerScope {
    pub fn book(book_id: i64) -> Self {
        Self {
            book_id,
            focus_loan: None,
        }
    }

    pub fn with_loan(book_id: i64, loan_id: i64) -> Self {
        Self {
            book_id,
            focus_loan: Some(loan_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookLedger {
    pub book: Book,
    pub copies: Vec<BookCopy>,
    pub reservations: Vec<Reservation>,
    pub loans: Vec<Loan>,
    pub fines: Vec<Fine>,
    /// Loans deleted by administrative removal, applied on commit
    pub removed_loans: Vec<i64>,
    pub outbox: Vec<Notification>,
}

impl BookLedger {
    pub fn new(
        book: Book,
        copies: Vec<BookCopy>,
        reservations: Vec<Reservation>,
        loans: Vec<Loan>,
        fines: Vec<Fine>,
    ) -> Self {
        Self {
            book,
            copies,
            reservations,
            loans,
            fines,
            removed_loans: Vec::new(),
            outbox: Vec::new(),
        }
    }

    pub fn copy(&self, copy_id: i64) -> Option<&BookCopy> {
        self.copies.iter().find(|c| c.id == copy_id)
    }

    pub fn copy_mut(&mut self, copy_id: i64) -> Option<&mut BookCopy> {
        self.copies.iter_mut().find(|c| c.id == copy_id)
    }

    pub fn loan(&self, loan_id: i64) -> Option<&Loan> {
        self.loans.iter().find(|l| l.id == loan_id)
    }

    pub fn loan_mut(&mut self, loan_id: i64) -> Option<&mut Loan> {
        self.loans.iter_mut().find(|l| l.id == loan_id)
    }

    pub fn reservation(&self, reservation_id: i64) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == reservation_id)
    }

    pub fn reservation_mut(&mut self, reservation_id: i64) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == reservation_id)
    }

    pub fn fine_mut(&mut self, fine_id: i64) -> Option<&mut Fine> {
        self.fines.iter_mut().find(|f| f.id == fine_id)
    }

    pub fn fines_for_loan(&self, loan_id: i64) -> impl Iterator<Item = &Fine> {
        self.fines.iter().filter(move |f| f.loan_id == loan_id)
    }
}

/// A book as seen from the circulation desk
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BookInventory {
    pub book: Book,
    pub copies: Vec<BookCopy>,
    pub queue: Vec<QueueEntry>,
}

impl From<BookLedger> for BookInventory {
    fn from(ledger: BookLedger) -> Self {
        let queue = ledger.queue();
        Self {
            book: ledger.book,
            copies: ledger.copies,
            queue,
        }
    }
}

/// Result of an expiry and overdue sweep
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct SweepReport {
    pub books_visited: usize,
    pub reservations_expired: usize,
    pub fines_assessed: usize,
}
