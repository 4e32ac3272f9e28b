//! Repository layer: persistence of the lending aggregate
//!
//! Mutations go through a [`LedgerSession`], which holds the per-book lock
//! from [`LendingStore::begin`] until [`LedgerSession::commit`]. Dropping a
//! session without committing discards every change made to its ledger.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::{
    error::AppResult,
    models::{BookLedger, Fine, LedgerScope, Loan, Reservation},
};

/// An open unit of work on one book
#[async_trait]
pub trait LedgerSession: Send {
    fn ledger(&mut self) -> &mut BookLedger;

    /// Persist the ledger and release the book lock
    async fn commit(self: Box<Self>) -> AppResult<BookLedger>;
}

#[async_trait]
pub trait LendingStore: Send + Sync {
    /// Lock the book and load its ledger. `None` when the book does not exist.
    async fn begin(&self, scope: LedgerScope) -> AppResult<Option<Box<dyn LedgerSession>>>;

    /// Unlocked, read-only view of a book's ledger
    async fn snapshot(&self, scope: LedgerScope) -> AppResult<Option<BookLedger>>;

    async fn get_loan(&self, loan_id: i64) -> AppResult<Option<Loan>>;

    async fn get_reservation(&self, reservation_id: i64) -> AppResult<Option<Reservation>>;

    /// (book id, loan id) of the given fine
    async fn locate_fine(&self, fine_id: i64) -> AppResult<Option<(i64, i64)>>;

    /// Book owning the given copy
    async fn locate_copy(&self, copy_id: i64) -> AppResult<Option<i64>>;

    /// Inventory codes are unique across all books
    async fn inventory_code_taken(&self, code: &str) -> AppResult<bool>;

    async fn user_loans(&self, user_id: i64, include_returned: bool) -> AppResult<Vec<Loan>>;

    async fn user_reservations(&self, user_id: i64) -> AppResult<Vec<Reservation>>;

    async fn user_fines(&self, user_id: i64) -> AppResult<Vec<Fine>>;

    /// ACTIVE reservations of a user that have not lapsed by `now`
    async fn count_active_reservations(&self, user_id: i64, now: DateTime<Utc>) -> AppResult<i64>;

    /// Books with a lapsed ACTIVE reservation or an open loan past due at `now`
    async fn books_needing_sweep(&self, now: DateTime<Utc>) -> AppResult<Vec<i64>>;

    /// Connectivity check for readiness
    async fn ping(&self) -> AppResult<()>;
}

/// Shared handle to the configured store
pub type Repository = Arc<dyn LendingStore>;
