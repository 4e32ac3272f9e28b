//! In-process store
//!
//! Keeps every table in memory and serializes sessions with one async mutex
//! per book. Used for `memory://` development runs and by the test suites.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{LedgerSession, LendingStore};
use crate::{
    error::AppResult,
    models::{
        next_id, AccessType, Book, BookCopy, BookLedger, CopyStatus, Fine, LedgerScope, Loan,
        Reservation,
    },
};

#[derive(Default)]
struct Tables {
    books: HashMap<i64, Book>,
    copies: HashMap<i64, BookCopy>,
    reservations: HashMap<i64, Reservation>,
    loans: HashMap<i64, Loan>,
    fines: HashMap<i64, Fine>,
}

impl Tables {
    fn load(&self, scope: LedgerScope) -> Option<BookLedger> {
        let book = self.books.get(&scope.book_id)?.clone();

        let mut copies: Vec<BookCopy> = self
            .copies
            .values()
            .filter(|c| c.book_id == book.id)
            .cloned()
            .collect();
        copies.sort_by(|a, b| a.inventory_code.cmp(&b.inventory_code));

        let mut reservations: Vec<Reservation> = self
            .reservations
            .values()
            .filter(|r| r.book_id == book.id && r.is_active())
            .cloned()
            .collect();
        reservations.sort_by_key(|r| r.queue_key());

        let mut loans: Vec<Loan> = self
            .loans
            .values()
            .filter(|l| l.book_id == book.id && (l.is_open() || Some(l.id) == scope.focus_loan))
            .cloned()
            .collect();
        loans.sort_by_key(|l| (l.borrowed_at, l.id));

        let mut fines: Vec<Fine> = self
            .fines
            .values()
            .filter(|f| loans.iter().any(|l| l.id == f.loan_id))
            .cloned()
            .collect();
        fines.sort_by_key(|f| (f.created_at, f.id));

        Some(BookLedger::new(book, copies, reservations, loans, fines))
    }

    fn store(&mut self, ledger: &BookLedger) {
        self.books.insert(ledger.book.id, ledger.book.clone());
        for copy in &ledger.copies {
            self.copies.insert(copy.id, copy.clone());
        }
        for reservation in &ledger.reservations {
            self.reservations.insert(reservation.id, reservation.clone());
        }
        for loan in &ledger.loans {
            self.loans.insert(loan.id, loan.clone());
        }
        for loan_id in &ledger.removed_loans {
            self.loans.remove(loan_id);
        }
        for fine in &ledger.fines {
            self.fines.insert(fine.id, fine.clone());
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    book_locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a catalog book with `copies` AVAILABLE copies coded `B<id>-<n>`
    pub async fn seed_book(&self, book_id: i64, title: &str, copies: usize) -> Book {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        for n in 1..=copies {
            let copy = BookCopy {
                id: next_id(),
                book_id,
                inventory_code: format!("B{}-{}", book_id, n),
                status: CopyStatus::Available,
                access_type: AccessType::OpenStack,
                location: None,
                condition: None,
                updated_at: now,
            };
            tables.copies.insert(copy.id, copy);
        }
        let book = Book {
            id: book_id,
            title: title.to_string(),
            total_copies: copies as i32,
            available_copies: copies as i32,
        };
        tables.books.insert(book_id, book.clone());
        book
    }

    async fn book_lock(&self, book_id: i64) -> Arc<Mutex<()>> {
        self.book_locks
            .lock()
            .await
            .entry(book_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

struct MemorySession {
    _guard: OwnedMutexGuard<()>,
    tables: Arc<Mutex<Tables>>,
    ledger: BookLedger,
}

#[async_trait]
impl LedgerSession for MemorySession {
    fn ledger(&mut self) -> &mut BookLedger {
        &mut self.ledger
    }

    async fn commit(self: Box<Self>) -> AppResult<BookLedger> {
        let session = *self;
        session.tables.lock().await.store(&session.ledger);
        Ok(session.ledger)
    }
}

#[async_trait]
impl LendingStore for MemoryStore {
    async fn begin(&self, scope: LedgerScope) -> AppResult<Option<Box<dyn LedgerSession>>> {
        let guard = self.book_lock(scope.book_id).await.lock_owned().await;
        let ledger = match self.tables.lock().await.load(scope) {
            Some(ledger) => ledger,
            None => return Ok(None),
        };
        Ok(Some(Box::new(MemorySession {
            _guard: guard,
            tables: self.tables.clone(),
            ledger,
        })))
    }

    async fn snapshot(&self, scope: LedgerScope) -> AppResult<Option<BookLedger>> {
        Ok(self.tables.lock().await.load(scope))
    }

    async fn get_loan(&self, loan_id: i64) -> AppResult<Option<Loan>> {
        Ok(self.tables.lock().await.loans.get(&loan_id).cloned())
    }

    async fn get_reservation(&self, reservation_id: i64) -> AppResult<Option<Reservation>> {
        Ok(self
            .tables
            .lock()
            .await
            .reservations
            .get(&reservation_id)
            .cloned())
    }

    async fn locate_fine(&self, fine_id: i64) -> AppResult<Option<(i64, i64)>> {
        let tables = self.tables.lock().await;
        Ok(tables.fines.get(&fine_id).and_then(|fine| {
            tables
                .loans
                .get(&fine.loan_id)
                .map(|loan| (loan.book_id, loan.id))
        }))
    }

    async fn locate_copy(&self, copy_id: i64) -> AppResult<Option<i64>> {
        Ok(self.tables.lock().await.copies.get(&copy_id).map(|c| c.book_id))
    }

    async fn inventory_code_taken(&self, code: &str) -> AppResult<bool> {
        let tables = self.tables.lock().await;
        Ok(tables.copies.values().any(|c| c.inventory_code == code))
    }

    async fn user_loans(&self, user_id: i64, include_returned: bool) -> AppResult<Vec<Loan>> {
        let tables = self.tables.lock().await;
        let mut loans: Vec<Loan> = tables
            .loans
            .values()
            .filter(|l| l.user_id == user_id && (include_returned || l.is_open()))
            .cloned()
            .collect();
        loans.sort_by_key(|l| l.due_at);
        Ok(loans)
    }

    async fn user_reservations(&self, user_id: i64) -> AppResult<Vec<Reservation>> {
        let tables = self.tables.lock().await;
        let mut reservations: Vec<Reservation> = tables
            .reservations
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        reservations.sort_by_key(|r| r.queue_key());
        Ok(reservations)
    }

    async fn user_fines(&self, user_id: i64) -> AppResult<Vec<Fine>> {
        let tables = self.tables.lock().await;
        let mut fines: Vec<Fine> = tables
            .fines
            .values()
            .filter(|f| {
                tables
                    .loans
                    .get(&f.loan_id)
                    .map_or(false, |l| l.user_id == user_id)
            })
            .cloned()
            .collect();
        fines.sort_by_key(|f| (f.created_at, f.id));
        Ok(fines)
    }

    async fn count_active_reservations(&self, user_id: i64, now: DateTime<Utc>) -> AppResult<i64> {
        let tables = self.tables.lock().await;
        Ok(tables
            .reservations
            .values()
            .filter(|r| r.user_id == user_id && r.is_active() && r.expires_at > now)
            .count() as i64)
    }

    async fn books_needing_sweep(&self, now: DateTime<Utc>) -> AppResult<Vec<i64>> {
        let tables = self.tables.lock().await;
        let mut books: Vec<i64> = tables
            .reservations
            .values()
            .filter(|r| r.is_active() && r.expires_at <= now)
            .map(|r| r.book_id)
            .chain(
                tables
                    .loans
                    .values()
                    .filter(|l| l.is_open() && l.due_at < now)
                    .map(|l| l.book_id),
            )
            .collect();
        books.sort_unstable();
        books.dedup();
        Ok(books)
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}
