//! Lending service
//!
//! Every mutating operation is one unit of work on a single book: the ledger is
//! locked and loaded, stale reservations are expired, the operation runs on the
//! in-memory aggregate, counters are recomputed and the whole thing commits at
//! once. Notifications leave only after the commit succeeded.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::{
    config::{FinesConfig, LendingConfig},
    error::{AppError, AppResult},
    models::{
        next_id, AdmitCopy, BookCopy, BookInventory, BookLedger, CreateLoan, CreateReservation,
        Fine, LedgerScope, Loan, LoanDetails, LoanReturn, Reservation, ReservationStatus,
        SweepReport, UpdateCopyStatus,
    },
    repository::Repository,
};

use super::{clock::Clock, fines::FineCalculator, notifications::Notifier};

/// Reservation validity when the reader does not ask for one
const DEFAULT_RESERVATION_TTL_DAYS: i64 = 3;

#[derive(Clone)]
pub struct LendingService {
    repository: Repository,
    config: LendingConfig,
    fines: FineCalculator,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    retries: u32,
}

impl LendingService {
    pub fn new(
        repository: Repository,
        config: LendingConfig,
        fines: &FinesConfig,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        retries: u32,
    ) -> Self {
        Self {
            repository,
            config,
            fines: FineCalculator::new(fines),
            notifier,
            clock,
            retries,
        }
    }

    /// Run `work` as one unit of work on a book, replaying it after
    /// serialization failures
    async fn atomically<T, F>(&self, scope: LedgerScope, mut work: F) -> AppResult<T>
    where
        F: FnMut(&mut BookLedger, DateTime<Utc>) -> AppResult<T> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match self.run_once(scope, &mut work).await {
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!(book_id = scope.book_id, attempt, "Retrying unit of work: {}", e);
                }
                result => return result,
            }
        }
    }

    async fn run_once<T, F>(&self, scope: LedgerScope, work: &mut F) -> AppResult<T>
    where
        F: FnMut(&mut BookLedger, DateTime<Utc>) -> AppResult<T> + Send,
        T: Send,
    {
        let mut session = self
            .repository
            .begin(scope)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book {} not found", scope.book_id)))?;

        let now = self.clock.now();
        let value = {
            let ledger = session.ledger();
            ledger.expire_stale(now, self.config.hold_days)?;
            let value = work(&mut *ledger, now)?;
            ledger.recalculate_counters();
            value
        };

        let committed = session.commit().await?;
        for notification in &committed.outbox {
            self.notifier.notify(notification);
        }
        Ok(value)
    }

    async fn loan_record(&self, loan_id: i64) -> AppResult<Loan> {
        self.repository
            .get_loan(loan_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Loan {} not found", loan_id)))
    }

    // Lending operations

    /// Borrow a copy of a book
    pub async fn borrow(&self, request: CreateLoan) -> AppResult<Loan> {
        let days = request
            .duration_days
            .unwrap_or(self.config.loan_duration_days);
        if days < 1 || days > self.config.max_loan_duration_days {
            return Err(AppError::Validation(format!(
                "Loan duration must be between 1 and {} days",
                self.config.max_loan_duration_days
            )));
        }
        let user_id = request.user_id;

        let loan = self
            .atomically(LedgerScope::book(request.book_id), |ledger, now| {
                let held = ledger
                    .active_reservation_of(user_id)
                    .map(|r| (r.id, r.assigned_copy_id));

                let copy_id = match held {
                    Some((reservation_id, Some(copy_id))) => {
                        ledger.claim_specific(copy_id, now)?;
                        ledger.fulfil(reservation_id, now)?;
                        copy_id
                    }
                    _ => match ledger.claim_copy(now)? {
                        Some(copy_id) => {
                            if let Some((reservation_id, None)) = held {
                                ledger.fulfil(reservation_id, now)?;
                            }
                            copy_id
                        }
                        None => {
                            let first_in_line = ledger.peek_first().map(|r| r.user_id);
                            return Err(match first_in_line {
                                Some(first) if first != user_id => AppError::Conflict(
                                    "Book reserved by another reader".to_string(),
                                ),
                                _ => AppError::Conflict("No copies available".to_string()),
                            });
                        }
                    },
                };

                let loan = Loan {
                    id: next_id(),
                    user_id,
                    book_id: ledger.book.id,
                    copy_id,
                    borrowed_at: now,
                    due_at: now + Duration::days(days),
                    returned_at: None,
                    extensions_count: 0,
                    last_extended_at: None,
                };
                ledger.loans.push(loan.clone());
                Ok(loan)
            })
            .await?;

        tracing::info!(
            loan_id = loan.id,
            user_id = loan.user_id,
            book_id = loan.book_id,
            copy_id = loan.copy_id,
            "Book borrowed"
        );
        Ok(loan)
    }

    /// Return a borrowed copy; late returns incur a fine
    pub async fn return_loan(&self, loan_id: i64) -> AppResult<LoanReturn> {
        let record = self.loan_record(loan_id).await?;
        let hold_days = self.config.hold_days;
        let fines = &self.fines;

        let (loan, fine, now) = self
            .atomically(
                LedgerScope::with_loan(record.book_id, loan_id),
                |ledger, now| {
                    let loan = ledger
                        .loan_mut(loan_id)
                        .ok_or_else(|| AppError::NotFound(format!("Loan {} not found", loan_id)))?;
                    if !loan.is_open() {
                        return Err(AppError::InvalidState(format!(
                            "Loan {} is already returned",
                            loan_id
                        )));
                    }
                    loan.returned_at = Some(now);
                    let copy_id = loan.copy_id;

                    ledger.release(copy_id, now, hold_days)?;
                    let fine = fines.compute_on_return(ledger, loan_id)?;
                    let loan = ledger
                        .loan(loan_id)
                        .cloned()
                        .ok_or_else(|| AppError::Internal("Returned loan vanished".to_string()))?;
                    Ok((loan, fine, now))
                },
            )
            .await?;

        tracing::info!(loan_id, fined = fine.is_some(), "Book returned");
        Ok(LoanReturn {
            loan: LoanDetails::new(loan, now),
            fine,
        })
    }

    /// Push the due date back by one loan period
    pub async fn renew(&self, loan_id: i64) -> AppResult<Loan> {
        let record = self.loan_record(loan_id).await?;
        let max_extensions = self.config.max_extensions;
        let period = Duration::days(self.config.loan_duration_days);

        let loan = self
            .atomically(
                LedgerScope::with_loan(record.book_id, loan_id),
                |ledger, now| {
                    let borrower = match ledger.loan(loan_id) {
                        Some(loan) if loan.is_open() => loan.user_id,
                        Some(_) => {
                            return Err(AppError::InvalidState(format!(
                                "Loan {} is already returned",
                                loan_id
                            )))
                        }
                        None => return Err(AppError::NotFound(format!("Loan {} not found", loan_id))),
                    };
                    if ledger
                        .reservations
                        .iter()
                        .any(|r| r.is_active() && r.user_id != borrower)
                    {
                        return Err(AppError::Conflict(
                            "Book reserved by another reader".to_string(),
                        ));
                    }

                    let loan = ledger
                        .loan_mut(loan_id)
                        .ok_or_else(|| AppError::NotFound(format!("Loan {} not found", loan_id)))?;
                    if loan.extensions_count >= max_extensions {
                        return Err(AppError::Conflict(format!(
                            "Loan {} cannot be renewed more than {} time(s)",
                            loan_id, max_extensions
                        )));
                    }
                    loan.due_at = loan.due_at + period;
                    loan.extensions_count += 1;
                    loan.last_extended_at = Some(now);
                    Ok(loan.clone())
                },
            )
            .await?;

        tracing::info!(loan_id, due_at = %loan.due_at, "Loan renewed");
        Ok(loan)
    }

    /// Delete a loan record. An open loan gives its copy back first.
    pub async fn remove_loan(&self, loan_id: i64) -> AppResult<()> {
        let record = self.loan_record(loan_id).await?;
        let hold_days = self.config.hold_days;

        self.atomically(
            LedgerScope::with_loan(record.book_id, loan_id),
            |ledger, now| {
                let loan = ledger
                    .loan(loan_id)
                    .cloned()
                    .ok_or_else(|| AppError::NotFound(format!("Loan {} not found", loan_id)))?;
                if ledger.fines_for_loan(loan_id).next().is_some() {
                    return Err(AppError::Conflict(format!(
                        "Loan {} has fines and cannot be removed",
                        loan_id
                    )));
                }

                ledger.loans.retain(|l| l.id != loan_id);
                ledger.removed_loans.push(loan_id);
                if loan.is_open() {
                    ledger.release(loan.copy_id, now, hold_days)?;
                }
                Ok(())
            },
        )
        .await?;

        tracing::info!(loan_id, "Loan removed");
        Ok(())
    }

    /// Join the waiting queue for a book
    pub async fn enroll_reservation(&self, request: CreateReservation) -> AppResult<Reservation> {
        let ttl_days = request.ttl_days.unwrap_or(DEFAULT_RESERVATION_TTL_DAYS);
        if !(1..=14).contains(&ttl_days) {
            return Err(AppError::Validation(
                "Reservation expiry must be between 1 and 14 days".to_string(),
            ));
        }

        let active = self
            .repository
            .count_active_reservations(request.user_id, self.clock.now())
            .await?;
        if active >= self.config.max_active_reservations {
            return Err(AppError::Conflict(format!(
                "User {} already holds {} active reservations",
                request.user_id, active
            )));
        }

        let user_id = request.user_id;
        let reservation = self
            .atomically(LedgerScope::book(request.book_id), |ledger, now| {
                let id = ledger.enroll(user_id, ttl_days, now)?;
                ledger
                    .reservation(id)
                    .cloned()
                    .ok_or_else(|| AppError::Internal("Reservation vanished".to_string()))
            })
            .await?;

        tracing::info!(
            reservation_id = reservation.id,
            user_id,
            book_id = reservation.book_id,
            "Reservation created"
        );
        Ok(reservation)
    }

    /// Leave the queue
    pub async fn cancel_reservation(&self, reservation_id: i64) -> AppResult<()> {
        let reservation = self.get_reservation(reservation_id).await?;
        if !reservation.is_active() {
            return Err(AppError::InvalidState(format!(
                "Reservation {} is already {}",
                reservation_id, reservation.status
            )));
        }
        let hold_days = self.config.hold_days;

        self.atomically(LedgerScope::book(reservation.book_id), |ledger, now| {
            ledger.cancel(reservation_id, now, hold_days)
        })
        .await?;

        tracing::info!(reservation_id, "Reservation cancelled");
        Ok(())
    }

    /// Settle a fine
    pub async fn pay_fine(&self, fine_id: i64) -> AppResult<Fine> {
        let (book_id, loan_id) = self
            .repository
            .locate_fine(fine_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Fine {} not found", fine_id)))?;
        let fines = &self.fines;

        let fine = self
            .atomically(LedgerScope::with_loan(book_id, loan_id), |ledger, now| {
                fines.mark_paid(ledger, fine_id, now)
            })
            .await?;

        tracing::info!(fine_id, amount = %fine.amount, "Fine paid");
        Ok(fine)
    }

    // Copy management

    pub async fn admit_copy(&self, book_id: i64, request: AdmitCopy) -> AppResult<BookCopy> {
        if self
            .repository
            .inventory_code_taken(&request.inventory_code)
            .await?
        {
            return Err(AppError::Conflict(format!(
                "Inventory code {} already exists",
                request.inventory_code
            )));
        }
        let hold_days = self.config.hold_days;

        let copy = self
            .atomically(LedgerScope::book(book_id), |ledger, now| {
                let copy_id = ledger.admit_copy(&request, now, hold_days)?;
                ledger
                    .copy(copy_id)
                    .cloned()
                    .ok_or_else(|| AppError::Internal("Admitted copy vanished".to_string()))
            })
            .await?;

        tracing::info!(copy_id = copy.id, book_id, code = %copy.inventory_code, "Copy admitted");
        Ok(copy)
    }

    pub async fn update_copy_status(
        &self,
        copy_id: i64,
        request: UpdateCopyStatus,
    ) -> AppResult<BookCopy> {
        let book_id = self
            .repository
            .locate_copy(copy_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Copy {} not found", copy_id)))?;
        let hold_days = self.config.hold_days;

        let copy = self
            .atomically(LedgerScope::book(book_id), |ledger, now| {
                ledger.set_copy_status(
                    copy_id,
                    request.status,
                    request.condition.clone(),
                    now,
                    hold_days,
                )?;
                ledger
                    .copy(copy_id)
                    .cloned()
                    .ok_or_else(|| AppError::NotFound(format!("Copy {} not found", copy_id)))
            })
            .await?;

        tracing::info!(copy_id, status = %copy.status, "Copy status changed");
        Ok(copy)
    }

    /// Expire lapsed reservations and assess fines on overdue loans across
    /// all books that need it
    pub async fn sweep(&self) -> AppResult<SweepReport> {
        let now = self.clock.now();
        let books = self.repository.books_needing_sweep(now).await?;
        let fines = &self.fines;
        let mut report = SweepReport::default();

        for book_id in books {
            let (expired, assessed) = self
                .atomically(LedgerScope::book(book_id), |ledger, now| {
                    // Sessions load ACTIVE reservations only, so any EXPIRED one
                    // was closed by the lazy expiry of this session
                    let expired = ledger
                        .reservations
                        .iter()
                        .filter(|r| r.status == ReservationStatus::Expired)
                        .count();
                    let overdue: Vec<i64> = ledger
                        .loans
                        .iter()
                        .filter(|l| l.is_open() && l.due_at < now)
                        .map(|l| l.id)
                        .collect();
                    let mut assessed = 0;
                    for loan_id in overdue {
                        if fines.assess_overdue(ledger, loan_id, now)?.is_some() {
                            assessed += 1;
                        }
                    }
                    Ok((expired, assessed))
                })
                .await?;

            report.books_visited += 1;
            report.reservations_expired += expired;
            report.fines_assessed += assessed;
        }

        tracing::info!(
            books = report.books_visited,
            fines = report.fines_assessed,
            "Sweep finished"
        );
        Ok(report)
    }

    // Queries

    pub async fn get_loan(&self, loan_id: i64) -> AppResult<LoanDetails> {
        let loan = self.loan_record(loan_id).await?;
        Ok(LoanDetails::new(loan, self.clock.now()))
    }

    pub async fn get_reservation(&self, reservation_id: i64) -> AppResult<Reservation> {
        let now = self.clock.now();
        self.repository
            .get_reservation(reservation_id)
            .await?
            .map(|r| r.as_of(now))
            .ok_or_else(|| AppError::NotFound(format!("Reservation {} not found", reservation_id)))
    }

    /// The fine and the user who owes it
    pub async fn get_fine(&self, fine_id: i64) -> AppResult<(Fine, i64)> {
        let (book_id, loan_id) = self
            .repository
            .locate_fine(fine_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Fine {} not found", fine_id)))?;
        let ledger = self
            .repository
            .snapshot(LedgerScope::with_loan(book_id, loan_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book {} not found", book_id)))?;

        let owner = ledger
            .loan(loan_id)
            .map(|l| l.user_id)
            .ok_or_else(|| AppError::NotFound(format!("Loan {} not found", loan_id)))?;
        let fine = ledger
            .fines
            .into_iter()
            .find(|f| f.id == fine_id)
            .ok_or_else(|| AppError::NotFound(format!("Fine {} not found", fine_id)))?;
        Ok((fine, owner))
    }

    pub async fn user_loans(&self, user_id: i64, include_returned: bool) -> AppResult<Vec<LoanDetails>> {
        let now = self.clock.now();
        Ok(self
            .repository
            .user_loans(user_id, include_returned)
            .await?
            .into_iter()
            .map(|loan| LoanDetails::new(loan, now))
            .collect())
    }

    pub async fn user_reservations(&self, user_id: i64) -> AppResult<Vec<Reservation>> {
        let now = self.clock.now();
        Ok(self
            .repository
            .user_reservations(user_id)
            .await?
            .into_iter()
            .map(|r| r.as_of(now))
            .collect())
    }

    pub async fn user_fines(&self, user_id: i64) -> AppResult<Vec<Fine>> {
        self.repository.user_fines(user_id).await
    }

    /// Copies and waiting queue of a book
    pub async fn book_inventory(&self, book_id: i64) -> AppResult<BookInventory> {
        let mut ledger = self
            .repository
            .snapshot(LedgerScope::book(book_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book {} not found", book_id)))?;

        // Lapsed reservations are shown as the next session will leave them.
        // Nothing is written back.
        ledger.expire_stale(self.clock.now(), self.config.hold_days)?;
        ledger.recalculate_counters();
        Ok(BookInventory::from(ledger))
    }

    pub async fn ping(&self) -> AppResult<()> {
        self.repository.ping().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        models::{CopyStatus, Notification},
        repository::{memory::MemoryStore, LendingStore},
        services::notifications::MockNotifier,
    };
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    /// Clock the tests move by hand
    pub(crate) struct TestClock(Mutex<DateTime<Utc>>);

    impl TestClock {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Utc::now())))
        }

        pub(crate) fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now = *now + by;
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn quiet_notifier() -> Arc<dyn Notifier> {
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().return_const(());
        Arc::new(notifier)
    }

    fn service_with(
        store: &MemoryStore,
        clock: Arc<TestClock>,
        notifier: Arc<dyn Notifier>,
    ) -> LendingService {
        LendingService::new(
            Arc::new(store.clone()),
            LendingConfig::default(),
            &FinesConfig::default(),
            notifier,
            clock,
            3,
        )
    }

    fn borrow_request(user_id: i64, book_id: i64) -> CreateLoan {
        CreateLoan {
            user_id,
            book_id,
            duration_days: None,
        }
    }

    fn reserve_request(user_id: i64, book_id: i64) -> CreateReservation {
        CreateReservation {
            user_id,
            book_id,
            ttl_days: Some(7),
        }
    }

    async fn assert_counters_consistent(store: &MemoryStore, book_id: i64) {
        let ledger = store
            .snapshot(LedgerScope::book(book_id))
            .await
            .unwrap()
            .unwrap();
        let available = ledger
            .copies
            .iter()
            .filter(|c| c.status == CopyStatus::Available)
            .count() as i32;
        assert_eq!(ledger.book.available_copies, available);
    }

    /// A held copy belongs to exactly one ACTIVE reservation and no open loan
    async fn assert_no_double_reference(store: &MemoryStore, book_id: i64) {
        let ledger = store
            .snapshot(LedgerScope::book(book_id))
            .await
            .unwrap()
            .unwrap();

        let mut held = Vec::new();
        for reservation in ledger.reservations.iter().filter(|r| r.is_active()) {
            if let Some(copy_id) = reservation.assigned_copy_id {
                assert!(!held.contains(&copy_id), "copy {} held twice", copy_id);
                held.push(copy_id);
                assert!(
                    !ledger.loans.iter().any(|l| l.is_open() && l.copy_id == copy_id),
                    "copy {} is both held and on loan",
                    copy_id
                );
                assert_eq!(ledger.copy(copy_id).unwrap().status, CopyStatus::Reserved);
            }
        }
        for loan in ledger.loans.iter().filter(|l| l.is_open()) {
            assert_eq!(ledger.copy(loan.copy_id).unwrap().status, CopyStatus::Borrowed);
        }
    }

    #[tokio::test]
    async fn test_waiting_reader_gets_returned_copy() {
        let store = MemoryStore::new();
        store.seed_book(1, "Solaris", 1).await;
        let service = service_with(&store, TestClock::new(), quiet_notifier());

        let loan = assert_ok!(service.borrow(borrow_request(1, 1)).await);
        let reservation = assert_ok!(service.enroll_reservation(reserve_request(2, 1)).await);

        let returned = assert_ok!(service.return_loan(loan.id).await);
        assert!(returned.fine.is_none());
        assert_no_double_reference(&store, 1).await;

        let inventory = service.book_inventory(1).await.unwrap();
        assert_eq!(inventory.copies[0].status, CopyStatus::Reserved);
        assert_eq!(inventory.book.available_copies, 0);
        assert_eq!(
            inventory.queue[0].reservation.assigned_copy_id,
            Some(loan.copy_id)
        );

        // Someone else cannot take the held copy
        let err = assert_err!(service.borrow(borrow_request(3, 1)).await);
        assert!(matches!(err, AppError::Conflict(msg) if msg.contains("reserved")));

        let second = assert_ok!(service.borrow(borrow_request(2, 1)).await);
        assert_eq!(second.copy_id, loan.copy_id);
        let reservation = service.get_reservation(reservation.id).await.unwrap();
        assert_eq!(reservation.status, ReservationStatus::Fulfilled);
        assert_counters_consistent(&store, 1).await;
        assert_no_double_reference(&store, 1).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_borrows_of_last_copy() {
        let store = MemoryStore::new();
        store.seed_book(1, "Solaris", 1).await;
        let service = service_with(&store, TestClock::new(), quiet_notifier());

        let (a, b) = tokio::join!(
            {
                let service = service.clone();
                tokio::spawn(async move { service.borrow(borrow_request(1, 1)).await })
            },
            {
                let service = service.clone();
                tokio::spawn(async move { service.borrow(borrow_request(2, 1)).await })
            }
        );
        let results = [a.unwrap(), b.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(AppError::Conflict(_)))));
        assert_counters_consistent(&store, 1).await;
    }

    #[tokio::test]
    async fn test_late_return_is_fined() {
        let store = MemoryStore::new();
        store.seed_book(1, "Solaris", 1).await;
        let clock = TestClock::new();
        let service = service_with(&store, clock.clone(), quiet_notifier());

        let loan = service.borrow(borrow_request(1, 1)).await.unwrap();
        clock.advance(Duration::days(14 + 3));

        let returned = service.return_loan(loan.id).await.unwrap();
        let fine = returned.fine.unwrap();
        assert_eq!(fine.days_late, 3);
        assert_eq!(fine.amount, rust_decimal::Decimal::new(150, 2));

        let err = assert_err!(service.return_loan(loan.id).await);
        assert!(matches!(err, AppError::InvalidState(_)));

        assert_ok!(service.pay_fine(fine.id).await);
        let err = assert_err!(service.pay_fine(fine.id).await);
        assert!(matches!(err, AppError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_lapsed_hold_is_offered_to_next_reader() {
        let store = MemoryStore::new();
        store.seed_book(1, "Solaris", 1).await;
        let clock = TestClock::new();
        let service = service_with(&store, clock.clone(), quiet_notifier());

        let loan = service.borrow(borrow_request(1, 1)).await.unwrap();
        let first = service.enroll_reservation(reserve_request(2, 1)).await.unwrap();
        clock.advance(Duration::seconds(1));
        let second = service.enroll_reservation(reserve_request(3, 1)).await.unwrap();

        service.return_loan(loan.id).await.unwrap();
        clock.advance(Duration::days(2) + Duration::seconds(1));

        // Reads already show the lapsed hold as gone
        let inventory = service.book_inventory(1).await.unwrap();
        assert_eq!(inventory.queue.len(), 1);
        assert_eq!(inventory.queue[0].reservation.id, second.id);
        assert_eq!(inventory.queue[0].reservation.assigned_copy_id, Some(loan.copy_id));
        let lapsed = service.get_reservation(first.id).await.unwrap();
        assert_eq!(lapsed.status, ReservationStatus::Expired);

        let report = service.sweep().await.unwrap();
        assert_eq!(report.reservations_expired, 1);

        let first = service.get_reservation(first.id).await.unwrap();
        assert_eq!(first.status, ReservationStatus::Expired);
        let second = service.get_reservation(second.id).await.unwrap();
        assert_eq!(second.assigned_copy_id, Some(loan.copy_id));
        assert_counters_consistent(&store, 1).await;
        assert_no_double_reference(&store, 1).await;
    }

    #[tokio::test]
    async fn test_renew_refused_while_another_reader_waits() {
        let store = MemoryStore::new();
        store.seed_book(1, "Solaris", 1).await;
        let service = service_with(&store, TestClock::new(), quiet_notifier());

        let loan = service.borrow(borrow_request(1, 1)).await.unwrap();
        let renewed = assert_ok!(service.renew(loan.id).await);
        assert_eq!(renewed.due_at, loan.due_at + Duration::days(14));

        let err = assert_err!(service.renew(loan.id).await);
        assert!(matches!(err, AppError::Conflict(_)));

        let other = service.borrow(borrow_request(1, 1)).await;
        assert!(other.is_err());
        service.enroll_reservation(reserve_request(2, 1)).await.unwrap();
        let err = assert_err!(service.renew(loan.id).await);
        assert!(matches!(err, AppError::Conflict(msg) if msg.contains("reserved")));
    }

    #[tokio::test]
    async fn test_removing_open_loan_frees_copy() {
        let store = MemoryStore::new();
        store.seed_book(1, "Solaris", 2).await;
        let service = service_with(&store, TestClock::new(), quiet_notifier());

        let loan = service.borrow(borrow_request(1, 1)).await.unwrap();
        assert_ok!(service.remove_loan(loan.id).await);

        let err = assert_err!(service.get_loan(loan.id).await);
        assert!(matches!(err, AppError::NotFound(_)));
        let inventory = service.book_inventory(1).await.unwrap();
        assert_eq!(inventory.book.available_copies, 2);
        assert_no_double_reference(&store, 1).await;
    }

    #[tokio::test]
    async fn test_loan_with_fine_cannot_be_removed() {
        let store = MemoryStore::new();
        store.seed_book(1, "Solaris", 1).await;
        let clock = TestClock::new();
        let service = service_with(&store, clock.clone(), quiet_notifier());

        let loan = service.borrow(borrow_request(1, 1)).await.unwrap();
        clock.advance(Duration::days(20));
        service.return_loan(loan.id).await.unwrap();

        let err = assert_err!(service.remove_loan(loan.id).await);
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_reservation_limit_per_user() {
        let store = MemoryStore::new();
        let service = service_with(&store, TestClock::new(), quiet_notifier());
        for book_id in 1..=6 {
            store.seed_book(book_id, "Solaris", 1).await;
            service.borrow(borrow_request(99, book_id)).await.unwrap();
        }

        for book_id in 1..=5 {
            assert_ok!(service.enroll_reservation(reserve_request(1, book_id)).await);
        }
        let err = assert_err!(service.enroll_reservation(reserve_request(1, 6)).await);
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_lapsed_reservations_free_the_limit() {
        let store = MemoryStore::new();
        let clock = TestClock::new();
        let service = service_with(&store, clock.clone(), quiet_notifier());
        for book_id in 1..=6 {
            store.seed_book(book_id, "Solaris", 1).await;
            service.borrow(borrow_request(99, book_id)).await.unwrap();
        }

        for book_id in 1..=5 {
            let request = CreateReservation {
                ttl_days: Some(1),
                ..reserve_request(1, book_id)
            };
            assert_ok!(service.enroll_reservation(request).await);
        }
        clock.advance(Duration::days(2));

        let inventory = service.book_inventory(1).await.unwrap();
        assert!(inventory.queue.is_empty());
        let reservations = service.user_reservations(1).await.unwrap();
        assert_eq!(reservations.len(), 5);
        assert!(reservations
            .iter()
            .all(|r| r.status == ReservationStatus::Expired));

        assert_ok!(service.enroll_reservation(reserve_request(1, 6)).await);
        assert_no_double_reference(&store, 6).await;
    }

    #[tokio::test]
    async fn test_notifications_follow_commit() {
        let store = MemoryStore::new();
        store.seed_book(1, "Solaris", 1).await;

        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|n| matches!(n, Notification::ReservationQueued { position: 1, .. }))
            .times(1)
            .return_const(());
        notifier
            .expect_notify()
            .withf(|n| matches!(n, Notification::CopyReady { user_id: 2, .. }))
            .times(1)
            .return_const(());
        let service = service_with(&store, TestClock::new(), Arc::new(notifier));

        let loan = service.borrow(borrow_request(1, 1)).await.unwrap();
        service.enroll_reservation(reserve_request(2, 1)).await.unwrap();
        // Refused operations never notify
        assert!(service.enroll_reservation(reserve_request(2, 1)).await.is_err());
        service.return_loan(loan.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_hands_copy_to_next_reader() {
        let store = MemoryStore::new();
        store.seed_book(1, "Solaris", 1).await;
        let clock = TestClock::new();
        let service = service_with(&store, clock.clone(), quiet_notifier());

        let loan = service.borrow(borrow_request(1, 1)).await.unwrap();
        let first = service.enroll_reservation(reserve_request(2, 1)).await.unwrap();
        clock.advance(Duration::seconds(1));
        let second = service.enroll_reservation(reserve_request(3, 1)).await.unwrap();
        service.return_loan(loan.id).await.unwrap();

        assert_ok!(service.cancel_reservation(first.id).await);
        let err = assert_err!(service.cancel_reservation(first.id).await);
        assert!(matches!(err, AppError::InvalidState(_)));

        let second = service.get_reservation(second.id).await.unwrap();
        assert_eq!(second.assigned_copy_id, Some(loan.copy_id));
        assert_counters_consistent(&store, 1).await;
        assert_no_double_reference(&store, 1).await;
    }

    #[tokio::test]
    async fn test_cancelled_hold_frees_copy_when_nobody_waits() {
        let store = MemoryStore::new();
        store.seed_book(1, "Solaris", 1).await;
        let service = service_with(&store, TestClock::new(), quiet_notifier());

        let loan = service.borrow(borrow_request(1, 1)).await.unwrap();
        let reservation = service.enroll_reservation(reserve_request(2, 1)).await.unwrap();
        service.return_loan(loan.id).await.unwrap();

        assert_ok!(service.cancel_reservation(reservation.id).await);

        let inventory = service.book_inventory(1).await.unwrap();
        assert_eq!(inventory.copies[0].status, CopyStatus::Available);
        assert_eq!(inventory.book.available_copies, 1);
        assert!(inventory.queue.is_empty());
        assert_counters_consistent(&store, 1).await;
        assert_no_double_reference(&store, 1).await;
    }

    #[tokio::test]
    async fn test_withdrawn_copy_leaves_total() {
        let store = MemoryStore::new();
        store.seed_book(1, "Solaris", 2).await;
        let service = service_with(&store, TestClock::new(), quiet_notifier());
        let copy_id = service.book_inventory(1).await.unwrap().copies[1].id;

        let copy = service
            .update_copy_status(
                copy_id,
                UpdateCopyStatus {
                    status: CopyStatus::Withdrawn,
                    condition: Some("lost".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(copy.status, CopyStatus::Withdrawn);

        let inventory = service.book_inventory(1).await.unwrap();
        assert_eq!(inventory.book.total_copies, 1);
        assert_eq!(inventory.book.available_copies, 1);
    }
}
