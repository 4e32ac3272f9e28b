//! PostgreSQL store
//!
//! A session opens a transaction and takes `FOR UPDATE` on the book row, which
//! serializes every lending operation on that book. On commit only the rows
//! that differ from what was loaded are written back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Pool, Postgres, Transaction};

use super::{LedgerSession, LendingStore};
use crate::{
    error::AppResult,
    models::{Book, BookCopy, BookLedger, Fine, LedgerScope, Loan, Reservation},
};

#[derive(Clone)]
pub struct PgLendingStore {
    pool: Pool<Postgres>,
}

impl PgLendingStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

/// Load a book's ledger; with `lock` the book row is held until the transaction ends
async fn load_ledger(
    conn: &mut PgConnection,
    scope: LedgerScope,
    lock: bool,
) -> AppResult<Option<BookLedger>> {
    let book_sql = if lock {
        "SELECT id, title, total_copies, available_copies FROM books WHERE id = $1 FOR UPDATE"
    } else {
        "SELECT id, title, total_copies, available_copies FROM books WHERE id = $1"
    };

    let book = match sqlx::query_as::<_, Book>(book_sql)
        .bind(scope.book_id)
        .fetch_optional(&mut *conn)
        .await?
    {
        Some(book) => book,
        None => return Ok(None),
    };

    let copies = sqlx::query_as::<_, BookCopy>(
        "SELECT * FROM book_copies WHERE book_id = $1 ORDER BY inventory_code",
    )
    .bind(book.id)
    .fetch_all(&mut *conn)
    .await?;

    let reservations = sqlx::query_as::<_, Reservation>(
        r#"
        SELECT * FROM reservations
        WHERE book_id = $1 AND status = 'ACTIVE'
        ORDER BY reserved_at, id
        "#,
    )
    .bind(book.id)
    .fetch_all(&mut *conn)
    .await?;

    let loans = sqlx::query_as::<_, Loan>(
        r#"
        SELECT * FROM loans
        WHERE book_id = $1 AND (returned_at IS NULL OR id = $2)
        ORDER BY borrowed_at, id
        "#,
    )
    .bind(book.id)
    .bind(scope.focus_loan)
    .fetch_all(&mut *conn)
    .await?;

    let loan_ids: Vec<i64> = loans.iter().map(|l| l.id).collect();
    let fines = sqlx::query_as::<_, Fine>(
        "SELECT * FROM fines WHERE loan_id = ANY($1) ORDER BY created_at, id",
    )
    .bind(&loan_ids[..])
    .fetch_all(&mut *conn)
    .await?;

    Ok(Some(BookLedger::new(book, copies, reservations, loans, fines)))
}

struct PgSession {
    tx: Transaction<'static, Postgres>,
    original: BookLedger,
    ledger: BookLedger,
}

async fn write_copy(conn: &mut PgConnection, copy: &BookCopy) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO book_copies
            (id, book_id, inventory_code, status, access_type, location, condition, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            access_type = EXCLUDED.access_type,
            location = EXCLUDED.location,
            condition = EXCLUDED.condition,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(copy.id)
    .bind(copy.book_id)
    .bind(&copy.inventory_code)
    .bind(copy.status)
    .bind(copy.access_type)
    .bind(&copy.location)
    .bind(&copy.condition)
    .bind(copy.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_reservation(conn: &mut PgConnection, reservation: &Reservation) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO reservations
            (id, user_id, book_id, status, reserved_at, expires_at, assigned_copy_id, closed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            expires_at = EXCLUDED.expires_at,
            assigned_copy_id = EXCLUDED.assigned_copy_id,
            closed_at = EXCLUDED.closed_at
        "#,
    )
    .bind(reservation.id)
    .bind(reservation.user_id)
    .bind(reservation.book_id)
    .bind(reservation.status)
    .bind(reservation.reserved_at)
    .bind(reservation.expires_at)
    .bind(reservation.assigned_copy_id)
    .bind(reservation.closed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_loan(conn: &mut PgConnection, loan: &Loan) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO loans
            (id, user_id, book_id, copy_id, borrowed_at, due_at, returned_at,
             extensions_count, last_extended_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (id) DO UPDATE SET
            due_at = EXCLUDED.due_at,
            returned_at = EXCLUDED.returned_at,
            extensions_count = EXCLUDED.extensions_count,
            last_extended_at = EXCLUDED.last_extended_at
        "#,
    )
    .bind(loan.id)
    .bind(loan.user_id)
    .bind(loan.book_id)
    .bind(loan.copy_id)
    .bind(loan.borrowed_at)
    .bind(loan.due_at)
    .bind(loan.returned_at)
    .bind(loan.extensions_count)
    .bind(loan.last_extended_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_fine(conn: &mut PgConnection, fine: &Fine) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO fines
            (id, loan_id, amount, currency, reason, days_late, created_at, paid_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (id) DO UPDATE SET
            amount = EXCLUDED.amount,
            currency = EXCLUDED.currency,
            reason = EXCLUDED.reason,
            days_late = EXCLUDED.days_late,
            created_at = EXCLUDED.created_at,
            paid_at = EXCLUDED.paid_at
        "#,
    )
    .bind(fine.id)
    .bind(fine.loan_id)
    .bind(fine.amount)
    .bind(&fine.currency)
    .bind(&fine.reason)
    .bind(fine.days_late)
    .bind(fine.created_at)
    .bind(fine.paid_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Items of `current` that are new or differ from their loaded version
fn changed<'a, T: PartialEq>(
    current: &'a [T],
    original: &'a [T],
    id: impl Fn(&T) -> i64 + 'a,
) -> Vec<&'a T> {
    current
        .iter()
        .filter(|item| original.iter().find(|o| id(*o) == id(*item)) != Some(*item))
        .collect()
}

#[async_trait]
impl LedgerSession for PgSession {
    fn ledger(&mut self) -> &mut BookLedger {
        &mut self.ledger
    }

    async fn commit(self: Box<Self>) -> AppResult<BookLedger> {
        let PgSession {
            mut tx,
            original,
            ledger,
        } = *self;

        if ledger.book != original.book {
            sqlx::query("UPDATE books SET total_copies = $2, available_copies = $3 WHERE id = $1")
                .bind(ledger.book.id)
                .bind(ledger.book.total_copies)
                .bind(ledger.book.available_copies)
                .execute(&mut *tx)
                .await?;
        }

        for copy in changed(&ledger.copies, &original.copies, |c| c.id) {
            write_copy(&mut *tx, copy).await?;
        }

        // Closed rows first so partial unique indexes never see two live rows
        let mut reservations = changed(&ledger.reservations, &original.reservations, |r| r.id);
        reservations.sort_by_key(|r| r.is_active());
        for reservation in reservations {
            write_reservation(&mut *tx, reservation).await?;
        }

        let mut loans = changed(&ledger.loans, &original.loans, |l| l.id);
        loans.sort_by_key(|l| l.is_open());
        for loan in loans {
            write_loan(&mut *tx, loan).await?;
        }

        let mut fines = changed(&ledger.fines, &original.fines, |f| f.id);
        fines.sort_by_key(|f| !f.is_paid());
        for fine in fines {
            write_fine(&mut *tx, fine).await?;
        }

        for loan_id in &ledger.removed_loans {
            sqlx::query("DELETE FROM loans WHERE id = $1")
                .bind(loan_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(ledger)
    }
}

#[async_trait]
impl LendingStore for PgLendingStore {
    async fn begin(&self, scope: LedgerScope) -> AppResult<Option<Box<dyn LedgerSession>>> {
        let mut tx = self.pool.begin().await?;
        let ledger = match load_ledger(&mut *tx, scope, true).await? {
            Some(ledger) => ledger,
            None => return Ok(None),
        };
        Ok(Some(Box::new(PgSession {
            tx,
            original: ledger.clone(),
            ledger,
        })))
    }

    async fn snapshot(&self, scope: LedgerScope) -> AppResult<Option<BookLedger>> {
        let mut conn = self.pool.acquire().await?;
        load_ledger(&mut *conn, scope, false).await
    }

    async fn get_loan(&self, loan_id: i64) -> AppResult<Option<Loan>> {
        Ok(sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE id = $1")
            .bind(loan_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get_reservation(&self, reservation_id: i64) -> AppResult<Option<Reservation>> {
        Ok(sqlx::query_as::<_, Reservation>("SELECT * FROM reservations WHERE id = $1")
            .bind(reservation_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn locate_fine(&self, fine_id: i64) -> AppResult<Option<(i64, i64)>> {
        Ok(sqlx::query_as::<_, (i64, i64)>(
            "SELECT l.book_id, l.id FROM fines f JOIN loans l ON l.id = f.loan_id WHERE f.id = $1",
        )
        .bind(fine_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn locate_copy(&self, copy_id: i64) -> AppResult<Option<i64>> {
        Ok(sqlx::query_scalar("SELECT book_id FROM book_copies WHERE id = $1")
            .bind(copy_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn inventory_code_taken(&self, code: &str) -> AppResult<bool> {
        let taken: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM book_copies WHERE inventory_code = $1)")
                .bind(code)
                .fetch_one(&self.pool)
                .await?;
        Ok(taken)
    }

    async fn user_loans(&self, user_id: i64, include_returned: bool) -> AppResult<Vec<Loan>> {
        Ok(sqlx::query_as::<_, Loan>(
            r#"
            SELECT * FROM loans
            WHERE user_id = $1 AND ($2 OR returned_at IS NULL)
            ORDER BY due_at
            "#,
        )
        .bind(user_id)
        .bind(include_returned)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn user_reservations(&self, user_id: i64) -> AppResult<Vec<Reservation>> {
        Ok(sqlx::query_as::<_, Reservation>(
            "SELECT * FROM reservations WHERE user_id = $1 ORDER BY reserved_at, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn user_fines(&self, user_id: i64) -> AppResult<Vec<Fine>> {
        Ok(sqlx::query_as::<_, Fine>(
            r#"
            SELECT f.* FROM fines f
            JOIN loans l ON l.id = f.loan_id
            WHERE l.user_id = $1
            ORDER BY f.created_at, f.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn count_active_reservations(&self, user_id: i64, now: DateTime<Utc>) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM reservations
            WHERE user_id = $1 AND status = 'ACTIVE' AND expires_at > $2
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn books_needing_sweep(&self, now: DateTime<Utc>) -> AppResult<Vec<i64>> {
        let books: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT book_id FROM reservations WHERE status = 'ACTIVE' AND expires_at <= $1
            UNION
            SELECT book_id FROM loans WHERE returned_at IS NULL AND due_at < $1
            ORDER BY book_id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(books)
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
