//! Data models for the lending core

/// Store a status enum as TEXT through its `as_str` / `FromStr` pair
macro_rules! text_enum_sqlx {
    ($($ty:ty),+ $(,)?) => {$(
        impl sqlx::Type<sqlx::Postgres> for $ty {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <String as sqlx::Type<sqlx::Postgres>>::type_info()
            }

            fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
                <String as sqlx::Type<sqlx::Postgres>>::compatible(ty)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $ty {
            fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
                let s: &str = sqlx::Decode::<sqlx::Postgres>::decode(value)?;
                Ok(s.parse::<$ty>()?)
            }
        }

        impl sqlx::Encode<'_, sqlx::Postgres> for $ty {
            fn encode_by_ref(&self, buf: &mut sqlx::postgres::PgArgumentBuffer) -> sqlx::encode::IsNull {
                <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
            }
        }
    )+};
}

pub mod book;
pub mod fine;
pub mod ledger;
pub mod loan;
pub mod reservation;
pub mod user;

// Re-export commonly used types
pub use book::{AccessType, AdmitCopy, Book, BookCopy, CopyStatus, UpdateCopyStatus};
pub use fine::Fine;
pub use ledger::{BookInventory, BookLedger, LedgerScope, Notification, SweepReport};
pub use loan::{CreateLoan, Loan, LoanDetails, LoanReturn, LoanState};
pub use reservation::{CreateReservation, QueueEntry, Reservation, ReservationStatus};
pub use user::{Role, UserClaims};

/// Process-wide snowflake id source; ids grow with creation time
static ID_GENERATOR: snowflaked::sync::Generator = snowflaked::sync::Generator::new(0);

/// Allocate an id for a new entity
pub fn next_id() -> i64 {
    ID_GENERATOR.generate()
}
