//! Book and physical copy models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use utoipa::ToSchema;
use validator::Validate;

use crate::error::{AppError, AppResult};

/// Circulation status of one physical copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CopyStatus {
    Available,
    Reserved,
    Borrowed,
    Maintenance,
    Withdrawn,
}

impl CopyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyStatus::Available => "AVAILABLE",
            CopyStatus::Reserved => "RESERVED",
            CopyStatus::Borrowed => "BORROWED",
            CopyStatus::Maintenance => "MAINTENANCE",
            CopyStatus::Withdrawn => "WITHDRAWN",
        }
    }

    /// Legal copy transitions. Every status change goes through this table.
    pub fn can_transition_to(self, next: CopyStatus) -> bool {
        use CopyStatus::*;
        matches!(
            (self, next),
            (Available, Reserved)
                | (Available, Borrowed)
                | (Available, Maintenance)
                | (Available, Withdrawn)
                | (Reserved, Borrowed)
                | (Reserved, Available)
                | (Borrowed, Available)
                | (Borrowed, Reserved)
                | (Maintenance, Available)
                | (Maintenance, Reserved)
                | (Maintenance, Withdrawn)
                | (Withdrawn, Available)
                | (Withdrawn, Reserved)
        )
    }

    /// Copies out of circulation do not count towards the book total
    pub fn in_circulation(self) -> bool {
        self != CopyStatus::Withdrawn
    }
}

impl FromStr for CopyStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(CopyStatus::Available),
            "RESERVED" => Ok(CopyStatus::Reserved),
            "BORROWED" => Ok(CopyStatus::Borrowed),
            "MAINTENANCE" => Ok(CopyStatus::Maintenance),
            "WITHDRAWN" => Ok(CopyStatus::Withdrawn),
            other => Err(AppError::Internal(format!("Unknown copy status: {}", other))),
        }
    }
}

impl std::fmt::Display for CopyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a copy is shelved and how it may be used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessType {
    Storage,
    OpenStack,
    Reference,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessType::Storage => "STORAGE",
            AccessType::OpenStack => "OPEN_STACK",
            AccessType::Reference => "REFERENCE",
        }
    }
}

impl FromStr for AccessType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STORAGE" => Ok(AccessType::Storage),
            "OPEN_STACK" => Ok(AccessType::OpenStack),
            "REFERENCE" => Ok(AccessType::Reference),
            other => Err(AppError::Internal(format!("Unknown access type: {}", other))),
        }
    }
}

text_enum_sqlx!(CopyStatus, AccessType);

impl Default for AccessType {
    fn default() -> Self {
        AccessType::OpenStack
    }
}

/// Catalog entry with its denormalized inventory counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Book {
    pub id: i64,
    pub title: String,
    pub total_copies: i32,
    pub available_copies: i32,
}

/// One physical unit of a book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct BookCopy {
    pub id: i64,
    pub book_id: i64,
    pub inventory_code: String,
    pub status: CopyStatus,
    pub access_type: AccessType,
    pub location: Option<String>,
    pub condition: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl BookCopy {
    /// Move the copy to `next`, rejecting transitions the status table forbids
    pub fn transition(&mut self, next: CopyStatus, now: DateTime<Utc>) -> AppResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::InvalidState(format!(
                "Copy {} cannot go from {} to {}",
                self.inventory_code, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

/// Admit a new copy into circulation
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AdmitCopy {
    #[validate(length(min = 1, max = 60, message = "Inventory code must be 1 to 60 characters"))]
    pub inventory_code: String,
    pub access_type: Option<AccessType>,
    pub location: Option<String>,
    pub condition: Option<String>,
}

/// Take a copy out of circulation or bring it back
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateCopyStatus {
    /// MAINTENANCE, WITHDRAWN or AVAILABLE
    pub status: CopyStatus,
    pub condition: Option<String>,
}
