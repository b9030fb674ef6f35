use paperclip::actix::Apiv2Schema;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;
pub type BookId = String;
pub type BorrowingId = String;
pub type AdminId = String;

pub const BOOKS_COLLECTION: &str = "books";
pub const BORROWINGS_COLLECTION: &str = "borrowings";
pub const ADMIN_USERS_COLLECTION: &str = "admin_users";

pub const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;
/// Every loan is due this long after it was recorded
pub const LOAN_PERIOD_MILLIS: i64 = 7 * DAY_MILLIS;
/// Open loans due within this window are reported as due soon
pub const DUE_SOON_WINDOW_MILLIS: i64 = 2 * DAY_MILLIS;

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase", default)]
pub struct Book {
    pub id: BookId,
    pub title: String,
    pub author: String,
    pub isbn: String,
    pub category: String,
    pub publisher: String,
    /// 0 when unknown
    pub publication_year: u32,
    pub description: String,
    pub stock: u32,
    pub location: String,
    pub image_url: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Data entered by the operator when adding a book
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase", default)]
pub struct BookDetails {
    pub title: String,
    pub author: String,
    pub isbn: String,
    pub category: String,
    pub publisher: String,
    pub publication_year: u32,
    pub description: String,
    pub stock: u32,
    pub location: String,
    pub image_url: String,
}

/// Book edit, absent fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct BookPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isbn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publication_year: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Apiv2Schema)]
#[serde(rename_all = "snake_case")]
pub enum BorrowingStatus {
    Active,
    Overdue,
    Returned,
    ReturnedLate,
}

impl BorrowingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BorrowingStatus::Active => "active",
            BorrowingStatus::Overdue => "overdue",
            BorrowingStatus::Returned => "returned",
            BorrowingStatus::ReturnedLate => "returned_late",
        }
    }

    /// Loan still holds a copy of the book
    pub fn is_open(&self) -> bool {
        matches!(self, BorrowingStatus::Active | BorrowingStatus::Overdue)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }

    /// Status after the due date has passed, `None` when nothing changes
    pub fn after_due_date(&self) -> Option<BorrowingStatus> {
        match self {
            BorrowingStatus::Active => Some(BorrowingStatus::Overdue),
            _ => None,
        }
    }

    /// Status after the book was brought back, `None` for terminal statuses
    pub fn after_return(&self) -> Option<BorrowingStatus> {
        match self {
            BorrowingStatus::Active => Some(BorrowingStatus::Returned),
            BorrowingStatus::Overdue => Some(BorrowingStatus::ReturnedLate),
            BorrowingStatus::Returned | BorrowingStatus::ReturnedLate => None,
        }
    }
}

impl std::fmt::Display for BorrowingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for BorrowingStatus {
    fn default() -> Self {
        BorrowingStatus::Active
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase", default)]
pub struct Borrowing {
    pub id: BorrowingId,
    pub book_id: BookId,
    /// Title of the book at the moment it was borrowed
    pub book_title: String,
    pub borrower_name: String,
    pub borrower_nim: String,
    pub borrower_class: String,
    pub borrow_date: Timestamp,
    pub due_date: Timestamp,
    pub return_date: Option<Timestamp>,
    pub status: BorrowingStatus,
    pub admin_id: AdminId,
    pub fine_amount: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase", default)]
pub struct BorrowRequest {
    pub book_id: BookId,
    pub borrower_name: String,
    pub borrower_nim: String,
    pub borrower_class: String,
    /// Operator recording the loan
    pub admin_id: AdminId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct ReturnRequest {
    pub borrower_nim: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Overdue,
    DueSoon,
    OnTrack,
}

/// Reminder shown for an open loan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub borrowing: Borrowing,
    pub urgency: Urgency,
    /// Days late for overdue loans, days left otherwise
    pub days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct LatenessRecord {
    pub borrowing: Borrowing,
    /// Days late so far for overdue loans, days late at return for late returns
    pub days_late: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct LibraryStatistics {
    pub total_books: usize,
    pub total_stock: u64,
    pub active_borrowings: usize,
    pub overdue_borrowings: usize,
    pub monthly_borrowings: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "snake_case")]
pub enum AdminRole {
    Admin,
    SuperAdmin,
}

impl Default for AdminRole {
    fn default() -> Self {
        AdminRole::Admin
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase", default)]
pub struct AdminUser {
    pub id: AdminId,
    pub email: String,
    pub name: String,
    pub role: AdminRole,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct AdminRegistration {
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct AdminRename {
    pub name: String,
}

/// Machine readable reason of a failed request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NoStock,
    DuplicateLoan,
    NotFound,
    InvalidTransition,
    ConcurrencyConflict,
    StoreUnavailable,
    MalformedDocument,
}

/// Body of every error response
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
}
