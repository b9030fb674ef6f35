use libraryservice_store::data_store::DataStoreError;

use crate::api::{BookId, BorrowingId, BorrowingStatus, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Book {0} is out of stock")]
    NoStock(BookId),

    #[error("Borrower {0} already holds a loan")]
    DuplicateLoan(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Borrowing {id} is {status}, operation not allowed")]
    InvalidTransition {
        id: BorrowingId,
        status: BorrowingStatus,
    },

    #[error("Concurrent modification of {0}")]
    ConcurrencyConflict(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Malformed document: {0}")]
    MalformedDocument(#[from] serde_json::Error),
}

impl DomainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::Validation(_) => ErrorKind::Validation,
            DomainError::NoStock(_) => ErrorKind::NoStock,
            DomainError::DuplicateLoan(_) => ErrorKind::DuplicateLoan,
            DomainError::NotFound(_) => ErrorKind::NotFound,
            DomainError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            DomainError::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            DomainError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            DomainError::MalformedDocument(_) => ErrorKind::MalformedDocument,
        }
    }
}

impl From<DataStoreError> for DomainError {
    fn from(err: DataStoreError) -> Self {
        match err {
            DataStoreError::NotFound { collection, id } => {
                DomainError::NotFound(format!("{id} in {collection}"))
            }
            DataStoreError::ConditionFailed { collection, id } => {
                DomainError::ConcurrencyConflict(format!("{id} in {collection}"))
            }
            DataStoreError::DeserializationError(err) => DomainError::MalformedDocument(err),
            DataStoreError::DatabaseFailure(err) => DomainError::StoreUnavailable(err.to_string()),
            DataStoreError::Unavailable(reason) => DomainError::StoreUnavailable(reason),
        }
    }
}

/// Fails with `Validation` when the trimmed value is empty, returns it trimmed otherwise
pub(crate) fn require_non_blank(field: &str, value: &str) -> Result<String, DomainError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(DomainError::Validation(format!("{field} must not be empty")))
    } else {
        Ok(trimmed.to_string())
    }
}

#[cfg(test)]
mod domain_error_tests {
    use super::*;

    #[test]
    fn store_errors_map_onto_domain_taxonomy() {
        assert!(matches!(
            DomainError::from(DataStoreError::condition_failed("books", "b1")),
            DomainError::ConcurrencyConflict(..)
        ));
        assert!(matches!(
            DomainError::from(DataStoreError::not_found("books", "b1")),
            DomainError::NotFound(..)
        ));
        assert!(matches!(
            DomainError::from(DataStoreError::Unavailable("timeout".to_string())),
            DomainError::StoreUnavailable(..)
        ));
    }

    #[test]
    fn refusals_keep_their_kind() {
        assert_eq!(DomainError::NoStock("b1".to_string()).kind(), ErrorKind::NoStock);
        assert_eq!(
            DomainError::DuplicateLoan("A".to_string()).kind(),
            ErrorKind::DuplicateLoan
        );
        assert_eq!(
            DomainError::from(DataStoreError::condition_failed("books", "b1")).kind(),
            ErrorKind::ConcurrencyConflict
        );
    }

    #[test]
    fn blank_values_are_rejected() {
        assert_eq!(require_non_blank("name", "  Ann ").unwrap(), "Ann");
        assert!(matches!(
            require_non_blank("name", "   "),
            Err(DomainError::Validation(..))
        ));
    }
}
