//! Loan lifecycle: borrow, return, lazy overdue detection and history cleanup.
//!
//! Stock and status changes are conditional writes against the value read just
//! before, so a concurrent writer makes the operation fail with
//! `ConcurrencyConflict` instead of overwriting. Borrow and return retry once
//! on such a conflict.

use std::future::Future;
use std::sync::Arc;

use futures_util::stream::{BoxStream, StreamExt};
use serde_json::json;

use libraryservice_store::api::FieldFilter;
use libraryservice_store::data_store::{DataStore, DataStoreError};

use crate::api::{
    BookId, BorrowRequest, Borrowing, BorrowingId, BorrowingStatus, LatenessRecord,
    LibraryStatistics, Notification, Timestamp, BORROWINGS_COLLECTION, LOAN_PERIOD_MILLIS,
};
use crate::catalog::CatalogService;
use crate::clock::Clock;
use crate::documents::{fields, from_document, from_documents, to_document};
use crate::error::{require_non_blank, DomainError};
use crate::views;

/// Attempts made to undo a stock change after the loan write failed
const COMPENSATION_ATTEMPTS: usize = 3;
const CLOSE_ATTEMPTS: usize = 2;

pub struct BorrowingService {
    store: Arc<dyn DataStore>,
    clock: Arc<dyn Clock>,
    catalog: Arc<CatalogService>,
}

impl BorrowingService {
    pub fn new(
        store: Arc<dyn DataStore>,
        clock: Arc<dyn Clock>,
        catalog: Arc<CatalogService>,
    ) -> Self {
        Self {
            store,
            clock,
            catalog,
        }
    }

    /// Lends one copy of the book to the borrower
    pub async fn borrow(&self, request: BorrowRequest) -> Result<Borrowing, DomainError> {
        let request = BorrowRequest {
            book_id: require_non_blank("bookId", &request.book_id)?,
            borrower_name: require_non_blank("borrowerName", &request.borrower_name)?,
            borrower_nim: require_non_blank("borrowerNim", &request.borrower_nim)?,
            borrower_class: require_non_blank("borrowerClass", &request.borrower_class)?,
            admin_id: request.admin_id.trim().to_string(),
        };
        retry_on_conflict("Borrow", || self.try_borrow(&request)).await
    }

    async fn try_borrow(&self, request: &BorrowRequest) -> Result<Borrowing, DomainError> {
        if !self.open_loans(&request.borrower_nim).await?.is_empty() {
            return Err(DomainError::DuplicateLoan(request.borrower_nim.clone()));
        }

        let book = self.catalog.take_copy(&request.book_id).await?;
        let now = self.clock.now();
        let borrowing = Borrowing {
            id: uuid::Uuid::new_v4().to_string(),
            book_id: book.id.clone(),
            book_title: book.title.clone(),
            borrower_name: request.borrower_name.clone(),
            borrower_nim: request.borrower_nim.clone(),
            borrower_class: request.borrower_class.clone(),
            borrow_date: now,
            due_date: now + LOAN_PERIOD_MILLIS,
            return_date: None,
            status: BorrowingStatus::Active,
            admin_id: request.admin_id.clone(),
            fine_amount: None,
        };

        let written = match to_document(&borrowing) {
            Ok(document) => self
                .store
                .set(BORROWINGS_COLLECTION, &borrowing.id, document)
                .await
                .map_err(DomainError::from),
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            tracing::warn!("Recording loan of book {} failed: {}", book.id, err);
            self.put_copy_back(&book.id).await;
            return Err(err);
        }

        // Another loan for the same borrower may have been written between the
        // check above and our write. The earliest one wins.
        let rival = match self.open_loans(&borrowing.borrower_nim).await {
            Ok(loans) => loans.into_iter().any(|other| {
                other.id != borrowing.id
                    && (other.borrow_date, &other.id) < (borrowing.borrow_date, &borrowing.id)
            }),
            Err(err) => {
                tracing::warn!(
                    "Checking loans of {} failed, withdrawing {}: {}",
                    borrowing.borrower_nim,
                    borrowing.id,
                    err
                );
                self.withdraw(&borrowing).await;
                return Err(err);
            }
        };
        if rival {
            tracing::warn!(
                "Concurrent loan detected for {}, withdrawing {}",
                borrowing.borrower_nim,
                borrowing.id
            );
            self.withdraw(&borrowing).await;
            return Err(DomainError::DuplicateLoan(borrowing.borrower_nim));
        }

        tracing::info!(
            "Book {} lent to {} as {}, due {}",
            borrowing.book_id,
            borrowing.borrower_nim,
            borrowing.id,
            borrowing.due_date
        );
        Ok(borrowing)
    }

    /// Closes the borrower's open loan and puts the copy back on the shelf
    pub async fn return_book(&self, borrower_nim: &str) -> Result<Borrowing, DomainError> {
        let borrower_nim = require_non_blank("borrowerNim", borrower_nim)?;
        self.try_return(&borrower_nim).await
    }

    async fn try_return(&self, borrower_nim: &str) -> Result<Borrowing, DomainError> {
        let stored = self
            .open_loans(borrower_nim)
            .await?
            .into_iter()
            .max_by_key(|borrowing| borrowing.borrow_date)
            .ok_or_else(|| DomainError::NotFound(format!("Open borrowing of {borrower_nim}")))?;

        let now = self.clock.now();
        closing_status(&stored, now)?;

        // Only the stock write is retried, the loan write follows its stored status
        let released =
            retry_on_conflict("Return", || self.catalog.release_copy(&stored.book_id)).await?;
        if released.is_none() {
            tracing::warn!(
                "Book {} of borrowing {} is no longer in the catalog, stock left untouched",
                stored.book_id,
                stored.id
            );
        }

        let book_id = stored.book_id.clone();
        match self.close_loan(stored, now).await {
            Ok(closed) => {
                tracing::info!(
                    "Borrowing {} of {} closed as {}",
                    closed.id,
                    borrower_nim,
                    closed.status
                );
                Ok(closed)
            }
            Err(err) => {
                tracing::warn!("Closing loan of {} failed: {}", borrower_nim, err);
                if released.is_some() {
                    self.take_copy_back(&book_id).await;
                }
                Err(err)
            }
        }
    }

    /// Writes the closing status of an open loan. When the stored status moved on meanwhile
    /// (an overdue mark) the loan is read again and closed from where it stands now.
    /// A loan closed or removed by someone else is not found.
    async fn close_loan(
        &self,
        mut loan: Borrowing,
        now: Timestamp,
    ) -> Result<Borrowing, DomainError> {
        for _ in 0..CLOSE_ATTEMPTS {
            let status = closing_status(&loan, now)?;
            let closed = self
                .store
                .update_if(
                    BORROWINGS_COLLECTION,
                    &loan.id,
                    &[FieldFilter::new("status", loan.status.as_str())],
                    fields([("status", json!(status.as_str())), ("returnDate", json!(now))]),
                )
                .await;
            match closed {
                Ok(()) => {
                    return Ok(Borrowing {
                        status,
                        return_date: Some(now),
                        ..loan
                    })
                }
                Err(DataStoreError::ConditionFailed { .. }) => {}
                Err(err) => return Err(err.into()),
            }

            let latest = self
                .store
                .get(BORROWINGS_COLLECTION, &loan.id)
                .await?
                .map(from_document::<Borrowing>)
                .transpose()?;
            match latest {
                Some(latest) if latest.status.is_open() => {
                    tracing::info!(
                        "Borrowing {} moved to {} while closing, retrying",
                        loan.id,
                        latest.status
                    );
                    loan = latest;
                }
                _ => return Err(DomainError::NotFound(format!("Open borrowing {}", loan.id))),
            }
        }
        Err(DomainError::ConcurrencyConflict(format!("Borrowing {}", loan.id)))
    }

    /// All loans in the given status (all when `None`), newest first.
    /// Stale active loans are reported overdue and their status is persisted in the background.
    pub async fn list_borrowings(
        &self,
        status: Option<BorrowingStatus>,
    ) -> Result<Vec<Borrowing>, DomainError> {
        let (borrowings, now) = self.observe().await?;
        Ok(views::filter_by_status(&borrowings, status, now))
    }

    pub async fn search_borrowings(&self, query: &str) -> Result<Vec<Borrowing>, DomainError> {
        let (borrowings, now) = self.observe().await?;
        Ok(views::search_borrowings(&borrowings, query, now))
    }

    pub async fn lateness_history(&self) -> Result<Vec<Borrowing>, DomainError> {
        let (borrowings, now) = self.observe().await?;
        Ok(views::lateness_history(&borrowings, now))
    }

    pub async fn currently_overdue(&self) -> Result<Vec<Borrowing>, DomainError> {
        let (borrowings, now) = self.observe().await?;
        Ok(views::currently_overdue(&borrowings, now))
    }

    pub async fn overdue_count(&self) -> Result<usize, DomainError> {
        let (borrowings, now) = self.observe().await?;
        Ok(views::currently_overdue_count(&borrowings, now))
    }

    pub async fn returned_late(&self) -> Result<Vec<Borrowing>, DomainError> {
        let borrowings = self.all_borrowings().await?;
        Ok(views::returned_late(&borrowings))
    }

    pub async fn notifications(&self) -> Result<Vec<Notification>, DomainError> {
        let (borrowings, now) = self.observe().await?;
        Ok(views::notifications(&borrowings, now))
    }

    pub async fn lateness_details(
        &self,
        borrowing_id: &str,
    ) -> Result<LatenessRecord, DomainError> {
        let borrowing = self.find_borrowing(borrowing_id).await?;
        Ok(views::lateness_record(&borrowing, self.clock.now()))
    }

    pub async fn statistics(&self) -> Result<LibraryStatistics, DomainError> {
        let books = self.catalog.list_books().await?;
        let (borrowings, now) = self.observe().await?;
        Ok(views::library_statistics(&books, &borrowings, now))
    }

    /// The loan as it stands now, stale active loans reported overdue
    pub async fn get_borrowing(&self, borrowing_id: &str) -> Result<Borrowing, DomainError> {
        let borrowing = self.find_borrowing(borrowing_id).await?;
        Ok(views::with_current_status(&borrowing, self.clock.now()))
    }

    /// Removes a closed loan from the history, stock is not affected
    pub async fn delete_history(&self, borrowing_id: &str) -> Result<(), DomainError> {
        let borrowing = self.find_borrowing(borrowing_id).await?;
        if !borrowing.status.is_terminal() {
            return Err(DomainError::InvalidTransition {
                id: borrowing.id,
                status: borrowing.status,
            });
        }
        self.store
            .delete(BORROWINGS_COLLECTION, borrowing_id)
            .await?;
        tracing::info!("Borrowing {} removed from history", borrowing_id);
        Ok(())
    }

    /// Persists the overdue status of every stale active loan, returns how many were marked
    pub async fn sweep_overdue(&self) -> Result<usize, DomainError> {
        let now = self.clock.now();
        let mut marked = 0;
        for borrowing in self.all_borrowings().await? {
            if views::needs_overdue_mark(&borrowing, now)
                && mark_overdue(self.store.as_ref(), &borrowing.id).await?
            {
                marked += 1;
            }
        }
        Ok(marked)
    }

    /// Live view of all loans, newest first, with stale active loans reported overdue
    pub fn subscribe_borrowings(&self) -> BoxStream<'static, Result<Vec<Borrowing>, DomainError>> {
        let store = self.store.clone();
        let clock = self.clock.clone();
        self.store
            .subscribe(BORROWINGS_COLLECTION, vec![])
            .map(move |snapshot| {
                let borrowings: Vec<Borrowing> = from_documents(snapshot?)?;
                let now = clock.now();
                persist_overdue_in_background(store.clone(), &borrowings, now);
                Ok(views::filter_by_status(&borrowings, None, now))
            })
            .boxed()
    }

    async fn all_borrowings(&self) -> Result<Vec<Borrowing>, DomainError> {
        from_documents(self.store.query(BORROWINGS_COLLECTION, &[]).await?)
    }

    /// Reads every loan and starts persisting the ones that became overdue
    async fn observe(&self) -> Result<(Vec<Borrowing>, Timestamp), DomainError> {
        let borrowings = self.all_borrowings().await?;
        let now = self.clock.now();
        persist_overdue_in_background(self.store.clone(), &borrowings, now);
        Ok((borrowings, now))
    }

    async fn open_loans(&self, borrower_nim: &str) -> Result<Vec<Borrowing>, DomainError> {
        let loans: Vec<Borrowing> = from_documents(
            self.store
                .query(
                    BORROWINGS_COLLECTION,
                    &[FieldFilter::new("borrowerNim", borrower_nim)],
                )
                .await?,
        )?;
        Ok(loans
            .into_iter()
            .filter(|borrowing| borrowing.status.is_open())
            .collect())
    }

    async fn find_borrowing(&self, borrowing_id: &str) -> Result<Borrowing, DomainError> {
        self.store
            .get(BORROWINGS_COLLECTION, borrowing_id)
            .await?
            .map(from_document)
            .transpose()?
            .ok_or_else(|| DomainError::NotFound(format!("Borrowing {borrowing_id}")))
    }

    /// Removes a loan written by a borrow that did not go through and puts its copy back.
    /// While the record cannot be removed its copy stays lent.
    async fn withdraw(&self, borrowing: &Borrowing) {
        for _ in 0..COMPENSATION_ATTEMPTS {
            match self.store.delete(BORROWINGS_COLLECTION, &borrowing.id).await {
                Ok(_) => {
                    self.put_copy_back(&borrowing.book_id).await;
                    return;
                }
                Err(err) => {
                    tracing::warn!("Failed to withdraw borrowing {}: {}", borrowing.id, err)
                }
            }
        }
        tracing::warn!(
            "Gave up withdrawing borrowing {}, book {} stays lent",
            borrowing.id,
            borrowing.book_id
        );
    }

    async fn put_copy_back(&self, book_id: &BookId) {
        for _ in 0..COMPENSATION_ATTEMPTS {
            match self.catalog.release_copy(book_id).await {
                Ok(_) => return,
                Err(DomainError::ConcurrencyConflict(_)) => continue,
                Err(err) => {
                    tracing::warn!("Failed to restore stock of book {}: {}", book_id, err);
                    return;
                }
            }
        }
        tracing::warn!("Gave up restoring stock of book {}", book_id);
    }

    async fn take_copy_back(&self, book_id: &BookId) {
        for _ in 0..COMPENSATION_ATTEMPTS {
            match self.catalog.take_copy(book_id).await {
                Ok(_) => return,
                Err(DomainError::ConcurrencyConflict(_)) => continue,
                Err(err) => {
                    tracing::warn!("Failed to revert stock of book {}: {}", book_id, err);
                    return;
                }
            }
        }
        tracing::warn!("Gave up reverting stock of book {}", book_id);
    }
}

fn closing_status(loan: &Borrowing, now: Timestamp) -> Result<BorrowingStatus, DomainError> {
    let current = views::with_current_status(loan, now);
    current
        .status
        .after_return()
        .ok_or(DomainError::InvalidTransition {
            id: current.id,
            status: current.status,
        })
}

/// Runs the operation again once if it lost a race with another writer
async fn retry_on_conflict<T, F, Fut>(operation: &str, mut attempt: F) -> Result<T, DomainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DomainError>>,
{
    match attempt().await {
        Err(DomainError::ConcurrencyConflict(what)) => {
            tracing::info!("{} conflicted on {}, retrying", operation, what);
            attempt().await
        }
        result => result,
    }
}

/// Moves an active loan to overdue. Returns false when the loan was not active anymore.
pub(crate) async fn mark_overdue(
    store: &dyn DataStore,
    borrowing_id: &BorrowingId,
) -> Result<bool, DomainError> {
    let marked = store
        .update_if(
            BORROWINGS_COLLECTION,
            borrowing_id,
            &[FieldFilter::new("status", BorrowingStatus::Active.as_str())],
            fields([("status", json!(BorrowingStatus::Overdue.as_str()))]),
        )
        .await;
    match marked {
        Ok(()) => {
            tracing::info!("Borrowing {} is overdue", borrowing_id);
            Ok(true)
        }
        Err(DataStoreError::ConditionFailed { .. }) | Err(DataStoreError::NotFound { .. }) => {
            tracing::debug!("Borrowing {} no longer active, not marked", borrowing_id);
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

fn persist_overdue_in_background(
    store: Arc<dyn DataStore>,
    borrowings: &[Borrowing],
    now: Timestamp,
) {
    let stale: Vec<BorrowingId> = borrowings
        .iter()
        .filter(|borrowing| views::needs_overdue_mark(borrowing, now))
        .map(|borrowing| borrowing.id.clone())
        .collect();
    if stale.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for borrowing_id in stale {
            if let Err(err) = mark_overdue(store.as_ref(), &borrowing_id).await {
                tracing::warn!("Failed to mark borrowing {} overdue: {}", borrowing_id, err);
            }
        }
    });
}

#[cfg(test)]
mod borrowing_service_tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use libraryservice_store::api::{Document, DocumentStream};
    use libraryservice_store::data_store::InMemoryDataStore;

    use crate::api::{BookDetails, Urgency, BOOKS_COLLECTION, DAY_MILLIS};
    use crate::clock::ManualClock;

    use super::*;

    const T: Timestamp = 1_710_496_800_000;

    struct Library {
        store: Arc<dyn DataStore>,
        clock: Arc<ManualClock>,
        catalog: Arc<CatalogService>,
        borrowings: BorrowingService,
    }

    fn library_with(store: Arc<dyn DataStore>) -> Library {
        let clock = Arc::new(ManualClock::new(T));
        let catalog = Arc::new(CatalogService::new(store.clone(), clock.clone()));
        let borrowings = BorrowingService::new(store.clone(), clock.clone(), catalog.clone());
        Library {
            store,
            clock,
            catalog,
            borrowings,
        }
    }

    fn library() -> Library {
        library_with(Arc::new(InMemoryDataStore::default()))
    }

    impl Library {
        async fn add_book(&self, title: &str, stock: u32) -> BookId {
            self.catalog
                .add_book(BookDetails {
                    title: title.to_string(),
                    author: "Author".to_string(),
                    category: "Novel".to_string(),
                    stock,
                    ..BookDetails::default()
                })
                .await
                .unwrap()
                .id
        }

        async fn stock(&self, book_id: &str) -> u32 {
            self.catalog.get_book(book_id).await.unwrap().stock
        }

        async fn stored(&self, borrowing_id: &str) -> Option<Borrowing> {
            self.store
                .get(BORROWINGS_COLLECTION, borrowing_id)
                .await
                .unwrap()
                .map(|document| from_document(document).unwrap())
        }
    }

    fn request(book_id: &str, nim: &str) -> BorrowRequest {
        BorrowRequest {
            book_id: book_id.to_string(),
            borrower_name: format!("Borrower {nim}"),
            borrower_nim: nim.to_string(),
            borrower_class: "TI-1".to_string(),
            admin_id: "admin-1".to_string(),
        }
    }

    #[tokio::test]
    /// Last copy scenario
    /// 1. Borrow by A takes the only copy
    /// 2. Borrow by B fails with no stock
    /// 3. Return by A puts the copy back and closes the loan as returned
    async fn test_last_copy_borrow_and_return() {
        let library = library();
        let book_id = library.add_book("Dune", 1).await;

        let loan = library.borrowings.borrow(request(&book_id, "A")).await.unwrap();
        assert_eq!(loan.status, BorrowingStatus::Active);
        assert_eq!(loan.book_title, "Dune");
        assert_eq!(loan.borrow_date, T);
        assert_eq!(loan.due_date - loan.borrow_date, 604_800_000);
        assert_eq!(loan.return_date, None);
        assert_eq!(library.stock(&book_id).await, 0);

        let second = library.borrowings.borrow(request(&book_id, "B")).await;
        assert!(matches!(second, Err(DomainError::NoStock(..))));
        assert_eq!(library.stock(&book_id).await, 0);

        library.clock.advance(DAY_MILLIS);
        let returned = library.borrowings.return_book("A").await.unwrap();
        assert_eq!(returned.status, BorrowingStatus::Returned);
        assert_eq!(returned.return_date, Some(T + DAY_MILLIS));
        assert_eq!(library.stock(&book_id).await, 1);

        let stored = library.stored(&loan.id).await.unwrap();
        assert_eq!(stored, returned);
        assert_eq!(library.borrowings.list_borrowings(None).await.unwrap(), vec![stored]);
    }

    #[tokio::test]
    /// Borrow then immediate return restores stock and leaves one returned record
    async fn test_borrow_then_return_restores_stock() {
        let library = library();
        let book_id = library.add_book("1984", 3).await;

        library.borrowings.borrow(request(&book_id, "A")).await.unwrap();
        let returned = library.borrowings.return_book(" A ").await.unwrap();

        assert_eq!(library.stock(&book_id).await, 3);
        let all = library.borrowings.list_borrowings(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, BorrowingStatus::Returned);
        assert!(returned.return_date.unwrap() >= returned.borrow_date);
    }

    #[tokio::test]
    /// A borrower holds at most one loan, blank fields are rejected
    async fn test_borrow_preconditions() {
        let library = library();
        let dune = library.add_book("Dune", 2).await;
        let emma = library.add_book("Emma", 2).await;

        library.borrowings.borrow(request(&dune, "A")).await.unwrap();
        let duplicate = library.borrowings.borrow(request(&emma, "A")).await;
        assert!(matches!(duplicate, Err(DomainError::DuplicateLoan(..))));
        assert_eq!(library.stock(&emma).await, 2);

        let blank_name = library
            .borrowings
            .borrow(BorrowRequest {
                borrower_name: "  ".to_string(),
                ..request(&dune, "B")
            })
            .await;
        assert!(matches!(blank_name, Err(DomainError::Validation(..))));

        let unknown_book = library.borrowings.borrow(request("missing", "B")).await;
        assert!(matches!(unknown_book, Err(DomainError::NotFound(..))));
        assert_eq!(library.stock(&dune).await, 1);

        let no_loan = library.borrowings.return_book("B").await;
        assert!(matches!(no_loan, Err(DomainError::NotFound(..))));

        // Once returned, the borrower may borrow again
        library.borrowings.return_book("A").await.unwrap();
        library.borrowings.borrow(request(&emma, "A")).await.unwrap();
    }

    #[tokio::test]
    /// Overdue handling
    /// 1. Loan past due is listed as overdue before it is persisted
    /// 2. Sweep persists the overdue status once
    /// 3. Returning it closes the loan as returned late
    async fn test_overdue_loan_returned_late() {
        let library = library();
        let book_id = library.add_book("Dune", 1).await;
        let loan = library.borrowings.borrow(request(&book_id, "A")).await.unwrap();

        library.clock.advance(9 * DAY_MILLIS);
        let listed = library
            .borrowings
            .list_borrowings(Some(BorrowingStatus::Overdue))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, loan.id);
        assert_eq!(views::days_overdue(&listed[0], library.clock.now()), 2);
        assert_eq!(library.borrowings.overdue_count().await.unwrap(), 1);

        library.borrowings.sweep_overdue().await.unwrap();
        assert_eq!(library.borrowings.sweep_overdue().await.unwrap(), 0);
        assert_eq!(
            library.stored(&loan.id).await.unwrap().status,
            BorrowingStatus::Overdue
        );

        let details = library.borrowings.lateness_details(&loan.id).await.unwrap();
        assert_eq!(details.days_late, Some(2));

        let returned = library.borrowings.return_book("A").await.unwrap();
        assert_eq!(returned.status, BorrowingStatus::ReturnedLate);
        assert_eq!(library.stock(&book_id).await, 1);
        assert_eq!(
            library.borrowings.returned_late().await.unwrap(),
            vec![returned]
        );
        assert_eq!(library.borrowings.overdue_count().await.unwrap(), 0);
    }

    #[tokio::test]
    /// Marking twice changes the status once
    async fn test_overdue_mark_is_idempotent() {
        let library = library();
        let book_id = library.add_book("Dune", 1).await;
        let loan = library.borrowings.borrow(request(&book_id, "A")).await.unwrap();
        library.clock.advance(8 * DAY_MILLIS);

        assert!(mark_overdue(library.store.as_ref(), &loan.id).await.unwrap());
        assert!(!mark_overdue(library.store.as_ref(), &loan.id).await.unwrap());
        assert!(!mark_overdue(library.store.as_ref(), &"missing".to_string())
            .await
            .unwrap());
        assert_eq!(
            library.stored(&loan.id).await.unwrap().status,
            BorrowingStatus::Overdue
        );
    }

    #[tokio::test]
    /// Past due loan not yet marked is still returned late
    async fn test_stale_active_loan_returned_late() {
        let library = library();
        let book_id = library.add_book("Dune", 1).await;
        library.borrowings.borrow(request(&book_id, "A")).await.unwrap();

        library.clock.advance(8 * DAY_MILLIS);
        let returned = library.borrowings.return_book("A").await.unwrap();
        assert_eq!(returned.status, BorrowingStatus::ReturnedLate);
    }

    #[tokio::test]
    /// A loan returned exactly at its due date is on time, a millisecond later it is late
    async fn test_return_at_due_date_boundary() {
        let library = library();
        let book_id = library.add_book("Dune", 2).await;
        let on_time = library.borrowings.borrow(request(&book_id, "A")).await.unwrap();
        let late = library.borrowings.borrow(request(&book_id, "B")).await.unwrap();

        library.clock.set(on_time.due_date);
        assert_eq!(library.borrowings.overdue_count().await.unwrap(), 0);
        let returned = library.borrowings.return_book("A").await.unwrap();
        assert_eq!(returned.status, BorrowingStatus::Returned);

        library.clock.set(late.due_date + 1);
        let returned = library.borrowings.return_book("B").await.unwrap();
        assert_eq!(returned.status, BorrowingStatus::ReturnedLate);
        assert_eq!(returned.return_date, Some(late.due_date + 1));
        assert_eq!(library.stock(&book_id).await, 2);
    }

    #[tokio::test]
    /// Only closed loans can be removed from history
    async fn test_history_deletion() {
        let library = library();
        let book_id = library.add_book("Dune", 1).await;
        let loan = library.borrowings.borrow(request(&book_id, "A")).await.unwrap();

        let open = library.borrowings.delete_history(&loan.id).await;
        assert!(matches!(open, Err(DomainError::InvalidTransition { .. })));

        library.borrowings.return_book("A").await.unwrap();
        library.borrowings.delete_history(&loan.id).await.unwrap();
        assert_eq!(library.stored(&loan.id).await, None);
        assert_eq!(library.stock(&book_id).await, 1);

        let gone = library.borrowings.get_borrowing(&loan.id).await;
        assert!(matches!(gone, Err(DomainError::NotFound(..))));
    }

    #[tokio::test]
    /// Notifications, search and statistics over the live data
    async fn test_derived_views() {
        let library = library();
        let dune = library.add_book("Dune", 2).await;
        let emma = library.add_book("Emma", 1).await;

        let early = library.borrowings.borrow(request(&dune, "A")).await.unwrap();
        library.clock.advance(6 * DAY_MILLIS);
        let late = library.borrowings.borrow(request(&emma, "B")).await.unwrap();
        library.clock.advance(2 * DAY_MILLIS);

        let notifications = library.borrowings.notifications().await.unwrap();
        let urgencies: Vec<(BorrowingId, Urgency)> = notifications
            .into_iter()
            .map(|notification| (notification.borrowing.id, notification.urgency))
            .collect();
        assert_eq!(
            urgencies,
            vec![
                (early.id.clone(), Urgency::Overdue),
                (late.id.clone(), Urgency::OnTrack)
            ]
        );

        let found = library.borrowings.search_borrowings("emma").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, late.id);

        assert_eq!(
            library.borrowings.currently_overdue().await.unwrap()[0].id,
            early.id
        );
        assert_eq!(library.borrowings.lateness_history().await.unwrap().len(), 1);

        let statistics = library.borrowings.statistics().await.unwrap();
        assert_eq!(statistics.total_books, 2);
        assert_eq!(statistics.total_stock, 1);
        assert_eq!(statistics.active_borrowings, 1);
        assert_eq!(statistics.overdue_borrowings, 1);
        assert_eq!(statistics.monthly_borrowings, 2);
    }

    #[tokio::test]
    async fn test_borrowings_subscription() {
        let library = library();
        let book_id = library.add_book("Dune", 1).await;
        let mut updates = library.borrowings.subscribe_borrowings();
        assert_eq!(updates.next().await.unwrap().unwrap(), vec![]);

        library.borrowings.borrow(request(&book_id, "A")).await.unwrap();
        let snapshot = updates.next().await.unwrap().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].borrower_nim, "A");
    }

    /// Store that can lose stock and loan races, fail loan writes or slip in a rival loan
    #[derive(Default)]
    struct FaultyStore {
        inner: InMemoryDataStore,
        stock_conflicts: AtomicUsize,
        borrowing_conflicts: AtomicUsize,
        borrowing_updates: AtomicUsize,
        failed_borrowing_deletes: AtomicUsize,
        fail_borrowing_writes: AtomicBool,
        fail_queries_after_loan_write: bool,
        loan_written: AtomicBool,
        rival_loan: Mutex<Option<Borrowing>>,
        /// On the next loan update, marks the loan overdue and lends the last copy of this book
        interfere_on_close: Mutex<Option<BookId>>,
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn timed_out() -> DataStoreError {
        DataStoreError::Unavailable("write timed out".to_string())
    }

    #[async_trait::async_trait]
    impl DataStore for FaultyStore {
        async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, DataStoreError> {
            self.inner.get(collection, id).await
        }

        async fn query(
            &self,
            collection: &str,
            filters: &[FieldFilter],
        ) -> Result<Vec<Document>, DataStoreError> {
            if collection == BORROWINGS_COLLECTION
                && self.fail_queries_after_loan_write
                && self.loan_written.load(Ordering::SeqCst)
            {
                return Err(DataStoreError::Unavailable("query timed out".to_string()));
            }
            self.inner.query(collection, filters).await
        }

        async fn set(
            &self,
            collection: &str,
            id: &str,
            document: Document,
        ) -> Result<(), DataStoreError> {
            if collection == BORROWINGS_COLLECTION {
                if self.fail_borrowing_writes.load(Ordering::SeqCst) {
                    return Err(timed_out());
                }
                let rival = self.rival_loan.lock().unwrap().take();
                if let Some(rival) = rival {
                    self.inner
                        .set(collection, &rival.id, to_document(&rival).unwrap())
                        .await?;
                }
                self.inner.set(collection, id, document).await?;
                self.loan_written.store(true, Ordering::SeqCst);
                return Ok(());
            }
            self.inner.set(collection, id, document).await
        }

        async fn update(
            &self,
            collection: &str,
            id: &str,
            fields: Document,
        ) -> Result<(), DataStoreError> {
            self.inner.update(collection, id, fields).await
        }

        async fn update_if(
            &self,
            collection: &str,
            id: &str,
            expected: &[FieldFilter],
            fields: Document,
        ) -> Result<(), DataStoreError> {
            if collection == BOOKS_COLLECTION && take_one(&self.stock_conflicts) {
                return Err(DataStoreError::condition_failed(collection, id));
            }
            if collection == BORROWINGS_COLLECTION {
                self.borrowing_updates.fetch_add(1, Ordering::SeqCst);
                if self.fail_borrowing_writes.load(Ordering::SeqCst) {
                    return Err(timed_out());
                }
                if take_one(&self.borrowing_conflicts) {
                    return Err(DataStoreError::condition_failed(collection, id));
                }
                let interfering = self.interfere_on_close.lock().unwrap().take();
                if let Some(book_id) = interfering {
                    self.inner
                        .update(
                            collection,
                            id,
                            crate::documents::fields([("status", json!(BorrowingStatus::Overdue.as_str()))]),
                        )
                        .await?;
                    self.inner
                        .update(BOOKS_COLLECTION, &book_id, crate::documents::fields([("stock", json!(0))]))
                        .await?;
                }
            }
            self.inner.update_if(collection, id, expected, fields).await
        }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, DataStoreError> {
            self.inner.delete(collection, id).await
        }

        fn subscribe(&self, collection: &str, filters: Vec<FieldFilter>) -> DocumentStream {
            self.inner.subscribe(collection, filters)
        }
    }

    #[tokio::test]
    /// A single lost stock race is retried, a second one is reported
    async fn test_conflict_is_retried_once() {
        let store = Arc::new(FaultyStore::default());
        let library = library_with(store.clone());
        let book_id = library.add_book("Dune", 2).await;

        store.stock_conflicts.store(1, Ordering::SeqCst);
        library.borrowings.borrow(request(&book_id, "A")).await.unwrap();
        assert_eq!(library.stock(&book_id).await, 1);

        store.stock_conflicts.store(2, Ordering::SeqCst);
        let conflicted = library.borrowings.borrow(request(&book_id, "B")).await;
        assert!(matches!(
            conflicted,
            Err(DomainError::ConcurrencyConflict(..))
        ));
        assert_eq!(library.stock(&book_id).await, 1);
        assert_eq!(library.borrowings.list_borrowings(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    /// Stock taken for a loan that could not be recorded is put back
    async fn test_failed_loan_write_restores_stock() {
        let store = Arc::new(FaultyStore {
            fail_borrowing_writes: AtomicBool::new(true),
            ..FaultyStore::default()
        });
        let library = library_with(store);
        let book_id = library.add_book("Dune", 1).await;

        let failed = library.borrowings.borrow(request(&book_id, "A")).await;
        assert!(matches!(failed, Err(DomainError::StoreUnavailable(..))));
        assert_eq!(library.stock(&book_id).await, 1);
    }

    #[tokio::test]
    /// A loan written concurrently for the same borrower wins, ours is withdrawn
    async fn test_concurrent_duplicate_loan_is_withdrawn() {
        let store = Arc::new(FaultyStore::default());
        let library = library_with(store.clone());
        let book_id = library.add_book("Dune", 2).await;

        *store.rival_loan.lock().unwrap() = Some(Borrowing {
            id: "rival".to_string(),
            book_id: book_id.clone(),
            borrower_nim: "A".to_string(),
            borrow_date: T - 1,
            due_date: T - 1 + LOAN_PERIOD_MILLIS,
            ..Borrowing::default()
        });

        let withdrawn = library.borrowings.borrow(request(&book_id, "A")).await;
        assert!(matches!(withdrawn, Err(DomainError::DuplicateLoan(..))));
        assert_eq!(library.stock(&book_id).await, 2);
        let remaining: Vec<BorrowingId> = library
            .borrowings
            .list_borrowings(None)
            .await
            .unwrap()
            .into_iter()
            .map(|borrowing| borrowing.id)
            .collect();
        assert_eq!(remaining, vec!["rival".to_string()]);
    }

    #[tokio::test]
    /// Loan marked overdue and its copy lent again while it is being returned
    /// 1. The close follows the overdue mark and ends as returned late
    /// 2. The released copy stays with the other borrower, stock is not inflated
    async fn test_return_follows_concurrent_overdue_mark() {
        let store = Arc::new(FaultyStore::default());
        let library = library_with(store.clone());
        let book_id = library.add_book("Dune", 1).await;
        let loan = library.borrowings.borrow(request(&book_id, "A")).await.unwrap();

        library.clock.advance(8 * DAY_MILLIS);
        *store.interfere_on_close.lock().unwrap() = Some(book_id.clone());
        let returned = library.borrowings.return_book("A").await.unwrap();

        assert_eq!(returned.status, BorrowingStatus::ReturnedLate);
        assert_eq!(returned.return_date, Some(T + 8 * DAY_MILLIS));
        assert_eq!(library.stock(&book_id).await, 0);
        assert_eq!(library.stored(&loan.id).await.unwrap(), returned);
        assert_eq!(store.borrowing_updates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    /// A loan update lost to an unchanged loan is written again once, stock moves once
    async fn test_return_close_conflict_is_bounded() {
        let store = Arc::new(FaultyStore::default());
        let library = library_with(store.clone());
        let book_id = library.add_book("Dune", 1).await;
        let first = library.borrowings.borrow(request(&book_id, "A")).await.unwrap();

        store.borrowing_conflicts.store(1, Ordering::SeqCst);
        let returned = library.borrowings.return_book("A").await.unwrap();
        assert_eq!(returned.status, BorrowingStatus::Returned);
        assert_eq!(library.stock(&book_id).await, 1);
        assert_eq!(store.borrowing_updates.load(Ordering::SeqCst), 2);

        let second = library.borrowings.borrow(request(&book_id, "B")).await.unwrap();
        store.borrowing_updates.store(0, Ordering::SeqCst);
        store.borrowing_conflicts.store(3, Ordering::SeqCst);
        let conflicted = library.borrowings.return_book("B").await;
        assert!(matches!(
            conflicted,
            Err(DomainError::ConcurrencyConflict(..))
        ));
        assert_eq!(store.borrowing_updates.load(Ordering::SeqCst), 2);
        assert_eq!(store.borrowing_conflicts.load(Ordering::SeqCst), 1);
        assert_eq!(library.stock(&book_id).await, 0);
        assert_eq!(
            library.stored(&second.id).await.unwrap().status,
            BorrowingStatus::Active
        );
        assert_eq!(
            library.stored(&first.id).await.unwrap().status,
            BorrowingStatus::Returned
        );
    }

    #[tokio::test]
    /// Copy released for a loan that could not be closed is taken back
    async fn test_failed_close_restores_stock() {
        let store = Arc::new(FaultyStore::default());
        let library = library_with(store.clone());
        let book_id = library.add_book("Dune", 2).await;
        let loan = library.borrowings.borrow(request(&book_id, "A")).await.unwrap();

        store.fail_borrowing_writes.store(true, Ordering::SeqCst);
        let failed = library.borrowings.return_book("A").await;
        assert!(matches!(failed, Err(DomainError::StoreUnavailable(..))));
        assert_eq!(library.stock(&book_id).await, 1);
        assert_eq!(
            library.stored(&loan.id).await.unwrap().status,
            BorrowingStatus::Active
        );

        store.fail_borrowing_writes.store(false, Ordering::SeqCst);
        library.borrowings.return_book("A").await.unwrap();
        assert_eq!(library.stock(&book_id).await, 2);
    }

    #[tokio::test]
    /// A single lost stock race on return is retried, a second one is reported untouched
    async fn test_return_stock_conflict_is_retried_once() {
        let store = Arc::new(FaultyStore::default());
        let library = library_with(store.clone());
        let book_id = library.add_book("Dune", 1).await;
        let loan = library.borrowings.borrow(request(&book_id, "A")).await.unwrap();

        store.stock_conflicts.store(3, Ordering::SeqCst);
        let conflicted = library.borrowings.return_book("A").await;
        assert!(matches!(
            conflicted,
            Err(DomainError::ConcurrencyConflict(..))
        ));
        assert_eq!(store.stock_conflicts.load(Ordering::SeqCst), 1);
        assert_eq!(library.stock(&book_id).await, 0);
        assert!(library.stored(&loan.id).await.unwrap().status.is_open());

        store.stock_conflicts.store(1, Ordering::SeqCst);
        library.borrowings.return_book("A").await.unwrap();
        assert_eq!(library.stock(&book_id).await, 1);
    }

    #[tokio::test]
    /// Loan written but the follow-up check failed: the loan is withdrawn and stock restored
    async fn test_failed_rival_check_withdraws_loan() {
        let store = Arc::new(FaultyStore {
            fail_queries_after_loan_write: true,
            ..FaultyStore::default()
        });
        let library = library_with(store.clone());
        let book_id = library.add_book("Dune", 1).await;

        let failed = library.borrowings.borrow(request(&book_id, "A")).await;
        assert!(matches!(failed, Err(DomainError::StoreUnavailable(..))));
        assert_eq!(library.stock(&book_id).await, 1);
        assert!(store
            .inner
            .query(BORROWINGS_COLLECTION, &[])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    /// Withdrawing a duplicate loan retries the removal, a loan that cannot be removed keeps its copy
    async fn test_duplicate_withdrawal_survives_failed_delete() {
        let store = Arc::new(FaultyStore::default());
        let library = library_with(store.clone());
        let book_id = library.add_book("Dune", 3).await;
        let rival = |id: &str, nim: &str| Borrowing {
            id: id.to_string(),
            book_id: book_id.clone(),
            borrower_nim: nim.to_string(),
            borrow_date: T - 1,
            due_date: T - 1 + LOAN_PERIOD_MILLIS,
            ..Borrowing::default()
        };

        *store.rival_loan.lock().unwrap() = Some(rival("rival-a", "A"));
        store.failed_borrowing_deletes.store(1, Ordering::SeqCst);
        let withdrawn = library.borrowings.borrow(request(&book_id, "A")).await;
        assert!(matches!(withdrawn, Err(DomainError::DuplicateLoan(..))));
        assert_eq!(library.stock(&book_id).await, 3);
        assert_eq!(store.inner.query(BORROWINGS_COLLECTION, &[]).await.unwrap().len(), 1);

        *store.rival_loan.lock().unwrap() = Some(rival("rival-b", "B"));
        store.failed_borrowing_deletes.store(COMPENSATION_ATTEMPTS, Ordering::SeqCst);
        let kept = library.borrowings.borrow(request(&book_id, "B")).await;
        assert!(matches!(kept, Err(DomainError::DuplicateLoan(..))));
        assert_eq!(library.stock(&book_id).await, 2);
        assert_eq!(store.inner.query(BORROWINGS_COLLECTION, &[]).await.unwrap().len(), 3);
    }
}
