use anyhow::Context;
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_tracing::TracingMiddleware;
use serde::Serialize;

use crate::api::{
    AdminId, AdminRegistration, AdminRename, AdminUser, Book, BookDetails, BookId, BookPatch,
    BorrowRequest, Borrowing, BorrowingId, BorrowingStatus, ErrorKind, ErrorResponse,
    LatenessRecord, LibraryStatistics, Notification, ReturnRequest,
};
use crate::catalog::BookSortMode;

#[derive(Debug, Default, Serialize)]
struct BooksParams<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    query: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sort: Option<BookSortMode>,
}

#[derive(Debug, Default, Serialize)]
struct BorrowingsParams<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<BorrowingStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query: Option<&'a str>,
}

/// Why the service declined to record a loan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorrowRefusal {
    /// No copy of the book left on the shelf
    NoStock,
    /// The borrower already holds an open loan
    DuplicateLoan,
    /// Lost a race with another writer twice, worth trying again later
    Conflict,
}

pub struct LibraryServiceClient {
    url: String,
    client: ClientWithMiddleware,
}

async fn failure(response: reqwest::Response, what: &str) -> anyhow::Error {
    let status = response.status();
    let error = response
        .json::<ErrorResponse>()
        .await
        .map(|error| error.message)
        .unwrap_or_default();
    anyhow::anyhow!("Failed to {} ({}) {}", what, status, error)
}

impl LibraryServiceClient {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let reqwest_client = reqwest::Client::builder()
            .build()
            .context("Failed to build reqwest client")?;
        let client = ClientBuilder::new(reqwest_client)
            .with(TracingMiddleware::default())
            .build();

        Ok(Self {
            url: url.to_string(),
            client,
        })
    }

    /// Calls POST /api/books endpoint
    pub async fn add_book(&self, details: BookDetails) -> anyhow::Result<Book> {
        let response = self
            .client
            .post(format!("{}/api/books", self.url))
            .json(&details)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(failure(response, "add book").await)
        }
    }

    /// Calls GET /api/book/{book_id} endpoint
    /// None if the book is not in the catalog
    pub async fn get_book(&self, book_id: &BookId) -> anyhow::Result<Option<Book>> {
        let response = self
            .client
            .get(format!("{}/api/book/{}", self.url, book_id))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            Ok(None)
        } else if response.status().is_success() {
            Ok(Some(response.json().await?))
        } else {
            Err(failure(response, "get book").await)
        }
    }

    /// Calls PATCH /api/book/{book_id} endpoint
    pub async fn update_book(&self, book_id: &BookId, patch: BookPatch) -> anyhow::Result<Book> {
        let response = self
            .client
            .patch(format!("{}/api/book/{}", self.url, book_id))
            .json(&patch)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(failure(response, "update book").await)
        }
    }

    /// Calls DELETE /api/book/{book_id} endpoint
    /// Returns false if there was no such book
    pub async fn delete_book(&self, book_id: &BookId) -> anyhow::Result<bool> {
        let response = self
            .client
            .delete(format!("{}/api/book/{}", self.url, book_id))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            Ok(false)
        } else if response.status().is_success() {
            Ok(true)
        } else {
            Err(failure(response, "delete book").await)
        }
    }

    /// Calls GET /api/books endpoint
    pub async fn list_books(
        &self,
        query: Option<&str>,
        category: Option<&str>,
        sort: Option<BookSortMode>,
    ) -> anyhow::Result<Vec<Book>> {
        let response = self
            .client
            .get(format!("{}/api/books", self.url))
            .query(&BooksParams {
                query,
                category,
                sort,
            })
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(failure(response, "list books").await)
        }
    }

    /// Calls GET /api/books/available endpoint
    pub async fn available_books(&self) -> anyhow::Result<Vec<Book>> {
        self.get_json("/api/books/available", "list available books")
            .await
    }

    /// Calls GET /api/books/categories endpoint
    pub async fn categories(&self) -> anyhow::Result<Vec<String>> {
        self.get_json("/api/books/categories", "list categories").await
    }

    /// Calls POST /api/borrowings endpoint
    /// The inner error tells why the loan was refused
    pub async fn borrow(
        &self,
        request: BorrowRequest,
    ) -> anyhow::Result<Result<Borrowing, BorrowRefusal>> {
        let response = self
            .client
            .post(format!("{}/api/borrowings", self.url))
            .json(&request)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            let error: ErrorResponse = response
                .json()
                .await
                .context("Failed to read borrow refusal")?;
            tracing::info!("Borrow refused: {}", error.message);
            match error.kind {
                ErrorKind::NoStock => Ok(Err(BorrowRefusal::NoStock)),
                ErrorKind::DuplicateLoan => Ok(Err(BorrowRefusal::DuplicateLoan)),
                ErrorKind::ConcurrencyConflict => Ok(Err(BorrowRefusal::Conflict)),
                other => Err(anyhow::anyhow!(
                    "Failed to borrow book ({:?}) {}",
                    other,
                    error.message
                )),
            }
        } else if response.status().is_success() {
            Ok(Ok(response.json().await?))
        } else {
            Err(failure(response, "borrow book").await)
        }
    }

    /// Calls POST /api/borrowings/return endpoint
    /// None when the borrower holds no loan
    pub async fn return_book(&self, borrower_nim: &str) -> anyhow::Result<Option<Borrowing>> {
        let response = self
            .client
            .post(format!("{}/api/borrowings/return", self.url))
            .json(&ReturnRequest {
                borrower_nim: borrower_nim.to_string(),
            })
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            Ok(None)
        } else if response.status().is_success() {
            Ok(Some(response.json().await?))
        } else {
            Err(failure(response, "return book").await)
        }
    }

    /// Calls GET /api/borrowings endpoint
    pub async fn list_borrowings(
        &self,
        status: Option<BorrowingStatus>,
        query: Option<&str>,
    ) -> anyhow::Result<Vec<Borrowing>> {
        let response = self
            .client
            .get(format!("{}/api/borrowings", self.url))
            .query(&BorrowingsParams { status, query })
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(failure(response, "list borrowings").await)
        }
    }

    /// Calls POST /api/borrowings/sweep endpoint
    /// Returns number of loans newly marked overdue
    pub async fn sweep_overdue(&self) -> anyhow::Result<usize> {
        let response = self
            .client
            .post(format!("{}/api/borrowings/sweep", self.url))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(failure(response, "sweep overdue loans").await)
        }
    }

    /// Calls GET /api/borrowings/overdue endpoint
    pub async fn currently_overdue(&self) -> anyhow::Result<Vec<Borrowing>> {
        self.get_json("/api/borrowings/overdue", "list overdue loans")
            .await
    }

    /// Calls GET /api/borrowings/overdue/count endpoint
    pub async fn overdue_count(&self) -> anyhow::Result<usize> {
        self.get_json("/api/borrowings/overdue/count", "count overdue loans")
            .await
    }

    /// Calls GET /api/borrowings/lateness endpoint
    pub async fn lateness_history(&self) -> anyhow::Result<Vec<Borrowing>> {
        self.get_json("/api/borrowings/lateness", "get lateness history")
            .await
    }

    /// Calls GET /api/borrowings/returned_late endpoint
    pub async fn returned_late(&self) -> anyhow::Result<Vec<Borrowing>> {
        self.get_json("/api/borrowings/returned_late", "list late returns")
            .await
    }

    /// Calls GET /api/borrowing/{borrowing_id} endpoint
    pub async fn get_borrowing(
        &self,
        borrowing_id: &BorrowingId,
    ) -> anyhow::Result<Option<Borrowing>> {
        let response = self
            .client
            .get(format!("{}/api/borrowing/{}", self.url, borrowing_id))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            Ok(None)
        } else if response.status().is_success() {
            Ok(Some(response.json().await?))
        } else {
            Err(failure(response, "get borrowing").await)
        }
    }

    /// Calls GET /api/borrowing/{borrowing_id}/lateness endpoint
    pub async fn lateness_details(
        &self,
        borrowing_id: &BorrowingId,
    ) -> anyhow::Result<LatenessRecord> {
        self.get_json(
            &format!("/api/borrowing/{}/lateness", borrowing_id),
            "get lateness details",
        )
        .await
    }

    /// Calls DELETE /api/borrowing/{borrowing_id} endpoint
    /// Returns false if the loan is still open
    pub async fn delete_history(&self, borrowing_id: &BorrowingId) -> anyhow::Result<bool> {
        let response = self
            .client
            .delete(format!("{}/api/borrowing/{}", self.url, borrowing_id))
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            Ok(false)
        } else if response.status().is_success() {
            Ok(true)
        } else {
            Err(failure(response, "delete borrowing").await)
        }
    }

    /// Calls GET /api/notifications endpoint
    pub async fn notifications(&self) -> anyhow::Result<Vec<Notification>> {
        self.get_json("/api/notifications", "get notifications")
            .await
    }

    /// Calls GET /api/statistics endpoint
    pub async fn statistics(&self) -> anyhow::Result<LibraryStatistics> {
        self.get_json("/api/statistics", "get statistics").await
    }

    /// Calls POST /api/admins endpoint
    pub async fn register_admin(
        &self,
        registration: AdminRegistration,
    ) -> anyhow::Result<AdminUser> {
        let response = self
            .client
            .post(format!("{}/api/admins", self.url))
            .json(&registration)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(failure(response, "register admin").await)
        }
    }

    /// Calls GET /api/admin/{admin_id} endpoint
    pub async fn get_admin(&self, admin_id: &AdminId) -> anyhow::Result<Option<AdminUser>> {
        let response = self
            .client
            .get(format!("{}/api/admin/{}", self.url, admin_id))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            Ok(None)
        } else if response.status().is_success() {
            Ok(Some(response.json().await?))
        } else {
            Err(failure(response, "get admin").await)
        }
    }

    /// Calls PATCH /api/admin/{admin_id} endpoint
    pub async fn rename_admin(&self, admin_id: &AdminId, name: &str) -> anyhow::Result<AdminUser> {
        let response = self
            .client
            .patch(format!("{}/api/admin/{}", self.url, admin_id))
            .json(&AdminRename {
                name: name.to_string(),
            })
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(failure(response, "rename admin").await)
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        what: &str,
    ) -> anyhow::Result<T> {
        let response = self
            .client
            .get(format!("{}{}", self.url, path))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(failure(response, what).await)
        }
    }
}
