//! Book catalog: filtering and sorting of book lists plus book maintenance

use std::cmp::Reverse;
use std::sync::Arc;

use futures_util::stream::{BoxStream, StreamExt};
use itertools::Itertools;
use paperclip::actix::Apiv2Schema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use libraryservice_store::api::FieldFilter;
use libraryservice_store::data_store::DataStore;

use crate::api::{Book, BookDetails, BookPatch, BOOKS_COLLECTION};
use crate::clock::Clock;
use crate::documents::{fields, from_document, from_documents, to_document};
use crate::error::{require_non_blank, DomainError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "snake_case")]
pub enum BookSortMode {
    TitleAsc,
    TitleDesc,
    AuthorAsc,
    AuthorDesc,
    YearDesc,
    YearAsc,
    StockDesc,
    StockAsc,
}

/// Case-insensitive substring match on title, author, category, publisher and location.
/// A blank query keeps every book.
pub fn filter_by_text(books: &[Book], query: &str) -> Vec<Book> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return books.to_vec();
    }
    books
        .iter()
        .filter(|book| {
            [
                &book.title,
                &book.author,
                &book.category,
                &book.publisher,
                &book.location,
            ]
            .iter()
            .any(|field| field.to_lowercase().contains(&query))
        })
        .cloned()
        .collect()
}

/// `None` clears the filter
pub fn filter_by_category(books: &[Book], category: Option<&str>) -> Vec<Book> {
    match category {
        None => books.to_vec(),
        Some(category) => {
            let category = category.to_lowercase();
            books
                .iter()
                .filter(|book| book.category.to_lowercase() == category)
                .cloned()
                .collect()
        }
    }
}

/// Distinct categories in alphabetical order
pub fn categories(books: &[Book]) -> Vec<String> {
    books
        .iter()
        .map(|book| book.category.clone())
        .unique()
        .sorted()
        .collect()
}

/// Stable sort, text fields compared case-insensitively
pub fn sort_books(books: &mut [Book], mode: BookSortMode) {
    match mode {
        BookSortMode::TitleAsc => books.sort_by_cached_key(|book| book.title.to_lowercase()),
        BookSortMode::TitleDesc => {
            books.sort_by_cached_key(|book| Reverse(book.title.to_lowercase()))
        }
        BookSortMode::AuthorAsc => books.sort_by_cached_key(|book| book.author.to_lowercase()),
        BookSortMode::AuthorDesc => {
            books.sort_by_cached_key(|book| Reverse(book.author.to_lowercase()))
        }
        BookSortMode::YearDesc => books.sort_by_key(|book| Reverse(book.publication_year)),
        BookSortMode::YearAsc => books.sort_by_key(|book| book.publication_year),
        BookSortMode::StockDesc => books.sort_by_key(|book| Reverse(book.stock)),
        BookSortMode::StockAsc => books.sort_by_key(|book| book.stock),
    }
}

pub struct CatalogService {
    store: Arc<dyn DataStore>,
    clock: Arc<dyn Clock>,
}

impl CatalogService {
    pub fn new(store: Arc<dyn DataStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn add_book(&self, details: BookDetails) -> Result<Book, DomainError> {
        let now = self.clock.now();
        let book = Book {
            id: uuid::Uuid::new_v4().to_string(),
            title: require_non_blank("title", &details.title)?,
            author: require_non_blank("author", &details.author)?,
            category: require_non_blank("category", &details.category)?,
            isbn: details.isbn.trim().to_string(),
            publisher: details.publisher.trim().to_string(),
            publication_year: details.publication_year,
            description: details.description.trim().to_string(),
            stock: details.stock,
            location: details.location.trim().to_string(),
            image_url: details.image_url.trim().to_string(),
            created_at: now,
            updated_at: now,
        };

        self.store
            .set(BOOKS_COLLECTION, &book.id, to_document(&book)?)
            .await?;
        tracing::info!("Added book {} '{}'", book.id, book.title);
        Ok(book)
    }

    /// Direct edit by the operator, stock may be set to any value
    pub async fn update_book(&self, book_id: &str, patch: BookPatch) -> Result<Book, DomainError> {
        let mut patch = patch;
        patch.title = non_blank_change("title", patch.title)?;
        patch.author = non_blank_change("author", patch.author)?;
        patch.category = non_blank_change("category", patch.category)?;

        let mut changes = to_document(&patch)?;
        changes.insert("updatedAt".to_string(), json!(self.clock.now()));
        self.store
            .update(BOOKS_COLLECTION, book_id, changes)
            .await
            .map_err(|err| match DomainError::from(err) {
                DomainError::NotFound(_) => DomainError::NotFound(format!("Book {book_id}")),
                other => other,
            })?;

        self.get_book(book_id).await
    }

    /// Returns false when there was no such book
    pub async fn delete_book(&self, book_id: &str) -> Result<bool, DomainError> {
        let removed = self.store.delete(BOOKS_COLLECTION, book_id).await?;
        if removed {
            tracing::info!("Deleted book {}", book_id);
        }
        Ok(removed)
    }

    pub async fn get_book(&self, book_id: &str) -> Result<Book, DomainError> {
        self.find_book(book_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("Book {book_id}")))
    }

    async fn find_book(&self, book_id: &str) -> Result<Option<Book>, DomainError> {
        self.store
            .get(BOOKS_COLLECTION, book_id)
            .await?
            .map(from_document)
            .transpose()
    }

    /// All books ordered by title
    pub async fn list_books(&self) -> Result<Vec<Book>, DomainError> {
        let mut books: Vec<Book> = from_documents(self.store.query(BOOKS_COLLECTION, &[]).await?)?;
        sort_books(&mut books, BookSortMode::TitleAsc);
        Ok(books)
    }

    /// Books that can currently be lent out
    pub async fn available_books(&self) -> Result<Vec<Book>, DomainError> {
        Ok(self
            .list_books()
            .await?
            .into_iter()
            .filter(|book| book.stock > 0)
            .collect())
    }

    pub fn subscribe_books(&self) -> BoxStream<'static, Result<Vec<Book>, DomainError>> {
        self.store
            .subscribe(BOOKS_COLLECTION, vec![])
            .map(|snapshot| {
                let mut books: Vec<Book> = from_documents(snapshot?)?;
                sort_books(&mut books, BookSortMode::TitleAsc);
                Ok(books)
            })
            .boxed()
    }

    /// Takes one copy off the shelf, conditional on the stock read just before
    pub(crate) async fn take_copy(&self, book_id: &str) -> Result<Book, DomainError> {
        let book = self.get_book(book_id).await?;
        let remaining = book
            .stock
            .checked_sub(1)
            .ok_or_else(|| DomainError::NoStock(book_id.to_string()))?;
        self.set_stock(book, remaining).await
    }

    /// Puts one copy back, `None` when the book no longer exists in the catalog
    pub(crate) async fn release_copy(&self, book_id: &str) -> Result<Option<Book>, DomainError> {
        match self.find_book(book_id).await? {
            Some(book) => {
                let restored = book.stock + 1;
                Ok(Some(self.set_stock(book, restored).await?))
            }
            None => Ok(None),
        }
    }

    async fn set_stock(&self, book: Book, stock: u32) -> Result<Book, DomainError> {
        let now = self.clock.now();
        self.store
            .update_if(
                BOOKS_COLLECTION,
                &book.id,
                &[FieldFilter::new("stock", book.stock)],
                fields([("stock", json!(stock)), ("updatedAt", json!(now))]),
            )
            .await?;
        tracing::debug!("Stock of book {} changed {} -> {}", book.id, book.stock, stock);
        Ok(Book {
            stock,
            updated_at: now,
            ..book
        })
    }
}

fn non_blank_change(field: &str, change: Option<String>) -> Result<Option<String>, DomainError> {
    change
        .map(|value| require_non_blank(field, &value))
        .transpose()
}
