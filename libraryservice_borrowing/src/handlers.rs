use std::sync::Arc;

use actix_web::http::header::LOCATION;
use actix_web::web::Data;
use actix_web::{Error, HttpResponse};
use paperclip::actix::{
    api_v2_operation,
    web::{self},
    Apiv2Schema,
};
use serde::Deserialize;

use crate::admin_profile::AdminProfileService;
use crate::api::{
    AdminId, AdminRegistration, AdminRename, BookDetails, BookId, BookPatch, BorrowRequest,
    BorrowingId, BorrowingStatus, ErrorResponse, ReturnRequest,
};
use crate::borrowing_service::BorrowingService;
use crate::catalog::{self, BookSortMode, CatalogService};
use crate::error::DomainError;

#[derive(Debug, Default, Deserialize, Apiv2Schema)]
pub struct BooksQuery {
    /// Free text matched against title, author, category, publisher and location
    pub query: Option<String>,
    pub category: Option<String>,
    pub sort: Option<BookSortMode>,
}

#[derive(Debug, Default, Deserialize, Apiv2Schema)]
pub struct BorrowingsQuery {
    pub status: Option<BorrowingStatus>,
    /// Free text matched against borrower name, NIM, class and book title
    pub query: Option<String>,
}

pub(crate) fn error_response(operation: &str, err: DomainError) -> HttpResponse {
    let mut response = match &err {
        DomainError::Validation(_) => HttpResponse::BadRequest(),
        DomainError::NotFound(_) => HttpResponse::NotFound(),
        DomainError::NoStock(_)
        | DomainError::DuplicateLoan(_)
        | DomainError::InvalidTransition { .. }
        | DomainError::ConcurrencyConflict(_) => HttpResponse::Conflict(),
        DomainError::StoreUnavailable(_) => {
            tracing::error!("{} failed {}", operation, err);
            HttpResponse::ServiceUnavailable()
        }
        DomainError::MalformedDocument(_) => {
            tracing::error!("{} failed {}", operation, err);
            HttpResponse::InternalServerError()
        }
    };
    response.json(ErrorResponse {
        kind: err.kind(),
        message: err.to_string(),
    })
}

#[api_v2_operation]
pub async fn health() -> Result<HttpResponse, Error> {
    Ok(HttpResponse::Ok().finish())
}

#[api_v2_operation]
pub async fn list_books(
    catalog: Data<Arc<CatalogService>>,
    params: web::Query<BooksQuery>,
) -> Result<HttpResponse, Error> {
    Ok(match catalog.list_books().await {
        Ok(books) => {
            let params = params.into_inner();
            let books = catalog::filter_by_text(&books, params.query.as_deref().unwrap_or_default());
            let mut books = catalog::filter_by_category(&books, params.category.as_deref());
            if let Some(sort) = params.sort {
                catalog::sort_books(&mut books, sort);
            }
            HttpResponse::Ok().json(books)
        }
        Err(err) => error_response("List books", err),
    })
}

#[api_v2_operation]
pub async fn list_available_books(
    catalog: Data<Arc<CatalogService>>,
) -> Result<HttpResponse, Error> {
    Ok(match catalog.available_books().await {
        Ok(books) => HttpResponse::Ok().json(books),
        Err(err) => error_response("List available books", err),
    })
}

#[api_v2_operation]
pub async fn list_categories(catalog: Data<Arc<CatalogService>>) -> Result<HttpResponse, Error> {
    Ok(match catalog.list_books().await {
        Ok(books) => HttpResponse::Ok().json(catalog::categories(&books)),
        Err(err) => error_response("List categories", err),
    })
}

#[api_v2_operation]
pub async fn add_book(
    catalog: Data<Arc<CatalogService>>,
    details: web::Json<BookDetails>,
) -> Result<HttpResponse, Error> {
    Ok(match catalog.add_book(details.into_inner()).await {
        Ok(book) => HttpResponse::Created()
            .append_header((LOCATION, format!("/api/book/{}", book.id)))
            .json(book),
        Err(err) => error_response("Add book", err),
    })
}

#[api_v2_operation]
pub async fn get_book(
    catalog: Data<Arc<CatalogService>>,
    book_id: web::Path<BookId>,
) -> Result<HttpResponse, Error> {
    Ok(match catalog.get_book(&book_id).await {
        Ok(book) => HttpResponse::Ok().json(book),
        Err(err) => error_response("Get book", err),
    })
}

#[api_v2_operation]
pub async fn update_book(
    catalog: Data<Arc<CatalogService>>,
    book_id: web::Path<BookId>,
    patch: web::Json<BookPatch>,
) -> Result<HttpResponse, Error> {
    Ok(
        match catalog.update_book(&book_id, patch.into_inner()).await {
            Ok(book) => HttpResponse::Ok().json(book),
            Err(err) => error_response("Update book", err),
        },
    )
}

#[api_v2_operation]
pub async fn delete_book(
    catalog: Data<Arc<CatalogService>>,
    book_id: web::Path<BookId>,
) -> Result<HttpResponse, Error> {
    Ok(match catalog.delete_book(&book_id).await {
        Ok(true) => HttpResponse::NoContent().finish(),
        Ok(false) => HttpResponse::NotFound().finish(),
        Err(err) => error_response("Delete book", err),
    })
}

#[api_v2_operation]
pub async fn borrow_book(
    borrowings: Data<Arc<BorrowingService>>,
    request: web::Json<BorrowRequest>,
) -> Result<HttpResponse, Error> {
    Ok(match borrowings.borrow(request.into_inner()).await {
        Ok(borrowing) => HttpResponse::Created()
            .append_header((LOCATION, format!("/api/borrowing/{}", borrowing.id)))
            .json(borrowing),
        Err(err) => error_response("Borrow book", err),
    })
}

#[api_v2_operation]
pub async fn return_book(
    borrowings: Data<Arc<BorrowingService>>,
    request: web::Json<ReturnRequest>,
) -> Result<HttpResponse, Error> {
    Ok(
        match borrowings.return_book(&request.borrower_nim).await {
            Ok(borrowing) => HttpResponse::Ok().json(borrowing),
            Err(err) => error_response("Return book", err),
        },
    )
}

#[api_v2_operation]
pub async fn list_borrowings(
    borrowings: Data<Arc<BorrowingService>>,
    params: web::Query<BorrowingsQuery>,
) -> Result<HttpResponse, Error> {
    let params = params.into_inner();
    let listed = match params.query {
        Some(query) => borrowings.search_borrowings(&query).await.map(|found| {
            found
                .into_iter()
                .filter(|borrowing| params.status.map_or(true, |status| borrowing.status == status))
                .collect()
        }),
        None => borrowings.list_borrowings(params.status).await,
    };
    Ok(match listed {
        Ok(listed) => HttpResponse::Ok().json(listed),
        Err(err) => error_response("List borrowings", err),
    })
}

#[api_v2_operation]
pub async fn sweep_overdue(borrowings: Data<Arc<BorrowingService>>) -> Result<HttpResponse, Error> {
    Ok(match borrowings.sweep_overdue().await {
        Ok(marked) => HttpResponse::Ok().json(marked),
        Err(err) => error_response("Sweep overdue", err),
    })
}

#[api_v2_operation]
pub async fn currently_overdue(
    borrowings: Data<Arc<BorrowingService>>,
) -> Result<HttpResponse, Error> {
    Ok(match borrowings.currently_overdue().await {
        Ok(overdue) => HttpResponse::Ok().json(overdue),
        Err(err) => error_response("List overdue borrowings", err),
    })
}

#[api_v2_operation]
pub async fn overdue_count(borrowings: Data<Arc<BorrowingService>>) -> Result<HttpResponse, Error> {
    Ok(match borrowings.overdue_count().await {
        Ok(count) => HttpResponse::Ok().json(count),
        Err(err) => error_response("Count overdue borrowings", err),
    })
}

#[api_v2_operation]
pub async fn lateness_history(
    borrowings: Data<Arc<BorrowingService>>,
) -> Result<HttpResponse, Error> {
    Ok(match borrowings.lateness_history().await {
        Ok(history) => HttpResponse::Ok().json(history),
        Err(err) => error_response("Lateness history", err),
    })
}

#[api_v2_operation]
pub async fn returned_late(borrowings: Data<Arc<BorrowingService>>) -> Result<HttpResponse, Error> {
    Ok(match borrowings.returned_late().await {
        Ok(returned) => HttpResponse::Ok().json(returned),
        Err(err) => error_response("List late returns", err),
    })
}

#[api_v2_operation]
pub async fn get_borrowing(
    borrowings: Data<Arc<BorrowingService>>,
    borrowing_id: web::Path<BorrowingId>,
) -> Result<HttpResponse, Error> {
    Ok(match borrowings.get_borrowing(&borrowing_id).await {
        Ok(borrowing) => HttpResponse::Ok().json(borrowing),
        Err(err) => error_response("Get borrowing", err),
    })
}

#[api_v2_operation]
pub async fn lateness_details(
    borrowings: Data<Arc<BorrowingService>>,
    borrowing_id: web::Path<BorrowingId>,
) -> Result<HttpResponse, Error> {
    Ok(match borrowings.lateness_details(&borrowing_id).await {
        Ok(record) => HttpResponse::Ok().json(record),
        Err(err) => error_response("Lateness details", err),
    })
}

#[api_v2_operation]
pub async fn delete_history(
    borrowings: Data<Arc<BorrowingService>>,
    borrowing_id: web::Path<BorrowingId>,
) -> Result<HttpResponse, Error> {
    Ok(match borrowings.delete_history(&borrowing_id).await {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(err) => error_response("Delete borrowing history", err),
    })
}

#[api_v2_operation]
pub async fn notifications(borrowings: Data<Arc<BorrowingService>>) -> Result<HttpResponse, Error> {
    Ok(match borrowings.notifications().await {
        Ok(notifications) => HttpResponse::Ok().json(notifications),
        Err(err) => error_response("Notifications", err),
    })
}

#[api_v2_operation]
pub async fn statistics(borrowings: Data<Arc<BorrowingService>>) -> Result<HttpResponse, Error> {
    Ok(match borrowings.statistics().await {
        Ok(statistics) => HttpResponse::Ok().json(statistics),
        Err(err) => error_response("Statistics", err),
    })
}

#[api_v2_operation]
pub async fn register_admin(
    profiles: Data<Arc<AdminProfileService>>,
    registration: web::Json<AdminRegistration>,
) -> Result<HttpResponse, Error> {
    Ok(match profiles.register(registration.into_inner()).await {
        Ok(admin) => HttpResponse::Created()
            .append_header((LOCATION, format!("/api/admin/{}", admin.id)))
            .json(admin),
        Err(err) => error_response("Register admin", err),
    })
}

#[api_v2_operation]
pub async fn get_admin(
    profiles: Data<Arc<AdminProfileService>>,
    admin_id: web::Path<AdminId>,
) -> Result<HttpResponse, Error> {
    Ok(match profiles.get_profile(&admin_id).await {
        Ok(admin) => HttpResponse::Ok().json(admin),
        Err(err) => error_response("Get admin", err),
    })
}

#[api_v2_operation]
pub async fn rename_admin(
    profiles: Data<Arc<AdminProfileService>>,
    admin_id: web::Path<AdminId>,
    rename: web::Json<AdminRename>,
) -> Result<HttpResponse, Error> {
    Ok(match profiles.rename(&admin_id, &rename.name).await {
        Ok(admin) => HttpResponse::Ok().json(admin),
        Err(err) => error_response("Rename admin", err),
    })
}
