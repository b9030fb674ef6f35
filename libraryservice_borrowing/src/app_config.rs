use std::sync::Arc;

use paperclip::actix::web;

use libraryservice_store::data_store::DataStore;

use crate::admin_profile::AdminProfileService;
use crate::borrowing_service::BorrowingService;
use crate::catalog::CatalogService;
use crate::clock::Clock;
use crate::handlers;

/// Services shared by all workers, registered as app data
#[derive(Clone)]
pub struct LibraryServices {
    pub catalog: Arc<CatalogService>,
    pub borrowings: Arc<BorrowingService>,
    pub profiles: Arc<AdminProfileService>,
}

impl LibraryServices {
    pub fn new(store: Arc<dyn DataStore>, clock: Arc<dyn Clock>) -> Self {
        let catalog = Arc::new(CatalogService::new(store.clone(), clock.clone()));
        Self {
            borrowings: Arc::new(BorrowingService::new(
                store.clone(),
                clock.clone(),
                catalog.clone(),
            )),
            profiles: Arc::new(AdminProfileService::new(store, clock)),
            catalog,
        }
    }
}

pub fn config_app(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(handlers::health)))
        .service(
            web::scope("/api")
                .service(
                    web::resource("/books")
                        .route(web::get().to(handlers::list_books))
                        .route(web::post().to(handlers::add_book)),
                )
                .service(
                    web::resource("/books/available")
                        .route(web::get().to(handlers::list_available_books)),
                )
                .service(
                    web::resource("/books/categories")
                        .route(web::get().to(handlers::list_categories)),
                )
                .service(
                    web::resource("/book/{book_id}")
                        .route(web::get().to(handlers::get_book))
                        .route(web::patch().to(handlers::update_book))
                        .route(web::delete().to(handlers::delete_book)),
                )
                .service(
                    web::scope("/borrowings")
                        .service(
                            web::resource("")
                                .route(web::get().to(handlers::list_borrowings))
                                .route(web::post().to(handlers::borrow_book)),
                        )
                        .service(
                            web::resource("/return").route(web::post().to(handlers::return_book)),
                        )
                        .service(
                            web::resource("/sweep").route(web::post().to(handlers::sweep_overdue)),
                        )
                        .service(
                            web::resource("/overdue")
                                .route(web::get().to(handlers::currently_overdue)),
                        )
                        .service(
                            web::resource("/overdue/count")
                                .route(web::get().to(handlers::overdue_count)),
                        )
                        .service(
                            web::resource("/lateness")
                                .route(web::get().to(handlers::lateness_history)),
                        )
                        .service(
                            web::resource("/returned_late")
                                .route(web::get().to(handlers::returned_late)),
                        ),
                )
                .service(
                    web::scope("/borrowing/{borrowing_id}")
                        .service(
                            web::resource("")
                                .route(web::get().to(handlers::get_borrowing))
                                .route(web::delete().to(handlers::delete_history)),
                        )
                        .service(
                            web::resource("/lateness")
                                .route(web::get().to(handlers::lateness_details)),
                        ),
                )
                .service(
                    web::resource("/notifications").route(web::get().to(handlers::notifications)),
                )
                .service(web::resource("/statistics").route(web::get().to(handlers::statistics)))
                .service(web::resource("/admins").route(web::post().to(handlers::register_admin)))
                .service(
                    web::resource("/admin/{admin_id}")
                        .route(web::get().to(handlers::get_admin))
                        .route(web::patch().to(handlers::rename_admin)),
                ),
        );
}
