pub mod admin_profile;
pub mod api;
pub mod borrowing_service;
pub mod catalog;
pub mod clock;
mod documents;
pub mod error;
pub mod views;

#[cfg(any(feature = "client", test))]
pub mod client;

#[cfg(any(feature = "server", test))]
pub mod app_config;
#[cfg(any(feature = "server", test))]
mod handlers;
#[cfg(any(feature = "server", test))]
pub mod settings;
