pub mod api;

pub mod data_store;
