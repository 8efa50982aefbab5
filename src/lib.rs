pub mod app;
pub mod clients;
pub mod sanitize;
pub mod types;
