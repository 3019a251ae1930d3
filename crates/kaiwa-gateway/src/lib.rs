pub mod app;
pub mod auth;
pub mod error;
pub mod http;
pub mod sessions;
