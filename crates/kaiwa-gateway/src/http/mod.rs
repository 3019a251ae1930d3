pub mod auth;
pub mod feedback;
pub mod files;
pub mod health;
pub mod messages;
pub mod threads;
