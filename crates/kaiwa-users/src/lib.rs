pub mod db;
pub mod error;
pub mod manager;
pub mod password;
pub mod types;

pub use error::UserError;
pub use manager::UserManager;
pub use types::{AuthProvider, User};
