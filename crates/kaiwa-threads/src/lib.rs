pub mod db;
pub mod error;
pub mod manager;
pub mod types;

pub use error::ThreadError;
pub use manager::ThreadManager;
pub use types::{Element, Feedback, NewElement, Step, Thread};
