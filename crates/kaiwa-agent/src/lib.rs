pub mod aggregate;
pub mod assistants;
pub mod connections;
pub mod openai;
pub mod provider;
pub mod session;
pub mod stream;
pub mod tools;
pub mod turn;
