//! Database models and queries

pub mod init;
pub mod models;
pub mod store;

pub use init::init_database;
pub use models::*;
pub use store::ProgressStore;
