//! # BookBridge Common Library
//!
//! Shared code for the BookBridge sync bridge:
//! - Database models and queries (progress store)
//! - Event types (BridgeEvent enum) and EventBus
//! - Configuration loading
//! - Timestamp utilities

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
