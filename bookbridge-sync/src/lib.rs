//! BookBridge sync service library
//!
//! Keeps a reader's position consistent across an audiobook server,
//! KOReader devices, Storyteller, Booklore and Hardcover. The binary in
//! `main.rs` wires these modules together; integration tests drive them
//! directly.

pub mod align;
pub mod api;
pub mod clients;
pub mod ebook;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod state;
pub mod suggest;
pub mod suppress;
pub mod transcript;
pub mod translate;
pub mod triggers;
