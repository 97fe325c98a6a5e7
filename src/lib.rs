//! Embedding indices, identity resolution and search ranking for the clepho
//! photo library.
//!
//! The SQLite record store in [`db`] is the source of truth. The flat vector
//! indices in [`vectors`] are derived from it and can always be rebuilt.
//! [`Library`] ties the two together and is the usual entry point.

pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod library;
pub mod logging;
pub mod ranking;
pub mod tasks;
pub mod vectors;

pub use config::Config;
pub use library::{Library, SearchOptions};
