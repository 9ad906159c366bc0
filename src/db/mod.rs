//! Database module.
//!
//! Provides the persistence port and its SQLite implementation with embedded
//! migrations.

mod models;
mod port;
mod store;

pub use models::*;
pub use port::*;
pub use store::*;
