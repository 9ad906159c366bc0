//! uptrail: scheduled health checks, status observations and threshold alerts.
//!
//! The binary in `main.rs` wires these modules together; everything here is
//! usable on its own against any [`db::Persistence`] implementation.

pub mod alert;
pub mod config;
pub mod db;
pub mod eval;
pub mod probe;
pub mod scheduler;
pub mod uptime;
pub mod web;
