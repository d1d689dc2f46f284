//! Database layer for trackwire
//!
//! Durable storage via SQLite with:
//! - Schema migrations
//! - Event queue rows
//! - Customer identity and small key/value SDK state

pub mod repo;
pub mod schema;

pub use repo::Database;
