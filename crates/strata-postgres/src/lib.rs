//! PostgreSQL storage for Strata.
//!
//! [`PgStorage`] implements both the storage contract and the query surface.
//! Locks are advisory, so several processes may share one database.

pub mod migrations;
pub mod storage;

pub use storage::PgStorage;
