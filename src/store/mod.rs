//! Persistence (C1, §4.1).
//!
//! One registry SQLite database maps `plan_id -> file path`; each plan's
//! tasks, links, outputs, snapshots and evaluations live in that plan's own
//! SQLite file. Mirrors the reference `DatabaseManager`'s role, built out
//! with `sqlx` instead of left as a stub.

pub mod models;
mod sqlite;

pub use models::*;
pub use sqlite::Store;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
