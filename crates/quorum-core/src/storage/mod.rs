//! Embedded persistence for the coordination substrate.
//!
//! The store is a single SQLite database file with WAL enabled. All
//! subsystems read and mutate exclusively through [`Database`]; every
//! mutating operation uses an immediate transaction so that check-then-write
//! sequences cannot race with concurrent writers.

pub mod database;
pub mod error;
pub mod schema;

pub use database::{lock, Database, RetryPolicy, SharedDatabase};
pub use error::{StorageError, StorageResult};
pub use schema::initialize_schema;
