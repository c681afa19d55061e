//! Durable local state for Tidesync.
//!
//! One SQLite database holds the materialized entity mirror, the outbox of
//! local mutations and the per-collection stream cursors.
//!
//! # Design Principles
//! - Per-entity atomicity: writers serialize on striped per-key locks
//! - Short critical sections: the connection lock is never held across `.await`
//! - Crash safety: everything needed to resume lives in the database

pub mod cursor;
pub mod db;
pub mod local;
pub mod outbox;
pub mod predicate;

pub use cursor::CursorStore;
pub use db::Database;
pub use local::{ChangeEvent, ChangeKind, ChangeStream, EntityGuard, LocalStore, StoredRow};
pub use outbox::{Carry, Outbox, DEFAULT_CAPACITY};
pub use predicate::Predicate;
