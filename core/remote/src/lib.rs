//! Remote document store abstraction for Tidesync.
//!
//! This crate provides the gateway trait the sync engine talks to, an
//! in-memory server for tests and demos, and a change stream wrapper that
//! reconnects transparently.
//!
//! # Design Principles
//! - Backend isolation: no store-specific logic leaks into the engine
//! - Idempotent commits: retries after an unknown outcome are safe
//! - Resumable streams: every batch carries the cursor to resume from

pub mod gateway;
pub mod memory;
pub mod resume;

pub use gateway::{DeltaBatch, DeltaStream, RemoteGateway, RemoteResult, Snapshot};
pub use memory::{CommitRecord, MemoryRemote};
pub use resume::{backoff_delay, resumable, ReconnectPolicy};
