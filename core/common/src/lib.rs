//! Common utilities and types shared across Tidesync crates.
//!
//! This module provides the data model every other crate speaks: typed
//! field values and patches, entities, mutations, remote deltas, cursors
//! and the shared error taxonomy.

pub mod entity;
pub mod error;
pub mod types;
pub mod value;

pub use entity::{
    DeltaKind, DeltaValue, Entity, Field, Mutation, MutationDraft, MutationOp, MutationState,
    RemoteDelta, ResumeToken, SyncCursor,
};
pub use error::{Error, RemoteError, Result};
pub use types::{CollectionName, EntityId, EntityKey, MutationId, ReplicaId, Version};
pub use value::{FieldOp, FieldPatch, Value};
