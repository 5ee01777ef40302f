//! Durable storage for resolved tag-to-digest mappings.
//!
//! The store is append-only from the resolver's perspective: one write per
//! resolved reference, one bulk read at restart. Rows keep their strings
//! raw; the resolver reparses them during replay so that a corrupted table
//! is detected at the boundary rather than deep inside the state machine.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One persisted mapping row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDigest {
    pub reference: String,
    pub digest: String,
}

/// Durable mapping from `(workflow, reference)` to digest.
#[async_trait]
pub trait DigestStore: Send + Sync {
    /// Load every row written for a workflow, in write order, so that a
    /// replay folding rows into a map is deterministically last-write-wins.
    async fn load_all(&self, workflow_id: Uuid) -> StoreResult<Vec<StoredDigest>>;

    /// Append one resolved mapping.
    async fn put(&self, workflow_id: Uuid, reference: &str, digest: &str) -> StoreResult<()>;
}
