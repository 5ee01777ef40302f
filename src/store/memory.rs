//! In-memory store used by tests and embedded runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use super::{DigestStore, StoreResult, StoredDigest};

#[derive(Clone, Default)]
pub struct MemoryStore {
    rows: Arc<Mutex<HashMap<Uuid, Vec<StoredDigest>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows written for a workflow.
    pub fn row_count(&self, workflow_id: Uuid) -> usize {
        let rows = self.rows.lock().expect("digest rows poisoned");
        rows.get(&workflow_id).map(Vec::len).unwrap_or(0)
    }
}

#[async_trait]
impl DigestStore for MemoryStore {
    async fn load_all(&self, workflow_id: Uuid) -> StoreResult<Vec<StoredDigest>> {
        let rows = self.rows.lock().expect("digest rows poisoned");
        Ok(rows.get(&workflow_id).cloned().unwrap_or_default())
    }

    async fn put(&self, workflow_id: Uuid, reference: &str, digest: &str) -> StoreResult<()> {
        let mut rows = self.rows.lock().expect("digest rows poisoned");
        rows.entry(workflow_id).or_default().push(StoredDigest {
            reference: reference.to_owned(),
            digest: digest.to_owned(),
        });
        Ok(())
    }
}
