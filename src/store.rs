use crate::error::OrchestrationError;
use crate::record::{DocumentId, DocumentWorkflow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

/// Time-bounded exclusive claim on a document's workflow.
///
/// A worker holds the lease for the duration of one `advance` call. The
/// expiry lets a new worker reclaim a document whose holder crashed; the
/// token fences stale holders out of release.
#[derive(Debug, Clone)]
pub struct Lease {
    /// The leased document.
    pub document_id: DocumentId,
    /// Identity of the holder.
    pub owner: String,
    /// Fencing token, unique per grant.
    pub token: u64,
    /// When the lease may be reclaimed by another worker.
    pub expires_at: SystemTime,
}

/// Durable storage for workflow records and per-document leases.
///
/// Saves use optimistic concurrency: the caller passes the version it loaded
/// and the store rejects the write if the stored version moved. Lease
/// acquisition must be atomic so two workers can never both believe they
/// hold a document.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persists a brand-new record.
    ///
    /// # Errors
    ///
    /// [`OrchestrationError::WorkflowAlreadyExists`] if the document already
    /// has a record.
    async fn create(&self, record: DocumentWorkflow) -> Result<(), OrchestrationError>;

    /// Loads the current record for a document.
    ///
    /// # Errors
    ///
    /// [`OrchestrationError::WorkflowNotFound`] if no record exists.
    async fn load(&self, document_id: &DocumentId) -> Result<DocumentWorkflow, OrchestrationError>;

    /// Saves a record if the stored version still equals `expected_version`.
    ///
    /// On success the stored record carries `expected_version + 1`, which is
    /// also returned.
    ///
    /// # Errors
    ///
    /// [`OrchestrationError::VersionConflict`] if another writer got there
    /// first; the caller must discard its in-flight result and reload.
    async fn compare_and_swap_save(
        &self,
        record: DocumentWorkflow,
        expected_version: u64,
    ) -> Result<u64, OrchestrationError>;

    /// Atomically claims the document for `ttl`, reclaiming expired leases.
    ///
    /// # Errors
    ///
    /// [`OrchestrationError::LeaseConflict`] while another holder's lease is
    /// live.
    async fn acquire_lease(
        &self,
        document_id: &DocumentId,
        owner: &str,
        ttl: Duration,
    ) -> Result<Lease, OrchestrationError>;

    /// Releases a lease if `token` still identifies the current grant.
    /// Stale tokens are ignored.
    async fn release_lease(
        &self,
        document_id: &DocumentId,
        token: u64,
    ) -> Result<(), OrchestrationError>;
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<DocumentId, DocumentWorkflow>,
    leases: HashMap<DocumentId, Lease>,
    next_token: u64,
}

/// In-memory [`WorkflowStore`] for tests and single-process embedding.
///
/// All operations run under one mutex, which makes compare-and-swap and
/// lease acquisition trivially atomic.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn create(&self, record: DocumentWorkflow) -> Result<(), OrchestrationError> {
        let mut inner = self.lock();
        if inner.records.contains_key(&record.document_id) {
            return Err(OrchestrationError::WorkflowAlreadyExists(
                record.document_id.clone(),
            ));
        }
        inner.records.insert(record.document_id.clone(), record);
        Ok(())
    }

    async fn load(&self, document_id: &DocumentId) -> Result<DocumentWorkflow, OrchestrationError> {
        self.lock()
            .records
            .get(document_id)
            .cloned()
            .ok_or_else(|| OrchestrationError::WorkflowNotFound(document_id.clone()))
    }

    async fn compare_and_swap_save(
        &self,
        mut record: DocumentWorkflow,
        expected_version: u64,
    ) -> Result<u64, OrchestrationError> {
        let mut inner = self.lock();
        let stored = inner
            .records
            .get(&record.document_id)
            .ok_or_else(|| OrchestrationError::WorkflowNotFound(record.document_id.clone()))?;
        if stored.version != expected_version {
            return Err(OrchestrationError::VersionConflict {
                document_id: record.document_id.clone(),
                expected: expected_version,
                found: stored.version,
            });
        }
        let new_version = expected_version + 1;
        record.version = new_version;
        inner.records.insert(record.document_id.clone(), record);
        Ok(new_version)
    }

    async fn acquire_lease(
        &self,
        document_id: &DocumentId,
        owner: &str,
        ttl: Duration,
    ) -> Result<Lease, OrchestrationError> {
        let mut inner = self.lock();
        let now = SystemTime::now();
        if let Some(existing) = inner.leases.get(document_id) {
            if existing.expires_at > now {
                return Err(OrchestrationError::LeaseConflict {
                    document_id: document_id.clone(),
                    holder: existing.owner.clone(),
                });
            }
        }
        inner.next_token += 1;
        let lease = Lease {
            document_id: document_id.clone(),
            owner: owner.to_string(),
            token: inner.next_token,
            expires_at: now + ttl,
        };
        inner.leases.insert(document_id.clone(), lease.clone());
        Ok(lease)
    }

    async fn release_lease(
        &self,
        document_id: &DocumentId,
        token: u64,
    ) -> Result<(), OrchestrationError> {
        let mut inner = self.lock();
        if inner
            .leases
            .get(document_id)
            .is_some_and(|lease| lease.token == token)
        {
            inner.leases.remove(document_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DocumentPayload, TenantId};

    fn record(id: &str) -> DocumentWorkflow {
        DocumentWorkflow::new(
            DocumentId::new(id),
            TenantId::new("t1"),
            DocumentPayload {
                file_path: format!("tenants/t1/{id}.pdf"),
                file_name: format!("{id}.pdf"),
                mime_type: "application/pdf".to_string(),
                file_size: 1024,
                created_by: "user-1".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let store = InMemoryStore::new();
        store.create(record("doc-1")).await.unwrap();
        assert!(matches!(
            store.create(record("doc-1")).await,
            Err(OrchestrationError::WorkflowAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_load_missing_record() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.load(&DocumentId::new("nope")).await,
            Err(OrchestrationError::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cas_bumps_version() {
        let store = InMemoryStore::new();
        store.create(record("doc-1")).await.unwrap();

        let loaded = store.load(&DocumentId::new("doc-1")).await.unwrap();
        assert_eq!(loaded.version, 0);

        let v1 = store.compare_and_swap_save(loaded.clone(), 0).await.unwrap();
        assert_eq!(v1, 1);
        assert_eq!(store.load(&DocumentId::new("doc-1")).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_version() {
        let store = InMemoryStore::new();
        store.create(record("doc-1")).await.unwrap();
        let loaded = store.load(&DocumentId::new("doc-1")).await.unwrap();

        store.compare_and_swap_save(loaded.clone(), 0).await.unwrap();
        // A second writer based on the same version loses.
        let err = store.compare_and_swap_save(loaded, 0).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::VersionConflict {
                expected: 0,
                found: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_lease_exclusivity_and_release() {
        let store = InMemoryStore::new();
        let doc = DocumentId::new("doc-1");

        let lease = store
            .acquire_lease(&doc, "worker-a", Duration::from_secs(30))
            .await
            .unwrap();
        let err = store
            .acquire_lease(&doc, "worker-b", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::LeaseConflict { ref holder, .. } if holder == "worker-a"
        ));

        store.release_lease(&doc, lease.token).await.unwrap();
        store
            .acquire_lease(&doc, "worker-b", Duration::from_secs(30))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let store = InMemoryStore::new();
        let doc = DocumentId::new("doc-1");

        let stale = store
            .acquire_lease(&doc, "crashed-worker", Duration::ZERO)
            .await
            .unwrap();
        // TTL of zero: expired immediately, a new worker may reclaim.
        let fresh = store
            .acquire_lease(&doc, "worker-b", Duration::from_secs(30))
            .await
            .unwrap();
        assert_ne!(stale.token, fresh.token);

        // The crashed holder's release is a stale no-op.
        store.release_lease(&doc, stale.token).await.unwrap();
        let err = store
            .acquire_lease(&doc, "worker-c", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::LeaseConflict { .. }));
    }
}
