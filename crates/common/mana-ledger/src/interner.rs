use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::LedgerResult;
use crate::store::ManaStore;
use crate::types::{ExternalId, InternedId};

/// Hands out small integer ids for host-supplied 128-bit identifiers.
pub struct IdentityInterner {
    store: Arc<dyn ManaStore>,
    forward: RwLock<HashMap<ExternalId, InternedId>>,
    reverse: RwLock<HashMap<InternedId, ExternalId>>,
}

impl IdentityInterner {
    pub fn new(store: Arc<dyn ManaStore>) -> Self {
        Self {
            store,
            forward: RwLock::new(HashMap::new()),
            reverse: RwLock::new(HashMap::new()),
        }
    }

    /// Idempotent; the first call for an identifier persists the mapping.
    pub async fn intern(&self, external_id: ExternalId) -> LedgerResult<InternedId> {
        if let Some(id) = self.forward.read().await.get(&external_id) {
            return Ok(*id);
        }
        let id = self.store.intern(external_id).await?;
        self.forward.write().await.insert(external_id, id);
        self.reverse.write().await.insert(id, external_id);
        Ok(id)
    }

    pub async fn external_of(&self, id: InternedId) -> LedgerResult<Option<ExternalId>> {
        if let Some(ext) = self.reverse.read().await.get(&id) {
            return Ok(Some(*ext));
        }
        let found = self.store.external_id(id).await?;
        if let Some(ext) = found {
            self.reverse.write().await.insert(id, ext);
            self.forward.write().await.insert(ext, id);
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryManaStore;
    use uuid::Uuid;

    #[tokio::test]
    async fn concurrent_interning_yields_one_id() -> LedgerResult<()> {
        let interner = Arc::new(IdentityInterner::new(Arc::new(InMemoryManaStore::new())));
        let ext = Uuid::new_v4();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let interner = interner.clone();
            handles.push(tokio::spawn(async move { interner.intern(ext).await }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.expect("task panicked")?);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(interner.external_of(ids[0]).await?, Some(ext));
        Ok(())
    }
}
