use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::LedgerResult;
use crate::metrics::MANA_OWNERS_KNOWN;
use crate::store::ManaStore;
use crate::types::{OwnerId, OwnerRecord, OwnerType};

/// Snapshot of every owner, grouped by foreign type then foreign id.
pub type OwnerMap = HashMap<OwnerType, HashMap<i64, OwnerId>>;

/// Maps foreign entities to stable owner ids.
///
/// Owner records are permanent, so cached entries never go stale.
pub struct OwnerRegistry {
    store: Arc<dyn ManaStore>,
    cache: RwLock<HashMap<(OwnerType, i64), OwnerId>>,
}

impl OwnerRegistry {
    pub fn new(store: Arc<dyn ManaStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Return the owner id for the foreign entity, creating the owner on first sight.
    pub async fn resolve(&self, foreign_id: i64, foreign_type: OwnerType) -> LedgerResult<OwnerId> {
        if let Some(id) = self.cache.read().await.get(&(foreign_type, foreign_id)) {
            return Ok(*id);
        }
        let record = self.store.resolve_owner(foreign_id, foreign_type).await?;
        self.remember(&record).await;
        Ok(record.id)
    }

    /// Like [`resolve`](Self::resolve) but never creates an owner.
    pub async fn lookup(&self, foreign_id: i64, foreign_type: OwnerType) -> LedgerResult<Option<OwnerId>> {
        if let Some(id) = self.cache.read().await.get(&(foreign_type, foreign_id)) {
            return Ok(Some(*id));
        }
        match self.store.find_owner(foreign_id, foreign_type).await? {
            Some(record) => {
                self.remember(&record).await;
                Ok(Some(record.id))
            }
            None => Ok(None),
        }
    }

    /// Every persisted owner. Each [`OwnerType`] is present as a key even when empty.
    pub async fn load_all(&self) -> LedgerResult<OwnerMap> {
        let mut owners: OwnerMap = OwnerType::ALL.iter().map(|ty| (*ty, HashMap::new())).collect();
        for record in self.store.all_owners().await? {
            owners
                .entry(record.foreign_type)
                .or_default()
                .insert(record.foreign_id, record.id);
        }
        Ok(owners)
    }

    /// Fill the cache from storage. Returns the number of owners loaded.
    pub async fn warm_up(&self) -> LedgerResult<usize> {
        let records = self.store.all_owners().await?;
        let mut cache = self.cache.write().await;
        for record in &records {
            cache.insert((record.foreign_type, record.foreign_id), record.id);
        }
        MANA_OWNERS_KNOWN.set(cache.len() as i64);
        info!(owners = records.len(), "owner registry warmed up");
        Ok(records.len())
    }

    async fn remember(&self, record: &OwnerRecord) {
        let mut cache = self.cache.write().await;
        if cache
            .insert((record.foreign_type, record.foreign_id), record.id)
            .is_none()
        {
            debug!(owner = %record.id, foreign_id = record.foreign_id, kind = %record.foreign_type, "cached owner");
        }
        MANA_OWNERS_KNOWN.set(cache.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryManaStore;

    #[tokio::test]
    async fn lookup_does_not_create() -> LedgerResult<()> {
        let registry = OwnerRegistry::new(Arc::new(InMemoryManaStore::new()));
        assert_eq!(registry.lookup(3, OwnerType::Player).await?, None);
        let id = registry.resolve(3, OwnerType::Player).await?;
        assert_eq!(registry.lookup(3, OwnerType::Player).await?, Some(id));
        Ok(())
    }

    #[tokio::test]
    async fn load_all_groups_by_type() -> LedgerResult<()> {
        let registry = OwnerRegistry::new(Arc::new(InMemoryManaStore::new()));
        let p = registry.resolve(1, OwnerType::Player).await?;
        let g = registry.resolve(1, OwnerType::Group).await?;
        let all = registry.load_all().await?;
        assert_eq!(all[&OwnerType::Player][&1], p);
        assert_eq!(all[&OwnerType::Group][&1], g);
        assert!(all[&OwnerType::Other].is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn warm_up_sees_owners_created_elsewhere() -> LedgerResult<()> {
        let store = Arc::new(InMemoryManaStore::new());
        let first = OwnerRegistry::new(store.clone());
        first.resolve(8, OwnerType::Other).await?;
        let second = OwnerRegistry::new(store);
        assert_eq!(second.warm_up().await?, 1);
        Ok(())
    }
}
