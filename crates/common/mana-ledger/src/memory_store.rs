use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{LedgerError, LedgerResult};
use crate::store::{plan_debit, ManaStore};
use crate::types::{
    Debit, ExternalId, InternedId, ManaGainStat, ManaUnit, Millis, OwnerId, OwnerRecord,
    OwnerType, TransferLogEntry, TransferOutcome, UseLogEntry, UseStamp,
};

#[derive(Debug, Default)]
struct Tables {
    owners: Vec<OwnerRecord>,
    owner_index: HashMap<(OwnerType, i64), OwnerId>,
    identities: Vec<ExternalId>,
    identity_index: HashMap<ExternalId, InternedId>,
    units: BTreeMap<(OwnerId, Millis), ManaUnit>,
    gain_stats: HashMap<OwnerId, ManaGainStat>,
    transfers: BTreeMap<(Millis, OwnerId, OwnerId), u64>,
    uses: Vec<UseLogEntry>,
}

impl Tables {
    fn merge_unit(&mut self, unit: ManaUnit) -> LedgerResult<ManaUnit> {
        match self.units.get_mut(&(unit.owner_id, unit.gain_time)) {
            Some(existing) => {
                existing.content = existing
                    .content
                    .checked_add(unit.content)
                    .ok_or_else(|| LedgerError::overflow("mana unit content"))?;
                Ok(*existing)
            }
            None => {
                self.units.insert((unit.owner_id, unit.gain_time), unit);
                Ok(unit)
            }
        }
    }

    fn unit_keys_until(&self, owner: OwnerId, cutoff: Millis) -> Vec<(OwnerId, Millis)> {
        self.units
            .range((owner, Millis::MIN)..=(owner, cutoff))
            .map(|(k, _)| *k)
            .collect()
    }
}

/// Map-backed store. Every operation runs under one write guard, which makes
/// each of them atomic. Cloning shares the underlying tables.
#[derive(Debug, Default, Clone)]
pub struct InMemoryManaStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryManaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ManaStore for InMemoryManaStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn resolve_owner(
        &self,
        foreign_id: i64,
        foreign_type: OwnerType,
    ) -> LedgerResult<OwnerRecord> {
        let mut t = self.tables.write().await;
        if let Some(id) = t.owner_index.get(&(foreign_type, foreign_id)) {
            return Ok(t.owners[(id.0 - 1) as usize]);
        }
        let record = OwnerRecord {
            id: OwnerId(t.owners.len() as u32 + 1),
            foreign_id,
            foreign_type,
        };
        t.owners.push(record);
        t.owner_index.insert((foreign_type, foreign_id), record.id);
        Ok(record)
    }

    async fn find_owner(
        &self,
        foreign_id: i64,
        foreign_type: OwnerType,
    ) -> LedgerResult<Option<OwnerRecord>> {
        let t = self.tables.read().await;
        Ok(t.owner_index
            .get(&(foreign_type, foreign_id))
            .map(|id| t.owners[(id.0 - 1) as usize]))
    }

    async fn get_owner(&self, id: OwnerId) -> LedgerResult<Option<OwnerRecord>> {
        let t = self.tables.read().await;
        Ok(id
            .0
            .checked_sub(1)
            .and_then(|idx| t.owners.get(idx as usize))
            .copied())
    }

    async fn all_owners(&self) -> LedgerResult<Vec<OwnerRecord>> {
        Ok(self.tables.read().await.owners.clone())
    }

    async fn intern(&self, external_id: ExternalId) -> LedgerResult<InternedId> {
        let mut t = self.tables.write().await;
        if let Some(id) = t.identity_index.get(&external_id) {
            return Ok(*id);
        }
        t.identities.push(external_id);
        let id = InternedId(t.identities.len() as u32);
        t.identity_index.insert(external_id, id);
        Ok(id)
    }

    async fn external_id(&self, id: InternedId) -> LedgerResult<Option<ExternalId>> {
        let t = self.tables.read().await;
        Ok(id
            .0
            .checked_sub(1)
            .and_then(|idx| t.identities.get(idx as usize))
            .copied())
    }

    async fn merge_unit(&self, unit: ManaUnit) -> LedgerResult<ManaUnit> {
        self.tables.write().await.merge_unit(unit)
    }

    async fn get_unit(&self, owner: OwnerId, gain_time: Millis) -> LedgerResult<Option<ManaUnit>> {
        Ok(self.tables.read().await.units.get(&(owner, gain_time)).copied())
    }

    async fn delete_unit(&self, owner: OwnerId, gain_time: Millis) -> LedgerResult<bool> {
        Ok(self
            .tables
            .write()
            .await
            .units
            .remove(&(owner, gain_time))
            .is_some())
    }

    async fn set_unit_content(
        &self,
        owner: OwnerId,
        gain_time: Millis,
        content: u64,
    ) -> LedgerResult<bool> {
        let mut t = self.tables.write().await;
        match t.units.get_mut(&(owner, gain_time)) {
            Some(unit) => {
                unit.content = content;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reassign_units_until(
        &self,
        from: OwnerId,
        to: OwnerId,
        cutoff: Millis,
        log_time: Millis,
    ) -> LedgerResult<TransferOutcome> {
        if from == to {
            return Ok(TransferOutcome::default());
        }
        let mut t = self.tables.write().await;
        let keys = t.unit_keys_until(from, cutoff);

        // Validate every addition before touching anything.
        let mut amount = 0u64;
        for key in &keys {
            let content = t.units.get(key).map_or(0, |u| u.content);
            amount = amount
                .checked_add(content)
                .ok_or_else(|| LedgerError::overflow("transferred amount"))?;
            if let Some(dest) = t.units.get(&(to, key.1)) {
                dest.content
                    .checked_add(content)
                    .ok_or_else(|| LedgerError::overflow("mana unit content"))?;
            }
        }
        let log_key = (log_time, from, to);
        let logged = t
            .transfers
            .get(&log_key)
            .copied()
            .unwrap_or(0)
            .checked_add(amount)
            .ok_or_else(|| LedgerError::overflow("transfer log amount"))?;

        for key in &keys {
            if let Some(mut unit) = t.units.remove(key) {
                unit.owner_id = to;
                t.merge_unit(unit)?;
            }
        }
        if amount > 0 {
            t.transfers.insert(log_key, logged);
        }
        Ok(TransferOutcome {
            units: keys.len(),
            amount,
        })
    }

    async fn debit_units(
        &self,
        owner: OwnerId,
        since: Millis,
        amount: u64,
        usage: Option<UseStamp>,
    ) -> LedgerResult<Debit> {
        let mut t = self.tables.write().await;
        let live: Vec<ManaUnit> = t
            .units
            .range((owner, since)..=(owner, Millis::MAX))
            .map(|(_, unit)| *unit)
            .collect();
        let drawn = plan_debit(&live, amount)?;
        for d in &drawn {
            let key = (owner, d.gain_time);
            let left = t.units.get(&key).map_or(0, |u| u.content - d.amount);
            if left == 0 {
                t.units.remove(&key);
            } else if let Some(unit) = t.units.get_mut(&key) {
                unit.content = left;
            }
        }
        let uses = usage.map(|stamp| stamp.rows(&drawn)).unwrap_or_default();
        t.uses.extend(uses.iter().copied());
        Ok(Debit { drawn, uses })
    }

    async fn delete_units_until(&self, owner: OwnerId, cutoff: Millis) -> LedgerResult<usize> {
        let mut t = self.tables.write().await;
        let keys = t.unit_keys_until(owner, cutoff);
        for key in &keys {
            t.units.remove(key);
        }
        Ok(keys.len())
    }

    async fn delete_units_before(&self, cutoff: Millis) -> LedgerResult<usize> {
        let mut t = self.tables.write().await;
        let before = t.units.len();
        t.units.retain(|(_, gain_time), _| *gain_time >= cutoff);
        Ok(before - t.units.len())
    }

    async fn units_of(&self, owner: OwnerId) -> LedgerResult<Vec<ManaUnit>> {
        let t = self.tables.read().await;
        Ok(t.units
            .range((owner, Millis::MIN)..=(owner, Millis::MAX))
            .map(|(_, unit)| *unit)
            .collect())
    }

    async fn get_or_create_gain_stat(&self, owner: OwnerId) -> LedgerResult<ManaGainStat> {
        let mut t = self.tables.write().await;
        Ok(*t
            .gain_stats
            .entry(owner)
            .or_insert_with(|| ManaGainStat::fresh(owner)))
    }

    async fn put_gain_stat(&self, stat: ManaGainStat) -> LedgerResult<()> {
        self.tables.write().await.gain_stats.insert(stat.owner_id, stat);
        Ok(())
    }

    async fn all_gain_stats(&self) -> LedgerResult<Vec<ManaGainStat>> {
        let t = self.tables.read().await;
        let mut stats: Vec<_> = t.gain_stats.values().copied().collect();
        stats.sort_by_key(|s| s.owner_id);
        Ok(stats)
    }

    async fn merge_transfer(&self, entry: TransferLogEntry) -> LedgerResult<TransferLogEntry> {
        let mut t = self.tables.write().await;
        let amount = t
            .transfers
            .entry((entry.log_time, entry.from_owner, entry.to_owner))
            .or_insert(0);
        *amount = amount
            .checked_add(entry.amount)
            .ok_or_else(|| LedgerError::overflow("transfer log amount"))?;
        Ok(TransferLogEntry {
            amount: *amount,
            ..entry
        })
    }

    async fn transfer_entries(&self) -> LedgerResult<Vec<TransferLogEntry>> {
        let t = self.tables.read().await;
        Ok(t.transfers
            .iter()
            .map(|((log_time, from_owner, to_owner), amount)| TransferLogEntry {
                log_time: *log_time,
                from_owner: *from_owner,
                to_owner: *to_owner,
                amount: *amount,
            })
            .collect())
    }

    async fn append_use(&self, entry: UseLogEntry) -> LedgerResult<()> {
        self.tables.write().await.uses.push(entry);
        Ok(())
    }

    async fn use_entries(&self) -> LedgerResult<Vec<UseLogEntry>> {
        Ok(self.tables.read().await.uses.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(owner: u32, gain_time: Millis, content: u64, creator: u32) -> ManaUnit {
        ManaUnit {
            content,
            gain_time,
            owner_id: OwnerId(owner),
            creator_id: InternedId(creator),
        }
    }

    #[tokio::test]
    async fn resolve_assigns_dense_ids() -> LedgerResult<()> {
        let store = InMemoryManaStore::new();
        let a = store.resolve_owner(10, OwnerType::Player).await?;
        let b = store.resolve_owner(10, OwnerType::Group).await?;
        let again = store.resolve_owner(10, OwnerType::Player).await?;
        assert_eq!(a.id, OwnerId(1));
        assert_eq!(b.id, OwnerId(2));
        assert_eq!(again, a);
        Ok(())
    }

    #[tokio::test]
    async fn reassign_merges_into_existing_destination_unit() -> LedgerResult<()> {
        let store = InMemoryManaStore::new();
        store.merge_unit(unit(1, 5, 10, 1)).await?;
        store.merge_unit(unit(2, 5, 3, 2)).await?;
        let outcome = store.reassign_units_until(OwnerId(1), OwnerId(2), 5, 1_000).await?;
        assert_eq!(outcome, TransferOutcome { units: 1, amount: 10 });
        let moved = store.units_of(OwnerId(2)).await?;
        assert_eq!(moved, vec![unit(2, 5, 13, 2)]);
        assert!(store.units_of(OwnerId(1)).await?.is_empty());
        assert_eq!(store.transfer_entries().await?[0].amount, 10);
        Ok(())
    }

    #[tokio::test]
    async fn get_owner_only_knows_resolved_ids() -> LedgerResult<()> {
        let store = InMemoryManaStore::new();
        let a = store.resolve_owner(3, OwnerType::Player).await?;
        assert_eq!(store.get_owner(a.id).await?, Some(a));
        assert_eq!(store.get_owner(OwnerId(0)).await?, None);
        assert_eq!(store.get_owner(OwnerId(2)).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn external_id_of_unknown_interned_id_is_none() -> LedgerResult<()> {
        let store = InMemoryManaStore::new();
        assert_eq!(store.external_id(InternedId(0)).await?, None);
        assert_eq!(store.external_id(InternedId(7)).await?, None);
        Ok(())
    }
}
