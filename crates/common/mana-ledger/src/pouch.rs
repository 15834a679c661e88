//! Owner-scoped access to mana units.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::audit::bucket_start;
use crate::clock::Clock;
use crate::error::{LedgerError, LedgerResult};
use crate::interner::IdentityInterner;
use crate::store::ManaStore;
use crate::types::{Debit, Drawn, ExternalId, ManaUnit, Millis, OwnerId, TransferOutcome, UseStamp};

/// One async mutex per owner, shared by every pouch handle.
#[derive(Debug, Default)]
pub struct OwnerLocks {
    locks: Mutex<HashMap<OwnerId, Arc<AsyncMutex<()>>>>,
}

impl OwnerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, owner: OwnerId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(owner).or_default().clone()
    }

    pub async fn lock(&self, owner: OwnerId) -> OwnedMutexGuard<()> {
        self.handle(owner).lock_owned().await
    }

    /// Lock two owners in ascending id order so opposite transfers cannot deadlock.
    pub async fn lock_pair(
        &self,
        a: OwnerId,
        b: OwnerId,
    ) -> (OwnedMutexGuard<()>, Option<OwnedMutexGuard<()>>) {
        if a == b {
            return (self.lock(a).await, None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first = self.lock(first).await;
        let second = self.lock(second).await;
        (first, Some(second))
    }
}

/// Builds [`ManaPouch`] handles that share one store, lock table and clock.
#[derive(Clone)]
pub struct PouchFactory {
    store: Arc<dyn ManaStore>,
    interner: Arc<IdentityInterner>,
    locks: Arc<OwnerLocks>,
    clock: Arc<dyn Clock>,
    rot_time: Millis,
    transfer_bucket: Millis,
}

impl PouchFactory {
    pub fn new(
        store: Arc<dyn ManaStore>,
        interner: Arc<IdentityInterner>,
        locks: Arc<OwnerLocks>,
        clock: Arc<dyn Clock>,
        rot_time: Millis,
        transfer_bucket: Millis,
    ) -> Self {
        Self {
            store,
            interner,
            locks,
            clock,
            rot_time,
            transfer_bucket,
        }
    }

    pub fn pouch(&self, owner: OwnerId) -> ManaPouch {
        ManaPouch::new(
            owner,
            self.store.clone(),
            self.interner.clone(),
            self.locks.clone(),
            self.clock.clone(),
            self.rot_time,
            self.transfer_bucket,
        )
    }
}

/// Handle on the units of a single owner.
///
/// Mutations hold the owner's lock for their whole read-modify-write. Units
/// are only ever created for, or moved to, owners the registry knows.
#[derive(Clone)]
pub struct ManaPouch {
    owner: OwnerId,
    store: Arc<dyn ManaStore>,
    interner: Arc<IdentityInterner>,
    locks: Arc<OwnerLocks>,
    clock: Arc<dyn Clock>,
    rot_time: Millis,
    transfer_bucket: Millis,
}

impl ManaPouch {
    pub fn new(
        owner: OwnerId,
        store: Arc<dyn ManaStore>,
        interner: Arc<IdentityInterner>,
        locks: Arc<OwnerLocks>,
        clock: Arc<dyn Clock>,
        rot_time: Millis,
        transfer_bucket: Millis,
    ) -> Self {
        Self {
            owner,
            store,
            interner,
            locks,
            clock,
            rot_time,
            transfer_bucket,
        }
    }

    async fn require_owner(&self, owner: OwnerId) -> LedgerResult<()> {
        match self.store.get_owner(owner).await? {
            Some(_) => Ok(()),
            None => Err(LedgerError::NotFound(format!("owner {}", owner))),
        }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Merge `content` into the unit at `gain_time`, creating it if needed.
    /// An existing unit keeps its creator.
    pub async fn add_unit(
        &self,
        content: u64,
        gain_time: Millis,
        creator: ExternalId,
    ) -> LedgerResult<ManaUnit> {
        if content == 0 {
            return Err(LedgerError::InvalidAmount("mana unit content must be positive".into()));
        }
        let creator_id = self.interner.intern(creator).await?;
        let _guard = self.locks.lock(self.owner).await;
        self.require_owner(self.owner).await?;
        let stored = self
            .store
            .merge_unit(ManaUnit {
                content,
                gain_time,
                owner_id: self.owner,
                creator_id,
            })
            .await?;
        debug!(owner = %self.owner, gain_time, content, total = stored.content, "added mana unit");
        Ok(stored)
    }

    /// [`add_unit`](Self::add_unit) stamped with the current time.
    pub async fn grant(&self, content: u64, creator: ExternalId) -> LedgerResult<ManaUnit> {
        self.add_unit(content, self.clock.now_millis(), creator).await
    }

    /// Delete the unit at `gain_time`. Absence is not an error.
    pub async fn remove_unit(&self, gain_time: Millis) -> LedgerResult<bool> {
        let _guard = self.locks.lock(self.owner).await;
        let removed = self.store.delete_unit(self.owner, gain_time).await?;
        debug!(owner = %self.owner, gain_time, removed, "sniped mana unit");
        Ok(removed)
    }

    /// Replace the content of the unit at `gain_time`. Absence is not an error.
    pub async fn set_unit_content(&self, gain_time: Millis, content: u64) -> LedgerResult<bool> {
        let _guard = self.locks.lock(self.owner).await;
        self.store.set_unit_content(self.owner, gain_time, content).await
    }

    /// Hand every unit gained at or before `cutoff` to `to`, keeping gain times and creators.
    ///
    /// The moved amount lands in the transfer log in the same store step, so
    /// either both happen or neither does.
    pub async fn transfer_until(&self, to: OwnerId, cutoff: Millis) -> LedgerResult<TransferOutcome> {
        let _guards = self.locks.lock_pair(self.owner, to).await;
        self.require_owner(self.owner).await?;
        self.require_owner(to).await?;
        if to == self.owner {
            return Ok(TransferOutcome::default());
        }
        let log_time = bucket_start(self.clock.now_millis(), self.transfer_bucket);
        let outcome = self
            .store
            .reassign_units_until(self.owner, to, cutoff, log_time)
            .await?;
        debug!(
            from = %self.owner,
            to = %to,
            cutoff,
            units = outcome.units,
            amount = outcome.amount,
            "transferred mana units"
        );
        Ok(outcome)
    }

    /// Delete every unit gained at or before `cutoff`.
    pub async fn delete_until(&self, cutoff: Millis) -> LedgerResult<usize> {
        let _guard = self.locks.lock(self.owner).await;
        self.store.delete_units_until(self.owner, cutoff).await
    }

    /// `(gain_time, content)` pairs, oldest first.
    pub async fn load(&self) -> LedgerResult<Vec<(Millis, u64)>> {
        Ok(self
            .store
            .units_of(self.owner)
            .await?
            .into_iter()
            .map(|u| (u.gain_time, u.content))
            .collect())
    }

    pub async fn units(&self) -> LedgerResult<Vec<ManaUnit>> {
        self.store.units_of(self.owner).await
    }

    /// Oldest gain time that has not rotted yet.
    fn live_since(&self) -> Millis {
        self.clock.now_millis().saturating_sub(self.rot_time)
    }

    /// Total content of units that have not rotted, whether or not a sweep has run.
    pub async fn balance(&self) -> LedgerResult<u64> {
        let since = self.live_since();
        Ok(self
            .store
            .units_of(self.owner)
            .await?
            .iter()
            .filter(|u| u.gain_time >= since)
            .fold(0u64, |acc, u| acc.saturating_add(u.content)))
    }

    /// Consume `amount` from the oldest live units first. Fails without
    /// touching anything if the live balance is short.
    pub async fn spend(&self, amount: u64) -> LedgerResult<Vec<Drawn>> {
        Ok(self.consume(amount, None).await?.drawn)
    }

    /// [`spend`](Self::spend), also appending the use rows described by
    /// `usage` in the same store step.
    pub async fn consume(&self, amount: u64, usage: Option<UseStamp>) -> LedgerResult<Debit> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount("spend amount must be positive".into()));
        }
        let _guard = self.locks.lock(self.owner).await;
        let debit = self
            .store
            .debit_units(self.owner, self.live_since(), amount, usage)
            .await?;
        debug!(owner = %self.owner, amount, units = debit.drawn.len(), uses = debit.uses.len(), "spent mana");
        Ok(debit)
    }

    /// External id of whoever created the unit at `gain_time`.
    pub async fn creator_of(&self, gain_time: Millis) -> LedgerResult<Option<ExternalId>> {
        match self.store.get_unit(self.owner, gain_time).await? {
            Some(unit) => self.interner.external_of(unit.creator_id).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory_store::InMemoryManaStore;
    use crate::types::OwnerType;
    use uuid::Uuid;

    /// A pouch for a freshly registered player.
    async fn pouch(store: Arc<dyn ManaStore>, clock: Arc<ManualClock>, rot: Millis) -> LedgerResult<ManaPouch> {
        let owner = store.resolve_owner(1, OwnerType::Player).await?.id;
        let interner = Arc::new(IdentityInterner::new(store.clone()));
        Ok(ManaPouch::new(owner, store, interner, Arc::new(OwnerLocks::new()), clock, rot, 1_000))
    }

    #[tokio::test]
    async fn zero_content_is_rejected() -> LedgerResult<()> {
        let store: Arc<dyn ManaStore> = Arc::new(InMemoryManaStore::new());
        let p = pouch(store, Arc::new(ManualClock::new(0)), 1_000).await?;
        let err = p.add_unit(0, 5, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
        Ok(())
    }

    #[tokio::test]
    async fn unregistered_owner_gets_no_units() -> LedgerResult<()> {
        let store: Arc<dyn ManaStore> = Arc::new(InMemoryManaStore::new());
        let interner = Arc::new(IdentityInterner::new(store.clone()));
        let clock = Arc::new(ManualClock::new(0));
        let p = ManaPouch::new(OwnerId(42), store.clone(), interner, Arc::new(OwnerLocks::new()), clock, 1_000, 1_000);
        let err = p.add_unit(5, 10, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
        assert!(store.units_of(OwnerId(42)).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn balance_ignores_rotted_units() -> LedgerResult<()> {
        let store: Arc<dyn ManaStore> = Arc::new(InMemoryManaStore::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let p = pouch(store, clock.clone(), 1_000).await?;
        let creator = Uuid::new_v4();
        p.add_unit(5, 8_999, creator).await?;
        p.add_unit(7, 9_000, creator).await?;
        assert_eq!(p.balance().await?, 7);
        assert_eq!(p.load().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn spend_draws_oldest_first() -> LedgerResult<()> {
        let store: Arc<dyn ManaStore> = Arc::new(InMemoryManaStore::new());
        let p = pouch(store, Arc::new(ManualClock::new(100)), 1_000).await?;
        let creator = Uuid::new_v4();
        p.add_unit(3, 10, creator).await?;
        p.add_unit(4, 20, creator).await?;
        p.add_unit(5, 30, creator).await?;

        let drawn = p.spend(5).await?;
        assert_eq!(drawn.iter().map(|d| (d.gain_time, d.amount)).collect::<Vec<_>>(), vec![(10, 3), (20, 2)]);
        assert_eq!(p.load().await?, vec![(20, 2), (30, 5)]);

        let err = p.spend(8).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientMana { requested: 8, available: 7 }));
        assert_eq!(p.load().await?, vec![(20, 2), (30, 5)]);
        Ok(())
    }

    #[tokio::test]
    async fn creator_of_resolves_external_id() -> LedgerResult<()> {
        let store: Arc<dyn ManaStore> = Arc::new(InMemoryManaStore::new());
        let p = pouch(store, Arc::new(ManualClock::new(0)), 1_000).await?;
        let creator = Uuid::new_v4();
        p.add_unit(1, 42, creator).await?;
        assert_eq!(p.creator_of(42).await?, Some(creator));
        assert_eq!(p.creator_of(43).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_merges_are_not_lost() -> LedgerResult<()> {
        let store: Arc<dyn ManaStore> = Arc::new(InMemoryManaStore::new());
        let p = pouch(store, Arc::new(ManualClock::new(0)), 1_000).await?;
        let mut handles = Vec::new();
        for _ in 0..50 {
            let p = p.clone();
            handles.push(tokio::spawn(async move { p.add_unit(2, 7, Uuid::new_v4()).await }));
        }
        for h in handles {
            h.await.expect("task panicked")?;
        }
        assert_eq!(p.load().await?, vec![(7, 100)]);
        Ok(())
    }
}
