use std::sync::Arc;
use tracing::info;

use crate::activity::{GameHost, LoginRewarder};
use crate::audit::{TransferLedger, UseLedger};
use crate::clock::{Clock, SystemClock};
use crate::config::ManaConfig;
use crate::decay::{decay_sweep, DecayWorker};
use crate::error::LedgerResult;
use crate::interner::IdentityInterner;
use crate::pouch::{ManaPouch, OwnerLocks, PouchFactory};
use crate::registry::OwnerRegistry;
use crate::sled_store::SledManaStore;
use crate::store::ManaStore;
use crate::streak::{RewardPolicy, StreakTracker};
use crate::types::{ExternalId, Millis, OwnerId, TransferOutcome, UseLogEntry, UseStamp};

/// Wires every ledger component to one store and clock.
pub struct ManaEngine {
    config: ManaConfig,
    store: Arc<dyn ManaStore>,
    clock: Arc<dyn Clock>,
    locks: Arc<OwnerLocks>,
    registry: Arc<OwnerRegistry>,
    interner: Arc<IdentityInterner>,
    pouches: PouchFactory,
    streaks: Arc<StreakTracker>,
    transfers: TransferLedger,
    uses: UseLedger,
}

impl ManaEngine {
    /// Reward curve comes from `config.reward`.
    pub fn new(store: Arc<dyn ManaStore>, clock: Arc<dyn Clock>, config: ManaConfig) -> Self {
        let policy = Arc::new(config.reward);
        Self::with_reward_policy(store, clock, config, policy)
    }

    pub fn with_reward_policy(
        store: Arc<dyn ManaStore>,
        clock: Arc<dyn Clock>,
        config: ManaConfig,
        policy: Arc<dyn RewardPolicy>,
    ) -> Self {
        let locks = Arc::new(OwnerLocks::new());
        let interner = Arc::new(IdentityInterner::new(store.clone()));
        Self {
            registry: Arc::new(OwnerRegistry::new(store.clone())),
            pouches: PouchFactory::new(
                store.clone(),
                interner.clone(),
                locks.clone(),
                clock.clone(),
                config.rot_time_ms,
                config.transfer_log_bucket_ms,
            ),
            streaks: Arc::new(StreakTracker::new(store.clone(), clock.clone(), locks.clone(), policy)),
            transfers: TransferLedger::new(store.clone(), clock.clone(), config.transfer_log_bucket_ms),
            uses: UseLedger::new(store.clone(), clock.clone(), interner.clone()),
            interner,
            locks,
            store,
            clock,
            config,
        }
    }

    /// Open the sled store named by `config`, on the wall clock, with a warm owner cache.
    pub async fn open(config: ManaConfig) -> LedgerResult<Self> {
        let store = Arc::new(SledManaStore::open(&config.storage_path)?);
        let engine = Self::new(store, Arc::new(SystemClock), config);
        engine.registry.warm_up().await?;
        info!(path = %engine.config.storage_path.display(), "mana engine ready");
        Ok(engine)
    }

    pub fn config(&self) -> &ManaConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ManaStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<OwnerRegistry> {
        &self.registry
    }

    pub fn interner(&self) -> &Arc<IdentityInterner> {
        &self.interner
    }

    pub fn streaks(&self) -> &Arc<StreakTracker> {
        &self.streaks
    }

    pub fn transfers(&self) -> &TransferLedger {
        &self.transfers
    }

    pub fn uses(&self) -> &UseLedger {
        &self.uses
    }

    pub fn locks(&self) -> &Arc<OwnerLocks> {
        &self.locks
    }

    pub fn pouch(&self, owner: OwnerId) -> ManaPouch {
        self.pouches.pouch(owner)
    }

    /// Move `from`'s units up to `cutoff` into `to`; the moved amount is logged in the same step.
    pub async fn transfer_until(&self, from: OwnerId, to: OwnerId, cutoff: Millis) -> LedgerResult<TransferOutcome> {
        self.pouch(from).transfer_until(to, cutoff).await
    }

    /// Spend `amount` from `owner` and write one use row per creator whose mana was drawn.
    pub async fn use_mana(
        &self,
        owner: OwnerId,
        amount: u64,
        user: ExternalId,
        pearled: ExternalId,
        is_upgrade: bool,
    ) -> LedgerResult<Vec<UseLogEntry>> {
        let usage = UseStamp {
            log_time: self.clock.now_millis(),
            user: self.interner.intern(user).await?,
            pearled_target: self.interner.intern(pearled).await?,
            is_upgrade,
        };
        let debit = self.pouch(owner).consume(amount, Some(usage)).await?;
        Ok(debit.uses)
    }

    pub async fn decay_sweep(&self) -> LedgerResult<usize> {
        decay_sweep(self.store.as_ref(), self.clock.now_millis(), self.config.rot_time_ms).await
    }

    pub fn decay_worker(&self) -> DecayWorker {
        DecayWorker::new(
            self.store.clone(),
            self.clock.clone(),
            self.config.rot_time_ms,
            self.config.decay_interval(),
        )
    }

    pub fn login_rewarder(&self, host: Arc<dyn GameHost>) -> LoginRewarder {
        LoginRewarder::new(self.registry.clone(), self.streaks.clone(), host, self.pouches.clone())
    }
}
