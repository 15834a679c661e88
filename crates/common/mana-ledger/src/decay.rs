//! Periodic removal of rotted mana units.
#![forbid(unsafe_code)]

use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{error, info};

use crate::clock::Clock;
use crate::error::LedgerResult;
use crate::metrics::{MANA_DECAY_SWEEPS_TOTAL, MANA_UNITS_DECAYED_TOTAL};
use crate::store::ManaStore;
use crate::types::Millis;

/// Delete every unit, across all owners, gained strictly before `now - rot_time`.
/// A unit exactly `rot_time` old survives.
pub async fn decay_sweep(store: &dyn ManaStore, now: Millis, rot_time: Millis) -> LedgerResult<usize> {
    let cutoff = now.saturating_sub(rot_time);
    let removed = store.delete_units_before(cutoff).await?;
    MANA_DECAY_SWEEPS_TOTAL.inc();
    MANA_UNITS_DECAYED_TOTAL.inc_by(removed as u64);
    info!(cutoff, removed, "mana decay sweep finished");
    Ok(removed)
}

/// Background task running [`decay_sweep`] on a fixed period.
///
/// Takes no per-owner locks; a unit merged into during a sweep may still be
/// removed if it is old enough.
pub struct DecayWorker {
    store: Arc<dyn ManaStore>,
    clock: Arc<dyn Clock>,
    rot_time: Millis,
    period: Duration,
}

impl DecayWorker {
    pub fn new(store: Arc<dyn ManaStore>, clock: Arc<dyn Clock>, rot_time: Millis, period: Duration) -> Self {
        Self {
            store,
            clock,
            rot_time,
            period,
        }
    }

    /// Run one sweep now.
    pub async fn tick(&self) -> LedgerResult<usize> {
        decay_sweep(self.store.as_ref(), self.clock.now_millis(), self.rot_time).await
    }

    /// Sweep every period until `shutdown` flips to `true` or its sender is dropped.
    /// A failed sweep is logged and the next period tries again.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, transient = e.is_transient(), "mana decay sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("mana decay worker stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory_store::InMemoryManaStore;
    use crate::types::{InternedId, ManaUnit, OwnerId};

    #[tokio::test(start_paused = true)]
    async fn worker_sweeps_until_shutdown() -> LedgerResult<()> {
        let store = Arc::new(InMemoryManaStore::new());
        let clock = Arc::new(ManualClock::new(10_000));
        store
            .merge_unit(ManaUnit {
                content: 1,
                gain_time: 0,
                owner_id: OwnerId(1),
                creator_id: InternedId(1),
            })
            .await?;

        let (tx, rx) = watch::channel(false);
        let worker = DecayWorker::new(store.clone(), clock, 5_000, Duration::from_secs(60));
        let handle = tokio::spawn(worker.run(rx));

        time::sleep(Duration::from_secs(1)).await;
        assert!(store.units_of(OwnerId(1)).await?.is_empty());

        tx.send(true).expect("worker alive");
        handle.await.expect("worker panicked");
        Ok(())
    }
}
