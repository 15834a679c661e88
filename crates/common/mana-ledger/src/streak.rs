//! Login streak tracking and reward calculation.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::LedgerResult;
use crate::pouch::OwnerLocks;
use crate::store::ManaStore;
use crate::types::{epoch_day, ManaGainStat, OwnerId};

/// Decides how much mana a login streak is worth.
pub trait RewardPolicy: Debug + Send + Sync {
    /// Must be non-decreasing in `streak`.
    fn reward_for_streak(&self, streak: u32) -> u64;
}

/// `base + per_streak_day * streak`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearStreakReward {
    pub base: u64,
    pub per_streak_day: u64,
    pub max: u64,
}

impl Default for LinearStreakReward {
    fn default() -> Self {
        Self {
            base: 0,
            per_streak_day: 1,
            max: 10,
        }
    }
}

impl RewardPolicy for LinearStreakReward {
    fn reward_for_streak(&self, streak: u32) -> u64 {
        self.base
            .saturating_add(self.per_streak_day.saturating_mul(streak as u64))
            .min(self.max)
    }
}

/// A reward triggered by a login evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardGranted {
    pub streak: u32,
    pub amount: u64,
}

/// What a login evaluation did to the stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    AlreadyCredited,
    Increment,
    Reset,
}

fn transition(last_day: i64, today: i64) -> Transition {
    if last_day >= today {
        // Same day, or a clock that went backwards: never move last_day back.
        Transition::AlreadyCredited
    } else if last_day == today - 1 {
        Transition::Increment
    } else {
        Transition::Reset
    }
}

pub struct StreakTracker {
    store: Arc<dyn ManaStore>,
    clock: Arc<dyn Clock>,
    locks: Arc<OwnerLocks>,
    policy: Arc<dyn RewardPolicy>,
}

impl StreakTracker {
    pub fn new(
        store: Arc<dyn ManaStore>,
        clock: Arc<dyn Clock>,
        locks: Arc<OwnerLocks>,
        policy: Arc<dyn RewardPolicy>,
    ) -> Self {
        Self {
            store,
            clock,
            locks,
            policy,
        }
    }

    /// The persisted stat for `owner`, created on first use.
    pub async fn stat(&self, owner: OwnerId) -> LedgerResult<ManaGainStat> {
        self.store.get_or_create_gain_stat(owner).await
    }

    pub async fn all_stats(&self) -> LedgerResult<Vec<ManaGainStat>> {
        self.store.all_gain_stats().await
    }

    /// Evaluate a login. The advanced stat is persisted before the reward is
    /// returned, so a failure can lose a reward but never hand out two.
    ///
    /// Serialised with the owner's pouch mutations through the shared lock table.
    pub async fn update(&self, owner: OwnerId) -> LedgerResult<Option<RewardGranted>> {
        let _guard = self.locks.lock(owner).await;
        let mut stat = self.store.get_or_create_gain_stat(owner).await?;
        let today = epoch_day(self.clock.now_millis());

        match transition(stat.last_day, today) {
            Transition::AlreadyCredited => {
                debug!(%owner, streak = stat.streak, "login already credited today");
                return Ok(None);
            }
            Transition::Increment => stat.streak = stat.streak.saturating_add(1),
            Transition::Reset => stat.streak = 1,
        }
        stat.last_day = today;
        self.store.put_gain_stat(stat).await?;

        let amount = self.policy.reward_for_streak(stat.streak);
        info!(%owner, streak = stat.streak, amount, "login streak advanced");
        Ok(Some(RewardGranted {
            streak: stat.streak,
            amount,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_the_calendar() {
        assert_eq!(transition(10, 10), Transition::AlreadyCredited);
        assert_eq!(transition(11, 10), Transition::AlreadyCredited);
        assert_eq!(transition(9, 10), Transition::Increment);
        assert_eq!(transition(5, 10), Transition::Reset);
        assert_eq!(transition(i64::MIN, 10), Transition::Reset);
    }

    #[test]
    fn linear_reward_is_capped_and_monotonic() {
        let policy = LinearStreakReward::default();
        let rewards: Vec<u64> = (0..15).map(|s| policy.reward_for_streak(s)).collect();
        assert!(rewards.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(policy.reward_for_streak(3), 3);
        assert_eq!(policy.reward_for_streak(50), 10);
    }
}
