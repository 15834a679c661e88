//! Login handling: streak evaluation plus reward delivery through the host.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

use crate::error::LedgerResult;
use crate::metrics::MANA_REWARDS_GRANTED_TOTAL;
use crate::pouch::PouchFactory;
use crate::registry::OwnerRegistry;
use crate::streak::{RewardGranted, StreakTracker};
use crate::types::{ExternalId, ManaUnit, OwnerType};

/// What the surrounding game server provides.
#[async_trait]
pub trait GameHost: Send + Sync {
    /// Whether the player may receive mana right now (e.g. not exiled).
    async fn is_eligible_for_reward(&self, player: ExternalId) -> bool;

    /// Best-effort message to the player.
    async fn notify(&self, player: ExternalId, message: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Already credited today.
    NoReward,
    Delivered { reward: RewardGranted, unit: ManaUnit },
    /// The streak advanced but the player was not eligible to receive mana.
    Withheld { reward: RewardGranted },
}

pub struct LoginRewarder {
    registry: Arc<OwnerRegistry>,
    streaks: Arc<StreakTracker>,
    host: Arc<dyn GameHost>,
    pouches: PouchFactory,
}

impl LoginRewarder {
    pub fn new(
        registry: Arc<OwnerRegistry>,
        streaks: Arc<StreakTracker>,
        host: Arc<dyn GameHost>,
        pouches: PouchFactory,
    ) -> Self {
        Self {
            registry,
            streaks,
            host,
            pouches,
        }
    }

    /// Evaluate a login of `player`, whose foreign id is `foreign_id`.
    ///
    /// The streak advances even when the player is ineligible. If delivering an
    /// eligible reward fails, the error is returned and the reward is reported
    /// as lost; it is not re-offered the same day.
    pub async fn on_login(&self, player: ExternalId, foreign_id: i64) -> LedgerResult<LoginOutcome> {
        let owner = self.registry.resolve(foreign_id, OwnerType::Player).await?;
        let reward = match self.streaks.update(owner).await? {
            Some(reward) => reward,
            None => return Ok(LoginOutcome::NoReward),
        };

        if !self.host.is_eligible_for_reward(player).await {
            MANA_REWARDS_GRANTED_TOTAL.with_label_values(&["false"]).inc();
            info!(%player, %owner, streak = reward.streak, "login reward withheld");
            self.host
                .notify(player, "You didn't get any mana because you are pearled")
                .await;
            return Ok(LoginOutcome::Withheld { reward });
        }

        if reward.amount == 0 {
            MANA_REWARDS_GRANTED_TOTAL.with_label_values(&["false"]).inc();
            return Ok(LoginOutcome::Withheld { reward });
        }

        let unit = match self.pouches.pouch(owner).grant(reward.amount, player).await {
            Ok(unit) => unit,
            Err(e) => {
                error!(%player, %owner, streak = reward.streak, amount = reward.amount, error = %e, "login reward lost");
                return Err(e);
            }
        };
        MANA_REWARDS_GRANTED_TOTAL.with_label_values(&["true"]).inc();
        self.host
            .notify(
                player,
                &format!("You got {} mana for logging in ({} day streak)", reward.amount, reward.streak),
            )
            .await;
        Ok(LoginOutcome::Delivered { reward, unit })
    }
}
