use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};

/// Milliseconds since the Unix epoch.
pub type Millis = i64;

pub const MILLIS_PER_DAY: Millis = 86_400_000;

/// Day number (days since the Unix epoch) containing `ms`.
pub fn epoch_day(ms: Millis) -> i64 {
    ms.div_euclid(MILLIS_PER_DAY)
}

/// Opaque 128-bit identifier supplied by the host (creators, users, pearled targets).
pub type ExternalId = Uuid;

/// Internal surrogate key of a mana owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(pub u32);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Small integer standing in for an [`ExternalId`] in the unit table and the use log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InternedId(pub u32);

impl fmt::Display for InternedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of foreign entity an owner record points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OwnerType {
    Player,
    Group,
    Other,
}

impl OwnerType {
    pub const ALL: [OwnerType; 3] = [OwnerType::Player, OwnerType::Group, OwnerType::Other];

    /// Stable tag written to storage.
    pub fn tag(self) -> u8 {
        match self {
            OwnerType::Player => 0,
            OwnerType::Group => 1,
            OwnerType::Other => 2,
        }
    }

    pub fn from_tag(tag: u8) -> LedgerResult<Self> {
        match tag {
            0 => Ok(OwnerType::Player),
            1 => Ok(OwnerType::Group),
            2 => Ok(OwnerType::Other),
            other => Err(LedgerError::ConstraintViolation(format!(
                "unknown owner type tag {}",
                other
            ))),
        }
    }
}

impl fmt::Display for OwnerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OwnerType::Player => "player",
            OwnerType::Group => "group",
            OwnerType::Other => "other",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for OwnerType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "player" => Ok(OwnerType::Player),
            "group" => Ok(OwnerType::Group),
            "other" => Ok(OwnerType::Other),
            _ => Err(LedgerError::NotFound(format!("owner type '{}'", s))),
        }
    }
}

/// Permanent mapping from a foreign entity to an owner id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub id: OwnerId,
    pub foreign_id: i64,
    pub foreign_type: OwnerType,
}

/// A single time-stamped chunk of mana held by an owner.
///
/// `(owner_id, gain_time)` is the identity of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManaUnit {
    pub content: u64,
    pub gain_time: Millis,
    pub owner_id: OwnerId,
    pub creator_id: InternedId,
}

/// Login streak bookkeeping for one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManaGainStat {
    pub owner_id: OwnerId,
    pub streak: u32,
    pub last_day: i64,
}

impl ManaGainStat {
    /// The record created the first time an owner is evaluated.
    pub fn fresh(owner_id: OwnerId) -> Self {
        Self {
            owner_id,
            streak: 0,
            // Far enough back that the first evaluation always resets.
            last_day: i64::MIN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLogEntry {
    /// Start of the bucket the transfer fell into.
    pub log_time: Millis,
    pub from_owner: OwnerId,
    pub to_owner: OwnerId,
    pub amount: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UseLogEntry {
    pub log_time: Millis,
    pub creator: InternedId,
    pub user: InternedId,
    pub pearled_target: InternedId,
    pub is_upgrade: bool,
    pub amount: u64,
}

/// Result of moving units from one pouch to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferOutcome {
    pub units: usize,
    pub amount: u64,
}

/// A portion of a unit consumed by a debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drawn {
    pub gain_time: Millis,
    pub creator_id: InternedId,
    pub amount: u64,
}

/// Who spent mana on what. A debit carrying a stamp writes its use rows in
/// the same atomic step as the unit changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseStamp {
    pub log_time: Millis,
    pub user: InternedId,
    pub pearled_target: InternedId,
    pub is_upgrade: bool,
}

impl UseStamp {
    /// One row per creator in `drawn`, amounts summed, in first-seen order.
    pub fn rows(&self, drawn: &[Drawn]) -> Vec<UseLogEntry> {
        let mut rows: Vec<UseLogEntry> = Vec::new();
        for d in drawn {
            match rows.iter_mut().find(|r| r.creator == d.creator_id) {
                // Bounded by the debited amount, which fits in u64.
                Some(row) => row.amount += d.amount,
                None => rows.push(UseLogEntry {
                    log_time: self.log_time,
                    creator: d.creator_id,
                    user: self.user,
                    pearled_target: self.pearled_target,
                    is_upgrade: self.is_upgrade,
                    amount: d.amount,
                }),
            }
        }
        rows
    }
}

/// Everything a debit changed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Debit {
    pub drawn: Vec<Drawn>,
    pub uses: Vec<UseLogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_day_floors_before_the_epoch() {
        assert_eq!(epoch_day(0), 0);
        assert_eq!(epoch_day(MILLIS_PER_DAY - 1), 0);
        assert_eq!(epoch_day(MILLIS_PER_DAY), 1);
        assert_eq!(epoch_day(-1), -1);
    }

    #[test]
    fn owner_type_tags_round_trip() {
        for ty in OwnerType::ALL {
            assert_eq!(OwnerType::from_tag(ty.tag()).unwrap(), ty);
            assert_eq!(ty.to_string().parse::<OwnerType>().unwrap(), ty);
        }
        assert!(matches!(
            OwnerType::from_tag(9),
            Err(LedgerError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn use_rows_group_by_creator_in_first_seen_order() {
        let stamp = UseStamp {
            log_time: 5,
            user: InternedId(9),
            pearled_target: InternedId(8),
            is_upgrade: false,
        };
        let drawn = [
            Drawn { gain_time: 1, creator_id: InternedId(2), amount: 3 },
            Drawn { gain_time: 2, creator_id: InternedId(1), amount: 4 },
            Drawn { gain_time: 3, creator_id: InternedId(2), amount: 1 },
        ];
        let rows = stamp.rows(&drawn);
        assert_eq!(
            rows.iter().map(|r| (r.creator, r.amount)).collect::<Vec<_>>(),
            vec![(InternedId(2), 4), (InternedId(1), 4)]
        );
        assert!(rows.iter().all(|r| r.log_time == 5 && r.user == InternedId(9)));
    }
}
