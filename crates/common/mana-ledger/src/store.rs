//! Storage gateway consumed by the ledger components.
//!
//! Every method is a single atomic step at the storage layer. Composite
//! sequences (read a pouch, then adjust several units) are serialised per
//! owner by [`crate::pouch::OwnerLocks`], not here.

use async_trait::async_trait;

use crate::error::{LedgerError, LedgerResult};
use crate::types::{
    Debit, Drawn, ExternalId, InternedId, ManaGainStat, ManaUnit, Millis, OwnerId, OwnerRecord,
    OwnerType, TransferLogEntry, TransferOutcome, UseLogEntry, UseStamp,
};

#[async_trait]
pub trait ManaStore: Send + Sync {
    /// Short backend name used as a metrics label.
    fn backend(&self) -> &'static str;

    /// Return the owner for `(foreign_id, foreign_type)`, creating it if absent.
    /// Concurrent first-time callers all observe the same record.
    async fn resolve_owner(
        &self,
        foreign_id: i64,
        foreign_type: OwnerType,
    ) -> LedgerResult<OwnerRecord>;

    async fn find_owner(
        &self,
        foreign_id: i64,
        foreign_type: OwnerType,
    ) -> LedgerResult<Option<OwnerRecord>>;

    async fn get_owner(&self, id: OwnerId) -> LedgerResult<Option<OwnerRecord>>;

    async fn all_owners(&self) -> LedgerResult<Vec<OwnerRecord>>;

    /// Insert-if-absent mapping of an external identifier.
    async fn intern(&self, external_id: ExternalId) -> LedgerResult<InternedId>;

    async fn external_id(&self, id: InternedId) -> LedgerResult<Option<ExternalId>>;

    /// Upsert keyed by `(owner_id, gain_time)`. On conflict the stored content
    /// grows by `unit.content`; the stored creator is kept. Returns the stored unit.
    async fn merge_unit(&self, unit: ManaUnit) -> LedgerResult<ManaUnit>;

    async fn get_unit(&self, owner: OwnerId, gain_time: Millis) -> LedgerResult<Option<ManaUnit>>;

    /// Returns whether a unit was removed.
    async fn delete_unit(&self, owner: OwnerId, gain_time: Millis) -> LedgerResult<bool>;

    /// Returns whether a unit was updated.
    async fn set_unit_content(
        &self,
        owner: OwnerId,
        gain_time: Millis,
        content: u64,
    ) -> LedgerResult<bool>;

    /// Move every unit of `from` with `gain_time <= cutoff` to `to`, all or nothing.
    /// A moved unit landing on an existing unit of `to` merges additively.
    ///
    /// A non-zero moved amount is added to the transfer row `(log_time, from, to)`
    /// in the same atomic step. An overflow anywhere aborts the whole move.
    async fn reassign_units_until(
        &self,
        from: OwnerId,
        to: OwnerId,
        cutoff: Millis,
        log_time: Millis,
    ) -> LedgerResult<TransferOutcome>;

    /// Consume `amount` from the units of `owner` gained at or after `since`,
    /// oldest first. Emptied units are deleted. With `usage`, the matching use
    /// rows are appended in the same atomic step. On any error nothing changes.
    async fn debit_units(
        &self,
        owner: OwnerId,
        since: Millis,
        amount: u64,
        usage: Option<UseStamp>,
    ) -> LedgerResult<Debit>;

    /// Delete every unit of `owner` with `gain_time <= cutoff`.
    async fn delete_units_until(&self, owner: OwnerId, cutoff: Millis) -> LedgerResult<usize>;

    /// Delete every unit of every owner with `gain_time < cutoff` (strict).
    async fn delete_units_before(&self, cutoff: Millis) -> LedgerResult<usize>;

    /// Units of `owner`, ascending by `gain_time`.
    async fn units_of(&self, owner: OwnerId) -> LedgerResult<Vec<ManaUnit>>;

    /// Return the stored stat for `owner`, persisting [`ManaGainStat::fresh`] first if absent.
    async fn get_or_create_gain_stat(&self, owner: OwnerId) -> LedgerResult<ManaGainStat>;

    /// Full replace of the stat row.
    async fn put_gain_stat(&self, stat: ManaGainStat) -> LedgerResult<()>;

    async fn all_gain_stats(&self) -> LedgerResult<Vec<ManaGainStat>>;

    /// Additive upsert keyed by `(log_time, from_owner, to_owner)`. Returns the accumulated row.
    async fn merge_transfer(&self, entry: TransferLogEntry) -> LedgerResult<TransferLogEntry>;

    /// Transfer rows ordered by `(log_time, from_owner, to_owner)`.
    async fn transfer_entries(&self) -> LedgerResult<Vec<TransferLogEntry>>;

    async fn append_use(&self, entry: UseLogEntry) -> LedgerResult<()>;

    /// Use rows in insertion order.
    async fn use_entries(&self) -> LedgerResult<Vec<UseLogEntry>>;

    /// Make every completed write durable. A no-op for volatile backends.
    async fn flush(&self) -> LedgerResult<()> {
        Ok(())
    }
}

/// Decide what a debit of `amount` draws from `live` (ascending by gain time).
/// Every non-empty unit before the last one drawn is drained completely.
pub(crate) fn plan_debit(live: &[ManaUnit], amount: u64) -> LedgerResult<Vec<Drawn>> {
    if amount == 0 {
        return Err(LedgerError::InvalidAmount("spend amount must be positive".into()));
    }
    let available = live.iter().fold(0u64, |acc, u| acc.saturating_add(u.content));
    if available < amount {
        return Err(LedgerError::InsufficientMana {
            requested: amount,
            available,
        });
    }
    let mut remaining = amount;
    let mut drawn = Vec::new();
    for unit in live.iter().filter(|u| u.content > 0) {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(unit.content);
        remaining -= take;
        drawn.push(Drawn {
            gain_time: unit.gain_time,
            creator_id: unit.creator_id,
            amount: take,
        });
    }
    Ok(drawn)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(gain_time: Millis, content: u64) -> ManaUnit {
        ManaUnit {
            content,
            gain_time,
            owner_id: OwnerId(1),
            creator_id: InternedId(1),
        }
    }

    #[test]
    fn plan_skips_empty_units_and_stops_when_covered() {
        let live = [unit(1, 2), unit(2, 0), unit(3, 5), unit(4, 9)];
        let drawn = plan_debit(&live, 4).unwrap();
        assert_eq!(
            drawn.iter().map(|d| (d.gain_time, d.amount)).collect::<Vec<_>>(),
            vec![(1, 2), (3, 2)]
        );
    }

    #[test]
    fn plan_rejects_short_balance_with_saturated_total() {
        let live = [unit(1, u64::MAX), unit(2, 1)];
        assert_eq!(plan_debit(&live, u64::MAX).unwrap().len(), 1);
        assert!(matches!(
            plan_debit(&[unit(1, 3)], 4),
            Err(LedgerError::InsufficientMana { requested: 4, available: 3 })
        ));
        assert!(matches!(plan_debit(&live, 0), Err(LedgerError::InvalidAmount(_))));
    }
}
