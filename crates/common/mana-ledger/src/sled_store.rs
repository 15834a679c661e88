use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Batch, Db, Tree};
use std::path::Path;
use tracing::debug;

use crate::error::{LedgerError, LedgerResult};
use crate::metrics::observe;
use crate::store::{plan_debit, ManaStore};
use crate::types::{
    Debit, ExternalId, InternedId, ManaGainStat, ManaUnit, Millis, OwnerId, OwnerRecord,
    OwnerType, TransferLogEntry, TransferOutcome, UseLogEntry, UseStamp,
};

const BACKEND: &str = "sled";

const OWNERS_TREE: &str = "owners";
const OWNER_INDEX_TREE: &str = "owner_index";
const IDENTITIES_TREE: &str = "identities";
const IDENTITY_INDEX_TREE: &str = "identity_index";
const UNITS_TREE: &str = "units";
const GAIN_STATS_TREE: &str = "gain_stats";
const TRANSFER_LOG_TREE: &str = "transfer_log";
const USE_LOG_TREE: &str = "use_log";
const META_TREE: &str = "meta";

const OWNER_SEQ_KEY: &[u8] = b"owner_seq";
const IDENTITY_SEQ_KEY: &[u8] = b"identity_seq";

#[derive(Debug, Serialize, Deserialize)]
struct OwnerRow {
    foreign_id: i64,
    foreign_type: u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct UnitRow {
    content: u64,
    creator: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct GainStatRow {
    streak: u32,
    last_day: i64,
}

// Keys are big-endian so sled's byte order matches numeric order. Signed
// values get their sign bit flipped first.

fn ordered_i64(v: i64) -> [u8; 8] {
    ((v as u64) ^ (1 << 63)).to_be_bytes()
}

fn i64_from_ordered(bytes: &[u8]) -> LedgerResult<i64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| LedgerError::Codec(format!("expected 8 key bytes, got {}", bytes.len())))?;
    Ok((u64::from_be_bytes(raw) ^ (1 << 63)) as i64)
}

fn u32_from_be(bytes: &[u8]) -> LedgerResult<u32> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| LedgerError::Codec(format!("expected 4 bytes, got {}", bytes.len())))?;
    Ok(u32::from_be_bytes(raw))
}

fn u64_from_be(bytes: &[u8]) -> LedgerResult<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| LedgerError::Codec(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

fn owner_index_key(foreign_type: OwnerType, foreign_id: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(foreign_type.tag());
    key.extend_from_slice(&ordered_i64(foreign_id));
    key
}

fn unit_key(owner: OwnerId, gain_time: Millis) -> Vec<u8> {
    let mut key = Vec::with_capacity(12);
    key.extend_from_slice(&owner.0.to_be_bytes());
    key.extend_from_slice(&ordered_i64(gain_time));
    key
}

fn split_unit_key(key: &[u8]) -> LedgerResult<(OwnerId, Millis)> {
    if key.len() != 12 {
        return Err(LedgerError::Codec(format!("bad unit key length {}", key.len())));
    }
    Ok((OwnerId(u32_from_be(&key[..4])?), i64_from_ordered(&key[4..])?))
}

fn transfer_key(log_time: Millis, from: OwnerId, to: OwnerId) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&ordered_i64(log_time));
    key.extend_from_slice(&from.0.to_be_bytes());
    key.extend_from_slice(&to.0.to_be_bytes());
    key
}

fn encode<T: Serialize>(value: &T) -> LedgerResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> LedgerResult<T> {
    Ok(bincode::deserialize(bytes)?)
}

fn unit_from_row(owner_id: OwnerId, gain_time: Millis, row: UnitRow) -> ManaUnit {
    ManaUnit {
        content: row.content,
        gain_time,
        owner_id,
        creator_id: InternedId(row.creator),
    }
}

fn abort(e: LedgerError) -> ConflictableTransactionError<LedgerError> {
    ConflictableTransactionError::Abort(e)
}

fn from_tx(e: TransactionError<LedgerError>) -> LedgerError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => e.into(),
    }
}

/// Persistent [`ManaStore`] on top of sled.
#[derive(Clone)]
pub struct SledManaStore {
    db: Db,
    owners: Tree,
    owner_index: Tree,
    identities: Tree,
    identity_index: Tree,
    units: Tree,
    gain_stats: Tree,
    transfer_log: Tree,
    use_log: Tree,
    meta: Tree,
}

impl SledManaStore {
    /// Opens or creates the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Opens a throwaway database that is removed when dropped.
    pub fn temporary() -> LedgerResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> LedgerResult<Self> {
        Ok(Self {
            owners: db.open_tree(OWNERS_TREE)?,
            owner_index: db.open_tree(OWNER_INDEX_TREE)?,
            identities: db.open_tree(IDENTITIES_TREE)?,
            identity_index: db.open_tree(IDENTITY_INDEX_TREE)?,
            units: db.open_tree(UNITS_TREE)?,
            gain_stats: db.open_tree(GAIN_STATS_TREE)?,
            transfer_log: db.open_tree(TRANSFER_LOG_TREE)?,
            use_log: db.open_tree(USE_LOG_TREE)?,
            meta: db.open_tree(META_TREE)?,
            db,
        })
    }

    /// Flush dirty pages to disk.
    pub async fn flush(&self) -> LedgerResult<()> {
        observe(BACKEND, "flush", self.db.flush_async().await.map(|_| ()).map_err(Into::into))
    }

    fn do_get_owner(&self, id: OwnerId) -> LedgerResult<Option<OwnerRecord>> {
        let bytes = match self.owners.get(id.0.to_be_bytes())? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let row: OwnerRow = decode(&bytes)?;
        Ok(Some(OwnerRecord {
            id,
            foreign_id: row.foreign_id,
            foreign_type: OwnerType::from_tag(row.foreign_type)?,
        }))
    }

    fn owner_record(&self, id: OwnerId) -> LedgerResult<OwnerRecord> {
        self.do_get_owner(id)?
            .ok_or_else(|| LedgerError::ConstraintViolation(format!("owner index points at missing owner {}", id)))
    }

    fn do_find_owner(&self, foreign_id: i64, foreign_type: OwnerType) -> LedgerResult<Option<OwnerRecord>> {
        match self.owner_index.get(owner_index_key(foreign_type, foreign_id))? {
            Some(id) => Ok(Some(self.owner_record(OwnerId(u32_from_be(&id)?))?)),
            None => Ok(None),
        }
    }

    fn do_resolve_owner(&self, foreign_id: i64, foreign_type: OwnerType) -> LedgerResult<OwnerRecord> {
        if let Some(existing) = self.do_find_owner(foreign_id, foreign_type)? {
            return Ok(existing);
        }
        let index_key = owner_index_key(foreign_type, foreign_id);
        let row = encode(&OwnerRow {
            foreign_id,
            foreign_type: foreign_type.tag(),
        })?;
        let id = (&self.owners, &self.owner_index, &self.meta)
            .transaction(|(owners, index, meta)| {
                if let Some(existing) = index.get(index_key.as_slice())? {
                    return u32_from_be(&existing).map_err(abort);
                }
                let next = match meta.get(OWNER_SEQ_KEY)? {
                    Some(seq) => u32_from_be(&seq).map_err(abort)? + 1,
                    None => 1,
                };
                let id_bytes = next.to_be_bytes();
                meta.insert(OWNER_SEQ_KEY, &id_bytes[..])?;
                index.insert(index_key.as_slice(), &id_bytes[..])?;
                owners.insert(&id_bytes[..], row.as_slice())?;
                Ok(next)
            })
            .map_err(from_tx)?;
        debug!(owner = id, foreign_id, %foreign_type, "resolved mana owner");
        Ok(OwnerRecord {
            id: OwnerId(id),
            foreign_id,
            foreign_type,
        })
    }

    fn do_all_owners(&self) -> LedgerResult<Vec<OwnerRecord>> {
        let mut out = Vec::new();
        for item in self.owners.iter() {
            let (key, value) = item?;
            let row: OwnerRow = decode(&value)?;
            out.push(OwnerRecord {
                id: OwnerId(u32_from_be(&key)?),
                foreign_id: row.foreign_id,
                foreign_type: OwnerType::from_tag(row.foreign_type)?,
            });
        }
        Ok(out)
    }

    fn do_intern(&self, external_id: ExternalId) -> LedgerResult<InternedId> {
        let ext = *external_id.as_bytes();
        if let Some(id) = self.identity_index.get(ext)? {
            return Ok(InternedId(u32_from_be(&id)?));
        }
        let id = (&self.identities, &self.identity_index, &self.meta)
            .transaction(|(identities, index, meta)| {
                if let Some(existing) = index.get(&ext[..])? {
                    return u32_from_be(&existing).map_err(abort);
                }
                let next = match meta.get(IDENTITY_SEQ_KEY)? {
                    Some(seq) => u32_from_be(&seq).map_err(abort)? + 1,
                    None => 1,
                };
                let id_bytes = next.to_be_bytes();
                meta.insert(IDENTITY_SEQ_KEY, &id_bytes[..])?;
                index.insert(&ext[..], &id_bytes[..])?;
                identities.insert(&id_bytes[..], &ext[..])?;
                Ok(next)
            })
            .map_err(from_tx)?;
        Ok(InternedId(id))
    }

    fn do_external_id(&self, id: InternedId) -> LedgerResult<Option<ExternalId>> {
        match self.identities.get(id.0.to_be_bytes())? {
            Some(bytes) => ExternalId::from_slice(&bytes)
                .map(Some)
                .map_err(|e| LedgerError::Codec(e.to_string())),
            None => Ok(None),
        }
    }

    fn do_merge_unit(&self, unit: ManaUnit) -> LedgerResult<ManaUnit> {
        let key = unit_key(unit.owner_id, unit.gain_time);
        let incoming = UnitRow {
            content: unit.content,
            creator: unit.creator_id.0,
        };
        let mut failure = None;
        let stored = self.units.update_and_fetch(key.as_slice(), |old| {
            failure = None;
            let merged = match old {
                None => Ok(incoming),
                Some(bytes) => decode::<UnitRow>(bytes).and_then(|existing| {
                    existing
                        .content
                        .checked_add(incoming.content)
                        .map(|content| UnitRow { content, ..existing })
                        .ok_or_else(|| LedgerError::overflow("mana unit content"))
                }),
            };
            match merged.and_then(|row| encode(&row)) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    failure = Some(e);
                    old.map(|b| b.to_vec())
                }
            }
        })?;
        if let Some(e) = failure {
            return Err(e);
        }
        let bytes = stored.ok_or_else(|| LedgerError::ConstraintViolation("merged unit vanished".into()))?;
        Ok(unit_from_row(unit.owner_id, unit.gain_time, decode(&bytes)?))
    }

    fn do_get_unit(&self, owner: OwnerId, gain_time: Millis) -> LedgerResult<Option<ManaUnit>> {
        match self.units.get(unit_key(owner, gain_time))? {
            Some(bytes) => Ok(Some(unit_from_row(owner, gain_time, decode(&bytes)?))),
            None => Ok(None),
        }
    }

    fn do_set_unit_content(&self, owner: OwnerId, gain_time: Millis, content: u64) -> LedgerResult<bool> {
        let mut failure = None;
        let updated = self
            .units
            .update_and_fetch(unit_key(owner, gain_time), |old| {
                failure = None;
                let bytes = old?;
                match decode::<UnitRow>(bytes).and_then(|row| encode(&UnitRow { content, ..row })) {
                    Ok(next) => Some(next),
                    Err(e) => {
                        failure = Some(e);
                        Some(bytes.to_vec())
                    }
                }
            })?;
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(updated.is_some())
    }

    fn unit_keys_until(&self, owner: OwnerId, cutoff: Millis) -> LedgerResult<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        for item in self
            .units
            .range(unit_key(owner, Millis::MIN)..=unit_key(owner, cutoff))
        {
            let (key, _) = item?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    fn do_reassign_units_until(
        &self,
        from: OwnerId,
        to: OwnerId,
        cutoff: Millis,
        log_time: Millis,
    ) -> LedgerResult<TransferOutcome> {
        if from == to {
            return Ok(TransferOutcome::default());
        }
        let keys = self.unit_keys_until(from, cutoff)?;
        if keys.is_empty() {
            return Ok(TransferOutcome::default());
        }
        let log_key = transfer_key(log_time, from, to);
        (&self.units, &self.transfer_log)
            .transaction(|(units, transfer_log)| {
                let mut outcome = TransferOutcome::default();
                for key in &keys {
                    let row = match units.get(key.as_slice())? {
                        Some(bytes) => decode::<UnitRow>(&bytes).map_err(abort)?,
                        None => continue,
                    };
                    units.remove(key.as_slice())?;
                    let (_, gain_time) = split_unit_key(key).map_err(abort)?;
                    let dest = unit_key(to, gain_time);
                    let merged = match units.get(dest.as_slice())? {
                        Some(bytes) => {
                            let existing = decode::<UnitRow>(&bytes).map_err(abort)?;
                            let content = existing
                                .content
                                .checked_add(row.content)
                                .ok_or_else(|| abort(LedgerError::overflow("mana unit content")))?;
                            UnitRow { content, ..existing }
                        }
                        None => row,
                    };
                    units.insert(dest, encode(&merged).map_err(abort)?)?;
                    outcome.units += 1;
                    outcome.amount = outcome
                        .amount
                        .checked_add(row.content)
                        .ok_or_else(|| abort(LedgerError::overflow("transferred amount")))?;
                }
                if outcome.amount > 0 {
                    let previous = match transfer_log.get(log_key.as_slice())? {
                        Some(bytes) => u64_from_be(&bytes).map_err(abort)?,
                        None => 0,
                    };
                    let total = previous
                        .checked_add(outcome.amount)
                        .ok_or_else(|| abort(LedgerError::overflow("transfer log amount")))?;
                    transfer_log.insert(log_key.as_slice(), &total.to_be_bytes()[..])?;
                }
                Ok(outcome)
            })
            .map_err(from_tx)
    }

    fn do_debit_units(
        &self,
        owner: OwnerId,
        since: Millis,
        amount: u64,
        usage: Option<UseStamp>,
    ) -> LedgerResult<Debit> {
        let mut keys = Vec::new();
        for item in self
            .units
            .range(unit_key(owner, since)..=unit_key(owner, Millis::MAX))
        {
            let (key, _) = item?;
            keys.push(key.to_vec());
        }
        (&self.units, &self.use_log)
            .transaction(|(units, use_log)| {
                let mut live = Vec::with_capacity(keys.len());
                for key in &keys {
                    if let Some(bytes) = units.get(key.as_slice())? {
                        let (_, gain_time) = split_unit_key(key).map_err(abort)?;
                        let row = decode::<UnitRow>(&bytes).map_err(abort)?;
                        if row.content > 0 {
                            live.push(unit_from_row(owner, gain_time, row));
                        }
                    }
                }
                let drawn = plan_debit(&live, amount).map_err(abort)?;
                // `drawn` is a prefix of `live`.
                for (d, unit) in drawn.iter().zip(&live) {
                    let key = unit_key(owner, d.gain_time);
                    if d.amount == unit.content {
                        units.remove(key)?;
                    } else {
                        let row = UnitRow {
                            content: unit.content - d.amount,
                            creator: unit.creator_id.0,
                        };
                        units.insert(key, encode(&row).map_err(abort)?)?;
                    }
                }
                let uses = usage.map(|stamp| stamp.rows(&drawn)).unwrap_or_default();
                for entry in &uses {
                    let seq = self.db.generate_id().map_err(|e| abort(e.into()))?;
                    use_log.insert(&seq.to_be_bytes()[..], encode(entry).map_err(abort)?)?;
                }
                Ok(Debit { drawn, uses })
            })
            .map_err(from_tx)
    }

    fn remove_keys(&self, keys: &[Vec<u8>]) -> LedgerResult<usize> {
        let mut batch = Batch::default();
        for key in keys {
            batch.remove(key.as_slice());
        }
        self.units.apply_batch(batch)?;
        Ok(keys.len())
    }

    fn do_delete_units_before(&self, cutoff: Millis) -> LedgerResult<usize> {
        let mut doomed = Vec::new();
        for item in self.units.iter() {
            let (key, _) = item?;
            let (_, gain_time) = split_unit_key(&key)?;
            if gain_time < cutoff {
                doomed.push(key.to_vec());
            }
        }
        self.remove_keys(&doomed)
    }

    fn do_units_of(&self, owner: OwnerId) -> LedgerResult<Vec<ManaUnit>> {
        let mut out = Vec::new();
        for item in self.units.scan_prefix(owner.0.to_be_bytes()) {
            let (key, value) = item?;
            let (_, gain_time) = split_unit_key(&key)?;
            out.push(unit_from_row(owner, gain_time, decode(&value)?));
        }
        Ok(out)
    }

    fn do_get_or_create_gain_stat(&self, owner: OwnerId) -> LedgerResult<ManaGainStat> {
        let fresh = ManaGainStat::fresh(owner);
        let row = encode(&GainStatRow {
            streak: fresh.streak,
            last_day: fresh.last_day,
        })?;
        match self
            .gain_stats
            .compare_and_swap(owner.0.to_be_bytes(), None as Option<&[u8]>, Some(row))?
        {
            Ok(()) => Ok(fresh),
            Err(cas) => {
                let current = cas.current.ok_or_else(|| {
                    LedgerError::ConstraintViolation(format!("gain stat for {} raced to absent", owner))
                })?;
                let row: GainStatRow = decode(&current)?;
                Ok(ManaGainStat {
                    owner_id: owner,
                    streak: row.streak,
                    last_day: row.last_day,
                })
            }
        }
    }

    fn do_put_gain_stat(&self, stat: ManaGainStat) -> LedgerResult<()> {
        let row = encode(&GainStatRow {
            streak: stat.streak,
            last_day: stat.last_day,
        })?;
        self.gain_stats.insert(stat.owner_id.0.to_be_bytes(), row)?;
        Ok(())
    }

    fn do_all_gain_stats(&self) -> LedgerResult<Vec<ManaGainStat>> {
        let mut out = Vec::new();
        for item in self.gain_stats.iter() {
            let (key, value) = item?;
            let row: GainStatRow = decode(&value)?;
            out.push(ManaGainStat {
                owner_id: OwnerId(u32_from_be(&key)?),
                streak: row.streak,
                last_day: row.last_day,
            });
        }
        Ok(out)
    }

    fn do_merge_transfer(&self, entry: TransferLogEntry) -> LedgerResult<TransferLogEntry> {
        let key = transfer_key(entry.log_time, entry.from_owner, entry.to_owner);
        let mut failure = None;
        let stored = self.transfer_log.update_and_fetch(key, |old| {
            failure = None;
            let total = match old {
                None => Ok(entry.amount),
                Some(bytes) => u64_from_be(bytes).and_then(|previous| {
                    previous
                        .checked_add(entry.amount)
                        .ok_or_else(|| LedgerError::overflow("transfer log amount"))
                }),
            };
            match total {
                Ok(total) => Some(total.to_be_bytes().to_vec()),
                Err(e) => {
                    failure = Some(e);
                    old.map(|b| b.to_vec())
                }
            }
        })?;
        if let Some(e) = failure {
            return Err(e);
        }
        let amount = match stored {
            Some(bytes) => u64_from_be(&bytes)?,
            None => entry.amount,
        };
        Ok(TransferLogEntry { amount, ..entry })
    }

    fn do_transfer_entries(&self) -> LedgerResult<Vec<TransferLogEntry>> {
        let mut out = Vec::new();
        for item in self.transfer_log.iter() {
            let (key, value) = item?;
            if key.len() != 16 {
                return Err(LedgerError::Codec(format!("bad transfer key length {}", key.len())));
            }
            out.push(TransferLogEntry {
                log_time: i64_from_ordered(&key[..8])?,
                from_owner: OwnerId(u32_from_be(&key[8..12])?),
                to_owner: OwnerId(u32_from_be(&key[12..])?),
                amount: u64_from_be(&value)?,
            });
        }
        Ok(out)
    }

    fn do_append_use(&self, entry: UseLogEntry) -> LedgerResult<()> {
        let seq = self.db.generate_id()?;
        self.use_log.insert(seq.to_be_bytes(), encode(&entry)?)?;
        Ok(())
    }

    fn do_use_entries(&self) -> LedgerResult<Vec<UseLogEntry>> {
        let mut out = Vec::new();
        for item in self.use_log.iter() {
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl ManaStore for SledManaStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn flush(&self) -> LedgerResult<()> {
        SledManaStore::flush(self).await
    }

    async fn resolve_owner(&self, foreign_id: i64, foreign_type: OwnerType) -> LedgerResult<OwnerRecord> {
        observe(BACKEND, "resolve_owner", self.do_resolve_owner(foreign_id, foreign_type))
    }

    async fn find_owner(&self, foreign_id: i64, foreign_type: OwnerType) -> LedgerResult<Option<OwnerRecord>> {
        observe(BACKEND, "find_owner", self.do_find_owner(foreign_id, foreign_type))
    }

    async fn get_owner(&self, id: OwnerId) -> LedgerResult<Option<OwnerRecord>> {
        observe(BACKEND, "get_owner", self.do_get_owner(id))
    }

    async fn all_owners(&self) -> LedgerResult<Vec<OwnerRecord>> {
        observe(BACKEND, "all_owners", self.do_all_owners())
    }

    async fn intern(&self, external_id: ExternalId) -> LedgerResult<InternedId> {
        observe(BACKEND, "intern", self.do_intern(external_id))
    }

    async fn external_id(&self, id: InternedId) -> LedgerResult<Option<ExternalId>> {
        observe(BACKEND, "external_id", self.do_external_id(id))
    }

    async fn merge_unit(&self, unit: ManaUnit) -> LedgerResult<ManaUnit> {
        observe(BACKEND, "merge_unit", self.do_merge_unit(unit))
    }

    async fn get_unit(&self, owner: OwnerId, gain_time: Millis) -> LedgerResult<Option<ManaUnit>> {
        observe(BACKEND, "get_unit", self.do_get_unit(owner, gain_time))
    }

    async fn delete_unit(&self, owner: OwnerId, gain_time: Millis) -> LedgerResult<bool> {
        let result = self
            .units
            .remove(unit_key(owner, gain_time))
            .map(|old| old.is_some())
            .map_err(Into::into);
        observe(BACKEND, "delete_unit", result)
    }

    async fn set_unit_content(&self, owner: OwnerId, gain_time: Millis, content: u64) -> LedgerResult<bool> {
        observe(BACKEND, "set_unit_content", self.do_set_unit_content(owner, gain_time, content))
    }

    async fn reassign_units_until(
        &self,
        from: OwnerId,
        to: OwnerId,
        cutoff: Millis,
        log_time: Millis,
    ) -> LedgerResult<TransferOutcome> {
        observe(
            BACKEND,
            "reassign_units_until",
            self.do_reassign_units_until(from, to, cutoff, log_time),
        )
    }

    async fn debit_units(
        &self,
        owner: OwnerId,
        since: Millis,
        amount: u64,
        usage: Option<UseStamp>,
    ) -> LedgerResult<Debit> {
        observe(BACKEND, "debit_units", self.do_debit_units(owner, since, amount, usage))
    }

    async fn delete_units_until(&self, owner: OwnerId, cutoff: Millis) -> LedgerResult<usize> {
        let result = self
            .unit_keys_until(owner, cutoff)
            .and_then(|keys| self.remove_keys(&keys));
        observe(BACKEND, "delete_units_until", result)
    }

    async fn delete_units_before(&self, cutoff: Millis) -> LedgerResult<usize> {
        observe(BACKEND, "delete_units_before", self.do_delete_units_before(cutoff))
    }

    async fn units_of(&self, owner: OwnerId) -> LedgerResult<Vec<ManaUnit>> {
        observe(BACKEND, "units_of", self.do_units_of(owner))
    }

    async fn get_or_create_gain_stat(&self, owner: OwnerId) -> LedgerResult<ManaGainStat> {
        observe(BACKEND, "get_or_create_gain_stat", self.do_get_or_create_gain_stat(owner))
    }

    async fn put_gain_stat(&self, stat: ManaGainStat) -> LedgerResult<()> {
        observe(BACKEND, "put_gain_stat", self.do_put_gain_stat(stat))
    }

    async fn all_gain_stats(&self) -> LedgerResult<Vec<ManaGainStat>> {
        observe(BACKEND, "all_gain_stats", self.do_all_gain_stats())
    }

    async fn merge_transfer(&self, entry: TransferLogEntry) -> LedgerResult<TransferLogEntry> {
        observe(BACKEND, "merge_transfer", self.do_merge_transfer(entry))
    }

    async fn transfer_entries(&self) -> LedgerResult<Vec<TransferLogEntry>> {
        observe(BACKEND, "transfer_entries", self.do_transfer_entries())
    }

    async fn append_use(&self, entry: UseLogEntry) -> LedgerResult<()> {
        observe(BACKEND, "append_use", self.do_append_use(entry))
    }

    async fn use_entries(&self) -> LedgerResult<Vec<UseLogEntry>> {
        observe(BACKEND, "use_entries", self.do_use_entries())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn unit(owner: u32, gain_time: Millis, content: u64) -> ManaUnit {
        ManaUnit {
            content,
            gain_time,
            owner_id: OwnerId(owner),
            creator_id: InternedId(1),
        }
    }

    #[test]
    fn ordered_keys_sort_numerically() {
        let mut keys = vec![ordered_i64(5), ordered_i64(-3), ordered_i64(0), ordered_i64(i64::MIN)];
        keys.sort();
        let decoded: Vec<i64> = keys.iter().map(|k| i64_from_ordered(k).unwrap()).collect();
        assert_eq!(decoded, vec![i64::MIN, -3, 0, 5]);
    }

    #[tokio::test]
    async fn owners_and_identities_survive_reopen() -> LedgerResult<()> {
        let dir = tempdir().map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;
        let ext = Uuid::new_v4();
        {
            let store = SledManaStore::open(dir.path())?;
            assert_eq!(store.resolve_owner(42, OwnerType::Player).await?.id, OwnerId(1));
            assert_eq!(store.resolve_owner(7, OwnerType::Group).await?.id, OwnerId(2));
            assert_eq!(store.intern(ext).await?, InternedId(1));
            store.flush().await?;
        }
        let store = SledManaStore::open(dir.path())?;
        assert_eq!(store.resolve_owner(42, OwnerType::Player).await?.id, OwnerId(1));
        assert_eq!(store.resolve_owner(1, OwnerType::Other).await?.id, OwnerId(3));
        assert_eq!(store.intern(ext).await?, InternedId(1));
        assert_eq!(store.external_id(InternedId(1)).await?, Some(ext));
        Ok(())
    }

    #[tokio::test]
    async fn units_scan_in_gain_time_order() -> LedgerResult<()> {
        let store = SledManaStore::temporary()?;
        for t in [300, -20, 100] {
            store.merge_unit(unit(1, t, 1)).await?;
        }
        store.merge_unit(unit(2, 50, 9)).await?;
        let times: Vec<Millis> = store.units_of(OwnerId(1)).await?.iter().map(|u| u.gain_time).collect();
        assert_eq!(times, vec![-20, 100, 300]);
        Ok(())
    }

    #[tokio::test]
    async fn set_content_on_missing_unit_does_not_create_it() -> LedgerResult<()> {
        let store = SledManaStore::temporary()?;
        assert!(!store.set_unit_content(OwnerId(1), 10, 5).await?);
        assert!(store.get_unit(OwnerId(1), 10).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_unit_aborts_the_whole_debit() -> LedgerResult<()> {
        let store = SledManaStore::temporary()?;
        store.merge_unit(unit(1, 10, 4)).await?;
        store.merge_unit(unit(1, 20, 4)).await?;
        store.units.insert(unit_key(OwnerId(1), 20), &b"garbage"[..])?;
        let stamp = UseStamp {
            log_time: 0,
            user: InternedId(2),
            pearled_target: InternedId(3),
            is_upgrade: false,
        };

        let err = store.debit_units(OwnerId(1), 0, 6, Some(stamp)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Codec(_)));
        assert_eq!(store.get_unit(OwnerId(1), 10).await?, Some(unit(1, 10, 4)));
        assert!(store.use_entries().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_transfer_row_is_reported_not_reset() -> LedgerResult<()> {
        let store = SledManaStore::temporary()?;
        let key = transfer_key(1_000, OwnerId(1), OwnerId(2));
        store.transfer_log.insert(key.as_slice(), &b"bad"[..])?;
        let entry = TransferLogEntry {
            log_time: 1_000,
            from_owner: OwnerId(1),
            to_owner: OwnerId(2),
            amount: 5,
        };

        let err = store.merge_transfer(entry).await.unwrap_err();
        assert!(matches!(err, LedgerError::Codec(_)));
        assert_eq!(store.transfer_log.get(key.as_slice())?.as_deref(), Some(&b"bad"[..]));
        Ok(())
    }

    #[tokio::test]
    async fn gain_stat_is_persisted_on_first_read() -> LedgerResult<()> {
        let store = SledManaStore::temporary()?;
        let stat = store.get_or_create_gain_stat(OwnerId(4)).await?;
        assert_eq!(stat, ManaGainStat::fresh(OwnerId(4)));
        assert_eq!(store.all_gain_stats().await?, vec![stat]);
        Ok(())
    }
}
