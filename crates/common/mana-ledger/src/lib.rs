#![forbid(unsafe_code)]

//! Decaying mana ledger.
//!
//! Owners are resolved through [`OwnerRegistry`], hold time-stamped units in a
//! [`ManaPouch`], earn units through login streaks ([`StreakTracker`]) and leave
//! an audit trail in the [`TransferLedger`] and [`UseLedger`]. Units older than
//! the configured rot time are removed by [`decay_sweep`] / [`DecayWorker`].

pub mod activity;
pub mod audit;
pub mod clock;
pub mod config;
pub mod decay;
pub mod engine;
pub mod error;
pub mod interner;
pub mod memory_store;
pub mod metrics;
pub mod pouch;
pub mod registry;
pub mod sled_store;
pub mod store;
pub mod streak;
pub mod types;

pub use activity::{GameHost, LoginOutcome, LoginRewarder};
pub use audit::{TransferLedger, UseLedger};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ManaConfig;
pub use decay::{decay_sweep, DecayWorker};
pub use engine::ManaEngine;
pub use error::{ConfigError, LedgerError, LedgerResult};
pub use interner::IdentityInterner;
pub use memory_store::InMemoryManaStore;
pub use pouch::{ManaPouch, OwnerLocks, PouchFactory};
pub use registry::{OwnerMap, OwnerRegistry};
pub use sled_store::SledManaStore;
pub use store::ManaStore;
pub use streak::{LinearStreakReward, RewardGranted, RewardPolicy, StreakTracker};
pub use types::{
    epoch_day, Debit, Drawn, ExternalId, InternedId, ManaGainStat, ManaUnit, Millis, OwnerId,
    OwnerRecord, OwnerType, TransferLogEntry, TransferOutcome, UseLogEntry, UseStamp, MILLIS_PER_DAY,
};
