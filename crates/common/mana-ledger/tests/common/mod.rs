#![allow(dead_code)]

use mana_ledger::{InMemoryManaStore, ManaStore, SledManaStore};
use std::sync::Arc;

/// One store of each backend, labelled for assertion messages.
pub fn stores() -> Vec<(&'static str, Arc<dyn ManaStore>)> {
    vec![
        ("memory", Arc::new(InMemoryManaStore::new())),
        (
            "sled",
            Arc::new(SledManaStore::temporary().expect("open temporary sled store")),
        ),
    ]
}

pub const DAY: i64 = mana_ledger::MILLIS_PER_DAY;
