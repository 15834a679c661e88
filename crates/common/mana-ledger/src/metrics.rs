use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

use crate::error::{LedgerError, LedgerResult};

lazy_static! {
    // Store operations
    pub static ref MANA_STORE_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "mana_store_operations_total",
        "Total number of operations against the mana store",
        &["store", "operation", "status"]
    ).expect("register mana_store_operations_total");

    pub static ref MANA_STORE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "mana_store_errors_total",
        "Total number of errors during mana store operations",
        &["store", "operation", "error_type"]
    ).expect("register mana_store_errors_total");

    // Decay
    pub static ref MANA_DECAY_SWEEPS_TOTAL: IntCounter = register_int_counter!(
        "mana_decay_sweeps_total",
        "Total number of completed decay sweeps"
    ).expect("register mana_decay_sweeps_total");

    pub static ref MANA_UNITS_DECAYED_TOTAL: IntCounter = register_int_counter!(
        "mana_units_decayed_total",
        "Total number of mana units removed by decay sweeps"
    ).expect("register mana_units_decayed_total");

    // Rewards
    pub static ref MANA_REWARDS_GRANTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "mana_rewards_granted_total",
        "Login rewards triggered by streak evaluation",
        &["delivered"]
    ).expect("register mana_rewards_granted_total");

    pub static ref MANA_OWNERS_KNOWN: IntGauge = register_int_gauge!(
        "mana_owners_known",
        "Number of owners held in the registry cache"
    ).expect("register mana_owners_known");
}

fn error_type(e: &LedgerError) -> &'static str {
    match e {
        LedgerError::StorageUnavailable(_) => "io",
        LedgerError::ConstraintViolation(_) => "constraint",
        LedgerError::NotFound(_) => "not_found",
        LedgerError::InvalidAmount(_) | LedgerError::InsufficientMana { .. } => "invalid",
        LedgerError::Codec(_) => "deserialization",
    }
}

/// Count one store operation and pass its result through.
pub fn observe<T>(store: &str, operation: &str, result: LedgerResult<T>) -> LedgerResult<T> {
    match &result {
        Ok(_) => {
            MANA_STORE_OPERATIONS_TOTAL
                .with_label_values(&[store, operation, "success"])
                .inc();
        }
        Err(e) => {
            MANA_STORE_OPERATIONS_TOTAL
                .with_label_values(&[store, operation, "error"])
                .inc();
            MANA_STORE_ERRORS_TOTAL
                .with_label_values(&[store, operation, error_type(e)])
                .inc();
        }
    }
    result
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_text() -> String {
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buf) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buf).into_owned()
}
