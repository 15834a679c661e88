use thiserror::Error;

/// Errors surfaced by the mana ledger and its storage adapters.
///
/// Nothing in this crate retries; callers decide whether a failed grant or
/// transfer is retried or reported.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Transient backend failure (I/O, connection, timeout).
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A uniqueness or referential rule was broken. Signals a programming
    /// error and is never worth retrying.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("insufficient mana: requested {requested}, available {available}")]
    InsufficientMana { requested: u64, available: u64 },

    /// A persisted record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl LedgerError {
    pub(crate) fn overflow(what: &str) -> Self {
        LedgerError::InvalidAmount(format!("{} would overflow u64", what))
    }

    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::StorageUnavailable(_))
    }
}

impl From<sled::Error> for LedgerError {
    fn from(e: sled::Error) -> Self {
        match e {
            sled::Error::CollectionNotFound(name) => {
                LedgerError::NotFound(format!("sled tree {:?}", name))
            }
            sled::Error::Corruption { .. } => LedgerError::Codec(e.to_string()),
            other => LedgerError::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<bincode::Error> for LedgerError {
    fn from(e: bincode::Error) -> Self {
        LedgerError::Codec(e.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors raised while loading or validating [`crate::config::ManaConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_storage_failures_are_transient() {
        assert!(LedgerError::StorageUnavailable("timeout".into()).is_transient());
        assert!(!LedgerError::ConstraintViolation("dup".into()).is_transient());
        assert!(!LedgerError::NotFound("unit".into()).is_transient());
        assert!(!LedgerError::InsufficientMana { requested: 2, available: 1 }.is_transient());
    }
}
