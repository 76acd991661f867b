use std::net::Ipv4Addr;

use thiserror::Error;

/// Core error taxonomy. "Not found" is not represented here; lookups that
/// may miss return `Ok(None)`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] sqlx::Error),

    #[error("conflict: row already exists")]
    Conflict,

    #[error("no address available in any pool of {subnet}")]
    PoolExhausted { subnet: String },

    #[error("lease for {ip} is held by {owner}, not {requester}")]
    MacMismatch {
        ip: Ipv4Addr,
        owner: String,
        requester: String,
    },

    #[error("packet cannot be mapped to a configured subnet")]
    SubnetUnresolved,

    #[error("configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("configuration reload failed: {0}")]
    ReloadFailed(String),

    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => Error::Conflict,
            _ => Error::StorageUnavailable(err),
        }
    }
}

impl Error {
    /// Transient storage failures are retried by periodic tasks; everything
    /// else is a terminal outcome for the operation that produced it.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
