//! Error taxonomy shared by handlers, watchers, the store and the REST layer.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed registration or event payload. Carries the offending field names.
    #[error("the following fields are missing or invalid: {}", .0.join(", "))]
    Validation(Vec<String>),

    #[error("already tracking the contract at {0}")]
    Duplicate(String),

    /// Chain node unreachable, timed out, or returned a JSON-RPC error.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Pin/unpin call against the storage network failed.
    #[error("storage network error: {0}")]
    StorageNetwork(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Durable collection could not be read or written.
    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    pub fn validation(field: impl Into<String>) -> Self {
        Error::Validation(vec![field.into()])
    }

    /// Field names a REST client should see for this error, if any.
    pub fn fields(&self) -> Option<Vec<String>> {
        match self {
            Error::Validation(fields) => Some(fields.clone()),
            Error::Duplicate(_) | Error::NotFound(_) => Some(vec!["address".to_string()]),
            _ => None,
        }
    }

    /// Transient failures are retried on the next tick from the old cursor.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Rpc(_) | Error::StorageNetwork(_) | Error::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
