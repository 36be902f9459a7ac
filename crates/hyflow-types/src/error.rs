use thiserror::Error;

/// Errors from checkpoint store operations (used by trait definitions in hyflow-core).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("checkpoint store connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Errors raised while decoding identifiers carried in records and CLI input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid tag '{0}'")]
    InvalidTag(String),

    #[error("invalid entity key '{0}'")]
    InvalidEntityKey(String),

    #[error("invalid location '{0}': expected <deployment>/<location>")]
    InvalidLocation(String),
}
