use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("object id must not be empty")]
    EmptyId,

    #[error("object id contains a control character: {0:?}")]
    InvalidId(String),
}
