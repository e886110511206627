// Types-specific error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypesError {
    /// An identifier was empty
    #[error("{0} cannot be empty")]
    EmptyIdentifier(&'static str),

    /// A role weight failed to parse
    #[error("Invalid weight: {0}")]
    InvalidWeight(String),

    /// A flag value was out of range or malformed
    #[error("Invalid flag: {0}")]
    InvalidFlag(String),
}
