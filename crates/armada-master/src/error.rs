// Master-specific error types

use thiserror::Error;

use crate::validation::ValidationError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MasterError {
    /// A framework action failed validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A label decorator refused to run
    #[error("Decorator '{hook}' failed: {message}")]
    Decorator { hook: String, message: String },

    /// An internal invariant no longer holds; the actor aborts
    #[error("Invariant violation: {0}")]
    Invariant(String),
}
