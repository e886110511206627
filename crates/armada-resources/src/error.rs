// Resource-specific error types

use thiserror::Error;

/// Errors produced by resource construction and arithmetic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// A resource failed well-formedness checks
    #[error("Invalid resource: {0}")]
    Invalid(String),

    /// Subtraction attempted with a subtrahend that is not contained
    #[error("Resources not contained: cannot subtract {subtrahend} from {minuend}")]
    NotContained { minuend: String, subtrahend: String },

    /// A resource string could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, ResourceError>;
