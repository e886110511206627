// Allocator-specific error types
//
// The allocator's view may lag the master's by one dispatch, so these
// errors are expected during churn; handlers log them and move on.

use thiserror::Error;

use armada_types::{FrameworkId, SlaveId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// An event referred to a framework the allocator does not know
    #[error("Unknown framework: {0}")]
    UnknownFramework(FrameworkId),

    /// An event referred to a slave the allocator does not know
    #[error("Unknown slave: {0}")]
    UnknownSlave(SlaveId),

    /// Resource bookkeeping failed
    #[error("Ledger error: {0}")]
    Ledger(String),
}
