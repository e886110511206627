// Opaque identifier newtypes
//
// Every identifier is an opaque string wrapper with identity
// Display/FromStr round-trip. Offer ids are single-use; framework ids
// persist across reconnections.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::TypesError;

macro_rules! identifier {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                $name(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = TypesError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                if value.is_empty() {
                    return Err(TypesError::EmptyIdentifier(stringify!($name)));
                }
                Ok($name(value.to_string()))
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                $name(value.to_string())
            }
        }
    };
}

identifier! {
    /// Identifies a framework; stable across framework failover.
    FrameworkId
}

identifier! {
    /// Identifies a slave for the duration of its registration.
    SlaveId
}

identifier! {
    /// Identifies a single offer; never reused.
    OfferId
}

identifier! {
    /// Identifies a task within its framework.
    TaskId
}

identifier! {
    /// Identifies an executor on a slave.
    ExecutorId
}

/// Mint a random hex suffix for identifiers generated by the master.
pub fn random_suffix() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
