// Resource algebra for the Armada cluster manager
//
// Resources are value types: a named quantity (scalar, range or set)
// carrying a role and, optionally, a reservation principal and volume
// persistence. Bags of resources form a commutative monoid per
// (name, kind, role, reservation, persistence) tuple, with subtraction
// defined only when the subtrahend is contained.

mod error;
mod parse;
mod resource;
mod value;

pub use error::{ResourceError, Result};
pub use resource::{Persistence, Resource, Resources};
pub use value::{Ranges, Scalar, TextSet, Value};

/// The role that unreserved resources belong to.
pub const DEFAULT_ROLE: &str = "*";
