// Allocation policy engine for the Armada cluster manager
//
// The master talks to an allocator only through the fire-and-forget
// operations of the Allocator trait, dispatched over a mailbox by the
// AllocatorHandle. Policies are interchangeable behind that trait; the
// default is weighted dominant-resource fairness.

mod drf;
mod error;
mod handle;
mod traits;

pub use drf::DrfAllocator;
pub use error::AllocationError;
pub use handle::{AllocatorEvent, AllocatorHandle};
pub use traits::{Allocation, Allocator};
