// Core type definitions for the Armada cluster manager
//
// Identifiers, descriptive info records, the task state machine, the
// status taxonomy, protocol message shapes and configuration flags used
// by the master and the allocator.

mod error;
mod flags;
mod ids;
mod info;
mod message;
mod role;
mod task;

pub use error::TypesError;
pub use flags::MasterFlags;
pub use ids::{random_suffix, ExecutorId, FrameworkId, OfferId, SlaveId, TaskId};
pub use info::{
    CommandInfo, Environment, ExecutorInfo, FrameworkInfo, Label, Labels, MasterInfo, SlaveInfo,
    TaskInfo,
};
pub use message::{
    Filters, FrameworkToMaster, MasterToFramework, MasterToSlave, OfferInfo, Operation,
    SlaveToMaster,
};
pub use role::{Roles, DEFAULT_ROLE};
pub use task::{StatusReason, StatusSource, TaskState, TaskStatus};
