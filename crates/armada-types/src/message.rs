// Protocol message shapes
//
// Messages are tagged variants consumed at a single dispatch site; the
// encoding is abstracted behind serde. The connection envelope (who is
// speaking, over which channel) is supplied by the transport layer and
// is not part of these shapes.

use serde::{Deserialize, Serialize};

use armada_resources::{Resource, Resources};

use crate::ids::{ExecutorId, FrameworkId, OfferId, SlaveId, TaskId};
use crate::info::{FrameworkInfo, MasterInfo, SlaveInfo, TaskInfo};
use crate::task::TaskStatus;

/// Suppression attached to declined resources: matching resources are
/// not re-offered to the framework until the filter expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filters {
    /// Seconds to withhold the declined resources
    pub refuse_seconds: f64,
}

impl Default for Filters {
    fn default() -> Self {
        Filters { refuse_seconds: 5.0 }
    }
}

impl Filters {
    pub fn refuse_for(seconds: f64) -> Self {
        Filters {
            refuse_seconds: seconds,
        }
    }
}

/// The offer shape pushed to frameworks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferInfo {
    pub offer_id: OfferId,
    pub framework_id: FrameworkId,
    pub slave_id: SlaveId,
    pub hostname: String,
    pub resources: Resources,
}

/// Operations a framework may apply to accepted offers, in list order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Launch tasks on the offered resources
    Launch { tasks: Vec<TaskInfo> },
    /// Dynamically reserve unreserved resources for the framework's role
    Reserve { resources: Vec<Resource> },
    /// Return dynamically reserved resources to the unreserved pool
    Unreserve { resources: Vec<Resource> },
    /// Create persistent volumes on reserved disk
    Create { volumes: Vec<Resource> },
    /// Destroy persistent volumes
    Destroy { volumes: Vec<Resource> },
}

/// Messages a framework sends to the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameworkToMaster {
    Register {
        info: FrameworkInfo,
    },
    Reregister {
        framework_id: FrameworkId,
        info: FrameworkInfo,
        failover: bool,
    },
    AcceptOffers {
        offer_ids: Vec<OfferId>,
        operations: Vec<Operation>,
        filters: Option<Filters>,
    },
    DeclineOffers {
        offer_ids: Vec<OfferId>,
        filters: Option<Filters>,
    },
    ReviveOffers,
    KillTask {
        task_id: TaskId,
    },
    /// Ask for the authoritative state of tasks; an empty list means
    /// every known task (implicit reconciliation).
    ReconcileTasks {
        statuses: Vec<TaskStatus>,
    },
    /// Acknowledge a status update so the slave can forget it
    Acknowledge {
        slave_id: SlaveId,
        task_id: TaskId,
        uuid: String,
    },
    RequestResources {
        requests: Vec<Resources>,
    },
    Unregister,
}

/// Messages the master pushes to a framework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterToFramework {
    Registered {
        framework_id: FrameworkId,
        master_info: MasterInfo,
    },
    Reregistered {
        framework_id: FrameworkId,
        master_info: MasterInfo,
    },
    ResourceOffers {
        offers: Vec<OfferInfo>,
    },
    RescindOffer {
        offer_id: OfferId,
    },
    StatusUpdate {
        status: TaskStatus,
    },
    FrameworkError {
        message: String,
    },
    Shutdown {
        message: String,
    },
}

/// Messages a slave sends to the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaveToMaster {
    Register {
        info: SlaveInfo,
        checkpointed_resources: Resources,
    },
    Reregister {
        slave_id: SlaveId,
        info: SlaveInfo,
        /// Tasks the slave still knows about, per framework
        tasks: Vec<(FrameworkId, TaskInfo)>,
        checkpointed_resources: Resources,
    },
    StatusUpdate {
        framework_id: FrameworkId,
        status: TaskStatus,
    },
    Pong,
}

/// Messages the master pushes to a slave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterToSlave {
    Registered {
        slave_id: SlaveId,
    },
    Reregistered {
        slave_id: SlaveId,
    },
    RunTask {
        framework_id: FrameworkId,
        framework_info: FrameworkInfo,
        task: TaskInfo,
    },
    KillTask {
        framework_id: FrameworkId,
        task_id: TaskId,
    },
    StatusUpdateAcknowledgement {
        framework_id: FrameworkId,
        task_id: TaskId,
        uuid: String,
    },
    ShutdownExecutor {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
    },
    ShutdownSlave {
        message: String,
    },
    Ping,
}
