// Task state machine and status taxonomy
//
// The source/reason wire names are kept bit-exact for compatibility
// with existing schedulers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ExecutorId, SlaveId, TaskId};

/// States a task moves through. STAGING → STARTING → RUNNING, then one
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskState {
    #[serde(rename = "TASK_STAGING")]
    Staging,
    #[serde(rename = "TASK_STARTING")]
    Starting,
    #[serde(rename = "TASK_RUNNING")]
    Running,
    #[serde(rename = "TASK_FINISHED")]
    Finished,
    #[serde(rename = "TASK_FAILED")]
    Failed,
    #[serde(rename = "TASK_KILLED")]
    Killed,
    #[serde(rename = "TASK_LOST")]
    Lost,
    #[serde(rename = "TASK_ERROR")]
    Error,
}

impl TaskState {
    /// Terminal states free the task's resources.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished
                | TaskState::Failed
                | TaskState::Killed
                | TaskState::Lost
                | TaskState::Error
        )
    }
}

/// Who generated a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusSource {
    #[serde(rename = "SOURCE_MASTER")]
    Master,
    #[serde(rename = "SOURCE_SLAVE")]
    Slave,
    #[serde(rename = "SOURCE_EXECUTOR")]
    Executor,
}

/// Why a status update was generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StatusReason {
    #[serde(rename = "REASON_TASK_INVALID")]
    TaskInvalid,
    #[serde(rename = "REASON_RECONCILIATION")]
    Reconciliation,
    #[serde(rename = "REASON_SLAVE_REMOVED")]
    SlaveRemoved,
    #[serde(rename = "REASON_FRAMEWORK_REMOVED")]
    FrameworkRemoved,
    #[serde(rename = "REASON_EXECUTOR_TERMINATED")]
    ExecutorTerminated,
    #[serde(rename = "REASON_INVALID_OFFERS")]
    InvalidOffers,
}

/// A single observation of a task's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    /// Human-readable explanation
    pub message: Option<String>,
    pub source: Option<StatusSource>,
    pub reason: Option<StatusReason>,
    /// Unset for master-generated updates about unknown slaves
    pub slave_id: Option<SlaveId>,
    pub executor_id: Option<ExecutorId>,
    pub timestamp: DateTime<Utc>,
    /// Deduplication key; handlers treat repeated uuids as idempotent
    pub uuid: String,
}

impl TaskStatus {
    pub fn new(task_id: TaskId, state: TaskState) -> Self {
        TaskStatus {
            task_id,
            state,
            message: None,
            source: None,
            reason: None,
            slave_id: None,
            executor_id: None,
            timestamp: Utc::now(),
            uuid: crate::ids::random_suffix(),
        }
    }

    pub fn with_slave(mut self, slave_id: SlaveId) -> Self {
        self.slave_id = Some(slave_id);
        self
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }

    /// A terminal update synthesized by the master itself.
    pub fn from_master(task_id: TaskId, state: TaskState, reason: StatusReason) -> Self {
        let mut status = TaskStatus::new(task_id, state);
        status.source = Some(StatusSource::Master);
        status.reason = Some(reason);
        status
    }
}
