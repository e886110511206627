// Descriptive info records exchanged at registration and launch time

use serde::{Deserialize, Serialize};

use armada_resources::Resources;

use crate::ids::{ExecutorId, SlaveId, TaskId};
use crate::role::DEFAULT_ROLE;

/// Everything a framework declares about itself when registering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkInfo {
    /// Human-readable framework name
    pub name: String,
    /// Unix user tasks run as by default
    pub user: String,
    /// Allocation role the framework belongs to
    pub role: String,
    /// Principal used for reservations and authorization
    pub principal: Option<String>,
    /// Informational web UI address
    pub webui_url: Option<String>,
    /// Whether the slaves should checkpoint this framework's tasks
    pub checkpoint: bool,
    /// Seconds a disconnected framework may fail over before removal
    pub failover_timeout: f64,
}

impl FrameworkInfo {
    pub fn new(name: &str, user: &str) -> Self {
        FrameworkInfo {
            name: name.to_string(),
            user: user.to_string(),
            role: DEFAULT_ROLE.to_string(),
            principal: None,
            webui_url: None,
            checkpoint: false,
            failover_timeout: 0.0,
        }
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.role = role.to_string();
        self
    }

    pub fn with_principal(mut self, principal: &str) -> Self {
        self.principal = Some(principal.to_string());
        self
    }

    pub fn with_failover_timeout(mut self, seconds: f64) -> Self {
        self.failover_timeout = seconds;
        self
    }
}

/// Everything a slave declares about itself when registering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveInfo {
    /// Hostname the slave runs on
    pub hostname: String,
    /// Total resources the slave advertises
    pub resources: Resources,
    /// Free-form attributes (rack, zone, ...)
    pub attributes: Vec<Label>,
    /// Whether the slave checkpoints framework state
    pub checkpoint: bool,
}

impl SlaveInfo {
    pub fn new(hostname: &str, resources: Resources) -> Self {
        SlaveInfo {
            hostname: hostname.to_string(),
            resources,
            attributes: Vec::new(),
            checkpoint: false,
        }
    }
}

/// Command run by an executor or a command-based task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    /// Shell command line
    pub value: String,
    /// Environment handed to the command
    pub environment: Environment,
}

impl CommandInfo {
    pub fn shell(value: &str) -> Self {
        CommandInfo {
            value: value.to_string(),
            environment: Environment::default(),
        }
    }
}

/// Executor description; reusing an executor id on a slave requires an
/// identical ExecutorInfo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: ExecutorId,
    /// Resources consumed by the executor itself
    pub resources: Resources,
    pub command: CommandInfo,
}

/// A task a framework wants to launch on offered resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    /// Slave the task must land on; has to match the offer
    pub slave_id: SlaveId,
    pub resources: Resources,
    /// Custom executor; exclusive with `command`
    pub executor: Option<ExecutorInfo>,
    /// Command task; exclusive with `executor`
    pub command: Option<CommandInfo>,
    /// Free-form labels, extensible by master hook decorators
    pub labels: Labels,
}

impl TaskInfo {
    pub fn command_task(
        task_id: TaskId,
        name: &str,
        slave_id: SlaveId,
        resources: Resources,
        command: CommandInfo,
    ) -> Self {
        TaskInfo {
            task_id,
            name: name.to_string(),
            slave_id,
            resources,
            executor: None,
            command: Some(command),
            labels: Labels::default(),
        }
    }
}

/// A key/value annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl Label {
    pub fn new(key: &str, value: &str) -> Self {
        Label {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// An ordered collection of labels. Merging replaces labels with the
/// same key and appends the rest, so later decorators win.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn new(labels: Vec<Label>) -> Self {
        Labels(labels)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|label| label.key == key)
            .map(|label| label.value.as_str())
    }

    pub fn merge(&mut self, other: Labels) {
        for label in other.0 {
            match self.0.iter_mut().find(|l| l.key == label.key) {
                Some(existing) => existing.value = label.value,
                None => self.0.push(label),
            }
        }
    }
}

/// Environment variables for executors and commands.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Environment(Vec<Label>);

impl Environment {
    pub fn set(&mut self, name: &str, value: &str) {
        match self.0.iter_mut().find(|v| v.key == name) {
            Some(existing) => existing.value = value.to_string(),
            None => self.0.push(Label::new(name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|v| v.key == name).map(|v| v.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }
}

/// Identity of the master a framework or slave is registered with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterInfo {
    pub id: String,
    pub hostname: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_merge_replaces_by_key() {
        let mut labels = Labels::new(vec![Label::new("tier", "batch"), Label::new("team", "ads")]);
        labels.merge(Labels::new(vec![
            Label::new("tier", "service"),
            Label::new("zone", "eu"),
        ]));

        assert_eq!(labels.get("tier"), Some("service"));
        assert_eq!(labels.get("team"), Some("ads"));
        assert_eq!(labels.get("zone"), Some("eu"));
        assert_eq!(labels.iter().count(), 3);
    }

    #[test]
    fn test_environment_set_overwrites() {
        let mut env = Environment::default();
        env.set("PATH", "/bin");
        env.set("PATH", "/usr/bin");
        assert_eq!(env.get("PATH"), Some("/usr/bin"));
        assert_eq!(env.iter().count(), 1);
    }
}
