// Label decorator hooks
//
// Decorators run as an ordered fold over a task's labels at launch
// time: each one sees the previous decorator's output and returns a
// replacement, or an error that is logged and skipped.

use std::sync::Arc;

use tracing::warn;

use armada_types::{FrameworkInfo, Labels, SlaveInfo, TaskInfo};

use crate::error::MasterError;

/// A single decorator applied to task labels before dispatch.
pub trait TaskLabelDecorator: Send + Sync {
    /// Name used in logs when the decorator fails.
    fn name(&self) -> &str;

    /// Produce replacement labels from the current ones.
    fn decorate(
        &self,
        labels: &Labels,
        task: &TaskInfo,
        framework: &FrameworkInfo,
        slave: &SlaveInfo,
    ) -> Result<Labels, MasterError>;
}

/// Ordered collection of decorators.
#[derive(Clone, Default)]
pub struct HookManager {
    hooks: Vec<Arc<dyn TaskLabelDecorator>>,
}

impl HookManager {
    pub fn new() -> Self {
        HookManager { hooks: Vec::new() }
    }

    pub fn install(&mut self, hook: Arc<dyn TaskLabelDecorator>) {
        self.hooks.push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Fold the decorators over the task's labels. A failing decorator
    /// leaves the labels from the previous step untouched.
    pub fn decorate_labels(
        &self,
        task: &TaskInfo,
        framework: &FrameworkInfo,
        slave: &SlaveInfo,
    ) -> Labels {
        let mut labels = task.labels.clone();
        for hook in &self.hooks {
            match hook.decorate(&labels, task, framework, slave) {
                Ok(replacement) => labels = replacement,
                Err(error) => {
                    warn!(hook = hook.name(), %error, "label decorator failed, skipping");
                }
            }
        }
        labels
    }
}
