// The authoritative in-memory cluster state
//
// The registry exclusively owns Framework, Slave, Offer and Task
// records. Mutations go through methods that keep the resource ledgers
// balanced and emit change events the coordinator drains to notify the
// allocator.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use armada_resources::Resources;
use armada_types::{
    ExecutorId, ExecutorInfo, FrameworkId, FrameworkInfo, MasterToFramework, MasterToSlave,
    OfferId, SlaveId, SlaveInfo, TaskId, TaskInfo, TaskState, TaskStatus,
};

use crate::error::MasterError;

/// The master's record of a task.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: TaskId,
    pub name: String,
    pub framework_id: FrameworkId,
    pub slave_id: SlaveId,
    pub executor_id: Option<ExecutorId>,
    pub state: TaskState,
    pub resources: Resources,
    /// Status history in the order the master observed it
    pub statuses: Vec<TaskStatus>,
}

impl Task {
    pub fn from_info(framework_id: FrameworkId, info: &TaskInfo) -> Task {
        Task {
            task_id: info.task_id.clone(),
            name: info.name.clone(),
            framework_id,
            slave_id: info.slave_id.clone(),
            executor_id: info.executor.as_ref().map(|e| e.executor_id.clone()),
            state: TaskState::Staging,
            resources: info.resources.clone(),
            statuses: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// A connected (or failing-over) tenant.
#[derive(Debug)]
pub struct Framework {
    pub id: FrameworkId,
    pub info: FrameworkInfo,
    /// Channel the master pushes framework messages on
    pub endpoint: mpsc::UnboundedSender<MasterToFramework>,
    pub registered_time: DateTime<Utc>,
    pub reregistered_time: Option<DateTime<Utc>>,
    pub active: bool,
    /// When the framework lost its connection; failover timers compare
    /// against this so a reconnect invalidates older timers
    pub disconnected_time: Option<DateTime<Utc>>,
    pub offers: HashSet<OfferId>,
    /// Tasks validated but not yet recorded; only populated inside a
    /// single accept dispatch
    pub pending_tasks: HashMap<TaskId, TaskInfo>,
    pub tasks: HashMap<TaskId, Task>,
    /// Bounded archive of terminal tasks
    pub completed_tasks: VecDeque<Task>,
    pub used_resources: Resources,
    pub offered_resources: Resources,
}

impl Framework {
    pub fn new(
        id: FrameworkId,
        info: FrameworkInfo,
        endpoint: mpsc::UnboundedSender<MasterToFramework>,
    ) -> Framework {
        Framework {
            id,
            info,
            endpoint,
            registered_time: Utc::now(),
            reregistered_time: None,
            active: true,
            disconnected_time: None,
            offers: HashSet::new(),
            pending_tasks: HashMap::new(),
            tasks: HashMap::new(),
            completed_tasks: VecDeque::new(),
            used_resources: Resources::new(),
            offered_resources: Resources::new(),
        }
    }

    /// Whether a task id is taken by a pending or non-terminal task.
    pub fn has_live_task(&self, task_id: &TaskId) -> bool {
        self.pending_tasks.contains_key(task_id)
            || self.tasks.get(task_id).map(|t| !t.is_terminal()).unwrap_or(false)
    }
}

/// A worker node and the resources it advertises.
#[derive(Debug)]
pub struct Slave {
    pub id: SlaveId,
    pub info: SlaveInfo,
    /// Channel the master pushes slave messages on
    pub endpoint: mpsc::UnboundedSender<MasterToSlave>,
    pub registered_time: DateTime<Utc>,
    pub reregistered_time: Option<DateTime<Utc>>,
    pub active: bool,
    /// Task ids per framework; the tasks themselves live with their
    /// framework
    pub task_index: HashMap<FrameworkId, HashSet<TaskId>>,
    /// Executors running on this slave, per framework
    pub executors: HashMap<FrameworkId, HashMap<ExecutorId, ExecutorInfo>>,
    pub offers: HashSet<OfferId>,
    pub used_resources: HashMap<FrameworkId, Resources>,
    pub offered_resources: Resources,
    /// Reservations and volumes that survive slave restarts
    pub checkpointed_resources: Resources,
    pub missed_pings: u32,
}

impl Slave {
    pub fn new(
        id: SlaveId,
        info: SlaveInfo,
        endpoint: mpsc::UnboundedSender<MasterToSlave>,
        checkpointed_resources: Resources,
    ) -> Slave {
        Slave {
            id,
            info,
            endpoint,
            registered_time: Utc::now(),
            reregistered_time: None,
            active: true,
            task_index: HashMap::new(),
            executors: HashMap::new(),
            offers: HashSet::new(),
            used_resources: HashMap::new(),
            offered_resources: Resources::new(),
            checkpointed_resources,
            missed_pings: 0,
        }
    }

    /// Resources not currently used by tasks or tied up in offers.
    pub fn available_resources(&self) -> Resources {
        let mut available = self.info.resources.clone();
        for used in self.used_resources.values() {
            available = available.saturating_subtract(used);
        }
        available.saturating_subtract(&self.offered_resources)
    }

    fn total_used(&self) -> Resources {
        let mut total = Resources::new();
        for used in self.used_resources.values() {
            total += used;
        }
        total
    }
}

/// A live grant of one slave's resources to one framework.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    pub id: OfferId,
    pub framework_id: FrameworkId,
    pub slave_id: SlaveId,
    pub resources: Resources,
}

/// An archived framework, kept for introspection after removal.
#[derive(Debug)]
pub struct CompletedFramework {
    pub id: FrameworkId,
    pub info: FrameworkInfo,
    pub completed_tasks: VecDeque<Task>,
}

/// Change events the coordinator drains after mutating the registry
/// and forwards to the allocator.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    FrameworkAdded {
        id: FrameworkId,
        info: FrameworkInfo,
        used: Resources,
    },
    FrameworkRemoved {
        id: FrameworkId,
    },
    FrameworkActivated {
        id: FrameworkId,
        info: FrameworkInfo,
    },
    FrameworkDeactivated {
        id: FrameworkId,
    },
    SlaveAdded {
        id: SlaveId,
        info: SlaveInfo,
        used: HashMap<FrameworkId, Resources>,
    },
    SlaveRemoved {
        id: SlaveId,
    },
}

/// Owner of all framework, slave and offer state.
pub struct Registry {
    frameworks: HashMap<FrameworkId, Framework>,
    framework_order: Vec<FrameworkId>,
    slaves: HashMap<SlaveId, Slave>,
    slave_order: Vec<SlaveId>,
    offers: HashMap<OfferId, Offer>,
    completed_frameworks: VecDeque<CompletedFramework>,
    events: Vec<RegistryEvent>,
    max_completed_frameworks: usize,
    max_completed_tasks_per_framework: usize,
}

impl Registry {
    pub fn new(max_completed_frameworks: usize, max_completed_tasks_per_framework: usize) -> Self {
        Registry {
            frameworks: HashMap::new(),
            framework_order: Vec::new(),
            slaves: HashMap::new(),
            slave_order: Vec::new(),
            offers: HashMap::new(),
            completed_frameworks: VecDeque::new(),
            events: Vec::new(),
            max_completed_frameworks,
            max_completed_tasks_per_framework,
        }
    }

    // --- frameworks ---

    pub fn add_framework(&mut self, framework: Framework) {
        self.events.push(RegistryEvent::FrameworkAdded {
            id: framework.id.clone(),
            info: framework.info.clone(),
            used: framework.used_resources.clone(),
        });
        self.framework_order.push(framework.id.clone());
        self.frameworks.insert(framework.id.clone(), framework);
    }

    pub fn framework(&self, id: &FrameworkId) -> Option<&Framework> {
        self.frameworks.get(id)
    }

    pub fn framework_mut(&mut self, id: &FrameworkId) -> Option<&mut Framework> {
        self.frameworks.get_mut(id)
    }

    /// Registered frameworks in registration order.
    pub fn frameworks(&self) -> impl Iterator<Item = &Framework> {
        self.framework_order.iter().filter_map(|id| self.frameworks.get(id))
    }

    pub fn activate_framework(&mut self, id: &FrameworkId) {
        if let Some(framework) = self.frameworks.get_mut(id) {
            framework.active = true;
            framework.reregistered_time = Some(Utc::now());
            self.events.push(RegistryEvent::FrameworkActivated {
                id: id.clone(),
                info: framework.info.clone(),
            });
        }
    }

    pub fn deactivate_framework(&mut self, id: &FrameworkId) {
        if let Some(framework) = self.frameworks.get_mut(id) {
            framework.active = false;
            self.events.push(RegistryEvent::FrameworkDeactivated { id: id.clone() });
        }
    }

    /// Remove a framework and archive it. The caller is responsible
    /// for terminal status updates and offer rescinds beforehand.
    pub fn remove_framework(&mut self, id: &FrameworkId) -> Option<Framework> {
        let framework = self.frameworks.remove(id)?;
        self.framework_order.retain(|fid| fid != id);
        self.events.push(RegistryEvent::FrameworkRemoved { id: id.clone() });

        self.completed_frameworks.push_back(CompletedFramework {
            id: framework.id.clone(),
            info: framework.info.clone(),
            completed_tasks: framework.completed_tasks.clone(),
        });
        while self.completed_frameworks.len() > self.max_completed_frameworks {
            self.completed_frameworks.pop_front();
        }
        Some(framework)
    }

    pub fn completed_frameworks(&self) -> impl Iterator<Item = &CompletedFramework> {
        self.completed_frameworks.iter()
    }

    // --- slaves ---

    pub fn add_slave(&mut self, slave: Slave) {
        self.add_slave_with_tasks(slave, Vec::new())
            .expect("adding a slave without tasks cannot fail");
    }

    /// Add a re-registering slave along with the tasks it reported.
    /// The SlaveAdded event carries the rebuilt per-framework usage so
    /// the allocator's ledger starts out correct. Tasks must belong to
    /// registered frameworks.
    pub fn add_slave_with_tasks(&mut self, slave: Slave, tasks: Vec<Task>) -> Result<(), MasterError> {
        let id = slave.id.clone();
        let info = slave.info.clone();
        self.slave_order.push(id.clone());
        self.slaves.insert(id.clone(), slave);

        for task in tasks {
            self.add_task(task)?;
        }

        let used = self
            .slaves
            .get(&id)
            .map(|slave| slave.used_resources.clone())
            .unwrap_or_default();
        self.events.push(RegistryEvent::SlaveAdded { id, info, used });
        Ok(())
    }

    pub fn slave(&self, id: &SlaveId) -> Option<&Slave> {
        self.slaves.get(id)
    }

    pub fn slave_mut(&mut self, id: &SlaveId) -> Option<&mut Slave> {
        self.slaves.get_mut(id)
    }

    /// Registered slaves in registration order.
    pub fn slaves(&self) -> impl Iterator<Item = &Slave> {
        self.slave_order.iter().filter_map(|id| self.slaves.get(id))
    }

    /// Remove a slave. Offers and tasks on it must already be gone.
    pub fn remove_slave(&mut self, id: &SlaveId) -> Option<Slave> {
        let slave = self.slaves.remove(id)?;
        self.slave_order.retain(|sid| sid != id);
        self.events.push(RegistryEvent::SlaveRemoved { id: id.clone() });
        Some(slave)
    }

    // --- offers ---

    /// Record a freshly created offer and charge it to both ledgers.
    pub fn add_offer(&mut self, offer: Offer) -> Result<(), MasterError> {
        let framework = self
            .frameworks
            .get_mut(&offer.framework_id)
            .ok_or_else(|| MasterError::Invariant(format!("offer for unknown framework {}", offer.framework_id)))?;
        let slave = self
            .slaves
            .get_mut(&offer.slave_id)
            .ok_or_else(|| MasterError::Invariant(format!("offer for unknown slave {}", offer.slave_id)))?;

        framework.offers.insert(offer.id.clone());
        framework.offered_resources += &offer.resources;
        slave.offers.insert(offer.id.clone());
        slave.offered_resources += &offer.resources;
        self.offers.insert(offer.id.clone(), offer);
        Ok(())
    }

    pub fn offer(&self, id: &OfferId) -> Option<&Offer> {
        self.offers.get(id)
    }

    /// Take an offer through its single terminal transition, releasing
    /// it from both ledgers. Whether its resources return to the free
    /// pool or ride into tasks is the caller's business.
    pub fn remove_offer(&mut self, id: &OfferId) -> Option<Offer> {
        let offer = self.offers.remove(id)?;
        if let Some(framework) = self.frameworks.get_mut(&offer.framework_id) {
            framework.offers.remove(id);
            framework.offered_resources =
                framework.offered_resources.saturating_subtract(&offer.resources);
        }
        if let Some(slave) = self.slaves.get_mut(&offer.slave_id) {
            slave.offers.remove(id);
            slave.offered_resources = slave.offered_resources.saturating_subtract(&offer.resources);
        }
        Some(offer)
    }

    /// Outstanding offer ids of a framework.
    pub fn framework_offers(&self, id: &FrameworkId) -> Vec<OfferId> {
        self.frameworks
            .get(id)
            .map(|f| f.offers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Outstanding offer ids on a slave.
    pub fn slave_offers(&self, id: &SlaveId) -> Vec<OfferId> {
        self.slaves
            .get(id)
            .map(|s| s.offers.iter().cloned().collect())
            .unwrap_or_default()
    }

    // --- tasks ---

    /// Record a launched task and charge its resources to the
    /// framework and the slave.
    pub fn add_task(&mut self, task: Task) -> Result<(), MasterError> {
        let framework = self
            .frameworks
            .get_mut(&task.framework_id)
            .ok_or_else(|| MasterError::Invariant(format!("task for unknown framework {}", task.framework_id)))?;
        let slave = self
            .slaves
            .get_mut(&task.slave_id)
            .ok_or_else(|| MasterError::Invariant(format!("task for unknown slave {}", task.slave_id)))?;

        framework.used_resources += &task.resources;
        *slave
            .used_resources
            .entry(task.framework_id.clone())
            .or_default() += &task.resources;
        slave
            .task_index
            .entry(task.framework_id.clone())
            .or_default()
            .insert(task.task_id.clone());
        debug!(task_id = %task.task_id, framework_id = %task.framework_id, slave_id = %task.slave_id, "recorded task");
        framework.tasks.insert(task.task_id.clone(), task);
        Ok(())
    }

    /// Drop a task from the ledgers and archive it in the framework's
    /// completed ring. Returns the archived task.
    pub fn remove_task(&mut self, framework_id: &FrameworkId, task_id: &TaskId) -> Option<Task> {
        let framework = self.frameworks.get_mut(framework_id)?;
        let task = framework.tasks.remove(task_id)?;

        framework.used_resources = framework.used_resources.saturating_subtract(&task.resources);
        framework.completed_tasks.push_back(task.clone());
        while framework.completed_tasks.len() > self.max_completed_tasks_per_framework {
            framework.completed_tasks.pop_front();
        }

        if let Some(slave) = self.slaves.get_mut(&task.slave_id) {
            if let Some(used) = slave.used_resources.get_mut(framework_id) {
                *used = used.saturating_subtract(&task.resources);
                if used.is_empty() {
                    slave.used_resources.remove(framework_id);
                }
            }
            if let Some(index) = slave.task_index.get_mut(framework_id) {
                index.remove(task_id);
                if index.is_empty() {
                    slave.task_index.remove(framework_id);
                }
            }
        }
        Some(task)
    }

    // --- change log and invariants ---

    pub fn drain_events(&mut self) -> Vec<RegistryEvent> {
        std::mem::take(&mut self.events)
    }

    /// Check the conservation and ownership invariants. Called after
    /// every dispatched message; a violation aborts the master.
    pub fn check_invariants(&self) -> Result<(), MasterError> {
        for slave in self.slaves.values() {
            let mut committed = slave.total_used();
            committed += &slave.offered_resources;
            if !slave.info.resources.contains(&committed) {
                return Err(MasterError::Invariant(format!(
                    "slave {} over-committed: advertises {} but holds {}",
                    slave.id, slave.info.resources, committed
                )));
            }
        }

        for framework in self.frameworks.values() {
            let mut expected_offered = Resources::new();
            for offer_id in &framework.offers {
                match self.offers.get(offer_id) {
                    Some(offer) => expected_offered += &offer.resources,
                    None => {
                        return Err(MasterError::Invariant(format!(
                            "framework {} references dead offer {}",
                            framework.id, offer_id
                        )))
                    }
                }
            }
            if framework.offered_resources != expected_offered {
                return Err(MasterError::Invariant(format!(
                    "framework {} offered ledger drifted: {} vs offers {}",
                    framework.id, framework.offered_resources, expected_offered
                )));
            }

            let mut expected_used = Resources::new();
            for task in framework.tasks.values() {
                if !task.is_terminal() {
                    expected_used += &task.resources;
                }
            }
            if framework.used_resources != expected_used {
                return Err(MasterError::Invariant(format!(
                    "framework {} used ledger drifted: {} vs tasks {}",
                    framework.id, framework.used_resources, expected_used
                )));
            }
        }

        for offer in self.offers.values() {
            let connected = self
                .frameworks
                .get(&offer.framework_id)
                .map(|f| f.active)
                .unwrap_or(false);
            if !connected {
                return Err(MasterError::Invariant(format!(
                    "live offer {} owned by disconnected framework {}",
                    offer.id, offer.framework_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn resources(text: &str) -> Resources {
        Resources::from_str(text).unwrap()
    }

    fn framework(id: &str) -> (Framework, mpsc::UnboundedReceiver<MasterToFramework>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let info = FrameworkInfo::new(id, "tester");
        (Framework::new(FrameworkId::new(id), info, tx), rx)
    }

    fn slave(id: &str, total: &str) -> (Slave, mpsc::UnboundedReceiver<MasterToSlave>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let info = SlaveInfo::new(&format!("host-{}", id), resources(total));
        (
            Slave::new(SlaveId::new(id), info, tx, Resources::new()),
            rx,
        )
    }

    fn task(framework_id: &str, task_id: &str, slave_id: &str, r: &str) -> Task {
        let info = TaskInfo::command_task(
            TaskId::new(task_id),
            task_id,
            SlaveId::new(slave_id),
            resources(r),
            armada_types::CommandInfo::shell("sleep 1"),
        );
        Task::from_info(FrameworkId::new(framework_id), &info)
    }

    #[test]
    fn test_offer_ledger_round_trip() {
        let mut registry = Registry::new(10, 10);
        let (fw, _fw_rx) = framework("f1");
        let (sl, _sl_rx) = slave("s1", "cpus:2;mem:1024");
        registry.add_framework(fw);
        registry.add_slave(sl);

        let offer = Offer {
            id: OfferId::new("o1"),
            framework_id: FrameworkId::new("f1"),
            slave_id: SlaveId::new("s1"),
            resources: resources("cpus:2;mem:1024"),
        };
        registry.add_offer(offer).unwrap();

        let slave = registry.slave(&SlaveId::new("s1")).unwrap();
        assert!(slave.available_resources().is_empty());
        registry.check_invariants().unwrap();

        let removed = registry.remove_offer(&OfferId::new("o1")).unwrap();
        assert_eq!(removed.resources, resources("cpus:2;mem:1024"));
        let slave = registry.slave(&SlaveId::new("s1")).unwrap();
        assert_eq!(slave.available_resources(), resources("cpus:2;mem:1024"));
        registry.check_invariants().unwrap();
    }

    #[test]
    fn test_task_ledger_and_archive() {
        let mut registry = Registry::new(10, 2);
        let (fw, _fw_rx) = framework("f1");
        let (sl, _sl_rx) = slave("s1", "cpus:4;mem:4096");
        registry.add_framework(fw);
        registry.add_slave(sl);

        for i in 0..3 {
            let id = format!("t{}", i);
            registry.add_task(task("f1", &id, "s1", "cpus:1;mem:512")).unwrap();
            registry.check_invariants().unwrap();
            let removed = registry.remove_task(&FrameworkId::new("f1"), &TaskId::new(&id));
            assert!(removed.is_some());
        }

        let framework = registry.framework(&FrameworkId::new("f1")).unwrap();
        assert!(framework.used_resources.is_empty());
        // The completed ring is bounded at two entries.
        assert_eq!(framework.completed_tasks.len(), 2);
        assert_eq!(framework.completed_tasks[0].task_id, TaskId::new("t1"));
    }

    #[test]
    fn test_invariant_catches_over_commit() {
        let mut registry = Registry::new(10, 10);
        let (fw, _fw_rx) = framework("f1");
        let (sl, _sl_rx) = slave("s1", "cpus:1;mem:512");
        registry.add_framework(fw);
        registry.add_slave(sl);

        registry.add_task(task("f1", "t1", "s1", "cpus:1;mem:512")).unwrap();
        registry.check_invariants().unwrap();

        // A second task the slave cannot hold trips the check.
        registry.add_task(task("f1", "t2", "s1", "cpus:1;mem:512")).unwrap();
        assert!(registry.check_invariants().is_err());
    }

    #[test]
    fn test_completed_framework_ring() {
        let mut registry = Registry::new(2, 10);
        for i in 0..3 {
            let (fw, _rx) = framework(&format!("f{}", i));
            registry.add_framework(fw);
        }
        for i in 0..3 {
            registry.remove_framework(&FrameworkId::new(&format!("f{}", i)));
        }
        let kept: Vec<_> = registry.completed_frameworks().map(|c| c.id.clone()).collect();
        assert_eq!(kept, vec![FrameworkId::new("f1"), FrameworkId::new("f2")]);
    }

    #[test]
    fn test_iteration_in_registration_order() {
        let mut registry = Registry::new(10, 10);
        for id in ["charlie", "alpha", "bravo"] {
            let (fw, _rx) = framework(id);
            registry.add_framework(fw);
            let (sl, _rx) = slave(id, "cpus:1");
            registry.add_slave(sl);
        }

        let frameworks: Vec<_> = registry.frameworks().map(|f| f.id.as_str().to_string()).collect();
        assert_eq!(frameworks, vec!["charlie", "alpha", "bravo"]);
        let slaves: Vec<_> = registry.slaves().map(|s| s.id.as_str().to_string()).collect();
        assert_eq!(slaves, vec!["charlie", "alpha", "bravo"]);
    }

    #[test]
    fn test_events_drain_in_order() {
        let mut registry = Registry::new(10, 10);
        let (fw, _fw_rx) = framework("f1");
        let (sl, _sl_rx) = slave("s1", "cpus:1;mem:512");
        registry.add_framework(fw);
        registry.add_slave(sl);
        registry.deactivate_framework(&FrameworkId::new("f1"));

        let events = registry.drain_events();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], RegistryEvent::FrameworkAdded { .. }));
        assert!(matches!(events[1], RegistryEvent::SlaveAdded { .. }));
        assert!(matches!(events[2], RegistryEvent::FrameworkDeactivated { .. }));
        assert!(registry.drain_events().is_empty());
    }
}
