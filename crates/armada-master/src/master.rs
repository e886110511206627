// The master coordinator actor
//
// One mailbox, one dispatch loop. Each message is processed to
// completion before the next, so every handler sees and restores the
// registry invariants. The allocator is reached only through its
// handle; allocations come back as mailbox messages.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use armada_allocator::{Allocation, AllocatorHandle};
use armada_resources::{Resource, Resources};
use armada_types::{
    random_suffix, ExecutorId, Filters, FrameworkId, FrameworkInfo, FrameworkToMaster,
    MasterFlags, MasterInfo, MasterToFramework, MasterToSlave, OfferId, OfferInfo, Operation,
    SlaveId, SlaveInfo, SlaveToMaster, StatusReason, TaskId, TaskInfo, TaskState, TaskStatus,
};

use crate::auth::{Authorizer, PermissiveAuthorizer};
use crate::hooks::HookManager;
use crate::registrar::{InMemoryRegistrar, Registrar};
use crate::registry::{Framework, Offer, Registry, RegistryEvent, Slave, Task};
use crate::validation::{self, ValidationError};

/// Messages arriving at the master's mailbox. Protocol messages are
/// wrapped in a connection envelope naming the sender; registrations
/// additionally carry the reply channel.
pub enum MasterMessage {
    /// A framework (re)registration, with its endpoint
    ConnectFramework {
        endpoint: mpsc::UnboundedSender<MasterToFramework>,
        message: FrameworkToMaster,
    },
    /// Any other framework message
    FrameworkMessage {
        framework_id: FrameworkId,
        message: FrameworkToMaster,
    },
    /// The transport noticed the framework's connection dropped
    FrameworkDisconnected { framework_id: FrameworkId },
    /// A slave (re)registration, with its endpoint
    ConnectSlave {
        endpoint: mpsc::UnboundedSender<MasterToSlave>,
        message: SlaveToMaster,
    },
    /// Any other slave message
    SlaveMessage {
        slave_id: SlaveId,
        message: SlaveToMaster,
    },
    /// The transport noticed the slave's connection dropped
    SlaveDisconnected { slave_id: SlaveId },
    /// An offer round result from the allocator
    Allocate(Allocation),
    /// A live offer went unanswered past the offer timeout
    OfferTimeout { offer_id: OfferId },
    /// A disconnected framework's failover window closed
    FailoverExpired {
        framework_id: FrameworkId,
        disconnected_at: DateTime<Utc>,
    },
    /// Health-check tick
    PingSlaves,
    /// Operator request to shut a framework down
    ShutdownFramework { framework_id: FrameworkId },
}

/// Clonable address of a running master.
#[derive(Clone)]
pub struct MasterHandle {
    tx: mpsc::Sender<MasterMessage>,
    info: MasterInfo,
}

impl MasterHandle {
    pub fn master_info(&self) -> &MasterInfo {
        &self.info
    }

    pub async fn send(&self, message: MasterMessage) {
        if self.tx.send(message).await.is_err() {
            warn!("master mailbox is closed, dropping message");
        }
    }

    pub async fn connect_framework(
        &self,
        endpoint: mpsc::UnboundedSender<MasterToFramework>,
        message: FrameworkToMaster,
    ) {
        self.send(MasterMessage::ConnectFramework { endpoint, message }).await;
    }

    pub async fn framework_message(&self, framework_id: FrameworkId, message: FrameworkToMaster) {
        self.send(MasterMessage::FrameworkMessage { framework_id, message }).await;
    }

    pub async fn framework_disconnected(&self, framework_id: FrameworkId) {
        self.send(MasterMessage::FrameworkDisconnected { framework_id }).await;
    }

    pub async fn connect_slave(
        &self,
        endpoint: mpsc::UnboundedSender<MasterToSlave>,
        message: SlaveToMaster,
    ) {
        self.send(MasterMessage::ConnectSlave { endpoint, message }).await;
    }

    pub async fn slave_message(&self, slave_id: SlaveId, message: SlaveToMaster) {
        self.send(MasterMessage::SlaveMessage { slave_id, message }).await;
    }

    pub async fn slave_disconnected(&self, slave_id: SlaveId) {
        self.send(MasterMessage::SlaveDisconnected { slave_id }).await;
    }

    pub async fn shutdown_framework(&self, framework_id: FrameworkId) {
        self.send(MasterMessage::ShutdownFramework { framework_id }).await;
    }
}

/// The coordinator. Owns the registry; drives offers, launches and
/// task lifecycles.
pub struct Master {
    info: MasterInfo,
    flags: MasterFlags,
    registry: Registry,
    allocator: AllocatorHandle,
    registrar: Arc<dyn Registrar>,
    authorizer: Arc<dyn Authorizer>,
    hooks: HookManager,
    /// Own address, for timers
    tx: mpsc::Sender<MasterMessage>,
    next_framework: u64,
    next_slave: u64,
    next_offer: u64,
}

impl Master {
    /// Spawn a master with the default registrar, authorizer and no
    /// hooks.
    pub fn spawn(flags: MasterFlags, allocator: AllocatorHandle) -> MasterHandle {
        Master::spawn_with(
            flags,
            allocator,
            Arc::new(InMemoryRegistrar::new()),
            Arc::new(PermissiveAuthorizer),
            HookManager::new(),
        )
    }

    pub fn spawn_with(
        flags: MasterFlags,
        allocator: AllocatorHandle,
        registrar: Arc<dyn Registrar>,
        authorizer: Arc<dyn Authorizer>,
        hooks: HookManager,
    ) -> MasterHandle {
        let info = MasterInfo {
            id: format!("master-{}", random_suffix()),
            hostname: "localhost".to_string(),
        };
        let (tx, rx) = mpsc::channel(1024);

        // The allocator emits allocations on its own channel; a
        // forwarder folds them into the mailbox so they serialize with
        // everything else.
        let (allocation_tx, mut allocation_rx) = mpsc::unbounded_channel();
        allocator.initialize(flags.clone(), allocation_tx);
        let forward = tx.clone();
        tokio::spawn(async move {
            while let Some(allocation) = allocation_rx.recv().await {
                if forward.send(MasterMessage::Allocate(allocation)).await.is_err() {
                    break;
                }
            }
        });

        // Slave health checks ride the mailbox as well.
        let ping = tx.clone();
        let ping_period = Duration::from_secs_f64(flags.slave_ping_timeout.max(0.001));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ping_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                if ping.send(MasterMessage::PingSlaves).await.is_err() {
                    break;
                }
            }
        });

        let master = Master {
            info: info.clone(),
            registry: Registry::new(
                flags.max_completed_frameworks,
                flags.max_completed_tasks_per_framework,
            ),
            flags,
            allocator,
            registrar,
            authorizer,
            hooks,
            tx: tx.clone(),
            next_framework: 0,
            next_slave: 0,
            next_offer: 0,
        };
        tokio::spawn(master.run(rx));

        MasterHandle { tx, info }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<MasterMessage>) {
        info!(master_id = %self.info.id, "master started");
        while let Some(message) = rx.recv().await {
            self.dispatch(message).await;
            self.forward_registry_events();
            if let Err(error) = self.registry.check_invariants() {
                // Recovery is a restart against the registrar; serving
                // from corrupt state is worse than stopping.
                error!(%error, "registry invariant violated, aborting master");
                break;
            }
        }
        info!(master_id = %self.info.id, "master stopped");
    }

    async fn dispatch(&mut self, message: MasterMessage) {
        match message {
            MasterMessage::ConnectFramework { endpoint, message } => match message {
                FrameworkToMaster::Register { info } => {
                    self.register_framework(endpoint, info).await;
                }
                FrameworkToMaster::Reregister {
                    framework_id,
                    info,
                    failover,
                } => {
                    self.reregister_framework(endpoint, framework_id, info, failover);
                }
                other => {
                    warn!("non-registration message on the framework connect path: {:?}", kind(&other));
                }
            },
            MasterMessage::FrameworkMessage {
                framework_id,
                message,
            } => self.framework_message(framework_id, message).await,
            MasterMessage::FrameworkDisconnected { framework_id } => {
                self.framework_disconnected(framework_id);
            }
            MasterMessage::ConnectSlave { endpoint, message } => match message {
                SlaveToMaster::Register {
                    info,
                    checkpointed_resources,
                } => {
                    self.register_slave(endpoint, info, checkpointed_resources).await;
                }
                SlaveToMaster::Reregister {
                    slave_id,
                    info,
                    tasks,
                    checkpointed_resources,
                } => {
                    self.reregister_slave(endpoint, slave_id, info, tasks, checkpointed_resources)
                        .await;
                }
                _ => warn!("non-registration message on the slave connect path"),
            },
            MasterMessage::SlaveMessage { slave_id, message } => {
                self.slave_message(slave_id, message);
            }
            MasterMessage::SlaveDisconnected { slave_id } => self.slave_disconnected(slave_id),
            MasterMessage::Allocate(allocation) => self.create_offers(allocation),
            MasterMessage::OfferTimeout { offer_id } => self.offer_timed_out(offer_id),
            MasterMessage::FailoverExpired {
                framework_id,
                disconnected_at,
            } => self.failover_expired(framework_id, disconnected_at),
            MasterMessage::PingSlaves => self.ping_slaves(),
            MasterMessage::ShutdownFramework { framework_id } => {
                self.send_to_framework(
                    &framework_id,
                    MasterToFramework::Shutdown {
                        message: "framework was shut down by the operator".to_string(),
                    },
                );
                self.remove_framework(&framework_id);
            }
        }
    }

    /// Turn registry change events into allocator notifications.
    fn forward_registry_events(&mut self) {
        for event in self.registry.drain_events() {
            match event {
                RegistryEvent::FrameworkAdded { id, info, used } => {
                    self.allocator.framework_added(id, info, used);
                }
                RegistryEvent::FrameworkRemoved { id } => self.allocator.framework_removed(id),
                RegistryEvent::FrameworkActivated { id, info } => {
                    self.allocator.framework_activated(id, info);
                }
                RegistryEvent::FrameworkDeactivated { id } => {
                    self.allocator.framework_deactivated(id);
                }
                RegistryEvent::SlaveAdded { id, info, used } => {
                    self.allocator.slave_added(id, info, used);
                }
                RegistryEvent::SlaveRemoved { id } => self.allocator.slave_removed(id),
            }
        }
    }

    // --- framework lifecycle ---

    async fn register_framework(
        &mut self,
        endpoint: mpsc::UnboundedSender<MasterToFramework>,
        mut info: FrameworkInfo,
    ) {
        if !self.authorizer.authorize_framework(&info).await {
            let _ = endpoint.send(MasterToFramework::FrameworkError {
                message: format!("framework '{}' is not authorized to register", info.name),
            });
            return;
        }
        if info.role.is_empty() {
            info.role = self.flags.default_role.clone();
        }

        self.next_framework += 1;
        let framework_id = FrameworkId::new(format!("{}-{:04}", self.info.id, self.next_framework));
        info!(framework_id = %framework_id, name = %info.name, role = %info.role, "registering framework");

        let framework = Framework::new(framework_id.clone(), info, endpoint.clone());
        self.registry.add_framework(framework);

        let _ = endpoint.send(MasterToFramework::Registered {
            framework_id,
            master_info: self.info.clone(),
        });
    }

    fn reregister_framework(
        &mut self,
        endpoint: mpsc::UnboundedSender<MasterToFramework>,
        framework_id: FrameworkId,
        info: FrameworkInfo,
        failover: bool,
    ) {
        let Some(framework) = self.registry.framework_mut(&framework_id) else {
            let _ = endpoint.send(MasterToFramework::FrameworkError {
                message: format!("framework {} is not registered with this master", framework_id),
            });
            return;
        };

        info!(framework_id = %framework_id, failover, "framework re-registering");
        if failover {
            // The previous instance, if any, has been replaced.
            let _ = framework.endpoint.send(MasterToFramework::FrameworkError {
                message: "framework failed over".to_string(),
            });
        }
        framework.endpoint = endpoint.clone();
        framework.info = info;
        framework.disconnected_time = None;

        // Outstanding offers were made to the previous instance.
        self.rescind_framework_offers(&framework_id);
        self.registry.activate_framework(&framework_id);

        let _ = endpoint.send(MasterToFramework::Reregistered {
            framework_id,
            master_info: self.info.clone(),
        });
    }

    fn framework_disconnected(&mut self, framework_id: FrameworkId) {
        let Some(framework) = self.registry.framework_mut(&framework_id) else {
            return;
        };
        let failover_timeout = framework.info.failover_timeout;
        let disconnected_at = Utc::now();
        framework.disconnected_time = Some(disconnected_at);
        info!(framework_id = %framework_id, failover_timeout, "framework disconnected");

        // Offers are rescinded before any resource may return to the
        // free pool under another framework's name.
        self.rescind_framework_offers(&framework_id);
        self.registry.deactivate_framework(&framework_id);

        if failover_timeout > 0.0 {
            let tx = self.tx.clone();
            let id = framework_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(failover_timeout)).await;
                let _ = tx
                    .send(MasterMessage::FailoverExpired {
                        framework_id: id,
                        disconnected_at,
                    })
                    .await;
            });
        } else {
            self.remove_framework(&framework_id);
        }
    }

    fn failover_expired(&mut self, framework_id: FrameworkId, disconnected_at: DateTime<Utc>) {
        let Some(framework) = self.registry.framework(&framework_id) else {
            return;
        };
        // A reconnect clears or renews the disconnect timestamp, which
        // invalidates timers armed for the previous disconnect.
        if framework.active || framework.disconnected_time != Some(disconnected_at) {
            return;
        }
        info!(framework_id = %framework_id, "framework failover timeout expired");
        self.remove_framework(&framework_id);
    }

    /// Remove a framework: rescind offers, mark its tasks lost, shut
    /// down its executors, archive what remains.
    fn remove_framework(&mut self, framework_id: &FrameworkId) {
        if self.registry.framework(framework_id).is_none() {
            return;
        }
        info!(framework_id = %framework_id, "removing framework");
        self.rescind_framework_offers(framework_id);

        // Abort pending launches and running tasks on the slaves.
        let live_tasks: Vec<(TaskId, SlaveId)> = self
            .registry
            .framework(framework_id)
            .map(|f| {
                f.tasks
                    .values()
                    .filter(|t| !t.is_terminal())
                    .map(|t| (t.task_id.clone(), t.slave_id.clone()))
                    .collect()
            })
            .unwrap_or_default();

        for (task_id, slave_id) in live_tasks {
            self.send_to_slave(
                &slave_id,
                MasterToSlave::KillTask {
                    framework_id: framework_id.clone(),
                    task_id: task_id.clone(),
                },
            );
            self.terminate_task(
                framework_id,
                &task_id,
                TaskState::Lost,
                StatusReason::FrameworkRemoved,
                "framework was removed",
                // The framework is going away; nobody is listening.
                false,
            );
        }

        // Tell the slaves to shut down this framework's executors.
        let executors: Vec<(SlaveId, ExecutorId)> = self
            .registry
            .slaves()
            .flat_map(|slave| {
                slave
                    .executors
                    .get(framework_id)
                    .map(|executors| {
                        executors
                            .keys()
                            .map(|executor_id| (slave.id.clone(), executor_id.clone()))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            })
            .collect();
        for (slave_id, executor_id) in executors {
            self.send_to_slave(
                &slave_id,
                MasterToSlave::ShutdownExecutor {
                    framework_id: framework_id.clone(),
                    executor_id,
                },
            );
            if let Some(slave) = self.registry.slave_mut(&slave_id) {
                slave.executors.remove(framework_id);
            }
        }

        self.registry.remove_framework(framework_id);
    }

    /// Rescind every outstanding offer of a framework, returning the
    /// resources to the allocator.
    fn rescind_framework_offers(&mut self, framework_id: &FrameworkId) {
        for offer_id in self.registry.framework_offers(framework_id) {
            if let Some(offer) = self.registry.remove_offer(&offer_id) {
                debug!(offer_id = %offer.id, framework_id = %framework_id, "rescinding offer");
                self.allocator.resources_recovered(
                    offer.framework_id.clone(),
                    offer.slave_id.clone(),
                    offer.resources.clone(),
                );
                self.send_to_framework(
                    framework_id,
                    MasterToFramework::RescindOffer { offer_id: offer.id },
                );
            }
        }
    }

    // --- framework messages ---

    async fn framework_message(&mut self, framework_id: FrameworkId, message: FrameworkToMaster) {
        if self.registry.framework(&framework_id).is_none() {
            warn!(framework_id = %framework_id, "message from unregistered framework dropped");
            return;
        }
        match message {
            FrameworkToMaster::AcceptOffers {
                offer_ids,
                operations,
                filters,
            } => self.accept_offers(framework_id, offer_ids, operations, filters),
            FrameworkToMaster::DeclineOffers { offer_ids, filters } => {
                self.decline_offers(framework_id, offer_ids, filters);
            }
            FrameworkToMaster::ReviveOffers => self.allocator.offers_revived(framework_id),
            FrameworkToMaster::KillTask { task_id } => self.kill_task(framework_id, task_id),
            FrameworkToMaster::ReconcileTasks { statuses } => {
                self.reconcile_tasks(framework_id, statuses);
            }
            FrameworkToMaster::Acknowledge {
                slave_id,
                task_id,
                uuid,
            } => {
                self.send_to_slave(
                    &slave_id,
                    MasterToSlave::StatusUpdateAcknowledgement {
                        framework_id,
                        task_id,
                        uuid,
                    },
                );
            }
            FrameworkToMaster::RequestResources { requests } => {
                self.allocator.resources_requested(framework_id, requests);
            }
            FrameworkToMaster::Unregister => self.remove_framework(&framework_id),
            FrameworkToMaster::Register { .. } | FrameworkToMaster::Reregister { .. } => {
                warn!(framework_id = %framework_id, "registration must use the connect path");
            }
        }
    }

    /// The accept path: validate offers, apply operations, validate and
    /// launch tasks, recover the remainder.
    fn accept_offers(
        &mut self,
        framework_id: FrameworkId,
        offer_ids: Vec<OfferId>,
        operations: Vec<Operation>,
        _filters: Option<Filters>,
    ) {
        let launch_tasks: Vec<TaskInfo> = operations
            .iter()
            .filter_map(|op| match op {
                Operation::Launch { tasks } => Some(tasks.clone()),
                _ => None,
            })
            .flatten()
            .collect();

        // Step 1: the offers must be live, ours and on one slave.
        let slave_id = match validation::validate_offers(&offer_ids, &self.registry, &framework_id) {
            Ok(slave_id) => slave_id,
            Err(error) => {
                warn!(framework_id = %framework_id, %error, "rejecting accept");
                // Consume whichever of the offers do exist.
                for offer_id in &offer_ids {
                    if let Some(offer) = self.registry.remove_offer(offer_id) {
                        self.allocator.resources_recovered(
                            offer.framework_id,
                            offer.slave_id,
                            offer.resources,
                        );
                    }
                }
                for task in &launch_tasks {
                    self.send_task_error(
                        &framework_id,
                        task,
                        TaskState::Lost,
                        StatusReason::InvalidOffers,
                        &error.to_string(),
                    );
                }
                return;
            }
        };

        // Step 2: combine the offers into the working pool; the offers
        // are consumed here and never come back.
        let mut pool = Resources::new();
        for offer_id in &offer_ids {
            if let Some(offer) = self.registry.remove_offer(offer_id) {
                pool += &offer.resources;
            }
        }
        let pool_before_operations = pool.clone();
        let has_mutations = operations
            .iter()
            .any(|op| !matches!(op, Operation::Launch { .. }));

        // Step 3: apply reserve/unreserve/create/destroy in listed
        // order against local images; first failure rejects the accept.
        let mut checkpointed = self
            .registry
            .slave(&slave_id)
            .map(|slave| slave.checkpointed_resources.clone())
            .unwrap_or_default();
        let principal = self
            .registry
            .framework(&framework_id)
            .and_then(|f| f.info.principal.clone());
        let role = self
            .registry
            .framework(&framework_id)
            .map(|f| f.info.role.clone())
            .unwrap_or_default();

        for operation in &operations {
            let result = match operation {
                Operation::Launch { .. } => Ok(()),
                Operation::Reserve { resources } => {
                    apply_reserve(&mut pool, resources, &role, principal.as_deref())
                }
                Operation::Unreserve { resources } => apply_unreserve(&mut pool, resources),
                Operation::Create { volumes } => {
                    apply_create(&mut pool, &mut checkpointed, volumes, principal.as_deref())
                }
                Operation::Destroy { volumes } => {
                    apply_destroy(&mut pool, &mut checkpointed, volumes)
                }
            };
            if let Err(error) = result {
                warn!(framework_id = %framework_id, %error, "offer operation failed, rejecting accept");
                for task in &launch_tasks {
                    self.send_task_error(
                        &framework_id,
                        task,
                        TaskState::Error,
                        StatusReason::TaskInvalid,
                        &format!("offer operation failed: {}", error),
                    );
                }
                self.allocator.resources_recovered(framework_id, slave_id, pool);
                return;
            }
        }

        // Operations held; commit the checkpointed image. Reservation
        // and volume operations change the composition of the slave's
        // advertised resources, so the total is rewritten to match.
        if let Some(slave) = self.registry.slave_mut(&slave_id) {
            slave.checkpointed_resources = checkpointed;
            if has_mutations {
                match slave.info.resources.subtract(&pool_before_operations) {
                    Ok(rest) => {
                        let mut total = rest;
                        total += &pool;
                        slave.info.resources = total;
                    }
                    Err(error) => {
                        error!(%error, slave_id = %slave_id, "slave total does not cover its own offers");
                        return;
                    }
                }
            }
        }

        // Steps 4 and 5: sequential task validation against the
        // shrinking pool; failures continue with the pool unchanged.
        for task in launch_tasks {
            match self.launch_task(&framework_id, &slave_id, &task, &pool) {
                Ok(charged) => {
                    pool = pool
                        .subtract(&charged)
                        .expect("validated launch fits the residual pool");
                }
                Err(error) => {
                    debug!(task_id = %task.task_id, %error, "task failed validation");
                    self.send_task_error(
                        &framework_id,
                        &task,
                        TaskState::Error,
                        StatusReason::TaskInvalid,
                        &error.to_string(),
                    );
                }
            }
        }

        // Step 6: the remainder returns to the free pool unfiltered.
        // After reservation or volume operations the slave's shape has
        // changed, so the allocator's entry for it is rebuilt from the
        // authoritative ledger instead; anything not held by a task is
        // implicitly free in the rebuilt entry.
        if has_mutations {
            // Offers to other frameworks on this slave were priced in
            // the old composition; they cannot be accepted any more.
            self.rescind_slave_offers(&slave_id, false);
            if let Some(slave) = self.registry.slave(&slave_id) {
                let info = slave.info.clone();
                let used = slave.used_resources.clone();
                self.allocator.slave_removed(slave_id.clone());
                self.allocator.slave_added(slave_id, info, used);
            }
        } else if !pool.is_empty() {
            self.allocator.resources_recovered(framework_id, slave_id, pool);
        }
    }

    /// Validate one task and, when it passes, record and dispatch it.
    /// Returns the resources charged against the pool.
    fn launch_task(
        &mut self,
        framework_id: &FrameworkId,
        slave_id: &SlaveId,
        task: &TaskInfo,
        pool: &Resources,
    ) -> Result<Resources, ValidationError> {
        {
            let framework = self
                .registry
                .framework(framework_id)
                .expect("framework checked on dispatch");
            let slave = self
                .registry
                .slave(slave_id)
                .expect("slave validated with the offers");
            validation::validate_task(task, framework, slave, pool)?;
        }

        // The task id is claimed while the launch is in flight, so a
        // later task in the same batch cannot reuse it.
        if let Some(framework) = self.registry.framework_mut(framework_id) {
            framework.pending_tasks.insert(task.task_id.clone(), task.clone());
        }

        // Resources charged: the task's, plus a new executor's.
        let mut charged = task.resources.clone();
        if let Some(executor) = &task.executor {
            let is_new = self
                .registry
                .slave(slave_id)
                .map(|slave| {
                    slave
                        .executors
                        .get(framework_id)
                        .map(|m| !m.contains_key(&executor.executor_id))
                        .unwrap_or(true)
                })
                .unwrap_or(true);
            if is_new {
                charged += &executor.resources;
                if let Some(slave) = self.registry.slave_mut(slave_id) {
                    slave
                        .executors
                        .entry(framework_id.clone())
                        .or_default()
                        .insert(executor.executor_id.clone(), executor.clone());
                }
            }
        }

        let record = Task::from_info(framework_id.clone(), task);
        let recorded = self.registry.add_task(record);
        if let Some(framework) = self.registry.framework_mut(framework_id) {
            framework.pending_tasks.remove(&task.task_id);
        }
        recorded.map_err(|e| ValidationError::Task(task.task_id.to_string(), e.to_string()))?;

        // Decorate labels and hand the task to the slave.
        let (framework_info, slave_info, slave_endpoint) = {
            let framework = self.registry.framework(framework_id).expect("checked above");
            let slave = self.registry.slave(slave_id).expect("checked above");
            (framework.info.clone(), slave.info.clone(), slave.endpoint.clone())
        };
        let mut dispatched = task.clone();
        dispatched.labels = self.hooks.decorate_labels(task, &framework_info, &slave_info);

        info!(task_id = %task.task_id, framework_id = %framework_id, slave_id = %slave_id, "launching task");
        let _ = slave_endpoint.send(MasterToSlave::RunTask {
            framework_id: framework_id.clone(),
            framework_info,
            task: dispatched,
        });
        Ok(charged)
    }

    fn decline_offers(
        &mut self,
        framework_id: FrameworkId,
        offer_ids: Vec<OfferId>,
        filters: Option<Filters>,
    ) {
        for offer_id in offer_ids {
            match self.registry.offer(&offer_id) {
                Some(offer) if offer.framework_id == framework_id => {
                    let offer = self.registry.remove_offer(&offer_id).expect("offer exists");
                    debug!(offer_id = %offer_id, framework_id = %framework_id, "offer declined");
                    self.allocator.resources_unused(
                        offer.framework_id,
                        offer.slave_id,
                        offer.resources,
                        filters.clone(),
                    );
                }
                Some(_) => {
                    warn!(offer_id = %offer_id, framework_id = %framework_id, "declined offer owned by another framework");
                }
                None => debug!(offer_id = %offer_id, "declined offer is already gone"),
            }
        }
    }

    fn kill_task(&mut self, framework_id: FrameworkId, task_id: TaskId) {
        let known = self
            .registry
            .framework(&framework_id)
            .and_then(|f| f.tasks.get(&task_id))
            .map(|t| (t.slave_id.clone(), t.is_terminal()));

        match known {
            Some((slave_id, false)) => {
                self.send_to_slave(
                    &slave_id,
                    MasterToSlave::KillTask {
                        framework_id,
                        task_id,
                    },
                );
            }
            Some((_, true)) => {
                debug!(task_id = %task_id, "kill for already-terminal task ignored");
            }
            None => {
                // The task never reached the master; answer with LOST
                // so the framework can forget it.
                let status = TaskStatus::from_master(
                    task_id,
                    TaskState::Lost,
                    StatusReason::Reconciliation,
                )
                .with_message("attempted to kill an unknown task");
                self.send_to_framework(&framework_id, MasterToFramework::StatusUpdate { status });
            }
        }
    }

    fn reconcile_tasks(&mut self, framework_id: FrameworkId, statuses: Vec<TaskStatus>) {
        let Some(framework) = self.registry.framework(&framework_id) else {
            return;
        };

        let mut answers: Vec<TaskStatus> = Vec::new();
        if statuses.is_empty() {
            // Implicit reconciliation: the latest state of every known
            // task.
            for task in framework.tasks.values() {
                let mut answer = TaskStatus::from_master(
                    task.task_id.clone(),
                    task.state,
                    StatusReason::Reconciliation,
                );
                answer.slave_id = Some(task.slave_id.clone());
                answers.push(answer);
            }
        } else {
            for request in statuses {
                if let Some(task) = framework.tasks.get(&request.task_id) {
                    let mut answer = TaskStatus::from_master(
                        task.task_id.clone(),
                        task.state,
                        StatusReason::Reconciliation,
                    );
                    answer.slave_id = Some(task.slave_id.clone());
                    answers.push(answer);
                    continue;
                }
                match &request.slave_id {
                    Some(slave_id) => match self.registry.slave(slave_id) {
                        Some(slave) if !slave.active => {
                            // The slave is in limbo; stay silent rather
                            // than guess.
                            continue;
                        }
                        _ => {
                            // Slave registered without the task, or
                            // slave unknown: the task is lost.
                            let mut answer = TaskStatus::from_master(
                                request.task_id.clone(),
                                TaskState::Lost,
                                StatusReason::Reconciliation,
                            );
                            answer.slave_id = Some(slave_id.clone());
                            answers.push(answer);
                        }
                    },
                    None => {
                        answers.push(TaskStatus::from_master(
                            request.task_id.clone(),
                            TaskState::Lost,
                            StatusReason::Reconciliation,
                        ));
                    }
                }
            }
        }

        for status in answers {
            self.send_to_framework(&framework_id, MasterToFramework::StatusUpdate { status });
        }
    }

    // --- slave lifecycle ---

    async fn register_slave(
        &mut self,
        endpoint: mpsc::UnboundedSender<MasterToSlave>,
        info: SlaveInfo,
        checkpointed_resources: Resources,
    ) {
        self.next_slave += 1;
        let slave_id = SlaveId::new(format!("{}-S{:04}", self.info.id, self.next_slave));

        if !self.registrar.admit(&slave_id).await {
            warn!(slave_id = %slave_id, "registrar refused to admit slave");
            let _ = endpoint.send(MasterToSlave::ShutdownSlave {
                message: "registrar refused admission".to_string(),
            });
            return;
        }

        info!(slave_id = %slave_id, hostname = %info.hostname, resources = %info.resources, "registering slave");
        let slave = Slave::new(slave_id.clone(), info, endpoint.clone(), checkpointed_resources);
        self.registry.add_slave(slave);
        let _ = endpoint.send(MasterToSlave::Registered { slave_id });
    }

    async fn reregister_slave(
        &mut self,
        endpoint: mpsc::UnboundedSender<MasterToSlave>,
        slave_id: SlaveId,
        info: SlaveInfo,
        tasks: Vec<(FrameworkId, TaskInfo)>,
        checkpointed_resources: Resources,
    ) {
        if let Some(slave) = self.registry.slave_mut(&slave_id) {
            // Already known: rebind the connection and put the slave
            // back into the allocator's rotation.
            info!(slave_id = %slave_id, "slave re-registered");
            slave.endpoint = endpoint.clone();
            slave.active = true;
            slave.reregistered_time = Some(Utc::now());
            slave.missed_pings = 0;
            let slave_info = slave.info.clone();
            let used = slave.used_resources.clone();
            self.allocator.slave_added(slave_id.clone(), slave_info, used);
            let _ = endpoint.send(MasterToSlave::Reregistered { slave_id });
            return;
        }

        // Unknown to this master: consult the registrar, then rebuild
        // state from what the slave reports.
        if !self.registrar.readmit(&slave_id).await {
            warn!(slave_id = %slave_id, "slave is not in the admitted set");
            let _ = endpoint.send(MasterToSlave::ShutdownSlave {
                message: "slave attempted to re-register without being admitted".to_string(),
            });
            return;
        }

        info!(slave_id = %slave_id, tasks = tasks.len(), "re-admitting slave with reported tasks");
        let slave = Slave::new(slave_id.clone(), info, endpoint.clone(), checkpointed_resources);
        let records: Vec<Task> = tasks
            .iter()
            .filter(|(framework_id, _)| {
                let known = self.registry.framework(framework_id).is_some();
                if !known {
                    warn!(framework_id = %framework_id, "dropping reported task of unknown framework");
                }
                known
            })
            .map(|(framework_id, task_info)| {
                let mut task = Task::from_info(framework_id.clone(), task_info);
                task.slave_id = slave_id.clone();
                task.state = TaskState::Running;
                task
            })
            .collect();

        if let Err(error) = self.registry.add_slave_with_tasks(slave, records) {
            error!(%error, "failed to rebuild slave state");
            return;
        }
        let _ = endpoint.send(MasterToSlave::Reregistered { slave_id });
    }

    fn slave_disconnected(&mut self, slave_id: SlaveId) {
        let Some(slave) = self.registry.slave_mut(&slave_id) else {
            return;
        };
        if !slave.active {
            return;
        }
        info!(slave_id = %slave_id, "slave disconnected");
        slave.active = false;

        // Outstanding offers die with the connection.
        self.rescind_slave_offers(&slave_id, true);
        // The allocator stops offering this slave until it returns;
        // its tasks keep their resources in the master's ledger.
        self.allocator.slave_removed(slave_id);
    }

    /// Rescind every outstanding offer on a slave. Resources are
    /// returned to the allocator only when `recover` is set; when the
    /// slave's allocator entry is being dropped or rebuilt anyway,
    /// recovery would double-count.
    fn rescind_slave_offers(&mut self, slave_id: &SlaveId, recover: bool) {
        for offer_id in self.registry.slave_offers(slave_id) {
            if let Some(offer) = self.registry.remove_offer(&offer_id) {
                if recover {
                    self.allocator.resources_recovered(
                        offer.framework_id.clone(),
                        offer.slave_id.clone(),
                        offer.resources.clone(),
                    );
                }
                self.send_to_framework(
                    &offer.framework_id,
                    MasterToFramework::RescindOffer { offer_id: offer.id },
                );
            }
        }
    }

    fn ping_slaves(&mut self) {
        let slaves: Vec<(SlaveId, u32)> = self
            .registry
            .slaves()
            .map(|slave| (slave.id.clone(), slave.missed_pings))
            .collect();

        for (slave_id, missed) in slaves {
            if missed >= self.flags.max_slave_ping_timeouts {
                warn!(slave_id = %slave_id, missed, "slave missed too many health checks");
                self.remove_slave(&slave_id, "slave health check timed out");
                continue;
            }
            if let Some(slave) = self.registry.slave_mut(&slave_id) {
                slave.missed_pings += 1;
                if slave.active {
                    let _ = slave.endpoint.send(MasterToSlave::Ping);
                }
            }
        }
    }

    /// Remove a slave: rescind its offers, mark its tasks lost, purge
    /// it from the allocator's view.
    fn remove_slave(&mut self, slave_id: &SlaveId, reason: &str) {
        if self.registry.slave(slave_id).is_none() {
            return;
        }
        info!(slave_id = %slave_id, reason, "removing slave");

        // Offers die first; their resources do not return to the free
        // pool because the pool itself is going away.
        self.rescind_slave_offers(slave_id, false);

        // Every non-terminal task on the slave is lost.
        let lost: Vec<(FrameworkId, TaskId)> = self
            .registry
            .slave(slave_id)
            .map(|slave| {
                slave
                    .task_index
                    .iter()
                    .flat_map(|(framework_id, task_ids)| {
                        task_ids
                            .iter()
                            .map(|task_id| (framework_id.clone(), task_id.clone()))
                            .collect::<Vec<_>>()
                    })
                    .collect()
            })
            .unwrap_or_default();
        for (framework_id, task_id) in lost {
            self.terminate_task(
                &framework_id,
                &task_id,
                TaskState::Lost,
                StatusReason::SlaveRemoved,
                reason,
                true,
            );
        }

        if let Some(slave) = self.registry.remove_slave(slave_id) {
            let _ = slave.endpoint.send(MasterToSlave::ShutdownSlave {
                message: reason.to_string(),
            });
        }
    }

    // --- slave messages ---

    fn slave_message(&mut self, slave_id: SlaveId, message: SlaveToMaster) {
        match message {
            SlaveToMaster::Pong => {
                if let Some(slave) = self.registry.slave_mut(&slave_id) {
                    slave.missed_pings = 0;
                }
            }
            SlaveToMaster::StatusUpdate {
                framework_id,
                status,
            } => self.status_update(slave_id, framework_id, status),
            SlaveToMaster::Register { .. } | SlaveToMaster::Reregister { .. } => {
                warn!(slave_id = %slave_id, "registration must use the connect path");
            }
        }
    }

    /// Apply a slave-reported status update and forward it to the
    /// framework. Duplicate uuids are idempotent.
    fn status_update(&mut self, slave_id: SlaveId, framework_id: FrameworkId, status: TaskStatus) {
        let Some(framework) = self.registry.framework_mut(&framework_id) else {
            warn!(framework_id = %framework_id, "status update for unknown framework dropped");
            return;
        };
        let Some(task) = framework.tasks.get_mut(&status.task_id) else {
            warn!(task_id = %status.task_id, "status update for unknown task dropped");
            return;
        };

        if task.statuses.iter().any(|seen| seen.uuid == status.uuid) {
            // A retried update: forward again, mutate nothing.
            debug!(task_id = %status.task_id, uuid = %status.uuid, "duplicate status update");
            self.send_to_framework(&framework_id, MasterToFramework::StatusUpdate { status });
            return;
        }

        debug!(task_id = %status.task_id, state = ?status.state, slave_id = %slave_id, "status update");
        task.statuses.push(status.clone());
        task.state = status.state;

        if status.state.is_terminal() {
            if let Some(task) = self.registry.remove_task(&framework_id, &status.task_id) {
                self.allocator.resources_recovered(
                    framework_id.clone(),
                    task.slave_id,
                    task.resources,
                );
            }
        }
        self.send_to_framework(&framework_id, MasterToFramework::StatusUpdate { status });
    }

    // --- offers ---

    /// Turn an allocator grant into offers, guarding against the
    /// allocator's one-dispatch lag.
    fn create_offers(&mut self, allocation: Allocation) {
        let framework_id = allocation.framework_id;
        let framework_live = self
            .registry
            .framework(&framework_id)
            .map(|f| f.active)
            .unwrap_or(false);

        let mut offers: Vec<OfferInfo> = Vec::new();
        for (slave_id, resources) in allocation.resources {
            let slave_ready = self
                .registry
                .slave(&slave_id)
                .map(|s| s.active && s.available_resources().contains(&resources))
                .unwrap_or(false);
            if !framework_live || !slave_ready {
                // Stale grant; give it straight back.
                debug!(framework_id = %framework_id, slave_id = %slave_id, "returning stale allocation");
                self.allocator
                    .resources_recovered(framework_id.clone(), slave_id, resources);
                continue;
            }

            self.next_offer += 1;
            let offer_id = OfferId::new(format!("{}-O{:06}", self.info.id, self.next_offer));
            let hostname = self
                .registry
                .slave(&slave_id)
                .map(|s| s.info.hostname.clone())
                .unwrap_or_default();
            let offer = Offer {
                id: offer_id.clone(),
                framework_id: framework_id.clone(),
                slave_id: slave_id.clone(),
                resources: resources.clone(),
            };
            if let Err(error) = self.registry.add_offer(offer) {
                error!(%error, "failed to record offer");
                continue;
            }

            if let Some(seconds) = self.flags.offer_timeout {
                let tx = self.tx.clone();
                let timed_offer = offer_id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                    let _ = tx
                        .send(MasterMessage::OfferTimeout {
                            offer_id: timed_offer,
                        })
                        .await;
                });
            }

            offers.push(OfferInfo {
                offer_id,
                framework_id: framework_id.clone(),
                slave_id,
                hostname,
                resources,
            });
        }

        if !offers.is_empty() {
            debug!(framework_id = %framework_id, offers = offers.len(), "sending offers");
            self.send_to_framework(&framework_id, MasterToFramework::ResourceOffers { offers });
        }
    }

    fn offer_timed_out(&mut self, offer_id: OfferId) {
        if let Some(offer) = self.registry.remove_offer(&offer_id) {
            info!(offer_id = %offer_id, framework_id = %offer.framework_id, "offer timed out, rescinding");
            self.allocator.resources_recovered(
                offer.framework_id.clone(),
                offer.slave_id.clone(),
                offer.resources.clone(),
            );
            self.send_to_framework(
                &offer.framework_id,
                MasterToFramework::RescindOffer { offer_id: offer.id },
            );
        }
    }

    // --- helpers ---

    /// Mark a live task terminal, archive it, recover its resources
    /// and optionally notify the framework.
    fn terminate_task(
        &mut self,
        framework_id: &FrameworkId,
        task_id: &TaskId,
        state: TaskState,
        reason: StatusReason,
        message: &str,
        notify_framework: bool,
    ) {
        let Some(framework) = self.registry.framework_mut(framework_id) else {
            return;
        };
        let Some(task) = framework.tasks.get_mut(task_id) else {
            return;
        };
        let mut status = TaskStatus::from_master(task_id.clone(), state, reason);
        status.slave_id = Some(task.slave_id.clone());
        status.message = Some(message.to_string());
        task.statuses.push(status.clone());
        task.state = state;

        let removed = self.registry.remove_task(framework_id, task_id);
        if let Some(task) = removed {
            if reason != StatusReason::SlaveRemoved {
                // On slave removal the allocator drops the whole slave;
                // individual recovery would double-count.
                self.allocator.resources_recovered(
                    framework_id.clone(),
                    task.slave_id.clone(),
                    task.resources.clone(),
                );
            }
        }
        if notify_framework {
            self.send_to_framework(framework_id, MasterToFramework::StatusUpdate { status });
        }
    }

    /// Synthesize a terminal update for a task that never launched.
    fn send_task_error(
        &mut self,
        framework_id: &FrameworkId,
        task: &TaskInfo,
        state: TaskState,
        reason: StatusReason,
        message: &str,
    ) {
        let mut status = TaskStatus::from_master(task.task_id.clone(), state, reason);
        status.slave_id = Some(task.slave_id.clone());
        status.message = Some(message.to_string());
        self.send_to_framework(framework_id, MasterToFramework::StatusUpdate { status });
    }

    fn send_to_framework(&self, framework_id: &FrameworkId, message: MasterToFramework) {
        if let Some(framework) = self.registry.framework(framework_id) {
            if framework.endpoint.send(message).is_err() {
                debug!(framework_id = %framework_id, "framework endpoint closed");
            }
        }
    }

    fn send_to_slave(&self, slave_id: &SlaveId, message: MasterToSlave) {
        if let Some(slave) = self.registry.slave(slave_id) {
            if slave.endpoint.send(message).is_err() {
                debug!(slave_id = %slave_id, "slave endpoint closed");
            }
        }
    }
}

fn kind(message: &FrameworkToMaster) -> &'static str {
    match message {
        FrameworkToMaster::Register { .. } => "Register",
        FrameworkToMaster::Reregister { .. } => "Reregister",
        FrameworkToMaster::AcceptOffers { .. } => "AcceptOffers",
        FrameworkToMaster::DeclineOffers { .. } => "DeclineOffers",
        FrameworkToMaster::ReviveOffers => "ReviveOffers",
        FrameworkToMaster::KillTask { .. } => "KillTask",
        FrameworkToMaster::ReconcileTasks { .. } => "ReconcileTasks",
        FrameworkToMaster::Acknowledge { .. } => "Acknowledge",
        FrameworkToMaster::RequestResources { .. } => "RequestResources",
        FrameworkToMaster::Unregister => "Unregister",
    }
}

/// Reserve: unreserved resources in the pool become reserved for the
/// framework's role under its principal.
fn apply_reserve(
    pool: &mut Resources,
    resources: &[Resource],
    role: &str,
    principal: Option<&str>,
) -> Result<(), ValidationError> {
    validation::validate_resources(resources)?;
    for resource in resources {
        if resource.role != role {
            return Err(ValidationError::Resources(format!(
                "cannot reserve for role '{}' from a framework in role '{}'",
                resource.role, role
            )));
        }
        match (&resource.reservation, principal) {
            (Some(reserver), Some(principal)) if reserver == principal => {}
            _ => {
                return Err(ValidationError::Resources(
                    "reservation principal does not match the framework's".to_string(),
                ))
            }
        }
    }
    let wanted: Resources = resources.to_vec().into();
    let unreserved = wanted.flatten(None);
    *pool = pool.subtract(&unreserved).map_err(|e| ValidationError::Resources(e.to_string()))?;
    *pool += wanted;
    Ok(())
}

/// Unreserve: reserved resources in the pool flatten back to the
/// unreserved pool.
fn apply_unreserve(pool: &mut Resources, resources: &[Resource]) -> Result<(), ValidationError> {
    validation::validate_resources(resources)?;
    let wanted: Resources = resources.to_vec().into();
    *pool = pool.subtract(&wanted).map_err(|e| ValidationError::Resources(e.to_string()))?;
    *pool += wanted.flatten(None);
    Ok(())
}

/// Create: plain reserved disk becomes a persistent volume, recorded
/// in the slave's checkpointed set.
fn apply_create(
    pool: &mut Resources,
    checkpointed: &mut Resources,
    volumes: &[Resource],
    principal: Option<&str>,
) -> Result<(), ValidationError> {
    validation::validate_create(volumes, checkpointed, principal)?;
    let wanted: Resources = volumes.to_vec().into();
    let backing: Resources = volumes
        .iter()
        .map(|volume| {
            let mut plain = volume.clone();
            plain.persistence = None;
            plain
        })
        .collect();
    *pool = pool.subtract(&backing).map_err(|e| ValidationError::Volumes(e.to_string()))?;
    *pool += wanted.clone();
    *checkpointed += wanted;
    Ok(())
}

/// Destroy: a persistent volume reverts to plain disk and leaves the
/// checkpointed set.
fn apply_destroy(
    pool: &mut Resources,
    checkpointed: &mut Resources,
    volumes: &[Resource],
) -> Result<(), ValidationError> {
    validation::validate_destroy(volumes, checkpointed)?;
    let wanted: Resources = volumes.to_vec().into();
    let backing: Resources = volumes
        .iter()
        .map(|volume| {
            let mut plain = volume.clone();
            plain.persistence = None;
            plain
        })
        .collect();
    *pool = pool.subtract(&wanted).map_err(|e| ValidationError::Volumes(e.to_string()))?;
    *pool += backing;
    *checkpointed = checkpointed
        .subtract(&wanted)
        .map_err(|e| ValidationError::Volumes(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    use armada_resources::Scalar;

    fn resources(text: &str) -> Resources {
        Resources::from_str(text).unwrap()
    }

    #[test]
    fn test_apply_reserve_and_unreserve() {
        let mut pool = resources("cpus:4;mem:2048");
        let reserved = vec![Resource::scalar("cpus", Scalar::from_units(2))
            .with_role("analytics")
            .with_reservation("ops")];

        apply_reserve(&mut pool, &reserved, "analytics", Some("ops")).unwrap();
        assert_eq!(pool.by_role("analytics").scalar_quantity("cpus"), Scalar::from_units(2));
        assert_eq!(pool.unreserved().scalar_quantity("cpus"), Scalar::from_units(2));

        apply_unreserve(&mut pool, &reserved).unwrap();
        assert_eq!(pool.unreserved().scalar_quantity("cpus"), Scalar::from_units(4));
    }

    #[test]
    fn test_apply_reserve_rejects_foreign_role() {
        let mut pool = resources("cpus:4");
        let reserved = vec![Resource::scalar("cpus", Scalar::from_units(2))
            .with_role("analytics")
            .with_reservation("ops")];

        assert!(apply_reserve(&mut pool, &reserved, "batch", Some("ops")).is_err());
        assert!(apply_reserve(&mut pool, &reserved, "analytics", Some("intruder")).is_err());
        // The pool is untouched after the failures.
        assert_eq!(pool, resources("cpus:4"));
    }

    #[test]
    fn test_apply_create_and_destroy() {
        let disk = Resource::scalar("disk", Scalar::from_units(64))
            .with_role("data")
            .with_reservation("ops");
        let mut pool: Resources = vec![disk.clone()].into();
        let mut checkpointed = Resources::new();

        let volume = disk.clone().with_persistence("vol-1", "/data");
        apply_create(&mut pool, &mut checkpointed, &[volume.clone()], Some("ops")).unwrap();
        assert_eq!(checkpointed.persistent_volumes().iter().count(), 1);
        assert!(pool.contains(&vec![volume.clone()].into()));

        apply_destroy(&mut pool, &mut checkpointed, &[volume.clone()]).unwrap();
        assert!(checkpointed.is_empty());
        assert!(pool.contains(&vec![disk].into()));
        assert!(!pool.contains(&vec![volume].into()));
    }

    #[test]
    fn test_apply_destroy_requires_known_volume() {
        let volume = Resource::scalar("disk", Scalar::from_units(64))
            .with_role("data")
            .with_persistence("vol-9", "/data");
        let mut pool: Resources = vec![volume.clone()].into();
        let mut checkpointed = Resources::new();

        assert!(apply_destroy(&mut pool, &mut checkpointed, &[volume]).is_err());
    }
}
