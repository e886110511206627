// End-to-end scenarios driving a master with the default DRF
// allocator through framework and slave endpoints.

use std::str::FromStr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use armada_allocator::{AllocatorHandle, DrfAllocator};
use armada_master::{Master, MasterHandle};
use armada_resources::Resources;
use armada_types::{
    CommandInfo, Filters, FrameworkId, FrameworkInfo, FrameworkToMaster, MasterFlags,
    MasterToFramework, MasterToSlave, OfferId, OfferInfo, Operation, SlaveId, SlaveInfo,
    SlaveToMaster, StatusReason, StatusSource, TaskId, TaskInfo, TaskState, TaskStatus,
};

const WAIT: Duration = Duration::from_secs(30);

fn resources(text: &str) -> Resources {
    Resources::from_str(text).unwrap()
}

fn test_flags() -> MasterFlags {
    let mut flags = MasterFlags::default();
    flags.allocation_interval = 0.05;
    // Keep health checks out of the way unless a test wants them.
    flags.slave_ping_timeout = 300.0;
    flags
}

fn start_master(flags: MasterFlags) -> MasterHandle {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let allocator = AllocatorHandle::spawn(DrfAllocator::new());
    Master::spawn(flags, allocator)
}

fn command_task(task_id: &str, slave_id: &SlaveId, r: &str) -> TaskInfo {
    TaskInfo::command_task(
        TaskId::new(task_id),
        task_id,
        slave_id.clone(),
        resources(r),
        CommandInfo::shell("sleep 100"),
    )
}

/// A framework endpoint: registers and consumes master pushes. Offer
/// batches that arrive while waiting for something else are buffered
/// so the interleaving of pushes cannot race the assertions.
struct SchedulerDriver {
    id: FrameworkId,
    rx: mpsc::UnboundedReceiver<MasterToFramework>,
    master: MasterHandle,
    buffered_offers: std::collections::VecDeque<Vec<OfferInfo>>,
}

impl SchedulerDriver {
    async fn register(master: &MasterHandle, info: FrameworkInfo) -> SchedulerDriver {
        let (tx, mut rx) = mpsc::unbounded_channel();
        master
            .connect_framework(tx, FrameworkToMaster::Register { info })
            .await;
        match recv(&mut rx).await {
            MasterToFramework::Registered { framework_id, .. } => SchedulerDriver {
                id: framework_id,
                rx,
                master: master.clone(),
                buffered_offers: Default::default(),
            },
            other => panic!("expected Registered, got {:?}", other),
        }
    }

    /// Wait for the next batch of offers, skipping other pushes.
    async fn expect_offers(&mut self) -> Vec<OfferInfo> {
        if let Some(offers) = self.buffered_offers.pop_front() {
            return offers;
        }
        loop {
            if let MasterToFramework::ResourceOffers { offers } = recv(&mut self.rx).await {
                return offers;
            }
        }
    }

    /// Wait for the next status update, buffering offers on the way.
    async fn expect_status(&mut self) -> TaskStatus {
        loop {
            match recv(&mut self.rx).await {
                MasterToFramework::StatusUpdate { status } => return status,
                MasterToFramework::ResourceOffers { offers } => {
                    self.buffered_offers.push_back(offers);
                }
                _ => continue,
            }
        }
    }

    /// Assert that no offer arrives inside the window.
    async fn expect_no_offers(&mut self, window: Duration) {
        assert!(
            self.buffered_offers.is_empty(),
            "offers were already buffered before the window"
        );
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return,
                Ok(Some(MasterToFramework::ResourceOffers { offers })) => {
                    panic!("unexpected offers inside the filter window: {:?}", offers)
                }
                Ok(Some(_)) => continue,
                Ok(None) => panic!("master closed the framework endpoint"),
            }
        }
    }

    async fn accept(&self, offer_ids: Vec<OfferId>, operations: Vec<Operation>) {
        self.master
            .framework_message(
                self.id.clone(),
                FrameworkToMaster::AcceptOffers {
                    offer_ids,
                    operations,
                    filters: None,
                },
            )
            .await;
    }

    async fn decline(&self, offer_ids: Vec<OfferId>, filters: Option<Filters>) {
        self.master
            .framework_message(
                self.id.clone(),
                FrameworkToMaster::DeclineOffers { offer_ids, filters },
            )
            .await;
    }

    async fn reconcile(&self, statuses: Vec<TaskStatus>) {
        self.master
            .framework_message(self.id.clone(), FrameworkToMaster::ReconcileTasks { statuses })
            .await;
    }
}

/// A slave endpoint: registers, runs tasks, reports status.
struct SlaveDriver {
    id: SlaveId,
    rx: mpsc::UnboundedReceiver<MasterToSlave>,
    master: MasterHandle,
}

impl SlaveDriver {
    async fn register(master: &MasterHandle, hostname: &str, total: &str) -> SlaveDriver {
        let (tx, mut rx) = mpsc::unbounded_channel();
        master
            .connect_slave(
                tx,
                SlaveToMaster::Register {
                    info: SlaveInfo::new(hostname, resources(total)),
                    checkpointed_resources: Resources::new(),
                },
            )
            .await;
        match recv(&mut rx).await {
            MasterToSlave::Registered { slave_id } => SlaveDriver {
                id: slave_id,
                rx,
                master: master.clone(),
            },
            other => panic!("expected Registered, got {:?}", other),
        }
    }

    /// Wait for a task launch, answering health checks on the way.
    async fn expect_run_task(&mut self) -> (FrameworkId, TaskInfo) {
        loop {
            match recv(&mut self.rx).await {
                MasterToSlave::RunTask {
                    framework_id, task, ..
                } => return (framework_id, task),
                MasterToSlave::Ping => {
                    self.master
                        .slave_message(self.id.clone(), SlaveToMaster::Pong)
                        .await;
                }
                _ => continue,
            }
        }
    }

    /// Wait for a kill request, answering health checks on the way.
    async fn expect_kill_task(&mut self) -> TaskId {
        loop {
            match recv(&mut self.rx).await {
                MasterToSlave::KillTask { task_id, .. } => return task_id,
                MasterToSlave::Ping => {
                    self.master
                        .slave_message(self.id.clone(), SlaveToMaster::Pong)
                        .await;
                }
                _ => continue,
            }
        }
    }

    async fn expect_acknowledgement(&mut self) -> (TaskId, String) {
        loop {
            match recv(&mut self.rx).await {
                MasterToSlave::StatusUpdateAcknowledgement { task_id, uuid, .. } => {
                    return (task_id, uuid)
                }
                _ => continue,
            }
        }
    }

    async fn report(&self, framework_id: &FrameworkId, task_id: &TaskId, state: TaskState) -> String {
        let mut status = TaskStatus::new(task_id.clone(), state).with_slave(self.id.clone());
        status.source = Some(StatusSource::Slave);
        let uuid = status.uuid.clone();
        self.master
            .slave_message(
                self.id.clone(),
                SlaveToMaster::StatusUpdate {
                    framework_id: framework_id.clone(),
                    status,
                },
            )
            .await;
        uuid
    }
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
}

// S1: a framework launches a task inside an offer; the task runs and
// the residual resources come back in the next offer round.
#[tokio::test(start_paused = true)]
async fn test_task_running() {
    let master = start_master(test_flags());
    let mut slave = SlaveDriver::register(&master, "host1", "cpus:2;mem:1024").await;
    let mut scheduler =
        SchedulerDriver::register(&master, FrameworkInfo::new("s1-framework", "tester")).await;

    let offers = scheduler.expect_offers().await;
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].resources, resources("cpus:2;mem:1024"));
    assert_eq!(offers[0].slave_id, slave.id);

    let task = command_task("s1-task", &slave.id, "cpus:1;mem:512");
    scheduler
        .accept(
            vec![offers[0].offer_id.clone()],
            vec![Operation::Launch { tasks: vec![task] }],
        )
        .await;

    let (framework_id, launched) = slave.expect_run_task().await;
    assert_eq!(framework_id, scheduler.id);
    assert_eq!(launched.task_id, TaskId::new("s1-task"));

    let uuid = slave
        .report(&scheduler.id, &launched.task_id, TaskState::Running)
        .await;
    let status = scheduler.expect_status().await;
    assert_eq!(status.state, TaskState::Running);

    // The acknowledgement rides back to the slave.
    master
        .framework_message(
            scheduler.id.clone(),
            FrameworkToMaster::Acknowledge {
                slave_id: slave.id.clone(),
                task_id: launched.task_id.clone(),
                uuid: uuid.clone(),
            },
        )
        .await;
    let (acked_task, acked_uuid) = slave.expect_acknowledgement().await;
    assert_eq!(acked_task, launched.task_id);
    assert_eq!(acked_uuid, uuid);

    // The next round offers exactly the residual.
    let offers = scheduler.expect_offers().await;
    assert_eq!(offers[0].resources, resources("cpus:1;mem:512"));
}

// S2: a task with no resources is rejected with a master-sourced
// TASK_ERROR and the full offer is recovered.
#[tokio::test(start_paused = true)]
async fn test_invalid_task_rejected() {
    let master = start_master(test_flags());
    let slave = SlaveDriver::register(&master, "host1", "cpus:2;mem:1024").await;
    let mut scheduler =
        SchedulerDriver::register(&master, FrameworkInfo::new("s2-framework", "tester")).await;

    let offers = scheduler.expect_offers().await;
    let mut task = command_task("s2-task", &slave.id, "cpus:1");
    task.resources = Resources::new();

    scheduler
        .accept(
            vec![offers[0].offer_id.clone()],
            vec![Operation::Launch { tasks: vec![task] }],
        )
        .await;

    let status = scheduler.expect_status().await;
    assert_eq!(status.state, TaskState::Error);
    assert_eq!(status.source, Some(StatusSource::Master));
    assert_eq!(status.reason, Some(StatusReason::TaskInvalid));

    // Everything returns: the next offer carries the full slave again.
    let offers = scheduler.expect_offers().await;
    assert_eq!(offers[0].resources, resources("cpus:2;mem:1024"));
}

// S3: declining with a filter suppresses re-offers from that slave
// until the filter expires.
#[tokio::test(start_paused = true)]
async fn test_decline_with_filter() {
    let master = start_master(test_flags());
    let _slave = SlaveDriver::register(&master, "host1", "cpus:2;mem:1024").await;
    let mut scheduler =
        SchedulerDriver::register(&master, FrameworkInfo::new("s3-framework", "tester")).await;

    let offers = scheduler.expect_offers().await;
    let offer_ids: Vec<OfferId> = offers.iter().map(|o| o.offer_id.clone()).collect();
    scheduler
        .decline(offer_ids, Some(Filters::refuse_for(5.0)))
        .await;

    // Four seconds of allocator rounds emit nothing to this framework.
    scheduler.expect_no_offers(Duration::from_secs(4)).await;

    // Past expiry the resources flow again.
    let offers = scheduler.expect_offers().await;
    assert_eq!(offers[0].resources, resources("cpus:2;mem:1024"));
}

// S4: a slave that stays silent past the health-check deadline is
// removed; its tasks go lost and its resources stop being offered.
#[tokio::test(start_paused = true)]
async fn test_slave_loss() {
    let mut flags = test_flags();
    flags.slave_ping_timeout = 0.2;
    flags.max_slave_ping_timeouts = 2;
    let master = start_master(flags);

    let mut slave = SlaveDriver::register(&master, "host1", "cpus:2;mem:1024").await;
    let mut scheduler =
        SchedulerDriver::register(&master, FrameworkInfo::new("s4-framework", "tester")).await;

    let offers = scheduler.expect_offers().await;
    let task = command_task("s4-task", &slave.id, "cpus:2;mem:1024");
    scheduler
        .accept(
            vec![offers[0].offer_id.clone()],
            vec![Operation::Launch { tasks: vec![task] }],
        )
        .await;
    let (_, launched) = slave.expect_run_task().await;
    slave
        .report(&scheduler.id, &launched.task_id, TaskState::Running)
        .await;
    assert_eq!(scheduler.expect_status().await.state, TaskState::Running);

    // The slave drops off the network and never answers a ping again.
    master.slave_disconnected(slave.id.clone()).await;

    let status = scheduler.expect_status().await;
    assert_eq!(status.state, TaskState::Lost);
    assert_eq!(status.source, Some(StatusSource::Master));
    assert_eq!(status.reason, Some(StatusReason::SlaveRemoved));

    // With the slave gone the allocator has nothing left to offer.
    scheduler.expect_no_offers(Duration::from_secs(2)).await;
}

// S5: failover within the timeout keeps tasks and resumes offers;
// missing the timeout removes the framework and loses its tasks.
#[tokio::test(start_paused = true)]
async fn test_framework_failover() {
    let master = start_master(test_flags());
    let mut slave = SlaveDriver::register(&master, "host1", "cpus:2;mem:1024").await;
    let info = FrameworkInfo::new("s5-framework", "tester").with_failover_timeout(5.0);
    let mut scheduler = SchedulerDriver::register(&master, info.clone()).await;

    let offers = scheduler.expect_offers().await;
    let task = command_task("s5-task", &slave.id, "cpus:1;mem:512");
    scheduler
        .accept(
            vec![offers[0].offer_id.clone()],
            vec![Operation::Launch { tasks: vec![task] }],
        )
        .await;
    let (_, launched) = slave.expect_run_task().await;
    slave
        .report(&scheduler.id, &launched.task_id, TaskState::Running)
        .await;
    assert_eq!(scheduler.expect_status().await.state, TaskState::Running);

    // The scheduler's connection drops, then a new instance fails over
    // well within the window.
    master.framework_disconnected(scheduler.id.clone()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    master
        .connect_framework(
            tx,
            FrameworkToMaster::Reregister {
                framework_id: scheduler.id.clone(),
                info: info.clone(),
                failover: true,
            },
        )
        .await;
    match recv(&mut rx).await {
        MasterToFramework::Reregistered { framework_id, .. } => {
            assert_eq!(framework_id, scheduler.id);
        }
        other => panic!("expected Reregistered, got {:?}", other),
    }
    let mut failed_over = SchedulerDriver {
        id: scheduler.id.clone(),
        rx,
        master: master.clone(),
        buffered_offers: Default::default(),
    };

    // The running task survived the failover.
    failed_over.reconcile(Vec::new()).await;
    let answer = failed_over.expect_status().await;
    assert_eq!(answer.task_id, TaskId::new("s5-task"));
    assert_eq!(answer.state, TaskState::Running);

    // Offers resume for the residual resources.
    let offers = failed_over.expect_offers().await;
    assert_eq!(offers[0].resources, resources("cpus:1;mem:512"));

    // Now the failed-over instance disappears for good and the window
    // closes: the framework is removed and its task is killed off.
    master.framework_disconnected(failed_over.id.clone()).await;
    let killed = slave.expect_kill_task().await;
    assert_eq!(killed, TaskId::new("s5-task"));
}

// S6: reconciling a task the master never saw, without a slave id,
// answers TASK_LOST from the master with no slave id attached.
#[tokio::test(start_paused = true)]
async fn test_reconcile_unknown_task() {
    let master = start_master(test_flags());
    let mut scheduler =
        SchedulerDriver::register(&master, FrameworkInfo::new("s6-framework", "tester")).await;

    let request = TaskStatus::new(TaskId::new("never-launched"), TaskState::Running);
    scheduler.reconcile(vec![request]).await;

    let answer = scheduler.expect_status().await;
    assert_eq!(answer.task_id, TaskId::new("never-launched"));
    assert_eq!(answer.state, TaskState::Lost);
    assert_eq!(answer.source, Some(StatusSource::Master));
    assert_eq!(answer.reason, Some(StatusReason::Reconciliation));
    assert!(answer.slave_id.is_none());
}

// Replaying a reconciliation request yields the same answers.
#[tokio::test(start_paused = true)]
async fn test_reconciliation_is_idempotent() {
    let master = start_master(test_flags());
    let mut slave = SlaveDriver::register(&master, "host1", "cpus:2;mem:1024").await;
    let mut scheduler =
        SchedulerDriver::register(&master, FrameworkInfo::new("reconciler", "tester")).await;

    let offers = scheduler.expect_offers().await;
    let task = command_task("known-task", &slave.id, "cpus:1;mem:512");
    scheduler
        .accept(
            vec![offers[0].offer_id.clone()],
            vec![Operation::Launch { tasks: vec![task] }],
        )
        .await;
    let (_, launched) = slave.expect_run_task().await;
    slave
        .report(&scheduler.id, &launched.task_id, TaskState::Running)
        .await;
    assert_eq!(scheduler.expect_status().await.state, TaskState::Running);

    let request = vec![
        TaskStatus::new(TaskId::new("known-task"), TaskState::Running),
        TaskStatus::new(TaskId::new("ghost-task"), TaskState::Running),
    ];

    let mut rounds = Vec::new();
    for _ in 0..2 {
        scheduler.reconcile(request.clone()).await;
        let mut answers = Vec::new();
        for _ in 0..request.len() {
            let status = scheduler.expect_status().await;
            answers.push((status.task_id.clone(), status.state, status.reason));
        }
        answers.sort();
        rounds.push(answers);
    }
    assert_eq!(rounds[0], rounds[1]);
    assert!(rounds[0]
        .iter()
        .any(|(id, state, _)| *id == TaskId::new("known-task") && *state == TaskState::Running));
    assert!(rounds[0]
        .iter()
        .any(|(id, state, _)| *id == TaskId::new("ghost-task") && *state == TaskState::Lost));
}

// A reservation made on accepted offers feeds a launch in the same
// accept, and the volume survives on the slave's checkpointed set.
#[tokio::test(start_paused = true)]
async fn test_reserve_and_launch_in_one_accept() {
    let master = start_master(test_flags());
    let slave = SlaveDriver::register(&master, "host1", "cpus:4;mem:4096").await;
    let info = FrameworkInfo::new("reserver", "tester")
        .with_role("data")
        .with_principal("ops");
    let mut scheduler = SchedulerDriver::register(&master, info).await;

    let offers = scheduler.expect_offers().await;
    assert_eq!(offers[0].resources, resources("cpus:4;mem:4096"));

    let reserved: Vec<_> = resources("cpus(data):1;mem(data):512")
        .iter()
        .cloned()
        .map(|r| r.with_reservation("ops"))
        .collect();
    let mut task = command_task("reserved-task", &slave.id, "cpus:1");
    task.resources = reserved.iter().cloned().collect();

    scheduler
        .accept(
            vec![offers[0].offer_id.clone()],
            vec![
                Operation::Reserve {
                    resources: reserved,
                },
                Operation::Launch { tasks: vec![task] },
            ],
        )
        .await;

    // The reservation fed the launch, so the next round offers only
    // the unreserved remainder.
    let offers = scheduler.expect_offers().await;
    assert_eq!(offers[0].resources, resources("cpus:3;mem:3584"));
}

// Declined resources return through the allocator and are re-offered
// promptly when no filter is attached.
#[tokio::test(start_paused = true)]
async fn test_decline_without_filter_reoffers() {
    let master = start_master(test_flags());
    let _slave = SlaveDriver::register(&master, "host1", "cpus:1;mem:512").await;
    let mut scheduler =
        SchedulerDriver::register(&master, FrameworkInfo::new("decliner", "tester")).await;

    let offers = scheduler.expect_offers().await;
    scheduler
        .decline(vec![offers[0].offer_id.clone()], None)
        .await;

    let offers = scheduler.expect_offers().await;
    assert_eq!(offers[0].resources, resources("cpus:1;mem:512"));
}
