// Asynchronous dispatch onto an allocator
//
// The handle is the allocator's address: a clonable sender onto the
// allocator's mailbox. A spawned loop drains the mailbox one event at a
// time, so allocator state never needs a lock, and runs an offer round
// on every allocation-interval tick.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, warn};

use armada_resources::Resources;
use armada_types::{Filters, FrameworkId, FrameworkInfo, MasterFlags, SlaveId, SlaveInfo};

use crate::traits::{Allocation, Allocator};

/// One mailbox event per trait operation.
#[derive(Debug)]
pub enum AllocatorEvent {
    Initialize {
        flags: MasterFlags,
        master: mpsc::UnboundedSender<Allocation>,
    },
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
    UpdateWhitelist {
        whitelist: Option<Vec<String>>,
    },
    ResourcesRequested {
        id: FrameworkId,
        requests: Vec<Resources>,
    },
    ResourcesUnused {
        framework_id: FrameworkId,
        slave_id: SlaveId,
        resources: Resources,
        filters: Option<Filters>,
    },
    ResourcesRecovered {
        framework_id: FrameworkId,
        slave_id: SlaveId,
        resources: Resources,
    },
    OffersRevived {
        framework_id: FrameworkId,
    },
}

/// Clonable address of a running allocator.
#[derive(Clone)]
pub struct AllocatorHandle {
    tx: mpsc::UnboundedSender<AllocatorEvent>,
}

impl AllocatorHandle {
    /// Spawn the dispatch loop around an allocator implementation.
    pub fn spawn<A: Allocator>(allocator: A) -> AllocatorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(allocator, rx));
        AllocatorHandle { tx }
    }

    fn send(&self, event: AllocatorEvent) {
        // Fire and forget: a torn-down allocator means the master is
        // going away with it.
        if self.tx.send(event).is_err() {
            warn!("allocator mailbox is closed, dropping event");
        }
    }

    pub fn initialize(&self, flags: MasterFlags, master: mpsc::UnboundedSender<Allocation>) {
        self.send(AllocatorEvent::Initialize { flags, master });
    }

    pub fn framework_added(&self, id: FrameworkId, info: FrameworkInfo, used: Resources) {
        self.send(AllocatorEvent::FrameworkAdded { id, info, used });
    }

    pub fn framework_removed(&self, id: FrameworkId) {
        self.send(AllocatorEvent::FrameworkRemoved { id });
    }

    pub fn framework_activated(&self, id: FrameworkId, info: FrameworkInfo) {
        self.send(AllocatorEvent::FrameworkActivated { id, info });
    }

    pub fn framework_deactivated(&self, id: FrameworkId) {
        self.send(AllocatorEvent::FrameworkDeactivated { id });
    }

    pub fn slave_added(&self, id: SlaveId, info: SlaveInfo, used: HashMap<FrameworkId, Resources>) {
        self.send(AllocatorEvent::SlaveAdded { id, info, used });
    }

    pub fn slave_removed(&self, id: SlaveId) {
        self.send(AllocatorEvent::SlaveRemoved { id });
    }

    pub fn update_whitelist(&self, whitelist: Option<Vec<String>>) {
        self.send(AllocatorEvent::UpdateWhitelist { whitelist });
    }

    pub fn resources_requested(&self, id: FrameworkId, requests: Vec<Resources>) {
        self.send(AllocatorEvent::ResourcesRequested { id, requests });
    }

    pub fn resources_unused(
        &self,
        framework_id: FrameworkId,
        slave_id: SlaveId,
        resources: Resources,
        filters: Option<Filters>,
    ) {
        self.send(AllocatorEvent::ResourcesUnused {
            framework_id,
            slave_id,
            resources,
            filters,
        });
    }

    pub fn resources_recovered(
        &self,
        framework_id: FrameworkId,
        slave_id: SlaveId,
        resources: Resources,
    ) {
        self.send(AllocatorEvent::ResourcesRecovered {
            framework_id,
            slave_id,
            resources,
        });
    }

    pub fn offers_revived(&self, framework_id: FrameworkId) {
        self.send(AllocatorEvent::OffersRevived { framework_id });
    }
}

async fn dispatch_loop<A: Allocator>(
    mut allocator: A,
    mut rx: mpsc::UnboundedReceiver<AllocatorEvent>,
) {
    // The offer-round timer starts once initialize() delivers the flags.
    let mut timer: Option<tokio::time::Interval> = None;

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    debug!("allocator mailbox closed, stopping dispatch loop");
                    break;
                };
                if let AllocatorEvent::Initialize { flags, master } = event {
                    let period = Duration::from_secs_f64(flags.allocation_interval.max(0.001));
                    allocator.initialize(flags, master).await;
                    let mut interval = tokio::time::interval(period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    timer = Some(interval);
                } else {
                    dispatch(&mut allocator, event).await;
                }
            }
            _ = tick(&mut timer), if timer.is_some() => {
                allocator.allocate().await;
            }
        }
    }
}

async fn tick(timer: &mut Option<tokio::time::Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        // Guarded out by the select arm; never polled.
        None => std::future::pending::<()>().await,
    }
}

async fn dispatch<A: Allocator>(allocator: &mut A, event: AllocatorEvent) {
    match event {
        AllocatorEvent::Initialize { .. } => unreachable!("handled by the dispatch loop"),
        AllocatorEvent::FrameworkAdded { id, info, used } => {
            allocator.framework_added(id, info, used).await
        }
        AllocatorEvent::FrameworkRemoved { id } => allocator.framework_removed(id).await,
        AllocatorEvent::FrameworkActivated { id, info } => {
            allocator.framework_activated(id, info).await
        }
        AllocatorEvent::FrameworkDeactivated { id } => allocator.framework_deactivated(id).await,
        AllocatorEvent::SlaveAdded { id, info, used } => allocator.slave_added(id, info, used).await,
        AllocatorEvent::SlaveRemoved { id } => allocator.slave_removed(id).await,
        AllocatorEvent::UpdateWhitelist { whitelist } => allocator.update_whitelist(whitelist).await,
        AllocatorEvent::ResourcesRequested { id, requests } => {
            allocator.resources_requested(id, requests).await
        }
        AllocatorEvent::ResourcesUnused {
            framework_id,
            slave_id,
            resources,
            filters,
        } => {
            allocator
                .resources_unused(framework_id, slave_id, resources, filters)
                .await
        }
        AllocatorEvent::ResourcesRecovered {
            framework_id,
            slave_id,
            resources,
        } => {
            allocator
                .resources_recovered(framework_id, slave_id, resources)
                .await
        }
        AllocatorEvent::OffersRevived { framework_id } => {
            allocator.offers_revived(framework_id).await
        }
    }
}
