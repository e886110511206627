// Weighted dominant-resource-fairness allocation
//
// Each framework's dominant share is its largest per-resource-kind
// share of the cluster, divided by its role weight. Offer rounds walk
// frameworks in ascending dominant share (ties broken by registration
// order) and slaves in insertion order, granting each framework the
// slave's currently free resources that pass the whitelist, active
// decline filters and role compatibility.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use armada_resources::{Resources, Scalar, DEFAULT_ROLE};
use armada_types::{Filters, FrameworkId, FrameworkInfo, MasterFlags, SlaveId, SlaveInfo};

use crate::error::AllocationError;
use crate::traits::{Allocation, Allocator};

// Grants smaller than this are withheld to avoid dribble offers.
const MIN_OFFER_CPUS: Scalar = Scalar::from_millis(10);
const MIN_OFFER_MEM: Scalar = Scalar::from_millis(32 * 1000);

struct FrameworkEntry {
    info: FrameworkInfo,
    active: bool,
    /// Registration order, the DRF tie breaker
    sequence: u64,
}

struct SlaveEntry {
    info: SlaveInfo,
    /// Everything the slave advertises
    total: Resources,
    /// Offered or task-held resources, by framework
    allocated: HashMap<FrameworkId, Resources>,
}

impl SlaveEntry {
    fn free(&self) -> Resources {
        let mut free = self.total.clone();
        for held in self.allocated.values() {
            // The ledger only ever allocates out of `free`, so this
            // subtraction cannot fail while the invariants hold.
            free = free.saturating_subtract(held);
        }
        free
    }
}

struct DeclineFilter {
    slave_id: SlaveId,
    resources: Resources,
    expiry: Instant,
}

/// The default allocation policy: weighted DRF across roles.
pub struct DrfAllocator {
    flags: MasterFlags,
    master: Option<mpsc::UnboundedSender<Allocation>>,
    frameworks: HashMap<FrameworkId, FrameworkEntry>,
    slaves: HashMap<SlaveId, SlaveEntry>,
    /// Stable offer-walk order for slaves
    slave_order: Vec<SlaveId>,
    filters: HashMap<FrameworkId, Vec<DeclineFilter>>,
    whitelist: Option<HashSet<String>>,
    sequence: u64,
}

impl DrfAllocator {
    pub fn new() -> Self {
        DrfAllocator {
            flags: MasterFlags::default(),
            master: None,
            frameworks: HashMap::new(),
            slaves: HashMap::new(),
            slave_order: Vec::new(),
            filters: HashMap::new(),
            whitelist: None,
            sequence: 0,
        }
    }

    /// Cluster-wide total per scalar resource name, reservation-blind.
    fn cluster_totals(&self) -> HashMap<String, Scalar> {
        let mut totals: HashMap<String, Scalar> = HashMap::new();
        for slave in self.slaves.values() {
            let flat = slave.total.flatten(None);
            for name in flat.scalar_names() {
                let entry = totals.entry(name.clone()).or_insert(Scalar::ZERO);
                *entry = *entry + flat.scalar_quantity(&name);
            }
        }
        totals
    }

    /// A framework's dominant share: max over scalar kinds of its
    /// cluster share, divided by its role weight.
    fn dominant_share(&self, id: &FrameworkId, totals: &HashMap<String, Scalar>) -> f64 {
        let entry = match self.frameworks.get(id) {
            Some(entry) => entry,
            None => return 0.0,
        };

        let mut held = Resources::new();
        for slave in self.slaves.values() {
            if let Some(resources) = slave.allocated.get(id) {
                held += resources;
            }
        }
        let held = held.flatten(None);

        let mut share: f64 = 0.0;
        for (name, total) in totals {
            if total.is_zero() {
                continue;
            }
            let mine = held.scalar_quantity(name);
            share = share.max(mine.millis() as f64 / total.millis() as f64);
        }
        share / self.flags.roles.weight(&entry.info.role)
    }

    /// Frameworks eligible this round, in ascending dominant share.
    fn sorted_frameworks(&self) -> Vec<FrameworkId> {
        let totals = self.cluster_totals();
        let mut eligible: Vec<(f64, u64, FrameworkId)> = self
            .frameworks
            .iter()
            .filter(|(_, entry)| entry.active)
            .map(|(id, entry)| (self.dominant_share(id, &totals), entry.sequence, id.clone()))
            .collect();
        eligible.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.cmp(&b.1)));
        eligible.into_iter().map(|(_, _, id)| id).collect()
    }

    /// The part of `free` this framework may be offered: whitelist,
    /// active decline filters, role and reservation compatibility.
    fn offerable(&self, framework_id: &FrameworkId, slave_id: &SlaveId, free: &Resources) -> Resources {
        let slave = &self.slaves[slave_id];
        if let Some(whitelist) = &self.whitelist {
            if !whitelist.contains(&slave.info.hostname) {
                return Resources::new();
            }
        }
        let role = &self.frameworks[framework_id].info.role;

        // Reserved-for-role resources go only to that role's
        // frameworks; unreserved resources go to anyone.
        let mut offerable = free.filter(|r| r.role == DEFAULT_ROLE || r.role == *role);

        if let Some(filters) = self.filters.get(framework_id) {
            let now = Instant::now();
            for filter in filters {
                if filter.slave_id == *slave_id && filter.expiry > now {
                    offerable = offerable.saturating_subtract(&filter.resources);
                }
            }
        }
        offerable
    }

    /// Whether a grant is worth offering at all.
    fn allocatable(resources: &Resources) -> bool {
        resources.scalar_quantity("cpus") >= MIN_OFFER_CPUS
            || resources.scalar_quantity("mem") >= MIN_OFFER_MEM
    }

    fn recover(
        &mut self,
        framework_id: &FrameworkId,
        slave_id: &SlaveId,
        resources: &Resources,
    ) -> Result<(), AllocationError> {
        let slave = self
            .slaves
            .get_mut(slave_id)
            .ok_or_else(|| AllocationError::UnknownSlave(slave_id.clone()))?;
        let held = slave
            .allocated
            .get_mut(framework_id)
            .ok_or_else(|| AllocationError::UnknownFramework(framework_id.clone()))?;
        *held = held.saturating_subtract(resources);
        if held.is_empty() {
            slave.allocated.remove(framework_id);
        }
        Ok(())
    }

    fn drop_expired_filters(&mut self) {
        let now = Instant::now();
        for filters in self.filters.values_mut() {
            filters.retain(|filter| filter.expiry > now);
        }
        self.filters.retain(|_, filters| !filters.is_empty());
    }
}

impl Default for DrfAllocator {
    fn default() -> Self {
        DrfAllocator::new()
    }
}

#[async_trait]
impl Allocator for DrfAllocator {
    async fn initialize(&mut self, flags: MasterFlags, master: mpsc::UnboundedSender<Allocation>) {
        info!(allocation_interval = flags.allocation_interval, "initializing DRF allocator");
        self.flags = flags;
        self.master = Some(master);
    }

    async fn framework_added(&mut self, id: FrameworkId, info: FrameworkInfo, used: Resources) {
        debug!(framework_id = %id, role = %info.role, used = %used, "framework added");
        self.sequence += 1;
        self.frameworks.insert(
            id,
            FrameworkEntry {
                info,
                active: true,
                sequence: self.sequence,
            },
        );
    }

    async fn framework_removed(&mut self, id: FrameworkId) {
        debug!(framework_id = %id, "framework removed");
        self.frameworks.remove(&id);
        self.filters.remove(&id);
        // Anything still attributed to the framework returns to the
        // free pools; the master has already marked its offers and
        // tasks terminal.
        for slave in self.slaves.values_mut() {
            slave.allocated.remove(&id);
        }
    }

    async fn framework_activated(&mut self, id: FrameworkId, info: FrameworkInfo) {
        match self.frameworks.get_mut(&id) {
            Some(entry) => {
                entry.info = info;
                entry.active = true;
            }
            None => warn!(framework_id = %id, "activated framework is unknown"),
        }
    }

    async fn framework_deactivated(&mut self, id: FrameworkId) {
        match self.frameworks.get_mut(&id) {
            Some(entry) => entry.active = false,
            None => warn!(framework_id = %id, "deactivated framework is unknown"),
        }
        // A deactivated framework keeps no filters; it starts from a
        // clean slate on reactivation.
        self.filters.remove(&id);
    }

    async fn slave_added(
        &mut self,
        id: SlaveId,
        info: SlaveInfo,
        used: HashMap<FrameworkId, Resources>,
    ) {
        debug!(slave_id = %id, hostname = %info.hostname, total = %info.resources, "slave added");
        let total = info.resources.clone();
        let entry = SlaveEntry {
            info,
            total,
            allocated: used,
        };
        // A returning slave keeps its place in the walk order.
        if self.slaves.insert(id.clone(), entry).is_none() {
            self.slave_order.push(id);
        }
    }

    async fn slave_removed(&mut self, id: SlaveId) {
        debug!(slave_id = %id, "slave removed");
        self.slaves.remove(&id);
        self.slave_order.retain(|slave_id| *slave_id != id);
        for filters in self.filters.values_mut() {
            filters.retain(|filter| filter.slave_id != id);
        }
    }

    async fn update_whitelist(&mut self, whitelist: Option<Vec<String>>) {
        match &whitelist {
            Some(hostnames) => info!(count = hostnames.len(), "updated slave whitelist"),
            None => info!("cleared slave whitelist"),
        }
        self.whitelist = whitelist.map(|hostnames| hostnames.into_iter().collect());
    }

    async fn resources_requested(&mut self, id: FrameworkId, requests: Vec<Resources>) {
        // The default policy does not honor specific requests; demand
        // is met through the regular offer cycle.
        debug!(framework_id = %id, requests = requests.len(), "ignoring resource requests");
    }

    async fn resources_unused(
        &mut self,
        framework_id: FrameworkId,
        slave_id: SlaveId,
        resources: Resources,
        filters: Option<Filters>,
    ) {
        if resources.is_empty() {
            return;
        }
        if let Err(error) = self.recover(&framework_id, &slave_id, &resources) {
            warn!(%error, "dropping unused-resources event");
            return;
        }

        let refuse_seconds = filters.map(|f| f.refuse_seconds).unwrap_or(0.0);
        if refuse_seconds > 0.0 {
            self.filters.entry(framework_id).or_default().push(DeclineFilter {
                slave_id,
                resources,
                expiry: Instant::now() + Duration::from_secs_f64(refuse_seconds),
            });
        }
    }

    async fn resources_recovered(
        &mut self,
        framework_id: FrameworkId,
        slave_id: SlaveId,
        resources: Resources,
    ) {
        if resources.is_empty() {
            return;
        }
        if let Err(error) = self.recover(&framework_id, &slave_id, &resources) {
            warn!(%error, "dropping recovered-resources event");
        }
    }

    async fn offers_revived(&mut self, framework_id: FrameworkId) {
        debug!(framework_id = %framework_id, "reviving offers");
        self.filters.remove(&framework_id);
    }

    async fn allocate(&mut self) {
        self.drop_expired_filters();

        let Some(master) = self.master.clone() else {
            return;
        };

        for framework_id in self.sorted_frameworks() {
            let mut grants: Vec<(SlaveId, Resources)> = Vec::new();

            for slave_id in self.slave_order.clone() {
                let free = self.slaves[&slave_id].free();
                if free.is_empty() {
                    continue;
                }
                let offerable = self.offerable(&framework_id, &slave_id, &free);
                if !Self::allocatable(&offerable) {
                    continue;
                }

                // Subtracted from the free pool immediately; restoration
                // happens only through unused/recovered events.
                let slave = self.slaves.get_mut(&slave_id).expect("slave in walk order");
                let held = slave.allocated.entry(framework_id.clone()).or_default();
                *held += &offerable;
                grants.push((slave_id, offerable));
            }

            if !grants.is_empty() {
                debug!(framework_id = %framework_id, slaves = grants.len(), "allocating");
                if master
                    .send(Allocation {
                        framework_id: framework_id.clone(),
                        resources: grants,
                    })
                    .is_err()
                {
                    warn!("master channel closed, stopping offer round");
                    return;
                }
            }
        }
    }
}
