// The allocator capability trait
//
// Every operation is fire-and-forget from the master's perspective: the
// master dispatches and continues, and the allocator answers only by
// emitting Allocation batches on the channel handed to initialize().

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use armada_resources::Resources;
use armada_types::{Filters, FrameworkId, FrameworkInfo, MasterFlags, SlaveId, SlaveInfo};

/// One round's grant for a single framework: resources per slave. The
/// master turns each entry into an offer.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub framework_id: FrameworkId,
    pub resources: Vec<(SlaveId, Resources)>,
}

/// The capability set every allocation policy implements. The default
/// weighted-DRF policy is one implementation; others substitute freely.
#[async_trait]
pub trait Allocator: Send + 'static {
    /// Receive flags and the channel allocations are emitted on. Called
    /// exactly once, before any other operation.
    async fn initialize(&mut self, flags: MasterFlags, master: mpsc::UnboundedSender<Allocation>);

    async fn framework_added(&mut self, id: FrameworkId, info: FrameworkInfo, used: Resources);

    async fn framework_removed(&mut self, id: FrameworkId);

    async fn framework_activated(&mut self, id: FrameworkId, info: FrameworkInfo);

    async fn framework_deactivated(&mut self, id: FrameworkId);

    /// `used` carries the resources already held per framework on the
    /// slave, so a failed-over master can rebuild the ledger.
    async fn slave_added(
        &mut self,
        id: SlaveId,
        info: SlaveInfo,
        used: HashMap<FrameworkId, Resources>,
    );

    async fn slave_removed(&mut self, id: SlaveId);

    /// Restrict offers to slaves whose hostname is whitelisted; `None`
    /// lifts the restriction.
    async fn update_whitelist(&mut self, whitelist: Option<Vec<String>>);

    async fn resources_requested(&mut self, id: FrameworkId, requests: Vec<Resources>);

    /// Offered resources went unused (declined or left over from an
    /// accept); an optional filter suppresses re-offering.
    async fn resources_unused(
        &mut self,
        framework_id: FrameworkId,
        slave_id: SlaveId,
        resources: Resources,
        filters: Option<Filters>,
    );

    /// Resources came back from a terminal task or a rescinded offer.
    async fn resources_recovered(
        &mut self,
        framework_id: FrameworkId,
        slave_id: SlaveId,
        resources: Resources,
    );

    /// Clear all filters for the framework so everything is offerable
    /// again.
    async fn offers_revived(&mut self, framework_id: FrameworkId);

    /// Run one offer round. Driven by the dispatch loop on the
    /// allocation interval.
    async fn allocate(&mut self);
}
