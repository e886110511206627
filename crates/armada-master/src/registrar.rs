// Registrar boundary
//
// The persistent registrar lives outside the core; the master only
// consumes admit/readmit futures. The in-memory implementation backs
// tests and single-master deployments without durable state.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::Mutex;

use armada_types::SlaveId;

/// Admission record for slaves.
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Record a newly registering slave. False when the slave is
    /// already admitted.
    async fn admit(&self, slave_id: &SlaveId) -> bool;

    /// Check a re-registering slave against the admitted set.
    async fn readmit(&self, slave_id: &SlaveId) -> bool;
}

/// Non-durable registrar keeping the admitted set in memory.
#[derive(Default)]
pub struct InMemoryRegistrar {
    admitted: Mutex<HashSet<SlaveId>>,
}

impl InMemoryRegistrar {
    pub fn new() -> Self {
        InMemoryRegistrar::default()
    }
}

#[async_trait]
impl Registrar for InMemoryRegistrar {
    async fn admit(&self, slave_id: &SlaveId) -> bool {
        self.admitted.lock().await.insert(slave_id.clone())
    }

    async fn readmit(&self, slave_id: &SlaveId) -> bool {
        self.admitted.lock().await.contains(slave_id)
    }
}
