use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::types::{MachineId, RunnerAddress};

/// A registered cluster runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerRecord {
    pub address: RunnerAddress,
    /// Opaque runner metadata (zone, version, weight...). The registry
    /// stores it verbatim; nothing in the coordination core interprets it.
    pub metadata: serde_json::Value,
    pub healthy: bool,
}

impl RunnerRecord {
    pub fn new(address: RunnerAddress) -> Self {
        Self {
            address,
            metadata: serde_json::Value::Null,
            healthy: true,
        }
    }
}

/// Directory of live runners. Registration doubles as the heartbeat: an
/// upsert refreshes the row's timestamp, and rows outside the expiration
/// window are treated as absent rather than unhealthy.
#[async_trait]
pub trait RunnerRegistry: Send + Sync {
    /// Register (or re-register) a runner. Returns the stable numeric
    /// machine ID assigned to this address, used for snowflake generation.
    async fn register(&self, runner: &RunnerRecord) -> Result<MachineId, ClusterError>;

    /// Mark a runner healthy or unhealthy without touching its heartbeat.
    async fn set_health(&self, address: &RunnerAddress, healthy: bool) -> Result<(), ClusterError>;

    /// List runners whose heartbeat falls within the expiration window.
    async fn list_active(&self) -> Result<Vec<RunnerRecord>, ClusterError>;

    /// Remove a runner. Expired rows left behind by crashed runners are
    /// garbage collected lazily on this call.
    async fn unregister(&self, address: &RunnerAddress) -> Result<(), ClusterError>;
}
