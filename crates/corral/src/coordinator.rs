use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::lease::LeaseStorage;
use crate::metrics::ClusterMetrics;
use crate::registry::{RunnerRecord, RunnerRegistry};
use crate::types::{RunnerAddress, ShardId};

/// Shard Lease Coordinator: tracks which shards this runner owns, keeps the
/// leases alive, and maintains a soft routing cache of other runners'
/// ownership.
///
/// Losing a lease only loses messages in flight to this runner; persisted
/// messages are re-delivered via storage replay, so surrendering on doubt is
/// always safe and split-brain never is.
pub struct ShardLeaseCoordinator {
    config: Arc<ClusterConfig>,
    storage: Arc<dyn LeaseStorage>,
    /// Runner directory, when the deployment has one. Re-registered on every
    /// heartbeat (registration doubles as the directory heartbeat).
    registry: Option<Arc<dyn RunnerRegistry>>,
    metrics: Arc<ClusterMetrics>,
    owned: RwLock<HashSet<ShardId>>,
    /// Soft routing cache: shard -> last known owner. Reconciled from the
    /// strategy's `owners()` on every heartbeat; staleness is tolerated
    /// because dispatch falls back to storage replay.
    assignments: RwLock<HashMap<ShardId, RunnerAddress>>,
    cancel: CancellationToken,
    background_tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ShardLeaseCoordinator {
    pub fn new(
        config: Arc<ClusterConfig>,
        storage: Arc<dyn LeaseStorage>,
        registry: Option<Arc<dyn RunnerRegistry>>,
        metrics: Arc<ClusterMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            storage,
            registry,
            metrics,
            owned: RwLock::new(HashSet::new()),
            assignments: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            background_tasks: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Start the lease heartbeat loop.
    pub async fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.heartbeat_loop().await;
        });
        self.background_tasks.lock().await.push(handle);
    }

    /// Try to take leases on `candidates`. Returns the shards actually
    /// acquired. A storage failure is observed as nothing being acquired;
    /// the caller retries on its own schedule.
    pub async fn acquire(&self, candidates: &[ShardId]) -> Vec<ShardId> {
        let acquired = match self
            .storage
            .acquire(&self.config.runner_address, candidates)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                tracing::warn!(error = %e, "shard lease acquisition failed");
                return Vec::new();
            }
        };

        {
            let mut owned = self.owned.write().await;
            owned.extend(acquired.iter().cloned());
            self.metrics.shards.set(owned.len() as i64);
        }
        {
            let mut assignments = self.assignments.write().await;
            for shard in &acquired {
                assignments.insert(shard.clone(), self.config.runner_address.clone());
            }
        }
        tracing::info!(
            acquired = acquired.len(),
            candidates = candidates.len(),
            "acquired shard leases"
        );
        acquired
    }

    /// Release one shard explicitly. Idempotent; storage errors are logged
    /// and ignored (the lease will expire on its own).
    pub async fn release(&self, shard: &ShardId) {
        {
            let mut owned = self.owned.write().await;
            owned.remove(shard);
            self.metrics.shards.set(owned.len() as i64);
        }
        self.assignments.write().await.remove(shard);
        if let Err(e) = self
            .storage
            .release(&self.config.runner_address, shard)
            .await
        {
            tracing::warn!(shard_id = %shard, error = %e, "failed to release shard lease");
        }
    }

    /// Release every lease this runner holds. Used on graceful shutdown.
    pub async fn release_all(&self) {
        {
            let mut owned = self.owned.write().await;
            owned.clear();
            self.metrics.shards.set(0);
        }
        if let Err(e) = self.storage.release_all(&self.config.runner_address).await {
            tracing::warn!(error = %e, "failed to release shard leases");
        }
    }

    pub async fn is_owned(&self, shard: &ShardId) -> bool {
        self.owned.read().await.contains(shard)
    }

    pub async fn owned_shards(&self) -> HashSet<ShardId> {
        self.owned.read().await.clone()
    }

    /// Last known owner of a shard, from the routing cache. `None` means the
    /// owner is unknown; callers fall back to storage replay.
    pub async fn owner_of(&self, shard: &ShardId) -> Option<RunnerAddress> {
        self.assignments.read().await.get(shard).cloned()
    }

    /// Drop every cache entry pointing at `address`. Called when a runner
    /// turns out to be unavailable so subsequent dispatches stop routing to
    /// it until the next heartbeat reconciliation.
    pub async fn invalidate_address(&self, address: &RunnerAddress) {
        let mut assignments = self.assignments.write().await;
        let before = assignments.len();
        assignments.retain(|_, owner| owner != address);
        if assignments.len() != before {
            tracing::debug!(address = %address, "invalidated routing cache entries");
        }
    }

    /// Stop background loops and release all leases.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut tasks = self.background_tasks.lock().await;
        for handle in tasks.drain(..) {
            let _ = handle.await;
        }
        self.release_all().await;
    }

    async fn heartbeat_loop(&self) {
        let max_failures = self.config.lease_refresh_max_failures;
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {},
            }

            let owned: Vec<ShardId> = self.owned.read().await.iter().cloned().collect();
            if !owned.is_empty() {
                match self
                    .storage
                    .refresh(&self.config.runner_address, &owned)
                    .await
                {
                    Ok(still_owned) => {
                        consecutive_failures = 0;
                        let still: HashSet<ShardId> = still_owned.into_iter().collect();
                        let lost: Vec<ShardId> = owned
                            .iter()
                            .filter(|s| !still.contains(s))
                            .cloned()
                            .collect();
                        if !lost.is_empty() {
                            let mut owned_set = self.owned.write().await;
                            for shard in &lost {
                                tracing::warn!(shard_id = %shard, "shard lease lost during refresh");
                                owned_set.remove(shard);
                            }
                            self.metrics.shards.set(owned_set.len() as i64);
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        tracing::warn!(
                            error = %e,
                            consecutive_failures,
                            max_failures,
                            "lease refresh failed"
                        );
                        if consecutive_failures >= max_failures {
                            // The leases may have expired and been taken over;
                            // keeping the shards would risk split-brain.
                            tracing::error!(
                                consecutive_failures,
                                "lease refresh failed too many times, surrendering all shards"
                            );
                            consecutive_failures = 0;
                            let mut owned_set = self.owned.write().await;
                            owned_set.clear();
                            self.metrics.shards.set(0);
                        }
                    }
                }
            }

            self.reconcile_assignments().await;
            self.publish_runner_directory().await;
        }
    }

    /// Re-register this runner and publish the runner gauges from the
    /// directory's active set. Directory errors never affect lease state.
    async fn publish_runner_directory(&self) {
        let Some(registry) = &self.registry else {
            return;
        };
        let record = RunnerRecord::new(self.config.runner_address.clone());
        if let Err(e) = registry.register(&record).await {
            tracing::warn!(error = %e, "runner heartbeat registration failed");
        }
        match registry.list_active().await {
            Ok(active) => {
                let healthy = active.iter().filter(|r| r.healthy).count();
                self.metrics.runners.set(active.len() as i64);
                self.metrics.runners_healthy.set(healthy as i64);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to list active runners");
            }
        }
    }

    /// Refresh the routing cache from the strategy's best-effort owner view.
    /// Strategies without an enumerable view return nothing and the cache is
    /// left to explicit acquire/invalidate updates.
    async fn reconcile_assignments(&self) {
        let all_shards = self.config.all_shards();
        match self.storage.owners(&all_shards).await {
            Ok(owners) if !owners.is_empty() => {
                *self.assignments.write().await = owners;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "failed to reconcile shard assignments");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_lease::MemoryLeaseStorage;
    use async_trait::async_trait;
    use std::time::Duration;

    fn config(port: u16) -> Arc<ClusterConfig> {
        Arc::new(ClusterConfig {
            runner_address: RunnerAddress::new("127.0.0.1", port),
            shard_groups: vec!["default".into()],
            shards_per_group: 4,
            lease_expiration: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(20),
            ..Default::default()
        })
    }

    fn shard(id: i32) -> ShardId {
        ShardId::new("default", id)
    }

    fn coordinator(
        port: u16,
        storage: Arc<dyn LeaseStorage>,
    ) -> Arc<ShardLeaseCoordinator> {
        ShardLeaseCoordinator::new(
            config(port),
            storage,
            None,
            Arc::new(ClusterMetrics::unregistered()),
        )
    }

    #[tokio::test]
    async fn acquire_records_ownership() {
        let storage = Arc::new(MemoryLeaseStorage::new(Duration::from_millis(500)));
        let coord = coordinator(9001, storage);

        let got = coord.acquire(&[shard(0), shard(1)]).await;
        assert_eq!(got.len(), 2);
        assert!(coord.is_owned(&shard(0)).await);
        assert!(!coord.is_owned(&shard(2)).await);
        assert_eq!(
            coord.owner_of(&shard(0)).await,
            Some(RunnerAddress::new("127.0.0.1", 9001))
        );
    }

    #[tokio::test]
    async fn overlapping_candidates_split_cleanly() {
        let storage = Arc::new(MemoryLeaseStorage::new(Duration::from_millis(500)));
        let a = coordinator(9001, storage.clone());
        let b = coordinator(9002, storage);

        let got_a = a.acquire(&[shard(1), shard(2)]).await;
        let got_b = b.acquire(&[shard(2), shard(3)]).await;

        assert_eq!(got_a, vec![shard(1), shard(2)]);
        assert_eq!(got_b, vec![shard(3)]);
        assert!(!b.is_owned(&shard(2)).await);
    }

    #[tokio::test]
    async fn heartbeat_surrenders_stolen_shards() {
        let storage = Arc::new(MemoryLeaseStorage::new(Duration::from_millis(500)));
        let coord = coordinator(9001, storage.clone());
        coord.acquire(&[shard(0)]).await;
        coord.start().await;

        // Simulate losing the lease to another runner.
        use crate::lease::LeaseStorage as _;
        storage
            .release_all(&RunnerAddress::new("127.0.0.1", 9001))
            .await
            .unwrap();
        storage
            .acquire(&RunnerAddress::new("127.0.0.1", 9002), &[shard(0)])
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!coord.is_owned(&shard(0)).await);
        coord.shutdown().await;
    }

    #[tokio::test]
    async fn heartbeat_reconciles_routing_cache() {
        let storage = Arc::new(MemoryLeaseStorage::new(Duration::from_millis(500)));
        let a = coordinator(9001, storage.clone());
        a.start().await;

        // Another runner holds shard 2 directly in storage.
        use crate::lease::LeaseStorage as _;
        storage
            .acquire(&RunnerAddress::new("127.0.0.1", 9002), &[shard(2)])
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            a.owner_of(&shard(2)).await,
            Some(RunnerAddress::new("127.0.0.1", 9002))
        );

        a.invalidate_address(&RunnerAddress::new("127.0.0.1", 9002))
            .await;
        assert_eq!(a.owner_of(&shard(2)).await, None);
        a.shutdown().await;
    }

    struct FailingLeaseStorage;

    #[async_trait]
    impl LeaseStorage for FailingLeaseStorage {
        async fn acquire(
            &self,
            _address: &RunnerAddress,
            shards: &[ShardId],
        ) -> Result<Vec<ShardId>, ClusterError> {
            Ok(shards.to_vec())
        }

        async fn refresh(
            &self,
            _address: &RunnerAddress,
            _shards: &[ShardId],
        ) -> Result<Vec<ShardId>, ClusterError> {
            Err(ClusterError::PersistenceError {
                reason: "refresh unavailable".into(),
                source: None,
            })
        }

        async fn release(
            &self,
            _address: &RunnerAddress,
            _shard: &ShardId,
        ) -> Result<(), ClusterError> {
            Ok(())
        }

        async fn release_all(&self, _address: &RunnerAddress) -> Result<(), ClusterError> {
            Ok(())
        }

        async fn owners(
            &self,
            _shards: &[ShardId],
        ) -> Result<HashMap<ShardId, RunnerAddress>, ClusterError> {
            Ok(HashMap::new())
        }
    }

    #[tokio::test]
    async fn repeated_refresh_failures_surrender_everything() {
        let coord = coordinator(9001, Arc::new(FailingLeaseStorage));
        coord.acquire(&[shard(0), shard(1)]).await;
        coord.start().await;

        // Default max failures is 3 with a 20ms heartbeat.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(coord.owned_shards().await.is_empty());
        coord.shutdown().await;
    }

    #[tokio::test]
    async fn heartbeat_publishes_runner_gauges() {
        let storage = Arc::new(MemoryLeaseStorage::new(Duration::from_millis(500)));
        let metrics = Arc::new(ClusterMetrics::unregistered());
        let coord = ShardLeaseCoordinator::new(
            config(9001),
            storage.clone(),
            Some(storage.clone() as Arc<dyn RunnerRegistry>),
            Arc::clone(&metrics),
        );
        coord.start().await;

        let mut other = RunnerRecord::new(RunnerAddress::new("127.0.0.1", 9002));
        other.healthy = false;
        storage.register(&other).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(metrics.runners.get(), 2);
        assert_eq!(metrics.runners_healthy.get(), 1);
        coord.shutdown().await;
    }

    #[tokio::test]
    async fn release_round_trip_leaves_no_residue() {
        let storage = Arc::new(MemoryLeaseStorage::new(Duration::from_millis(500)));
        let a = coordinator(9001, storage.clone());
        a.acquire(&[shard(0)]).await;
        a.release(&shard(0)).await;
        assert!(!a.is_owned(&shard(0)).await);

        // Immediately reacquirable by someone else.
        let b = coordinator(9002, storage);
        assert_eq!(b.acquire(&[shard(0)]).await, vec![shard(0)]);
    }
}
