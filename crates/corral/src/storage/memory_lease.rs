use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::ClusterError;
use crate::lease::LeaseStorage;
use crate::registry::{RunnerRecord, RunnerRegistry};
use crate::types::{MachineId, RunnerAddress, ShardId};

/// In-memory lease store + runner registry with real expiry-based takeover.
/// Backs single-node deployments and tests.
pub struct MemoryLeaseStorage {
    expiration: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    /// Shard leases: shard -> (owner, last renewal).
    leases: HashMap<ShardId, Lease>,
    runners: HashMap<RunnerAddress, RunnerRow>,
    /// Assigned machine IDs per runner address, stable across re-registration.
    machine_ids: HashMap<RunnerAddress, MachineId>,
    next_machine_id: i32,
}

struct Lease {
    owner: RunnerAddress,
    renewed: Instant,
}

struct RunnerRow {
    record: RunnerRecord,
    last_heartbeat: Instant,
}

impl MemoryLeaseStorage {
    /// `expiration` bounds both lease validity and the registry's active
    /// window, mirroring `ClusterConfig::lease_expiration`.
    pub fn new(expiration: Duration) -> Self {
        Self {
            expiration,
            inner: Mutex::new(Inner {
                leases: HashMap::new(),
                runners: HashMap::new(),
                machine_ids: HashMap::new(),
                next_machine_id: 1,
            }),
        }
    }

    fn expired(&self, renewed: Instant, now: Instant) -> bool {
        now.duration_since(renewed) > self.expiration
    }
}

#[async_trait]
impl LeaseStorage for MemoryLeaseStorage {
    async fn acquire(
        &self,
        address: &RunnerAddress,
        shards: &[ShardId],
    ) -> Result<Vec<ShardId>, ClusterError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let mut acquired = Vec::new();
        for shard in shards {
            match inner.leases.get_mut(shard) {
                Some(lease) if &lease.owner == address => {
                    lease.renewed = now;
                    acquired.push(shard.clone());
                }
                Some(lease) if self.expired(lease.renewed, now) => {
                    // Expired lease: silent takeover.
                    lease.owner = address.clone();
                    lease.renewed = now;
                    acquired.push(shard.clone());
                }
                Some(_) => {} // live lease held elsewhere
                None => {
                    inner.leases.insert(
                        shard.clone(),
                        Lease {
                            owner: address.clone(),
                            renewed: now,
                        },
                    );
                    acquired.push(shard.clone());
                }
            }
        }
        Ok(acquired)
    }

    async fn refresh(
        &self,
        address: &RunnerAddress,
        shards: &[ShardId],
    ) -> Result<Vec<ShardId>, ClusterError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let mut still_owned = Vec::new();
        for shard in shards {
            if let Some(lease) = inner.leases.get_mut(shard) {
                if &lease.owner == address {
                    lease.renewed = now;
                    still_owned.push(shard.clone());
                }
            }
        }
        Ok(still_owned)
    }

    async fn release(&self, address: &RunnerAddress, shard: &ShardId) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock();
        if inner.leases.get(shard).is_some_and(|l| &l.owner == address) {
            inner.leases.remove(shard);
        }
        Ok(())
    }

    async fn release_all(&self, address: &RunnerAddress) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock();
        inner.leases.retain(|_, lease| &lease.owner != address);
        Ok(())
    }

    async fn owners(
        &self,
        shards: &[ShardId],
    ) -> Result<HashMap<ShardId, RunnerAddress>, ClusterError> {
        let inner = self.inner.lock();
        let now = Instant::now();
        let mut owners = HashMap::new();
        for shard in shards {
            if let Some(lease) = inner.leases.get(shard) {
                if !self.expired(lease.renewed, now) {
                    owners.insert(shard.clone(), lease.owner.clone());
                }
            }
        }
        Ok(owners)
    }
}

#[async_trait]
impl RunnerRegistry for MemoryLeaseStorage {
    async fn register(&self, runner: &RunnerRecord) -> Result<MachineId, ClusterError> {
        let mut inner = self.inner.lock();
        inner.runners.insert(
            runner.address.clone(),
            RunnerRow {
                record: runner.clone(),
                last_heartbeat: Instant::now(),
            },
        );
        // Re-registration keeps the previously assigned machine ID so the
        // snowflake generator is not re-seeded with a different value.
        let id = if let Some(&existing) = inner.machine_ids.get(&runner.address) {
            existing
        } else {
            let id = MachineId::wrapping(inner.next_machine_id);
            inner.next_machine_id += 1;
            inner.machine_ids.insert(runner.address.clone(), id);
            id
        };
        Ok(id)
    }

    async fn set_health(&self, address: &RunnerAddress, healthy: bool) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.runners.get_mut(address) {
            row.record.healthy = healthy;
        }
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<RunnerRecord>, ClusterError> {
        let inner = self.inner.lock();
        let now = Instant::now();
        Ok(inner
            .runners
            .values()
            .filter(|row| !self.expired(row.last_heartbeat, now))
            .map(|row| row.record.clone())
            .collect())
    }

    async fn unregister(&self, address: &RunnerAddress) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock();
        inner.runners.remove(address);
        inner.leases.retain(|_, lease| &lease.owner != address);
        // Lazy GC of rows whose runner died without unregistering.
        let now = Instant::now();
        let expiration = self.expiration;
        inner
            .runners
            .retain(|_, row| now.duration_since(row.last_heartbeat) <= expiration);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> RunnerAddress {
        RunnerAddress::new("127.0.0.1", port)
    }

    fn shard(id: i32) -> ShardId {
        ShardId::new("default", id)
    }

    fn storage() -> MemoryLeaseStorage {
        MemoryLeaseStorage::new(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn acquire_is_first_come_first_served() {
        let storage = storage();
        let got_a = storage.acquire(&addr(1), &[shard(0), shard(1)]).await.unwrap();
        assert_eq!(got_a.len(), 2);

        let got_b = storage.acquire(&addr(2), &[shard(1), shard(2)]).await.unwrap();
        assert_eq!(got_b, vec![shard(2)]);
    }

    #[tokio::test]
    async fn acquire_is_idempotent_for_the_holder() {
        let storage = storage();
        storage.acquire(&addr(1), &[shard(0)]).await.unwrap();
        let again = storage.acquire(&addr(1), &[shard(0)]).await.unwrap();
        assert_eq!(again, vec![shard(0)]);
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let storage = MemoryLeaseStorage::new(Duration::from_millis(20));
        storage.acquire(&addr(1), &[shard(0)]).await.unwrap();

        // Still live: takeover refused.
        assert!(storage.acquire(&addr(2), &[shard(0)]).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let got = storage.acquire(&addr(2), &[shard(0)]).await.unwrap();
        assert_eq!(got, vec![shard(0)]);

        // The previous holder no longer refreshes successfully.
        assert!(storage.refresh(&addr(1), &[shard(0)]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn refresh_reports_lost_shards() {
        let storage = storage();
        storage.acquire(&addr(1), &[shard(0), shard(1)]).await.unwrap();
        storage.release(&addr(1), &shard(1)).await.unwrap();
        let still = storage.refresh(&addr(1), &[shard(0), shard(1)]).await.unwrap();
        assert_eq!(still, vec![shard(0)]);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_owner_guarded() {
        let storage = storage();
        storage.acquire(&addr(1), &[shard(0)]).await.unwrap();

        // Non-owner release is a no-op.
        storage.release(&addr(2), &shard(0)).await.unwrap();
        assert_eq!(
            storage.refresh(&addr(1), &[shard(0)]).await.unwrap(),
            vec![shard(0)]
        );

        storage.release(&addr(1), &shard(0)).await.unwrap();
        storage.release(&addr(1), &shard(0)).await.unwrap();
        assert!(storage.acquire(&addr(2), &[shard(0)]).await.unwrap().len() == 1);
    }

    #[tokio::test]
    async fn release_all_frees_everything() {
        let storage = storage();
        storage.acquire(&addr(1), &[shard(0), shard(1)]).await.unwrap();
        storage.release_all(&addr(1)).await.unwrap();
        let got = storage.acquire(&addr(2), &[shard(0), shard(1)]).await.unwrap();
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn owners_excludes_expired_leases() {
        let storage = MemoryLeaseStorage::new(Duration::from_millis(20));
        storage.acquire(&addr(1), &[shard(0)]).await.unwrap();

        let owners = storage.owners(&[shard(0), shard(1)]).await.unwrap();
        assert_eq!(owners.get(&shard(0)), Some(&addr(1)));
        assert!(!owners.contains_key(&shard(1)));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(storage.owners(&[shard(0)]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn register_returns_stable_machine_ids() {
        let storage = storage();
        let id1 = storage.register(&RunnerRecord::new(addr(1))).await.unwrap();
        let id2 = storage.register(&RunnerRecord::new(addr(2))).await.unwrap();
        assert_ne!(id1, id2);

        let again = storage.register(&RunnerRecord::new(addr(1))).await.unwrap();
        assert_eq!(id1, again);
    }

    #[tokio::test]
    async fn list_active_filters_expired_rows() {
        let storage = MemoryLeaseStorage::new(Duration::from_millis(20));
        storage.register(&RunnerRecord::new(addr(1))).await.unwrap();
        assert_eq!(storage.list_active().await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(storage.list_active().await.unwrap().is_empty());

        // Re-registration is the heartbeat.
        storage.register(&RunnerRecord::new(addr(1))).await.unwrap();
        assert_eq!(storage.list_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn set_health_updates_record() {
        let storage = storage();
        storage.register(&RunnerRecord::new(addr(1))).await.unwrap();
        storage.set_health(&addr(1), false).await.unwrap();
        let active = storage.list_active().await.unwrap();
        assert!(!active[0].healthy);
    }

    #[tokio::test]
    async fn unregister_gcs_expired_rows() {
        let storage = MemoryLeaseStorage::new(Duration::from_millis(20));
        storage.register(&RunnerRecord::new(addr(1))).await.unwrap();
        storage.register(&RunnerRecord::new(addr(2))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        storage.register(&RunnerRecord::new(addr(3))).await.unwrap();

        storage.unregister(&addr(3)).await.unwrap();

        // 1 and 2 were expired and must have been collected too.
        let inner = storage.inner.lock();
        assert!(inner.runners.is_empty());
    }
}
