use async_trait::async_trait;
use std::collections::HashMap;

use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::types::{RunnerAddress, ShardId};

/// Spacing between the token ranges of consecutive shard groups. Leaves room
/// for far more shards per group than any deployment uses while keeping
/// tokens readable in lock tables.
const GROUP_TOKEN_STRIDE: i64 = 1_000_000;

/// Lease store strategy. One live lease per shard at any instant; an expired
/// lease is claimable by anyone. All operations are batch-shaped so a runner
/// can negotiate its whole candidate set in one round trip.
///
/// Strategy errors during `acquire`/`refresh` surface as shards simply not
/// being in the returned set; the coordinator's next heartbeat retries.
#[async_trait]
pub trait LeaseStorage: Send + Sync {
    /// Try to take leases on `shards` for `address`. Returns the subset
    /// actually held afterwards (including shards this address already held).
    async fn acquire(
        &self,
        address: &RunnerAddress,
        shards: &[ShardId],
    ) -> Result<Vec<ShardId>, ClusterError>;

    /// Extend the leases this address still holds. Returns the subset still
    /// held; anything missing was lost (expired and taken over, or revoked).
    async fn refresh(
        &self,
        address: &RunnerAddress,
        shards: &[ShardId],
    ) -> Result<Vec<ShardId>, ClusterError>;

    /// Release one lease. Idempotent: releasing a shard that is not held
    /// (or held by someone else) is a no-op.
    async fn release(&self, address: &RunnerAddress, shard: &ShardId) -> Result<(), ClusterError>;

    /// Release every lease held by this address.
    async fn release_all(&self, address: &RunnerAddress) -> Result<(), ClusterError>;

    /// Best-effort view of current lease owners. Strategies whose ownership
    /// is implicit in connection state (session-scoped mutexes) return an
    /// empty map; callers then fall back to storage replay for routing.
    async fn owners(
        &self,
        shards: &[ShardId],
    ) -> Result<HashMap<ShardId, RunnerAddress>, ClusterError>;
}

/// Deterministic shard → lock token/name derivation, computed once from
/// config. Every process with the same config derives the same tokens, which
/// is what lets advisory locks taken by different runners contend correctly.
#[derive(Debug)]
pub struct LockTokens {
    prefix: String,
    by_shard: HashMap<ShardId, i64>,
}

impl LockTokens {
    /// Derive tokens for every shard in the config, in group order: the
    /// token is `group_index * 1_000_000 + shard_index`.
    pub fn from_config(config: &ClusterConfig) -> Self {
        let mut by_shard = HashMap::new();
        for (group_index, group) in config.shard_groups.iter().enumerate() {
            for index in 0..config.shards_per_group {
                let shard = ShardId::new(group.clone(), index);
                let token = group_index as i64 * GROUP_TOKEN_STRIDE + index as i64;
                by_shard.insert(shard, token);
            }
        }
        Self {
            prefix: config.lock_name_prefix.clone(),
            by_shard,
        }
    }

    /// Numeric token for a shard, or `None` for shards outside the config.
    pub fn token(&self, shard: &ShardId) -> Option<i64> {
        self.by_shard.get(shard).copied()
    }

    /// Human-readable lock name: `"{prefix}.{group}:{index}"`. Logged next
    /// to the numeric token so lock tables stay readable to operators.
    pub fn name(&self, shard: &ShardId) -> String {
        format!("{}.{}", self.prefix, shard)
    }
}
