use crate::error::ClusterError;
use crate::types::{RunnerAddress, ShardId};
use std::time::Duration;

/// Configuration for the cluster coordination core.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Address this runner advertises to other runners.
    pub runner_address: RunnerAddress,
    /// Shard groups to participate in. Default: ["default"].
    pub shard_groups: Vec<String>,
    /// Number of shards per group. Default: 2048.
    pub shards_per_group: i32,
    /// How long a lease stays valid without a refresh. Default: 30s.
    pub lease_expiration: Duration,
    /// How often owned leases are refreshed. Must be less than half of
    /// `lease_expiration` so a refresh can fail once without losing the
    /// lease. Default: 10s.
    pub heartbeat_interval: Duration,
    /// How often the replay engine polls storage for replies. Default: 200ms.
    pub reply_poll_interval: Duration,
    /// Maximum consecutive lease refresh failures before owned shards are
    /// surrendered. Another runner may have already taken over the expired
    /// lease, so continuing to serve would split the shard. Default: 3.
    pub lease_refresh_max_failures: u32,
    /// Upper bound on the unlock loop when releasing a session-scoped
    /// advisory lock that was acquired more than once. Default: 16.
    pub release_retry_cap: u32,
    /// Prefix for derived lock names. Default: "corral".
    pub lock_name_prefix: String,
    /// Prefix for SQL table names. Default: "cluster_".
    pub table_prefix: String,
}

impl ClusterConfig {
    /// Validate configuration values. Returns an error message if any value is invalid.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.shard_groups.is_empty() {
            return Err(ClusterError::InvalidConfig {
                reason: "shard_groups must not be empty".to_string(),
            });
        }
        if self.shards_per_group < 1 {
            return Err(ClusterError::InvalidConfig {
                reason: format!(
                    "shards_per_group must be >= 1, got {}",
                    self.shards_per_group
                ),
            });
        }
        if self.lease_expiration.is_zero() {
            return Err(ClusterError::InvalidConfig {
                reason: "lease_expiration must be > 0".to_string(),
            });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ClusterError::InvalidConfig {
                reason: "heartbeat_interval must be > 0".to_string(),
            });
        }
        if self.heartbeat_interval >= self.lease_expiration / 2 {
            return Err(ClusterError::InvalidConfig {
                reason: format!(
                    "heartbeat_interval ({:?}) must be < lease_expiration / 2 ({:?})",
                    self.heartbeat_interval,
                    self.lease_expiration / 2
                ),
            });
        }
        if self.reply_poll_interval.is_zero() {
            return Err(ClusterError::InvalidConfig {
                reason: "reply_poll_interval must be > 0".to_string(),
            });
        }
        if self.lease_refresh_max_failures == 0 {
            return Err(ClusterError::InvalidConfig {
                reason: "lease_refresh_max_failures must be >= 1".to_string(),
            });
        }
        if self.release_retry_cap == 0 {
            return Err(ClusterError::InvalidConfig {
                reason: "release_retry_cap must be >= 1".to_string(),
            });
        }
        if self.lock_name_prefix.is_empty() {
            return Err(ClusterError::InvalidConfig {
                reason: "lock_name_prefix must not be empty".to_string(),
            });
        }
        // Table names are interpolated into SQL, so the prefix is restricted
        // to identifier characters.
        if !self
            .table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ClusterError::InvalidConfig {
                reason: format!(
                    "table_prefix must contain only [a-zA-Z0-9_], got {:?}",
                    self.table_prefix
                ),
            });
        }
        Ok(())
    }

    /// Enumerate every shard this configuration participates in, in group
    /// order then index order. The ordering is what makes lock tokens
    /// deterministic across processes.
    pub fn all_shards(&self) -> Vec<ShardId> {
        let mut shards = Vec::with_capacity(self.shard_groups.len() * self.shards_per_group as usize);
        for group in &self.shard_groups {
            for id in 0..self.shards_per_group {
                shards.push(ShardId::new(group.clone(), id));
            }
        }
        shards
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            runner_address: RunnerAddress::new("127.0.0.1", 9000),
            shard_groups: vec!["default".to_string()],
            shards_per_group: 2048,
            lease_expiration: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            reply_poll_interval: Duration::from_millis(200),
            lease_refresh_max_failures: 3,
            release_retry_cap: 16,
            lock_name_prefix: "corral".to_string(),
            table_prefix: "cluster_".to_string(),
        }
    }
}
