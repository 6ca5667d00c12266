//! SQL-backed shard leases and runner registry using PostgreSQL via sqlx.
//!
//! Tables (default `cluster_` prefix, created by the bundled migrations):
//! - `cluster_locks` — one row per leased shard: owner address + acquisition time
//! - `cluster_runners` — runner directory with heartbeat timestamps
//!
//! This is the row-lease strategy: ownership is a plain row, takeover is a
//! conditional upsert against the expiry window, and acquisition is confirmed
//! by reading back which rows actually carry our address. It works on any
//! Postgres-compatible backend, including ones without advisory locks.
//!
//! This module is only available when the `sql` feature is enabled.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::error::ClusterError;
use crate::lease::LeaseStorage;
use crate::registry::{RunnerRecord, RunnerRegistry};
use crate::types::{MachineId, RunnerAddress, ShardId, MAX_MACHINE_ID};

/// PostgreSQL-backed lease store and runner registry.
pub struct SqlLeaseStorage {
    pool: PgPool,
    lease_expiration: Duration,
    table_prefix: String,
}

impl SqlLeaseStorage {
    /// Create a new SQL lease storage. `lease_expiration` must match the
    /// value every other runner uses, or takeover timing disagrees across
    /// the cluster.
    pub fn new(pool: PgPool, lease_expiration: Duration, table_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            lease_expiration,
            table_prefix: table_prefix.into(),
        }
    }

    /// Run database migrations. The bundled migrations create tables under
    /// the default `cluster_` prefix; deployments with a custom prefix
    /// manage their schema externally.
    pub async fn migrate(&self) -> Result<(), ClusterError> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .map_err(|e| ClusterError::PersistenceError {
                reason: format!("migration failed: {e}"),
                source: Some(Box::new(e)),
            })
    }

    fn locks_table(&self) -> String {
        format!("{}locks", self.table_prefix)
    }

    fn runners_table(&self) -> String {
        format!("{}runners", self.table_prefix)
    }

    fn shard_strings(shards: &[ShardId]) -> Vec<String> {
        shards.iter().map(ToString::to_string).collect()
    }

    fn parse_shard(raw: &str) -> Result<ShardId, ClusterError> {
        ShardId::from_str(raw).map_err(|e| ClusterError::PersistenceError {
            reason: format!("invalid shard_id in locks table: {raw}"),
            source: Some(Box::new(e)),
        })
    }

    fn parse_address(raw: &str) -> Result<RunnerAddress, ClusterError> {
        RunnerAddress::from_str(raw).map_err(|e| ClusterError::PersistenceError {
            reason: format!("invalid address in table: {raw}"),
            source: Some(Box::new(e)),
        })
    }
}

#[async_trait]
impl LeaseStorage for SqlLeaseStorage {
    async fn acquire(
        &self,
        address: &RunnerAddress,
        shards: &[ShardId],
    ) -> Result<Vec<ShardId>, ClusterError> {
        if shards.is_empty() {
            return Ok(Vec::new());
        }
        let locks = self.locks_table();
        let ids = Self::shard_strings(shards);

        // Conditional upsert: a new row always wins; an existing row is only
        // overwritten when we already own it (renewal) or it has expired
        // (silent takeover). A live lease held elsewhere leaves the row
        // untouched.
        sqlx::query(&format!(
            r#"
            INSERT INTO {locks} (shard_id, address, acquired_at)
            SELECT shard_id, $2, NOW() FROM UNNEST($1::text[]) AS shard_id
            ON CONFLICT (shard_id) DO UPDATE
            SET address = EXCLUDED.address, acquired_at = NOW()
            WHERE {locks}.address = EXCLUDED.address
               OR {locks}.acquired_at <= NOW() - make_interval(secs => $3::double precision)
            "#
        ))
        .bind(&ids)
        .bind(address.to_string())
        .bind(self.lease_expiration.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| ClusterError::PersistenceError {
            reason: format!("failed to acquire shard leases: {e}"),
            source: Some(Box::new(e)),
        })?;

        // Read-after-write: only rows that actually carry our address are
        // owned, whatever the upsert did.
        let rows = sqlx::query(&format!(
            "SELECT shard_id FROM {locks} WHERE address = $2 AND shard_id = ANY($1::text[])"
        ))
        .bind(&ids)
        .bind(address.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ClusterError::PersistenceError {
            reason: format!("failed to confirm shard leases: {e}"),
            source: Some(Box::new(e)),
        })?;

        rows.iter()
            .map(|row| Self::parse_shard(row.get::<&str, _>("shard_id")))
            .collect()
    }

    async fn refresh(
        &self,
        address: &RunnerAddress,
        shards: &[ShardId],
    ) -> Result<Vec<ShardId>, ClusterError> {
        if shards.is_empty() {
            return Ok(Vec::new());
        }
        let locks = self.locks_table();
        let rows = sqlx::query(&format!(
            r#"
            UPDATE {locks} SET acquired_at = NOW()
            WHERE address = $2 AND shard_id = ANY($1::text[])
            RETURNING shard_id
            "#
        ))
        .bind(Self::shard_strings(shards))
        .bind(address.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ClusterError::PersistenceError {
            reason: format!("failed to refresh shard leases: {e}"),
            source: Some(Box::new(e)),
        })?;

        rows.iter()
            .map(|row| Self::parse_shard(row.get::<&str, _>("shard_id")))
            .collect()
    }

    async fn release(&self, address: &RunnerAddress, shard: &ShardId) -> Result<(), ClusterError> {
        let locks = self.locks_table();
        sqlx::query(&format!(
            "DELETE FROM {locks} WHERE shard_id = $1 AND address = $2"
        ))
        .bind(shard.to_string())
        .bind(address.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| ClusterError::PersistenceError {
            reason: format!("failed to release shard lease: {e}"),
            source: Some(Box::new(e)),
        })?;
        Ok(())
    }

    async fn release_all(&self, address: &RunnerAddress) -> Result<(), ClusterError> {
        let locks = self.locks_table();
        sqlx::query(&format!("DELETE FROM {locks} WHERE address = $1"))
            .bind(address.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| ClusterError::PersistenceError {
                reason: format!("failed to release shard leases: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(())
    }

    async fn owners(
        &self,
        shards: &[ShardId],
    ) -> Result<HashMap<ShardId, RunnerAddress>, ClusterError> {
        if shards.is_empty() {
            return Ok(HashMap::new());
        }
        let locks = self.locks_table();
        let rows = sqlx::query(&format!(
            r#"
            SELECT shard_id, address FROM {locks}
            WHERE shard_id = ANY($1::text[])
              AND acquired_at > NOW() - make_interval(secs => $2::double precision)
            "#
        ))
        .bind(Self::shard_strings(shards))
        .bind(self.lease_expiration.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ClusterError::PersistenceError {
            reason: format!("failed to read shard lease owners: {e}"),
            source: Some(Box::new(e)),
        })?;

        let mut owners = HashMap::new();
        for row in rows {
            let shard = Self::parse_shard(row.get::<&str, _>("shard_id"))?;
            let address = Self::parse_address(row.get::<&str, _>("address"))?;
            owners.insert(shard, address);
        }
        Ok(owners)
    }
}

#[async_trait]
impl RunnerRegistry for SqlLeaseStorage {
    async fn register(&self, runner: &RunnerRecord) -> Result<MachineId, ClusterError> {
        let runners = self.runners_table();
        // Registration doubles as the heartbeat; the BIGSERIAL machine_id is
        // assigned on first insert and survives re-registration.
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO {runners} (address, runner_metadata, healthy, last_heartbeat)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (address) DO UPDATE
            SET runner_metadata = EXCLUDED.runner_metadata,
                healthy = EXCLUDED.healthy,
                last_heartbeat = NOW()
            RETURNING machine_id
            "#
        ))
        .bind(runner.address.to_string())
        .bind(&runner.metadata)
        .bind(runner.healthy)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ClusterError::PersistenceError {
            reason: format!("failed to register runner: {e}"),
            source: Some(Box::new(e)),
        })?;

        let machine_id: i64 = row.get("machine_id");
        Ok(MachineId::wrapping(
            (machine_id % (MAX_MACHINE_ID as i64 + 1)) as i32,
        ))
    }

    async fn set_health(&self, address: &RunnerAddress, healthy: bool) -> Result<(), ClusterError> {
        let runners = self.runners_table();
        sqlx::query(&format!(
            "UPDATE {runners} SET healthy = $2 WHERE address = $1"
        ))
        .bind(address.to_string())
        .bind(healthy)
        .execute(&self.pool)
        .await
        .map_err(|e| ClusterError::PersistenceError {
            reason: format!("failed to set runner health: {e}"),
            source: Some(Box::new(e)),
        })?;
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<RunnerRecord>, ClusterError> {
        let runners = self.runners_table();
        let rows = sqlx::query(&format!(
            r#"
            SELECT address, runner_metadata, healthy FROM {runners}
            WHERE last_heartbeat > NOW() - make_interval(secs => $1::double precision)
            "#
        ))
        .bind(self.lease_expiration.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ClusterError::PersistenceError {
            reason: format!("failed to list runners: {e}"),
            source: Some(Box::new(e)),
        })?;

        rows.into_iter()
            .map(|row| {
                Ok(RunnerRecord {
                    address: Self::parse_address(row.get::<&str, _>("address"))?,
                    metadata: row.get("runner_metadata"),
                    healthy: row.get("healthy"),
                })
            })
            .collect()
    }

    async fn unregister(&self, address: &RunnerAddress) -> Result<(), ClusterError> {
        let runners = self.runners_table();
        // Remove this runner and, while here, any row whose heartbeat lapsed
        // without an unregister (crashed runner).
        sqlx::query(&format!(
            r#"
            DELETE FROM {runners}
            WHERE address = $1
               OR last_heartbeat <= NOW() - make_interval(secs => $2::double precision)
            "#
        ))
        .bind(address.to_string())
        .bind(self.lease_expiration.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| ClusterError::PersistenceError {
            reason: format!("failed to unregister runner: {e}"),
            source: Some(Box::new(e)),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn table_names_use_prefix() {
        let pool = PgPool::connect_lazy("postgres://localhost/corral").unwrap();
        let storage = SqlLeaseStorage::new(pool, Duration::from_secs(30), "cluster_");
        assert_eq!(storage.locks_table(), "cluster_locks");
        assert_eq!(storage.runners_table(), "cluster_runners");
    }

    #[test]
    fn shard_round_trips_through_text() {
        let shard = ShardId::new("default", 12);
        let parsed = SqlLeaseStorage::parse_shard(&shard.to_string()).unwrap();
        assert_eq!(parsed, shard);
        assert!(SqlLeaseStorage::parse_shard("not-a-shard").is_err());
    }
}
