//! Advisory-lock shard leases on PostgreSQL session mutexes.
//!
//! The native strategy from the locking protocol: every shard maps to a
//! deterministic numeric token ([`LockTokens`]) and holding the shard means
//! holding `pg_advisory_lock(token)` on this store's dedicated connection.
//! Expiry needs no timestamps — the backend releases every session-scoped
//! lock the moment the connection dies, so a crashed runner's shards free up
//! automatically.
//!
//! Any error on the dedicated connection invalidates it wholesale; the next
//! operation acquires a fresh connection from the pool. Callers observe a
//! connection failure as shards simply not being acquired (the coordinator's
//! next heartbeat retries), never as a fatal error.
//!
//! This module is only available when the `sql` feature is enabled.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Row};

use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::lease::{LeaseStorage, LockTokens};
use crate::types::{RunnerAddress, ShardId};

/// Session-scoped advisory-lock lease store.
pub struct AdvisoryLockStorage {
    pool: PgPool,
    tokens: LockTokens,
    release_retry_cap: u32,
    /// The dedicated lock-holding connection. All advisory locks live on
    /// this session; `None` means the previous connection was invalidated.
    conn: tokio::sync::Mutex<Option<PoolConnection<Postgres>>>,
}

impl AdvisoryLockStorage {
    pub fn new(pool: PgPool, config: &ClusterConfig) -> Self {
        Self {
            pool,
            tokens: LockTokens::from_config(config),
            release_retry_cap: config.release_retry_cap,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    /// Ensure the dedicated connection exists, creating it from the pool on
    /// first use or after invalidation.
    async fn ensure_conn<'a>(
        &self,
        slot: &'a mut Option<PoolConnection<Postgres>>,
    ) -> Result<&'a mut PoolConnection<Postgres>, sqlx::Error> {
        if slot.is_none() {
            *slot = Some(self.pool.acquire().await?);
        }
        Ok(slot.as_mut().expect("connection just ensured"))
    }

    /// Tokens currently granted to the dedicated connection's backend.
    /// Consulted before acquiring so an already-held token is never
    /// re-locked (stacking holds would make release counting unbounded).
    async fn held_tokens(
        conn: &mut PoolConnection<Postgres>,
    ) -> Result<HashSet<i64>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT ((classid::bigint << 32) | objid::bigint) AS token
            FROM pg_locks
            WHERE locktype = 'advisory' AND granted AND pid = pg_backend_pid()
            "#,
        )
        .fetch_all(&mut **conn)
        .await?;
        Ok(rows.iter().map(|row| row.get::<i64, _>("token")).collect())
    }
}

#[async_trait]
impl LeaseStorage for AdvisoryLockStorage {
    async fn acquire(
        &self,
        _address: &RunnerAddress,
        shards: &[ShardId],
    ) -> Result<Vec<ShardId>, ClusterError> {
        let mut slot = self.conn.lock().await;
        let conn = match self.ensure_conn(&mut slot).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "advisory lock connection unavailable");
                return Ok(Vec::new());
            }
        };

        let held = match Self::held_tokens(conn).await {
            Ok(held) => held,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list held advisory locks, dropping connection");
                *slot = None;
                return Ok(Vec::new());
            }
        };

        let mut acquired = Vec::new();
        for shard in shards {
            let Some(token) = self.tokens.token(shard) else {
                tracing::warn!(shard_id = %shard, "shard outside configured groups, skipping");
                continue;
            };
            if held.contains(&token) {
                acquired.push(shard.clone());
                continue;
            }
            let result = sqlx::query("SELECT pg_try_advisory_lock($1) AS locked")
                .bind(token)
                .fetch_one(&mut **conn)
                .await;
            match result {
                Ok(row) if row.get::<bool, _>("locked") => {
                    tracing::debug!(
                        lock = %self.tokens.name(shard),
                        token,
                        "advisory lock acquired"
                    );
                    acquired.push(shard.clone());
                }
                Ok(_) => {} // held by another session
                Err(e) => {
                    // The session may now hold an unknown subset; drop it so
                    // the backend releases everything taken this round.
                    tracing::warn!(shard_id = %shard, error = %e, "advisory lock acquire failed, dropping connection");
                    *slot = None;
                    return Ok(Vec::new());
                }
            }
        }
        Ok(acquired)
    }

    async fn refresh(
        &self,
        _address: &RunnerAddress,
        shards: &[ShardId],
    ) -> Result<Vec<ShardId>, ClusterError> {
        let mut slot = self.conn.lock().await;
        // No connection means no session, and session-scoped locks cannot
        // outlive it: everything is lost.
        let Some(conn) = slot.as_mut() else {
            return Ok(Vec::new());
        };
        match Self::held_tokens(conn).await {
            Ok(held) => Ok(shards
                .iter()
                .filter(|shard| {
                    self.tokens
                        .token(shard)
                        .is_some_and(|token| held.contains(&token))
                })
                .cloned()
                .collect()),
            Err(e) => {
                tracing::warn!(error = %e, "advisory lock refresh failed, dropping connection");
                *slot = None;
                Ok(Vec::new())
            }
        }
    }

    async fn release(&self, _address: &RunnerAddress, shard: &ShardId) -> Result<(), ClusterError> {
        let Some(token) = self.tokens.token(shard) else {
            return Ok(());
        };
        let mut slot = self.conn.lock().await;
        let Some(conn) = slot.as_mut() else {
            return Ok(()); // no session, nothing held
        };
        // A token locked more than once must be unlocked as many times.
        // Bounded loop: unlock until the backend reports no remaining hold.
        for _ in 0..self.release_retry_cap {
            let result = sqlx::query("SELECT pg_advisory_unlock($1) AS released")
                .bind(token)
                .fetch_one(&mut **conn)
                .await;
            match result {
                Ok(row) if row.get::<bool, _>("released") => continue,
                Ok(_) => return Ok(()), // nothing left to release
                Err(e) => {
                    tracing::warn!(shard_id = %shard, error = %e, "advisory unlock failed, dropping connection");
                    *slot = None;
                    return Ok(());
                }
            }
        }
        tracing::warn!(
            shard_id = %shard,
            cap = self.release_retry_cap,
            "advisory unlock loop hit retry cap, lock may still be held"
        );
        Ok(())
    }

    async fn release_all(&self, _address: &RunnerAddress) -> Result<(), ClusterError> {
        let mut slot = self.conn.lock().await;
        let Some(conn) = slot.as_mut() else {
            return Ok(());
        };
        if let Err(e) = sqlx::query("SELECT pg_advisory_unlock_all()")
            .execute(&mut **conn)
            .await
        {
            tracing::warn!(error = %e, "pg_advisory_unlock_all failed, dropping connection");
        }
        // Either way the slate is clean: dropping the connection releases
        // every session-scoped lock.
        *slot = None;
        Ok(())
    }

    /// Session-scoped ownership is not enumerable across backends, so there
    /// is no owner map; dispatch falls back to storage replay for shards it
    /// does not own.
    async fn owners(
        &self,
        _shards: &[ShardId],
    ) -> Result<HashMap<ShardId, RunnerAddress>, ClusterError> {
        Ok(HashMap::new())
    }
}
