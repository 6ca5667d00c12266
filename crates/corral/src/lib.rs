//! Cluster coordination core: shard ownership via storage-backed leases and
//! effectively-once message dispatch with persisted-reply replay.
//!
//! A process is a *runner*. Entities hash onto *shards*; a runner owns a
//! shard by holding its lease, renewed by the [`coordinator`] heartbeat.
//! Messages flow through the [`dispatch`] pipeline: persisted messages are
//! saved before delivery, duplicates continue the original request's reply
//! stream, and any delivery failure degrades to replaying recorded replies
//! from storage via the [`replay`] engine.
//!
//! Storage backends are pluggable: in-memory stores for tests and two
//! PostgreSQL lease strategies (row leases and session-scoped advisory
//! locks) behind the `sql` feature.

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod lease;
pub mod message;
pub mod message_storage;
pub mod metrics;
pub mod registry;
pub mod replay;
pub mod reply;
pub mod runners;
pub mod snowflake;
pub mod storage;
pub mod testing;
pub mod types;
