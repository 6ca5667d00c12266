//! In-process fixtures for exercising the dispatch pipeline without a real
//! transport or database: a scripted `Runners` implementation, a recording
//! `LocalRouter`, and a fully wired [`TestNode`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::ClusterConfig;
use crate::coordinator::ShardLeaseCoordinator;
use crate::dispatch::{LocalRouter, MessageDispatcher};
use crate::envelope::{Envelope, EnvelopeRequest};
use crate::error::ClusterError;
use crate::message::{reply_channel, IncomingMessage, OutgoingMessage, ReplyReceiver};
use crate::metrics::ClusterMetrics;
use crate::registry::RunnerRegistry;
use crate::replay::ReplayEngine;
use crate::reply::Reply;
use crate::runners::Runners;
use crate::snowflake::Snowflake;
use crate::storage::memory_lease::MemoryLeaseStorage;
use crate::storage::memory_message::MemoryMessageStorage;
use crate::types::{EntityAddress, EntityId, EntityType, RunnerAddress, ShardId};

enum Script {
    /// Every call fails with `RunnerUnavailable`.
    Unavailable,
    /// Calls succeed; requests get an empty reply stream that closes.
    Accept,
    /// Requests succeed and stream these replies back.
    Replies(Vec<Reply>),
}

/// Scripted inter-runner transport. Addresses without a script behave as
/// unavailable. Every accepted send and notify is recorded for assertions.
pub struct ScriptedRunners {
    scripts: DashMap<RunnerAddress, Script>,
    sent: Mutex<Vec<(RunnerAddress, EnvelopeRequest)>>,
    notified: Mutex<Vec<(RunnerAddress, Envelope)>>,
}

impl ScriptedRunners {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: DashMap::new(),
            sent: Mutex::new(Vec::new()),
            notified: Mutex::new(Vec::new()),
        })
    }

    pub fn unavailable(&self, address: RunnerAddress) {
        self.scripts.insert(address, Script::Unavailable);
    }

    pub fn accept(&self, address: RunnerAddress) {
        self.scripts.insert(address, Script::Accept);
    }

    pub fn respond_with(&self, address: RunnerAddress, replies: Vec<Reply>) {
        self.scripts.insert(address, Script::Replies(replies));
    }

    pub fn sent(&self) -> Vec<(RunnerAddress, EnvelopeRequest)> {
        self.sent.lock().clone()
    }

    pub fn notified(&self) -> Vec<(RunnerAddress, Envelope)> {
        self.notified.lock().clone()
    }

    fn fail(address: &RunnerAddress) -> ClusterError {
        ClusterError::RunnerUnavailable {
            address: address.clone(),
            source: None,
        }
    }
}

#[async_trait]
impl Runners for ScriptedRunners {
    async fn ping(&self, address: &RunnerAddress) -> Result<(), ClusterError> {
        match self.scripts.get(address).map(|s| matches!(s.value(), Script::Unavailable)) {
            Some(false) => Ok(()),
            _ => Err(Self::fail(address)),
        }
    }

    async fn send(
        &self,
        address: &RunnerAddress,
        envelope: EnvelopeRequest,
    ) -> Result<ReplyReceiver, ClusterError> {
        let replies = match self.scripts.get(address) {
            Some(script) => match script.value() {
                Script::Unavailable => return Err(Self::fail(address)),
                Script::Accept => Vec::new(),
                Script::Replies(replies) => replies.clone(),
            },
            None => return Err(Self::fail(address)),
        };
        self.sent.lock().push((address.clone(), envelope));

        let (tx, rx) = reply_channel();
        tokio::spawn(async move {
            for reply in replies {
                if tx.send(reply).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn notify(
        &self,
        address: &RunnerAddress,
        envelope: Envelope,
    ) -> Result<(), ClusterError> {
        match self.scripts.get(address) {
            Some(script) if !matches!(script.value(), Script::Unavailable) => {
                self.notified.lock().push((address.clone(), envelope));
                Ok(())
            }
            _ => Err(Self::fail(address)),
        }
    }
}

/// Local router that records every delivered envelope. Persisted request
/// replies are expected to be written through message storage by the test
/// itself.
pub struct RecordingRouter {
    delivered: Mutex<Vec<EnvelopeRequest>>,
}

impl RecordingRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
        })
    }

    pub fn delivered(&self) -> Vec<EnvelopeRequest> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl LocalRouter for RecordingRouter {
    async fn deliver(&self, message: IncomingMessage) -> Result<(), ClusterError> {
        self.delivered.lock().push(message.envelope().clone());
        Ok(())
    }
}

/// A single runner wired against in-memory storage, a scripted transport,
/// and a recording router, with intervals short enough for tests.
pub struct TestNode {
    pub config: Arc<ClusterConfig>,
    pub leases: Arc<MemoryLeaseStorage>,
    pub messages: Arc<MemoryMessageStorage>,
    pub transport: Arc<ScriptedRunners>,
    pub router: Arc<RecordingRouter>,
    pub coordinator: Arc<ShardLeaseCoordinator>,
    pub replay: Arc<ReplayEngine>,
    pub dispatcher: Arc<MessageDispatcher>,
}

impl TestNode {
    /// Build and start a node listening (notionally) on `port`, with four
    /// shards in the `default` group.
    pub async fn start(port: u16) -> Self {
        let config = Arc::new(ClusterConfig {
            runner_address: RunnerAddress::new("127.0.0.1", port),
            shard_groups: vec!["default".into()],
            shards_per_group: 4,
            lease_expiration: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(20),
            reply_poll_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let metrics = Arc::new(ClusterMetrics::unregistered());
        let leases = Arc::new(MemoryLeaseStorage::new(config.lease_expiration));
        let messages = Arc::new(MemoryMessageStorage::new());
        let transport = ScriptedRunners::new();
        let router = RecordingRouter::new();

        let coordinator = ShardLeaseCoordinator::new(
            Arc::clone(&config),
            leases.clone(),
            Some(leases.clone() as Arc<dyn RunnerRegistry>),
            Arc::clone(&metrics),
        );
        coordinator.start().await;

        let replay = ReplayEngine::new(messages.clone(), &config, Arc::clone(&metrics));
        replay.start().await;

        let dispatcher = MessageDispatcher::new(
            Arc::clone(&config),
            transport.clone(),
            messages.clone(),
            Arc::clone(&coordinator),
            Arc::clone(&replay),
            router.clone(),
        );

        Self {
            config,
            leases,
            messages,
            transport,
            router,
            coordinator,
            replay,
            dispatcher,
        }
    }

    pub fn shard(&self, index: i32) -> ShardId {
        ShardId::new("default", index)
    }

    pub fn address(&self) -> RunnerAddress {
        self.config.runner_address.clone()
    }

    /// Build a persisted request for `shard` and return it with the caller's
    /// reply receiver.
    pub fn request(&self, request_id: i64, shard: ShardId) -> (OutgoingMessage, ReplyReceiver) {
        let (tx, rx) = reply_channel();
        let message = OutgoingMessage::Request {
            envelope: envelope(request_id, shard, true),
            reply_tx: tx,
        };
        (message, rx)
    }

    /// Build a persisted fire-and-forget envelope for `shard`.
    pub fn envelope(&self, request_id: i64, shard: ShardId) -> OutgoingMessage {
        OutgoingMessage::Envelope {
            envelope: envelope(request_id, shard, true),
        }
    }

    pub async fn shutdown(&self) {
        self.dispatcher.shutdown();
        self.replay.shutdown().await;
        self.coordinator.shutdown().await;
    }
}

/// A bare envelope request addressed at a `User` entity on `shard`.
pub fn envelope(request_id: i64, shard: ShardId, persisted: bool) -> EnvelopeRequest {
    EnvelopeRequest {
        request_id: Snowflake(request_id),
        address: EntityAddress {
            shard_id: shard,
            entity_type: EntityType::new("User"),
            entity_id: EntityId::new("u-1"),
        },
        tag: "handle".into(),
        payload: Vec::new(),
        headers: HashMap::new(),
        persisted,
    }
}
