use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::ClusterConfig;
use crate::coordinator::ShardLeaseCoordinator;
use crate::envelope::Envelope;
use crate::error::ClusterError;
use crate::message::{reply_channel, IncomingMessage, OutgoingMessage, ReplySender};
use crate::message_storage::{MessageStorage, SaveResult};
use crate::replay::ReplayEngine;
use crate::reply::Reply;
use crate::runners::Runners;
use crate::snowflake::{Snowflake, SnowflakeGenerator};
use crate::types::RunnerAddress;

/// Entity-layer collaborator: delivers messages for locally owned shards.
///
/// For persisted requests, handlers record their replies through
/// `MessageStorage::save_reply`; the dispatcher registers the caller's reply
/// channel as a reply handler so those replies stream back in real time.
/// Transient requests reply directly on the message's channel.
///
/// `MailboxFull` and `AlreadyProcessingMessage` are backpressure signals and
/// are propagated to the dispatch caller unchanged.
#[async_trait]
pub trait LocalRouter: Send + Sync {
    async fn deliver(&self, message: IncomingMessage) -> Result<(), ClusterError>;
}

/// Message Dispatcher: persist-first routing with duplicate continuation and
/// storage-replay fallback.
///
/// A persisted message is durable before any delivery is attempted, so every
/// failure mode after the save degrades to replaying replies from storage
/// rather than re-executing the handler — that is the whole effectively-once
/// story.
pub struct MessageDispatcher {
    config: Arc<ClusterConfig>,
    snowflake: Arc<SnowflakeGenerator>,
    transport: Arc<dyn Runners>,
    storage: Arc<dyn MessageStorage>,
    coordinator: Arc<ShardLeaseCoordinator>,
    replay: Arc<ReplayEngine>,
    local: Arc<dyn LocalRouter>,
    /// Duplicate submissions whose request id was rewritten to the
    /// originally persisted id: resubmitted id -> original id. Consulted on
    /// every subsequent operation for the logical request, cleared once a
    /// terminal reply is observed.
    rewrites: Arc<DashMap<Snowflake, Snowflake>>,
    shutdown: AtomicBool,
}

impl MessageDispatcher {
    pub fn new(
        config: Arc<ClusterConfig>,
        transport: Arc<dyn Runners>,
        storage: Arc<dyn MessageStorage>,
        coordinator: Arc<ShardLeaseCoordinator>,
        replay: Arc<ReplayEngine>,
        local: Arc<dyn LocalRouter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            snowflake: Arc::new(SnowflakeGenerator::new()),
            transport,
            storage,
            coordinator,
            replay,
            local,
            rewrites: Arc::new(DashMap::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// The ID generator for this node; seeded with the machine ID returned
    /// by runner registration.
    pub fn snowflake(&self) -> &SnowflakeGenerator {
        &self.snowflake
    }

    /// Stop accepting new messages. In-flight replay waiters keep draining.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Map a request id through the duplicate rewrite table.
    pub fn resolve_request_id(&self, request_id: Snowflake) -> Snowflake {
        self.rewrites
            .get(&request_id)
            .map(|entry| *entry.value())
            .unwrap_or(request_id)
    }

    /// Top-level dispatch: persist (for persisted messages), handle
    /// duplicates, route to the owning runner, and fall back to storage
    /// replay when direct delivery is impossible.
    pub async fn dispatch(&self, mut message: OutgoingMessage) -> Result<(), ClusterError> {
        self.check_shutdown()?;
        self.apply_rewrite(&mut message);

        if message.envelope().persisted {
            if let Some(duplicate) = self.persist(&message).await? {
                return self.continue_duplicate(message, duplicate).await;
            }
        }
        self.route(message).await
    }

    /// Deliver directly to a known runner. No internal retry: a transport
    /// failure invalidates the routing cache entry and surfaces as
    /// `RunnerUnavailable` for the caller (or `dispatch`) to handle.
    pub async fn send(
        &self,
        address: &RunnerAddress,
        message: &OutgoingMessage,
    ) -> Result<(), ClusterError> {
        match message {
            OutgoingMessage::Envelope { envelope } => {
                match self
                    .transport
                    .notify(address, Envelope::Request(envelope.clone()))
                    .await
                {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        self.coordinator.invalidate_address(address).await;
                        Err(e)
                    }
                }
            }
            OutgoingMessage::Request { envelope, reply_tx } => {
                match self.transport.send(address, envelope.clone()).await {
                    Ok(mut remote) => {
                        // Pump the remote reply stream into the caller's
                        // channel; stops on the terminal reply or when the
                        // caller cancels.
                        let reply_tx = reply_tx.clone();
                        tokio::spawn(async move {
                            while let Some(reply) = remote.recv().await {
                                let last = reply.is_final();
                                if reply_tx.send(reply).await.is_err() || last {
                                    break;
                                }
                            }
                        });
                        Ok(())
                    }
                    Err(e) => {
                        self.coordinator.invalidate_address(address).await;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Deliver a message whose shard this runner owns. Persisted messages
    /// are saved first, exactly as in the remote path: durability does not
    /// depend on where the handler happens to live.
    pub async fn send_local(&self, mut message: OutgoingMessage) -> Result<(), ClusterError> {
        self.check_shutdown()?;
        self.apply_rewrite(&mut message);

        if message.envelope().persisted {
            if let Some(duplicate) = self.persist(&message).await? {
                return self.continue_duplicate(message, duplicate).await;
            }
        }
        self.deliver_local(message).await
    }

    /// Best-effort "wake up and check storage" signal toward `address`,
    /// always persisted first. With `discard` set, or for plain envelopes,
    /// a notify failure is swallowed; otherwise the reply stream is
    /// recovered via storage replay regardless of whether the nudge landed.
    pub async fn notify(
        &self,
        address: &RunnerAddress,
        mut message: OutgoingMessage,
        discard: bool,
    ) -> Result<(), ClusterError> {
        self.check_shutdown()?;
        self.apply_rewrite(&mut message);

        let mut rewritten_from = None;
        if let Some((original_id, last_reply)) = self.persist(&message).await? {
            if let Some(reply @ Reply::WithExit(_)) = last_reply {
                message.respond(reply).await;
                return Ok(());
            }
            let caller_id = message.envelope().request_id;
            if caller_id != original_id {
                message.envelope_mut().request_id = original_id;
                // Only a request whose reply stream is actually followed can
                // clear the entry again; a discarded notify never observes
                // the terminal reply, so it must not record one.
                if message.is_request() && !discard {
                    self.rewrites.insert(caller_id, original_id);
                    rewritten_from = Some(caller_id);
                }
            }
        }

        let envelope = message.envelope().clone();
        if *address == self.config.runner_address {
            if let Err(e) = self
                .local
                .deliver(IncomingMessage::Envelope { envelope })
                .await
            {
                tracing::debug!(error = %e, "local notify delivery failed, relying on replay");
            }
        } else if let Err(e) = self
            .transport
            .notify(address, Envelope::Request(envelope))
            .await
        {
            tracing::debug!(address = %address, error = %e, "remote notify failed, relying on replay");
            self.coordinator.invalidate_address(address).await;
        }

        if discard || !message.is_request() {
            return Ok(());
        }
        if let OutgoingMessage::Request { envelope, reply_tx } = message {
            self.replay_request(envelope.request_id, reply_tx, rewritten_from);
        }
        Ok(())
    }

    fn check_shutdown(&self) -> Result<(), ClusterError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ClusterError::ShuttingDown);
        }
        Ok(())
    }

    fn apply_rewrite(&self, message: &mut OutgoingMessage) {
        let caller_id = message.envelope().request_id;
        let resolved = self.resolve_request_id(caller_id);
        if resolved != caller_id {
            message.envelope_mut().request_id = resolved;
        }
    }

    /// Save the message. `Ok(None)` means freshly persisted; `Ok(Some(..))`
    /// carries the duplicate's original id and last recorded reply.
    async fn persist(
        &self,
        message: &OutgoingMessage,
    ) -> Result<Option<(Snowflake, Option<Reply>)>, ClusterError> {
        let result = match message {
            OutgoingMessage::Request { envelope, .. } => {
                self.storage.save_request(envelope).await?
            }
            OutgoingMessage::Envelope { envelope } => self.storage.save_envelope(envelope).await?,
        };
        match result {
            SaveResult::Success => Ok(None),
            SaveResult::Duplicate {
                original_id,
                last_received_reply,
            } => Ok(Some((original_id, last_received_reply))),
        }
    }

    async fn route(&self, message: OutgoingMessage) -> Result<(), ClusterError> {
        let shard = message.envelope().address.shard_id.clone();
        if self.coordinator.is_owned(&shard).await {
            return self.deliver_local(message).await;
        }

        let persisted = message.envelope().persisted;
        match self.coordinator.owner_of(&shard).await {
            Some(owner) if owner == self.config.runner_address => {
                // The cache says us but the owned set disagrees: the lease
                // was surrendered between cache refreshes.
                if persisted {
                    self.replay_message(message)
                } else {
                    Err(self.not_assigned(&message))
                }
            }
            Some(owner) => match self.send(&owner, &message).await {
                Ok(()) => Ok(()),
                Err(e) if persisted => {
                    tracing::debug!(
                        address = %owner,
                        request_id = message.envelope().request_id.0,
                        error = %e,
                        "remote delivery failed, replaying from storage"
                    );
                    self.replay_message(message)
                }
                Err(e) => Err(e),
            },
            None if persisted => self.replay_message(message),
            None => Err(self.not_assigned(&message)),
        }
    }

    fn not_assigned(&self, message: &OutgoingMessage) -> ClusterError {
        let address = &message.envelope().address;
        ClusterError::EntityNotAssignedToRunner {
            entity_type: address.entity_type.clone(),
            entity_id: address.entity_id.clone(),
        }
    }

    async fn deliver_local(&self, message: OutgoingMessage) -> Result<(), ClusterError> {
        match message {
            OutgoingMessage::Request { envelope, reply_tx } => {
                let persisted = envelope.persisted;
                let request_id = envelope.request_id;
                if persisted {
                    self.storage
                        .register_reply_handler(request_id, reply_tx.clone());
                }
                let result = self
                    .local
                    .deliver(IncomingMessage::Request {
                        request: envelope,
                        reply_tx,
                    })
                    .await;
                if result.is_err() && persisted {
                    self.storage.unregister_reply_handler(request_id);
                }
                result
            }
            OutgoingMessage::Envelope { envelope } => {
                self.local
                    .deliver(IncomingMessage::Envelope { envelope })
                    .await
            }
        }
    }

    /// Duplicate continuation: a terminal recorded reply answers the caller
    /// immediately; anything else joins the original request's reply stream
    /// through the replay engine.
    async fn continue_duplicate(
        &self,
        mut message: OutgoingMessage,
        (original_id, last_reply): (Snowflake, Option<Reply>),
    ) -> Result<(), ClusterError> {
        let caller_id = message.envelope().request_id;
        tracing::debug!(
            request_id = caller_id.0,
            original_id = original_id.0,
            "duplicate message submission"
        );

        if let Some(reply @ Reply::WithExit(_)) = last_reply {
            message.respond(reply).await;
            return Ok(());
        }

        let rewritten_from = if caller_id != original_id {
            message.envelope_mut().request_id = original_id;
            if message.is_request() {
                self.rewrites.insert(caller_id, original_id);
                Some(caller_id)
            } else {
                None
            }
        } else {
            None
        };

        match message {
            // Already persisted under the original id; the owner's storage
            // poll delivers it. Nothing to stream back.
            OutgoingMessage::Envelope { .. } => Ok(()),
            OutgoingMessage::Request { envelope, reply_tx } => {
                self.replay_request(envelope.request_id, reply_tx, rewritten_from);
                Ok(())
            }
        }
    }

    fn replay_message(&self, message: OutgoingMessage) -> Result<(), ClusterError> {
        match message {
            // Durable fire-and-forget: the eventual owner picks it up from
            // storage, there is nothing to wait for here.
            OutgoingMessage::Envelope { .. } => Ok(()),
            OutgoingMessage::Request { envelope, reply_tx } => {
                self.replay_request(envelope.request_id, reply_tx, None);
                Ok(())
            }
        }
    }

    /// Attach the caller to the replay stream for `request_id`. When the id
    /// was rewritten, replies are forwarded through a shim that clears the
    /// rewrite entry once the stream terminates (or the caller cancels).
    fn replay_request(
        &self,
        request_id: Snowflake,
        reply_tx: ReplySender,
        rewritten_from: Option<Snowflake>,
    ) {
        match rewritten_from {
            None => self.replay.watch(request_id, reply_tx),
            Some(from) => {
                let (tx, mut rx) = reply_channel();
                self.replay.watch(request_id, tx);
                let rewrites = Arc::clone(&self.rewrites);
                tokio::spawn(async move {
                    while let Some(reply) = rx.recv().await {
                        let last = reply.is_final();
                        if reply_tx.send(reply).await.is_err() || last {
                            break;
                        }
                    }
                    rewrites.remove(&from);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::reply_channel;
    use crate::metrics::ClusterMetrics;
    use crate::reply::{ExitResult, ReplyChunk, ReplyWithExit};
    use crate::storage::memory_lease::MemoryLeaseStorage;
    use crate::storage::memory_message::MemoryMessageStorage;
    use crate::testing::{envelope, RecordingRouter, ScriptedRunners};
    use crate::types::{RunnerAddress, ShardId};
    use std::time::Duration;

    struct RejectingRouter;

    #[async_trait]
    impl LocalRouter for RejectingRouter {
        async fn deliver(&self, message: IncomingMessage) -> Result<(), ClusterError> {
            Err(ClusterError::MailboxFull {
                address: message.envelope().address.clone(),
            })
        }
    }

    struct Fixture {
        storage: Arc<MemoryMessageStorage>,
        transport: Arc<ScriptedRunners>,
        coordinator: Arc<ShardLeaseCoordinator>,
        dispatcher: Arc<MessageDispatcher>,
    }

    async fn fixture(local: Arc<dyn LocalRouter>) -> Fixture {
        let config = Arc::new(ClusterConfig {
            runner_address: RunnerAddress::new("127.0.0.1", 9100),
            shard_groups: vec!["default".into()],
            shards_per_group: 4,
            reply_poll_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let metrics = Arc::new(ClusterMetrics::unregistered());
        let storage = Arc::new(MemoryMessageStorage::new());
        let leases = Arc::new(MemoryLeaseStorage::new(Duration::from_millis(500)));
        let coordinator =
            ShardLeaseCoordinator::new(Arc::clone(&config), leases, None, Arc::clone(&metrics));
        let replay = ReplayEngine::new(storage.clone(), &config, Arc::clone(&metrics));
        let transport = ScriptedRunners::new();
        let dispatcher = MessageDispatcher::new(
            Arc::clone(&config),
            transport.clone(),
            storage.clone(),
            Arc::clone(&coordinator),
            replay,
            local,
        );
        Fixture {
            storage,
            transport,
            coordinator,
            dispatcher,
        }
    }

    fn shard(index: i32) -> ShardId {
        ShardId::new("default", index)
    }

    #[tokio::test]
    async fn backpressure_propagates_and_unregisters_the_handler() {
        let fx = fixture(Arc::new(RejectingRouter)).await;
        fx.coordinator.acquire(&[shard(0)]).await;

        let (tx, mut rx) = reply_channel();
        let message = OutgoingMessage::Request {
            envelope: envelope(1, shard(0), true),
            reply_tx: tx,
        };
        let err = fx.dispatcher.dispatch(message).await.unwrap_err();
        assert!(matches!(err, ClusterError::MailboxFull { .. }));

        // The handler registered before delivery was rolled back: a later
        // reply save does not reach the caller.
        fx.storage
            .save_reply(&Reply::WithExit(ReplyWithExit {
                request_id: Snowflake(1),
                id: Snowflake(2),
                exit: ExitResult::Success(vec![]),
            }))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_pumps_the_remote_reply_stream() {
        let fx = fixture(RecordingRouter::new()).await;
        let remote = RunnerAddress::new("127.0.0.1", 9101);
        fx.transport.respond_with(
            remote.clone(),
            vec![
                Reply::Chunk(ReplyChunk {
                    request_id: Snowflake(5),
                    id: Snowflake(10),
                    sequence: 0,
                    values: vec![],
                }),
                Reply::WithExit(ReplyWithExit {
                    request_id: Snowflake(5),
                    id: Snowflake(11),
                    exit: ExitResult::Success(vec![]),
                }),
            ],
        );

        let (tx, mut rx) = reply_channel();
        let message = OutgoingMessage::Request {
            envelope: envelope(5, shard(1), false),
            reply_tx: tx,
        };
        fx.dispatcher.send(&remote, &message).await.unwrap();

        assert!(!rx.recv().await.unwrap().is_final());
        assert!(rx.recv().await.unwrap().is_final());
        assert_eq!(fx.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_send_invalidates_the_routing_cache() {
        let fx = fixture(RecordingRouter::new()).await;
        let remote = RunnerAddress::new("127.0.0.1", 9102);
        fx.transport.unavailable(remote.clone());

        let message = OutgoingMessage::Envelope {
            envelope: envelope(6, shard(1), false),
        };
        let err = fx.dispatcher.send(&remote, &message).await.unwrap_err();
        assert!(matches!(err, ClusterError::RunnerUnavailable { .. }));
    }
}
