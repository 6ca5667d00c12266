use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::envelope::EnvelopeRequest;
use crate::error::ClusterError;
use crate::message::ReplySender;
use crate::message_storage::{MessageStorage, SaveResult};
use crate::reply::{Reply, EXIT_SEQUENCE};
use crate::snowflake::Snowflake;

/// In-memory message storage for tests and single-node use.
pub struct MemoryMessageStorage {
    inner: Mutex<Inner>,
}

struct Inner {
    /// All stored envelopes keyed by request_id.
    messages: HashMap<Snowflake, StoredMessage>,
    /// Replies keyed by request_id.
    replies: HashMap<Snowflake, Vec<Reply>>,
    /// Live reply handlers.
    reply_handlers: HashMap<Snowflake, ReplySender>,
}

struct StoredMessage {
    #[allow(dead_code)]
    envelope: EnvelopeRequest,
    processed: bool,
}

impl MemoryMessageStorage {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                messages: HashMap::new(),
                replies: HashMap::new(),
                reply_handlers: HashMap::new(),
            }),
        }
    }

    fn prune_closed_handlers(inner: &mut Inner) {
        inner
            .reply_handlers
            .retain(|_id, sender| !sender.is_closed());
    }

    fn sorted_replies(inner: &Inner, request_id: Snowflake) -> Vec<Reply> {
        let mut replies = inner.replies.get(&request_id).cloned().unwrap_or_default();
        replies.sort_by_key(|reply| match reply {
            Reply::Chunk(chunk) => (0u8, chunk.sequence, chunk.id.0),
            Reply::WithExit(exit) => (1u8, EXIT_SEQUENCE, exit.id.0),
        });
        replies
    }

    fn duplicate(inner: &Inner, request_id: Snowflake) -> SaveResult {
        SaveResult::Duplicate {
            original_id: request_id,
            last_received_reply: Self::sorted_replies(inner, request_id).pop(),
        }
    }

    fn save(&self, envelope: &EnvelopeRequest) -> SaveResult {
        let mut inner = self.inner.lock();
        if inner.messages.contains_key(&envelope.request_id) {
            return Self::duplicate(&inner, envelope.request_id);
        }
        inner.messages.insert(
            envelope.request_id,
            StoredMessage {
                envelope: envelope.clone(),
                processed: false,
            },
        );
        SaveResult::Success
    }

    /// Whether the given request has been marked processed (final reply saved).
    pub fn is_processed(&self, request_id: Snowflake) -> bool {
        self.inner
            .lock()
            .messages
            .get(&request_id)
            .is_some_and(|m| m.processed)
    }
}

impl Default for MemoryMessageStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStorage for MemoryMessageStorage {
    async fn save_request(&self, envelope: &EnvelopeRequest) -> Result<SaveResult, ClusterError> {
        Ok(self.save(envelope))
    }

    async fn save_envelope(&self, envelope: &EnvelopeRequest) -> Result<SaveResult, ClusterError> {
        Ok(self.save(envelope))
    }

    async fn save_reply(&self, reply: &Reply) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock();
        let request_id = reply.request_id();

        Self::prune_closed_handlers(&mut inner);

        inner
            .replies
            .entry(request_id)
            .or_default()
            .push(reply.clone());

        // A final reply marks the message processed, in the same critical
        // section, so a concurrent duplicate save observes both or neither.
        if reply.is_final() {
            if let Some(msg) = inner.messages.get_mut(&request_id) {
                msg.processed = true;
            }
        }

        // Deliver to live handler if registered.
        let handler = if reply.is_final() {
            inner.reply_handlers.remove(&request_id)
        } else {
            inner.reply_handlers.get(&request_id).cloned()
        };
        if let Some(tx) = handler {
            if let Err(err) = tx.try_send(reply.clone()) {
                if matches!(err, tokio::sync::mpsc::error::TrySendError::Closed(_)) {
                    inner.reply_handlers.remove(&request_id);
                }
                tracing::debug!(
                    request_id = request_id.0,
                    "reply handler send failed — channel full or closed"
                );
            }
        }

        Ok(())
    }

    async fn replies_for(&self, request_ids: &[Snowflake]) -> Result<Vec<Reply>, ClusterError> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for &id in request_ids {
            out.extend(Self::sorted_replies(&inner, id));
        }
        Ok(out)
    }

    fn register_reply_handler(&self, request_id: Snowflake, sender: ReplySender) {
        let mut inner = self.inner.lock();
        Self::prune_closed_handlers(&mut inner);
        inner.reply_handlers.insert(request_id, sender);
    }

    fn unregister_reply_handler(&self, request_id: Snowflake) {
        self.inner.lock().reply_handlers.remove(&request_id);
    }
}
