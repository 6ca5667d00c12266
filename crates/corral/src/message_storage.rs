use async_trait::async_trait;

use crate::envelope::EnvelopeRequest;
use crate::error::ClusterError;
use crate::message::ReplySender;
use crate::reply::Reply;
use crate::snowflake::Snowflake;

/// Result of saving a message to storage.
#[derive(Debug)]
pub enum SaveResult {
    /// Message saved successfully.
    Success,
    /// A message with the same identity was persisted before.
    Duplicate {
        /// Request ID under which the message was originally persisted.
        /// May differ from the resubmitted ID when the backend dedups on a
        /// logical envelope key.
        original_id: Snowflake,
        /// The most recent reply already recorded for the original request,
        /// if any. A final reply here means the request already completed.
        last_received_reply: Option<Reply>,
    },
}

/// Persistent message storage for effectively-once delivery.
///
/// Implementations are external collaborators. (De)serialization failures
/// are `MalformedMessage` and must not be retried; I/O failures are
/// `PersistenceError`.
#[async_trait]
pub trait MessageStorage: Send + Sync {
    /// Save a request envelope. Returns `Duplicate` if it was saved before.
    async fn save_request(&self, envelope: &EnvelopeRequest) -> Result<SaveResult, ClusterError>;

    /// Save a fire-and-forget envelope. Returns `Duplicate` if it was saved before.
    async fn save_envelope(&self, envelope: &EnvelopeRequest) -> Result<SaveResult, ClusterError>;

    /// Save a reply produced by a handler.
    async fn save_reply(&self, reply: &Reply) -> Result<(), ClusterError>;

    /// Get all recorded replies for the given request IDs, ordered by
    /// sequence within each request. Batched: the replay engine issues one
    /// call per poll tick covering every pending request.
    async fn replies_for(&self, request_ids: &[Snowflake]) -> Result<Vec<Reply>, ClusterError>;

    /// Register a reply handler for real-time reply delivery. Replies saved
    /// for `request_id` are pushed into `sender` as they arrive.
    fn register_reply_handler(&self, request_id: Snowflake, sender: ReplySender);

    /// Unregister a reply handler.
    fn unregister_reply_handler(&self, request_id: Snowflake);
}
