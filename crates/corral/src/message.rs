use crate::envelope::EnvelopeRequest;
use crate::reply::Reply;

/// Channel types for reply delivery.
pub type ReplySender = tokio::sync::mpsc::Sender<Reply>;
pub type ReplyReceiver = tokio::sync::mpsc::Receiver<Reply>;

/// Default buffering for a reply channel.
const REPLY_CHANNEL_CAPACITY: usize = 16;

/// Create a reply channel pair. The caller keeps the receiver; the sender
/// travels with the outgoing message.
pub fn reply_channel() -> (ReplySender, ReplyReceiver) {
    tokio::sync::mpsc::channel(REPLY_CHANNEL_CAPACITY)
}

/// Incoming message to be processed by an entity.
#[derive(Debug)]
pub enum IncomingMessage {
    /// A request expecting a reply.
    Request {
        request: EnvelopeRequest,
        reply_tx: ReplySender,
    },
    /// A fire-and-forget envelope (no reply channel).
    Envelope { envelope: EnvelopeRequest },
}

/// Outgoing message from a client. For requests, the dispatcher holds the
/// sender half of the reply channel; dropping the receiver cancels interest
/// in further replies.
#[derive(Debug)]
pub enum OutgoingMessage {
    /// A request with a reply channel.
    Request {
        envelope: EnvelopeRequest,
        reply_tx: ReplySender,
    },
    /// A fire-and-forget envelope.
    Envelope { envelope: EnvelopeRequest },
}

impl IncomingMessage {
    /// Get the envelope request regardless of variant.
    pub fn envelope(&self) -> &EnvelopeRequest {
        match self {
            IncomingMessage::Request { request, .. } => request,
            IncomingMessage::Envelope { envelope } => envelope,
        }
    }
}

impl OutgoingMessage {
    /// Get the envelope request regardless of variant.
    pub fn envelope(&self) -> &EnvelopeRequest {
        match self {
            OutgoingMessage::Request { envelope, .. } => envelope,
            OutgoingMessage::Envelope { envelope } => envelope,
        }
    }

    /// Mutable access, used when a duplicate submission is rewritten to the
    /// originally persisted request ID.
    pub fn envelope_mut(&mut self) -> &mut EnvelopeRequest {
        match self {
            OutgoingMessage::Request { envelope, .. } => envelope,
            OutgoingMessage::Envelope { envelope } => envelope,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, OutgoingMessage::Request { .. })
    }

    /// Deliver a reply to the caller, if this is a request and the caller is
    /// still listening. A closed receiver means the caller cancelled.
    pub async fn respond(&self, reply: Reply) {
        if let OutgoingMessage::Request { reply_tx, .. } = self {
            let _ = reply_tx.send(reply).await;
        }
    }
}
