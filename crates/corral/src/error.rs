use crate::snowflake::Snowflake;
use crate::types::{EntityAddress, EntityId, EntityType, RunnerAddress};

/// Errors that can occur in the cluster system.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("entity {entity_type}/{entity_id} not assigned to this runner")]
    EntityNotAssignedToRunner {
        entity_type: EntityType,
        entity_id: EntityId,
    },

    #[error("malformed message: {reason}")]
    MalformedMessage {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("persistence error: {reason}")]
    PersistenceError {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("runner unavailable: {address}")]
    RunnerUnavailable {
        address: RunnerAddress,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("mailbox full for {address}")]
    MailboxFull { address: EntityAddress },

    #[error("already processing message {request_id}")]
    AlreadyProcessingMessage { request_id: Snowflake },

    #[error("cluster is shutting down")]
    ShuttingDown,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error(transparent)]
    ClockDriftExceeded(#[from] crate::snowflake::SnowflakeError),
}
