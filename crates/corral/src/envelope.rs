use crate::snowflake::Snowflake;
use crate::types::EntityAddress;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tagged enum for messages on the wire between runners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Envelope {
    Request(EnvelopeRequest),
    AckChunk(AckChunk),
    Interrupt(Interrupt),
}

/// A request envelope sent between runners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeRequest {
    pub request_id: Snowflake,
    pub address: EntityAddress,
    /// RPC method name.
    pub tag: String,
    /// MessagePack-encoded request body.
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    /// Whether this message should be persisted to storage before delivery.
    #[serde(default)]
    pub persisted: bool,
}

/// Acknowledgement of a streamed chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckChunk {
    pub request_id: Snowflake,
    pub id: Snowflake,
    pub sequence: i32,
}

/// Request to interrupt processing of an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interrupt {
    pub request_id: Snowflake,
    pub address: EntityAddress,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityId, EntityType, ShardId};

    fn sample_request() -> EnvelopeRequest {
        EnvelopeRequest {
            request_id: Snowflake(1000),
            address: EntityAddress {
                shard_id: ShardId::new("default", 1),
                entity_type: EntityType::new("User"),
                entity_id: EntityId::new("u-1"),
            },
            tag: "getProfile".into(),
            payload: vec![1, 2, 3],
            headers: HashMap::from([("x-trace".into(), "abc".into())]),
            persisted: false,
        }
    }

    #[test]
    fn envelope_request_serde_roundtrip() {
        let req = sample_request();
        let bytes = rmp_serde::to_vec(&Envelope::Request(req.clone())).unwrap();
        let decoded: Envelope = rmp_serde::from_slice(&bytes).unwrap();
        match decoded {
            Envelope::Request(r) => {
                assert_eq!(r.request_id, req.request_id);
                assert_eq!(r.tag, req.tag);
                assert_eq!(r.payload, req.payload);
            }
            _ => panic!("expected Request variant"),
        }
    }

    #[test]
    fn envelope_request_preserves_persisted_flag() {
        let mut req = sample_request();
        req.persisted = true;

        let bytes = rmp_serde::to_vec(&Envelope::Request(req)).unwrap();
        let decoded: Envelope = rmp_serde::from_slice(&bytes).unwrap();
        match decoded {
            Envelope::Request(r) => assert!(r.persisted),
            _ => panic!("expected Request variant"),
        }
    }

    #[test]
    fn interrupt_serde_roundtrip() {
        let int = Interrupt {
            request_id: Snowflake(300),
            address: EntityAddress {
                shard_id: ShardId::new("default", 2),
                entity_type: EntityType::new("Order"),
                entity_id: EntityId::new("o-1"),
            },
        };
        let bytes = rmp_serde::to_vec(&Envelope::Interrupt(int.clone())).unwrap();
        let decoded: Envelope = rmp_serde::from_slice(&bytes).unwrap();
        match decoded {
            Envelope::Interrupt(i) => {
                assert_eq!(i.request_id, int.request_id);
                assert_eq!(i.address, int.address);
            }
            _ => panic!("expected Interrupt variant"),
        }
    }
}
