use crate::snowflake::Snowflake;
use serde::{Deserialize, Serialize};

/// Reply types sent back from message handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    WithExit(ReplyWithExit),
    Chunk(ReplyChunk),
}

/// A final reply with an exit result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyWithExit {
    pub request_id: Snowflake,
    pub id: Snowflake,
    pub exit: ExitResult,
}

/// A streamed chunk reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyChunk {
    pub request_id: Snowflake,
    pub id: Snowflake,
    pub sequence: i32,
    /// MessagePack-encoded values.
    pub values: Vec<Vec<u8>>,
}

/// Sequence value reserved for exit replies in storage.
pub(crate) const EXIT_SEQUENCE: i32 = i32::MAX;

/// Result of processing a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExitResult {
    Success(Vec<u8>),
    Failure(String),
}

impl Reply {
    /// Get the request ID this reply is for.
    pub fn request_id(&self) -> Snowflake {
        match self {
            Reply::WithExit(r) => r.request_id,
            Reply::Chunk(r) => r.request_id,
        }
    }

    /// Whether this reply terminates the request's reply stream.
    pub fn is_final(&self) -> bool {
        matches!(self, Reply::WithExit(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_with_exit_serde_roundtrip() {
        let reply = Reply::WithExit(ReplyWithExit {
            request_id: Snowflake(100),
            id: Snowflake(200),
            exit: ExitResult::Success(vec![1, 2, 3]),
        });
        let bytes = rmp_serde::to_vec(&reply).unwrap();
        let decoded: Reply = rmp_serde::from_slice(&bytes).unwrap();
        match decoded {
            Reply::WithExit(r) => {
                assert_eq!(r.request_id, Snowflake(100));
                assert!(matches!(r.exit, ExitResult::Success(_)));
            }
            _ => panic!("expected WithExit"),
        }
    }

    #[test]
    fn exit_failure_roundtrip() {
        let reply = Reply::WithExit(ReplyWithExit {
            request_id: Snowflake(500),
            id: Snowflake(600),
            exit: ExitResult::Failure("something went wrong".into()),
        });
        let bytes = rmp_serde::to_vec(&reply).unwrap();
        let decoded: Reply = rmp_serde::from_slice(&bytes).unwrap();
        match decoded {
            Reply::WithExit(r) => match r.exit {
                ExitResult::Failure(msg) => assert_eq!(msg, "something went wrong"),
                _ => panic!("expected Failure"),
            },
            _ => panic!("expected WithExit"),
        }
    }

    #[test]
    fn is_final() {
        let chunk = Reply::Chunk(ReplyChunk {
            request_id: Snowflake(1),
            id: Snowflake(2),
            sequence: 0,
            values: vec![],
        });
        assert!(!chunk.is_final());

        let exit = Reply::WithExit(ReplyWithExit {
            request_id: Snowflake(1),
            id: Snowflake(3),
            exit: ExitResult::Success(vec![]),
        });
        assert!(exit.is_final());
    }
}
