use std::time::Duration;

use corral::error::ClusterError;
use corral::lease::LeaseStorage;
use corral::message::{reply_channel, OutgoingMessage};
use corral::message_storage::MessageStorage;
use corral::reply::{ExitResult, Reply, ReplyChunk, ReplyWithExit};
use corral::snowflake::Snowflake;
use corral::testing::{envelope, TestNode};
use corral::types::RunnerAddress;

fn chunk(request: i64, id: i64, sequence: i32) -> Reply {
    Reply::Chunk(ReplyChunk {
        request_id: Snowflake(request),
        id: Snowflake(id),
        sequence,
        values: vec![],
    })
}

fn exit(request: i64, id: i64) -> Reply {
    Reply::WithExit(ReplyWithExit {
        request_id: Snowflake(request),
        id: Snowflake(id),
        exit: ExitResult::Success(vec![7]),
    })
}

#[tokio::test]
async fn remote_failure_falls_back_to_storage_replay() {
    let node = TestNode::start(9001).await;
    let remote = RunnerAddress::new("127.0.0.1", 9002);

    // Another runner holds shard 1's lease but is unreachable.
    node.leases
        .acquire(&remote, &[node.shard(1)])
        .await
        .unwrap();
    node.transport.unavailable(remote.clone());
    tokio::time::sleep(Duration::from_millis(100)).await; // routing cache reconcile

    let (message, mut rx) = node.request(42, node.shard(1));
    node.dispatcher.dispatch(message).await.unwrap();

    // The message is durable; the owner (notionally) processes it and
    // records its replies. The caller gets them via replay, in order,
    // exactly once.
    node.messages.save_reply(&chunk(42, 1, 0)).await.unwrap();
    node.messages.save_reply(&exit(42, 2)).await.unwrap();

    let first = rx.recv().await.unwrap();
    assert!(!first.is_final());
    let second = rx.recv().await.unwrap();
    assert!(second.is_final());
    assert!(rx.recv().await.is_none());

    // Nothing ever made it onto the wire.
    assert!(node.transport.sent().is_empty());
    node.shutdown().await;
}

#[tokio::test]
async fn transient_request_with_unknown_owner_is_rejected() {
    let node = TestNode::start(9003).await;

    let (tx, _rx) = reply_channel();
    let message = OutgoingMessage::Request {
        envelope: envelope(10, node.shard(3), false),
        reply_tx: tx,
    };
    let err = node.dispatcher.dispatch(message).await.unwrap_err();
    assert!(matches!(
        err,
        ClusterError::EntityNotAssignedToRunner { .. }
    ));
    node.shutdown().await;
}

#[tokio::test]
async fn persisted_envelope_with_unknown_owner_is_accepted() {
    let node = TestNode::start(9004).await;

    let message = node.envelope(11, node.shard(3));
    node.dispatcher.dispatch(message).await.unwrap();

    // Durable and waiting for whoever takes the shard; nothing sent.
    assert!(node.transport.sent().is_empty());
    assert!(node.transport.notified().is_empty());
    node.shutdown().await;
}
