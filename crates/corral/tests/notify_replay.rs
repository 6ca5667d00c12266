use corral::error::ClusterError;
use corral::message_storage::MessageStorage;
use corral::reply::{ExitResult, Reply, ReplyWithExit};
use corral::snowflake::Snowflake;
use corral::testing::TestNode;
use corral::types::RunnerAddress;

fn exit(request: i64, id: i64) -> Reply {
    Reply::WithExit(ReplyWithExit {
        request_id: Snowflake(request),
        id: Snowflake(id),
        exit: ExitResult::Success(vec![]),
    })
}

#[tokio::test]
async fn notify_nudges_the_owner_and_replays_the_reply() {
    let node = TestNode::start(9031).await;
    let remote = RunnerAddress::new("127.0.0.1", 9032);
    node.transport.accept(remote.clone());

    let (message, mut rx) = node.request(55, node.shard(2));
    node.dispatcher.notify(&remote, message, false).await.unwrap();

    // The owner was nudged, but the reply comes via replay.
    assert_eq!(node.transport.notified().len(), 1);
    node.messages.save_reply(&exit(55, 1)).await.unwrap();
    assert!(rx.recv().await.unwrap().is_final());
    node.shutdown().await;
}

#[tokio::test]
async fn notify_with_discard_does_not_wait_for_replies() {
    let node = TestNode::start(9033).await;

    let (message, mut rx) = node.request(56, node.shard(0));
    node.dispatcher
        .notify(&node.address(), message, true)
        .await
        .unwrap();

    // Delivered locally as a plain envelope; no replay entry, and the reply
    // channel is simply dropped.
    assert_eq!(node.router.delivered().len(), 1);
    assert_eq!(node.replay.pending_count(), 0);
    assert!(rx.recv().await.is_none());
    node.shutdown().await;
}

#[tokio::test]
async fn notify_failure_still_recovers_via_replay() {
    let node = TestNode::start(9035).await;
    let remote = RunnerAddress::new("127.0.0.1", 9036);
    node.transport.unavailable(remote.clone());

    let (message, mut rx) = node.request(57, node.shard(1));
    node.dispatcher.notify(&remote, message, false).await.unwrap();

    node.messages.save_reply(&exit(57, 1)).await.unwrap();
    assert!(rx.recv().await.unwrap().is_final());
    node.shutdown().await;
}

#[tokio::test]
async fn dispatch_after_shutdown_is_rejected() {
    let node = TestNode::start(9034).await;
    node.dispatcher.shutdown();

    let (message, _rx) = node.request(58, node.shard(0));
    assert!(matches!(
        node.dispatcher.dispatch(message).await,
        Err(ClusterError::ShuttingDown)
    ));
}
