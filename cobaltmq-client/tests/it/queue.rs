use std::time::Duration;

use cobaltmq_client::QueueDeclareOpts;
use cobaltmq_codec::frame::{self, AMQPFieldValue, FieldTable, MethodFrameArgs};

use crate::helper;

#[tokio::test]
async fn queue_declare_resolves_with_the_server_reply() {
    let (client, mut server) = helper::connect().await.unwrap();

    let promise = client
        .queue_declare("", QueueDeclareOpts::default().exclusive(true))
        .await
        .unwrap();

    let ch = server.serve_channel_open().await.unwrap();

    match server.recv_method().await.unwrap() {
        (ch2, frame::QUEUE_DECLARE, MethodFrameArgs::QueueDeclare(args)) => {
            assert_eq!(ch2, ch);
            // empty name, the server chooses one
            assert_eq!(args.name, "");
            assert!(args.flags.contains(frame::QueueDeclareFlags::EXCLUSIVE));
        }
        f => panic!("{:?} is not a queue.declare", f),
    }

    server
        .send(
            frame::QueueDeclareOkArgs::default()
                .name("amq.gen-123")
                .message_count(7)
                .frame(ch),
        )
        .await
        .unwrap();

    let declared = promise.wait().await.unwrap();

    assert_eq!(declared.queue, "amq.gen-123");
    assert_eq!(declared.message_count, 7);
}

#[tokio::test]
async fn declare_arguments_pass_through_opaquely() {
    let (client, mut server) = helper::connect().await.unwrap();

    let mut arguments = FieldTable::new();
    arguments.insert(
        "x-dead-letter-exchange".into(),
        AMQPFieldValue::LongString("dlx".into()),
    );

    let promise = client
        .queue_declare("q-dlx", QueueDeclareOpts::default().arguments(arguments.clone()))
        .await
        .unwrap();

    let ch = server.serve_channel_open().await.unwrap();

    match server.recv_method().await.unwrap() {
        (_, frame::QUEUE_DECLARE, MethodFrameArgs::QueueDeclare(args)) => {
            assert_eq!(args.args, Some(arguments));
        }
        f => panic!("{:?} is not a queue.declare", f),
    }

    server
        .send(frame::QueueDeclareOkArgs::default().name("q-dlx").frame(ch))
        .await
        .unwrap();

    promise.wait().await.unwrap();
}

#[tokio::test]
async fn wait_timeout_leaves_the_promise_valid() {
    let (client, mut server) = helper::connect().await.unwrap();

    let mut promise = client.queue_purge("q-purge").await.unwrap();

    // no reply yet, a short wait gives no result instead of blocking
    assert!(promise.wait_timeout(Duration::from_millis(50)).await.unwrap().is_none());

    let ch = server.serve_channel_open().await.unwrap();

    match server.recv_method().await.unwrap() {
        (_, frame::QUEUE_PURGE, _) => (),
        f => panic!("{:?} is not a queue.purge", f),
    }

    server
        .send(frame::QueuePurgeOkArgs::default().message_count(1).frame(ch))
        .await
        .unwrap();

    // the same promise can be waited again and picks up the late reply
    assert_eq!(promise.wait_timeout(Duration::from_secs(1)).await.unwrap(), Some(1));
}

#[tokio::test]
async fn failed_declare_fails_only_its_promise() {
    let (client, mut server) = helper::connect().await.unwrap();

    let promise = client
        .queue_declare("q-passive", QueueDeclareOpts::default())
        .await
        .unwrap();

    let ch = server.serve_channel_open().await.unwrap();
    let _declare = server.recv_method().await.unwrap();

    server
        .send(frame::channel_close(ch, 404, "NOT_FOUND", frame::QUEUE_DECLARE))
        .await
        .unwrap();

    let err = helper::to_client_error(promise.wait().await);

    assert_eq!(err.channel, Some(ch));
    assert_eq!(err.code, 404);
    assert_eq!(err.class_method, frame::QUEUE_DECLARE);

    match server.recv_method().await.unwrap() {
        (ch2, frame::CHANNEL_CLOSE_OK, _) => assert_eq!(ch2, ch),
        f => panic!("{:?} is not a channel.close-ok", f),
    }

    // the connection survives, the next operation reopens a channel
    let promise = client.queue_bind("q", "x", "key").await.unwrap();

    let ch = server.serve_channel_open().await.unwrap();
    let _bind = server.recv_method().await.unwrap();

    server.send(frame::queue_bind_ok(ch)).await.unwrap();

    promise.wait().await.unwrap();
}
