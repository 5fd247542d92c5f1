use cobaltmq_client::{NoAck, Requeue, UsageError};
use cobaltmq_codec::frame::{self, MethodFrameArgs};

use crate::helper;

#[tokio::test]
async fn unacked_gets_hold_channels_and_reuse_is_lifo() {
    let (client, mut server) = helper::connect().await.unwrap();

    // two gets with pending acks occupy two channels
    let promise = client.basic_get("q-get", NoAck(false)).await.unwrap();
    let ch1 = server.serve_channel_open().await.unwrap();
    let _get = server.recv_method().await.unwrap();
    server.serve_get_ok(ch1, 1, false, b"one").await.unwrap();
    let msg1 = promise.wait().await.unwrap().unwrap();

    let promise = client.basic_get("q-get", NoAck(false)).await.unwrap();
    let ch2 = server.serve_channel_open().await.unwrap();
    let _get = server.recv_method().await.unwrap();
    server.serve_get_ok(ch2, 2, false, b"two").await.unwrap();
    let msg2 = promise.wait().await.unwrap().unwrap();

    assert_ne!(ch1, ch2);
    assert_eq!(msg1.message.body, b"one".to_vec());
    assert_eq!(msg2.message.body, b"two".to_vec());

    client.basic_ack(msg1.message.channel, msg1.delivery_tag).await.unwrap();
    client.basic_ack(msg2.message.channel, msg2.delivery_tag).await.unwrap();

    let _ack = server.recv_method().await.unwrap();
    let _ack = server.recv_method().await.unwrap();

    // both channels are back in the pool, the most recently released one is
    // reused without a channel.open
    let promise = client.basic_get("q-get", NoAck(false)).await.unwrap();

    match server.recv_method().await.unwrap() {
        (ch, frame::BASIC_GET, _) => assert_eq!(ch, ch2),
        f => panic!("{:?} is not a basic.get", f),
    }

    server.send(frame::basic_get_empty(ch2)).await.unwrap();

    assert!(promise.wait().await.unwrap().is_none());
}

#[tokio::test]
async fn double_ack_fails_loudly() {
    let (client, mut server) = helper::connect().await.unwrap();

    let promise = client.basic_get("q", NoAck(false)).await.unwrap();
    let ch = server.serve_channel_open().await.unwrap();
    let _get = server.recv_method().await.unwrap();
    server.serve_get_ok(ch, 1, false, b"a").await.unwrap();

    let msg = promise.wait().await.unwrap().unwrap();

    client.basic_ack(msg.message.channel, msg.delivery_tag).await.unwrap();

    let err = client
        .basic_ack(msg.message.channel, msg.delivery_tag)
        .await
        .unwrap_err();

    assert!(err.downcast::<UsageError>().is_ok());
}

#[tokio::test]
async fn reject_without_requeue_drops_the_message() {
    let (client, mut server) = helper::connect().await.unwrap();

    let promise = client.basic_get("q-reject", NoAck(false)).await.unwrap();
    let ch = server.serve_channel_open().await.unwrap();
    let _get = server.recv_method().await.unwrap();
    server.serve_get_ok(ch, 1, false, b"a").await.unwrap();

    let msg = promise.wait().await.unwrap().unwrap();

    assert!(!msg.redelivered);

    client
        .basic_reject(msg.message.channel, msg.delivery_tag, Requeue(false))
        .await
        .unwrap();

    match server.recv_method().await.unwrap() {
        (_, frame::BASIC_REJECT, MethodFrameArgs::BasicReject(args)) => {
            assert_eq!(args.delivery_tag, 1);
            assert!(!args.requeue);
        }
        f => panic!("{:?} is not a basic.reject", f),
    }

    // the queue does not give the message back
    let promise = client.basic_get("q-reject", NoAck(false)).await.unwrap();

    match server.recv_method().await.unwrap() {
        (ch2, frame::BASIC_GET, _) => assert_eq!(ch2, ch),
        f => panic!("{:?} is not a basic.get", f),
    }

    server.send(frame::basic_get_empty(ch)).await.unwrap();

    assert!(promise.wait().await.unwrap().is_none());
}

#[tokio::test]
async fn reject_with_requeue_redelivers() {
    let (client, mut server) = helper::connect().await.unwrap();

    let promise = client.basic_get("q-requeue", NoAck(false)).await.unwrap();
    let ch = server.serve_channel_open().await.unwrap();
    let _get = server.recv_method().await.unwrap();
    server.serve_get_ok(ch, 1, false, b"a").await.unwrap();

    let msg = promise.wait().await.unwrap().unwrap();

    client
        .basic_reject(msg.message.channel, msg.delivery_tag, Requeue(true))
        .await
        .unwrap();

    match server.recv_method().await.unwrap() {
        (_, frame::BASIC_REJECT, MethodFrameArgs::BasicReject(args)) => assert!(args.requeue),
        f => panic!("{:?} is not a basic.reject", f),
    }

    // the same message comes again, marked as redelivered
    let promise = client.basic_get("q-requeue", NoAck(false)).await.unwrap();
    let _get = server.recv_method().await.unwrap();
    server.serve_get_ok(ch, 2, true, b"a").await.unwrap();

    let msg = promise.wait().await.unwrap().unwrap();

    assert!(msg.redelivered);
    assert_eq!(msg.message.body, b"a".to_vec());
}
