use std::time::Duration;

use cobaltmq_client::{ConsumeOpts, ConsumerSignal};
use cobaltmq_codec::frame::{self, MethodFrameArgs};

use crate::helper;

#[tokio::test]
async fn one_subscription_resolves_once_per_message() {
    let (client, mut server) = helper::connect().await.unwrap();

    let promise = client.basic_consume("q-consume", ConsumeOpts::default()).await.unwrap();

    let ch = server.serve_channel_open().await.unwrap();

    let consumer_tag = match server.recv_method().await.unwrap() {
        (_, frame::BASIC_CONSUME, MethodFrameArgs::BasicConsume(args)) => {
            assert_eq!(args.queue, "q-consume");

            args.consumer_tag
        }
        f => panic!("{:?} is not a basic.consume", f),
    };

    server
        .send(frame::BasicConsumeOkArgs::new(&consumer_tag).frame(ch))
        .await
        .unwrap();

    let mut consumer = promise.wait().await.unwrap();

    assert_eq!(consumer.channel, ch);
    assert_eq!(consumer.consumer_tag, consumer_tag);

    // two publishes, the one subscription resolves twice, in publish order
    server.deliver(ch, &consumer_tag, 1, b"first").await.unwrap();
    server.deliver(ch, &consumer_tag, 2, b"second").await.unwrap();

    for expected in [&b"first"[..], &b"second"[..]] {
        match consumer.next().await {
            Some(ConsumerSignal::Delivered(dm)) => {
                assert_eq!(dm.message.body, expected.to_vec());

                client.basic_ack(dm.message.channel, dm.delivery_tag).await.unwrap();
            }
            other => panic!("{:?} is not a delivery", other),
        }
    }

    // nothing else was published, a short wait gives no result
    assert!(consumer.receive(Duration::from_millis(50)).await.is_none());

    let cancelled = consumer.cancel().await.unwrap();

    match server.recv_method().await.unwrap() {
        (_, frame::BASIC_ACK, _) => (),
        f => panic!("{:?} is not a basic.ack", f),
    }
    match server.recv_method().await.unwrap() {
        (_, frame::BASIC_ACK, _) => (),
        f => panic!("{:?} is not a basic.ack", f),
    }

    match server.recv_method().await.unwrap() {
        (_, frame::BASIC_CANCEL, MethodFrameArgs::BasicCancel(args)) => {
            assert_eq!(args.consumer_tag, consumer_tag);
        }
        f => panic!("{:?} is not a basic.cancel", f),
    }

    server
        .send(frame::BasicCancelOkArgs::new(&consumer_tag).frame(ch))
        .await
        .unwrap();

    assert_eq!(cancelled.wait().await.unwrap(), consumer_tag);
    assert!(matches!(consumer.next().await, Some(ConsumerSignal::Cancelled)));
}

#[tokio::test]
async fn prefetch_limits_deliveries_until_raised() {
    let (client, mut server) = helper::connect().await.unwrap();

    // three messages wait in the queue but prefetch is 1
    let promise = client
        .basic_consume("q-qos", ConsumeOpts::default().prefetch_count(1))
        .await
        .unwrap();

    let ch = server.serve_channel_open().await.unwrap();

    match server.recv_method().await.unwrap() {
        (_, frame::BASIC_QOS, MethodFrameArgs::BasicQos(args)) => {
            assert_eq!(args.prefetch_count, 1);
        }
        f => panic!("{:?} is not a basic.qos", f),
    }

    server.send(frame::basic_qos_ok(ch)).await.unwrap();

    let consumer_tag = match server.recv_method().await.unwrap() {
        (_, frame::BASIC_CONSUME, MethodFrameArgs::BasicConsume(args)) => args.consumer_tag,
        f => panic!("{:?} is not a basic.consume", f),
    };

    server
        .send(frame::BasicConsumeOkArgs::new(&consumer_tag).frame(ch))
        .await
        .unwrap();

    let mut consumer = promise.wait().await.unwrap();

    // the server honors prefetch=1 and pushes a single message
    server.deliver(ch, &consumer_tag, 1, b"a").await.unwrap();

    match consumer.receive(Duration::from_millis(100)).await {
        Some(ConsumerSignal::Delivered(dm)) => assert_eq!(dm.message.body, b"a".to_vec()),
        other => panic!("{:?} is not a delivery", other),
    }

    // the limit is reached, a short wait returns no result instead of
    // blocking forever
    assert!(consumer.receive(Duration::from_millis(100)).await.is_none());

    // raising the limit lets the next message through
    let qos = consumer.qos(2).await.unwrap();

    match server.recv_method().await.unwrap() {
        (_, frame::BASIC_QOS, MethodFrameArgs::BasicQos(args)) => {
            assert_eq!(args.prefetch_count, 2);
        }
        f => panic!("{:?} is not a basic.qos", f),
    }

    server.send(frame::basic_qos_ok(ch)).await.unwrap();
    qos.wait().await.unwrap();

    server.deliver(ch, &consumer_tag, 2, b"b").await.unwrap();

    match consumer.receive(Duration::from_millis(100)).await {
        Some(ConsumerSignal::Delivered(dm)) => assert_eq!(dm.message.body, b"b".to_vec()),
        other => panic!("{:?} is not a delivery", other),
    }
}

#[tokio::test]
async fn connection_close_reaches_the_consumer() {
    let (client, mut server) = helper::connect().await.unwrap();

    let promise = client.basic_consume("q", ConsumeOpts::default()).await.unwrap();

    let ch = server.serve_channel_open().await.unwrap();

    let consumer_tag = match server.recv_method().await.unwrap() {
        (_, frame::BASIC_CONSUME, MethodFrameArgs::BasicConsume(args)) => args.consumer_tag,
        f => panic!("{:?} is not a basic.consume", f),
    };

    server
        .send(frame::BasicConsumeOkArgs::new(&consumer_tag).frame(ch))
        .await
        .unwrap();

    let mut consumer = promise.wait().await.unwrap();

    server
        .send(frame::connection_close(320, "CONNECTION_FORCED", 0))
        .await
        .unwrap();

    match consumer.next().await {
        Some(ConsumerSignal::ConnectionClosed(err)) => {
            assert_eq!(err.code, 320);
            assert_eq!(err.channel, None);
        }
        other => panic!("{:?} is not a connection close signal", other),
    }

    drop(client);
}
