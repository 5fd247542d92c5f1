use cobaltmq_client::{MessageProperties, PublishedMessage};
use cobaltmq_codec::frame::{self, AMQPFieldValue, FieldTable, MethodFrameArgs};

use crate::helper;

#[tokio::test]
async fn publish_resolves_when_the_server_confirms() {
    let (client, mut server) = helper::connect().await.unwrap();

    let mut headers = FieldTable::new();
    headers.insert("x-count".into(), AMQPFieldValue::I64(42));

    let message = PublishedMessage::default().text("Hello, World!").properties(MessageProperties {
        content_type: Some("text/plain".to_string()),
        delivery_mode: Some(2),
        headers: Some(headers.clone()),
        ..Default::default()
    });

    let promise = client.basic_publish("x-logs", "info", message).await.unwrap();

    let ch = server.serve_channel_open().await.unwrap();

    // the first publish on a channel selects confirm mode
    assert_eq!(server.serve_confirm_select().await.unwrap(), ch);

    match server.recv_method().await.unwrap() {
        (_, frame::BASIC_PUBLISH, MethodFrameArgs::BasicPublish(args)) => {
            assert_eq!(args.exchange_name, "x-logs");
            assert_eq!(args.routing_key, "info");
            assert!(!args.is_mandatory());
        }
        f => panic!("{:?} is not a basic.publish", f),
    }

    let (header, body) = server.recv_content().await.unwrap();

    assert_eq!(body, b"Hello, World!".to_vec());
    assert_eq!(header.content_type, Some("text/plain".to_string()));
    assert_eq!(header.delivery_mode, Some(2));
    assert_eq!(header.headers, Some(headers));

    server
        .send(frame::BasicAckArgs::default().delivery_tag(1).frame(ch))
        .await
        .unwrap();

    promise.wait().await.unwrap();
}

#[tokio::test]
async fn mandatory_publish_without_route_fails_the_promise() {
    let (client, mut server) = helper::connect().await.unwrap();

    let promise = client
        .basic_publish("", "no-such-queue", PublishedMessage::default().text("a").mandatory(true))
        .await
        .unwrap();

    let ch = server.serve_channel_open().await.unwrap();
    server.serve_confirm_select().await.unwrap();

    match server.recv_method().await.unwrap() {
        (_, frame::BASIC_PUBLISH, MethodFrameArgs::BasicPublish(args)) => assert!(args.is_mandatory()),
        f => panic!("{:?} is not a basic.publish", f),
    }

    let _content = server.recv_content().await.unwrap();

    // the unroutable message comes back, then the confirm fails the publish
    server
        .send(
            frame::BasicReturnArgs {
                reply_code: 312,
                reply_text: "NO_ROUTE".to_string(),
                exchange_name: "".to_string(),
                routing_key: "no-such-queue".to_string(),
            }
            .frame(ch),
        )
        .await
        .unwrap();
    server.send_content(ch, b"a").await.unwrap();
    server
        .send(frame::BasicAckArgs::default().delivery_tag(1).frame(ch))
        .await
        .unwrap();

    let err = helper::to_client_error(promise.wait().await);

    assert_eq!(err.code, 312);
    assert_eq!(err.channel, Some(ch));

    // with the queue in place the same publish succeeds, the channel keeps
    // its confirm mode so no second confirm.select arrives
    let promise = client
        .basic_publish("", "no-such-queue", PublishedMessage::default().text("a").mandatory(true))
        .await
        .unwrap();

    match server.recv_method().await.unwrap() {
        (ch2, frame::BASIC_PUBLISH, _) => assert_eq!(ch2, ch),
        f => panic!("{:?} is not a basic.publish", f),
    }

    let _content = server.recv_content().await.unwrap();

    server
        .send(frame::BasicAckArgs::default().delivery_tag(2).frame(ch))
        .await
        .unwrap();

    promise.wait().await.unwrap();
}
