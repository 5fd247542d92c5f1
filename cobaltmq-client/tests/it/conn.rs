use cobaltmq_client::{Client, ConnectionOpts};
use cobaltmq_codec::frame::{self, AMQPFieldValue, AMQPFrame, FieldTable, MethodFrameArgs};

use crate::helper;

#[tokio::test]
async fn connect_sends_caller_properties_verbatim() {
    let mut props = FieldTable::new();
    props.insert("app_test".into(), AMQPFieldValue::LongString("blah".into()));
    props.insert("random_prop".into(), AMQPFieldValue::I32(1234));

    let opts = ConnectionOpts::default().properties(props);
    let (client, server) = helper::connect_opts(opts).await.unwrap();

    let start_ok = server.start_ok.unwrap();
    let sent = start_ok.properties.unwrap();

    assert_eq!(sent.get("app_test"), Some(&AMQPFieldValue::LongString("blah".into())));
    assert_eq!(sent.get("random_prop"), Some(&AMQPFieldValue::I32(1234)));

    drop(client);
}

#[tokio::test]
async fn rejected_open_fails_the_connect() {
    let (client_side, mut server) = helper::pair();

    let connecting = tokio::spawn(Client::connect_transport(
        client_side,
        ConnectionOpts::default().virtual_host("/invalid"),
    ));

    assert!(matches!(server.recv_frame().await.unwrap(), AMQPFrame::Header));

    server
        .send(
            frame::ConnectionStartArgs {
                version_major: 0,
                version_minor: 9,
                properties: None,
                mechanisms: "PLAIN".to_string(),
                locales: "en_US".to_string(),
            }
            .frame(),
        )
        .await
        .unwrap();

    let _start_ok = server.recv_method().await.unwrap();

    server.send(frame::connection_tune(2047, 131_072, 60)).await.unwrap();

    let _tune_ok = server.recv_method().await.unwrap();

    match server.recv_method().await.unwrap() {
        (0, frame::CONNECTION_OPEN, MethodFrameArgs::ConnectionOpen(args)) => {
            assert_eq!(args.virtual_host, "/invalid");
        }
        f => panic!("{:?} is not a connection.open", f),
    }

    server
        .send(frame::connection_close(530, "NOT_ALLOWED", frame::CONNECTION_OPEN))
        .await
        .unwrap();

    let err = helper::to_client_error(connecting.await.unwrap());

    assert_eq!(err.channel, None);
    assert_eq!(err.code, 530);
    assert_eq!(err.class_method, frame::CONNECTION_OPEN);
}

#[tokio::test]
async fn negotiated_heartbeat_is_emitted_when_idle() {
    let opts = ConnectionOpts::default().heartbeat(1);
    let (client, mut server) = helper::connect_opts(opts).await.unwrap();

    // the client has nothing to say, a heartbeat frame must still arrive
    match server.recv_frame().await.unwrap() {
        AMQPFrame::Heartbeat(0) => (),
        f => panic!("{:?} is not a heartbeat", f),
    }

    drop(client);
}

#[tokio::test]
async fn close_round_trip() {
    let (client, mut server) = helper::connect().await.unwrap();

    let closing = tokio::spawn(client.close());

    match server.recv_method().await.unwrap() {
        (0, frame::CONNECTION_CLOSE, MethodFrameArgs::ConnectionClose(args)) => {
            assert_eq!(args.code, 200);
        }
        f => panic!("{:?} is not a connection.close", f),
    }

    server.send(frame::connection_close_ok()).await.unwrap();

    closing.await.unwrap().unwrap();
}
