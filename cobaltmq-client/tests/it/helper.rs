//! A scripted AMQP peer for driving the client through an in-memory duplex
//! stream. Tests tell it what frames to expect and what to reply, so the
//! whole socket loop runs without a real server.

use std::time::Duration;

use anyhow::{bail, Result};
use cobaltmq_client::{Client, ClientError, ConnectionOpts};
use cobaltmq_codec::codec::{AMQPCodec, Frame};
use cobaltmq_codec::frame::{self, AMQPFrame, MethodFrameArgs};
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    framed: Framed<DuplexStream, AMQPCodec>,
    /// The start-ok the client sent during the handshake.
    pub start_ok: Option<frame::ConnectionStartOkArgs>,
}

/// An unconnected transport pair for tests scripting the handshake
/// themselves.
pub fn pair() -> (DuplexStream, TestServer) {
    let (client_side, server_side) = tokio::io::duplex(65_536);

    (
        client_side,
        TestServer {
            framed: Framed::new(server_side, AMQPCodec {}),
            start_ok: None,
        },
    )
}

#[allow(dead_code)]
pub async fn connect() -> Result<(Client, TestServer)> {
    connect_opts(ConnectionOpts::default()).await
}

/// Connects a client against the scripted peer, serving the whole handshake.
pub async fn connect_opts(opts: ConnectionOpts) -> Result<(Client, TestServer)> {
    let (client_side, mut server) = pair();

    let serving = tokio::spawn(async move {
        server.handshake().await?;

        Ok::<TestServer, anyhow::Error>(server)
    });

    let client = Client::connect_transport(client_side, opts).await?;
    let server = serving.await??;

    Ok((client, server))
}

#[allow(dead_code)]
pub fn to_client_error<T: std::fmt::Debug>(result: Result<T>) -> ClientError {
    result.unwrap_err().downcast::<ClientError>().unwrap()
}

impl TestServer {
    pub async fn handshake(&mut self) -> Result<()> {
        match self.recv_frame().await? {
            AMQPFrame::Header => (),
            f => bail!("{:?} is not the protocol header", f),
        }

        self.send(
            frame::ConnectionStartArgs {
                version_major: 0,
                version_minor: 9,
                properties: None,
                mechanisms: "PLAIN".to_string(),
                locales: "en_US".to_string(),
            }
            .frame(),
        )
        .await?;

        match self.recv_method().await? {
            (0, frame::CONNECTION_START_OK, MethodFrameArgs::ConnectionStartOk(args)) => {
                self.start_ok = Some(args);
            }
            f => bail!("{:?} is not a connection.start-ok", f),
        }

        self.send(frame::connection_tune(2047, 131_072, 60)).await?;

        match self.recv_method().await? {
            (0, frame::CONNECTION_TUNE_OK, _) => (),
            f => bail!("{:?} is not a connection.tune-ok", f),
        }

        match self.recv_method().await? {
            (0, frame::CONNECTION_OPEN, _) => (),
            f => bail!("{:?} is not a connection.open", f),
        }

        self.send(frame::connection_open_ok()).await
    }

    pub async fn send(&mut self, f: AMQPFrame) -> Result<()> {
        self.framed.send(Frame::Frame(f)).await?;

        Ok(())
    }

    pub async fn recv_frame(&mut self) -> Result<AMQPFrame> {
        let next = tokio::time::timeout(RECV_TIMEOUT, self.framed.next()).await;

        match next {
            Err(_) => bail!("No frame from the client within {:?}", RECV_TIMEOUT),
            Ok(None) => bail!("Client closed the stream"),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(Some(Ok(Frame::Frame(f)))) => Ok(f),
            Ok(Some(Ok(Frame::Frames(_)))) => bail!("The decoder gives one frame at a time"),
        }
    }

    /// The next method frame, skipping heartbeats.
    pub async fn recv_method(&mut self) -> Result<(frame::Channel, frame::ClassMethod, MethodFrameArgs)> {
        loop {
            match self.recv_frame().await? {
                AMQPFrame::Method(ch, cm, args) => return Ok((ch, cm, args)),
                AMQPFrame::Heartbeat(_) => continue,
                f => bail!("{:?} is not a method frame", f),
            }
        }
    }

    /// Serves the `Channel.Open` of a client needing a fresh channel.
    pub async fn serve_channel_open(&mut self) -> Result<frame::Channel> {
        match self.recv_method().await? {
            (ch, frame::CHANNEL_OPEN, _) => {
                self.send(frame::channel_open_ok(ch)).await?;

                Ok(ch)
            }
            f => bail!("{:?} is not a channel.open", f),
        }
    }

    /// Serves the `Confirm.Select` of the first publish on a channel.
    pub async fn serve_confirm_select(&mut self) -> Result<frame::Channel> {
        match self.recv_method().await? {
            (ch, frame::CONFIRM_SELECT, _) => {
                self.send(frame::confirm_select_ok(ch)).await?;

                Ok(ch)
            }
            f => bail!("{:?} is not a confirm.select", f),
        }
    }

    /// Reads a content header and as many body frames as the header
    /// declared.
    pub async fn recv_content(&mut self) -> Result<(frame::ContentHeaderFrame, Vec<u8>)> {
        let header = match self.recv_frame().await? {
            AMQPFrame::ContentHeader(header) => header,
            f => bail!("{:?} is not a content header", f),
        };

        let mut body = vec![];

        while (body.len() as u64) < header.body_size {
            match self.recv_frame().await? {
                AMQPFrame::ContentBody(cb) => body.extend_from_slice(&cb.body),
                f => bail!("{:?} is not a content body", f),
            }
        }

        Ok((header, body))
    }

    /// Pushes one delivery to a consumer: method, content header and body.
    pub async fn deliver(
        &mut self,
        ch: frame::Channel,
        consumer_tag: &str,
        delivery_tag: u64,
        body: &[u8],
    ) -> Result<()> {
        self.send(
            frame::BasicDeliverArgs::new(consumer_tag, delivery_tag, "")
                .routing_key("")
                .frame(ch),
        )
        .await?;

        self.send_content(ch, body).await
    }

    /// Replies to a `Basic.Get` with a message.
    pub async fn serve_get_ok(&mut self, ch: frame::Channel, delivery_tag: u64, redelivered: bool, body: &[u8]) -> Result<()> {
        self.send(
            frame::BasicGetOkArgs::new(delivery_tag, "")
                .redelivered(redelivered)
                .routing_key("")
                .frame(ch),
        )
        .await?;

        self.send_content(ch, body).await
    }

    pub async fn send_content(&mut self, ch: frame::Channel, body: &[u8]) -> Result<()> {
        self.send(AMQPFrame::ContentHeader(frame::ContentHeaderFrame {
            channel: ch,
            class_id: 0x3C,
            body_size: body.len() as u64,
            ..Default::default()
        }))
        .await?;

        self.send(AMQPFrame::ContentBody(frame::ContentBodyFrame {
            channel: ch,
            body: body.to_vec(),
        }))
        .await
    }
}
