use std::time::Duration;

use anyhow::Result;
use cobaltmq_codec::{
    codec::{AMQPCodec, Frame},
    frame::{self, AMQPFrame},
};
use futures::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use log::{debug, error, trace};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::codec::Framed;

use crate::{
    client_api::Command,
    error::ClientError,
    state::{self, ClientState},
};

/// One iteration of this loop is the pump step: it reads a decoded frame or
/// a client command, dispatches it into the state machine which resolves the
/// matching promise, and goes back to sleep. The channel table and the
/// promise routing are touched nowhere else.
pub(crate) async fn socket_loop<T>(transport: T, mut commands: mpsc::Receiver<Command>) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, mut stream) = Framed::new(transport, AMQPCodec {}).split();
    let (out_tx, out_rx) = mpsc::channel(16);
    let mut client = state::new(out_tx);

    // I/O output port, handles outgoing frames sent via a channel.
    tokio::spawn(async move {
        if let Err(e) = handle_outgoing(sink, out_rx).await {
            error!("Error {:?}", e);
        }
    });

    // Rebuilt once the tune round trip fixes the real interval.
    let mut heartbeat_interval: Option<Duration> = None;
    let mut heartbeat = tokio::time::interval(Duration::from_secs(60));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_received = Instant::now();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Frame::Frame(frame))) => {
                        last_received = Instant::now();

                        handle_in_frame(frame, &mut client).await?;
                    }
                    Some(Ok(Frame::Frames(frames))) => {
                        last_received = Instant::now();

                        for frame in frames {
                            handle_in_frame(frame, &mut client).await?;
                        }
                    }
                    Some(Err(e)) => {
                        // a malformed frame poisons the whole connection
                        error!("Frame decode error {:?}", e);

                        client.fail_all(&ClientError {
                            channel: None,
                            code: 501,
                            message: format!("Frame error: {}", e),
                            class_method: 0,
                        });

                        return Err(anyhow::Error::new(e));
                    }
                    None => {
                        trace!("Connection is closed by peer");

                        client.fail_all(&ClientError {
                            channel: None,
                            code: 501,
                            message: "Connection closed by peer".to_string(),
                            class_method: 0,
                        });

                        break;
                    }
                }
            }
            command = commands.recv() => {
                match command {
                    Some(command) => {
                        client.handle_command(command).await?;
                    }
                    None => {
                        // the Client handle is dropped, stop pumping
                        trace!("Client request stream is closed");

                        break;
                    }
                }
            }
            _ = heartbeat.tick(), if heartbeat_interval.is_some() => {
                let interval = heartbeat_interval.unwrap();

                if last_received.elapsed() > interval * 2 {
                    error!("No frame from the server for {:?}, connection is dead", last_received.elapsed());

                    let err = ClientError {
                        channel: None,
                        code: 501,
                        message: "Heartbeat timeout".to_string(),
                        class_method: 0,
                    };

                    client.fail_all(&err);

                    return Err(anyhow::Error::new(err));
                }

                client.send_heartbeat().await?;
            }
        }

        if client.is_closed() {
            break;
        }

        if heartbeat_interval != client.heartbeat() {
            heartbeat_interval = client.heartbeat();

            if let Some(interval) = heartbeat_interval {
                heartbeat = tokio::time::interval(interval);
                heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            }
        }
    }

    Ok(())
}

async fn handle_outgoing<T>(
    mut sink: SplitSink<Framed<T, AMQPCodec>, Frame>,
    mut outgoing: mpsc::Receiver<Frame>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(f) = outgoing.recv().await {
        trace!("Outgoing {:?}", f);

        if let Err(e) = sink.send(f).await {
            error!("Error {:?}", e);
        }
    }

    Ok(())
}

async fn handle_in_frame(f: AMQPFrame, cs: &mut ClientState) -> Result<()> {
    debug!("Incoming frame {:?}", f);

    match f {
        AMQPFrame::Header => Ok(()),
        AMQPFrame::Method(ch, cm, args) => handle_in_method_frame(ch, cm, args, cs).await,
        AMQPFrame::ContentHeader(header) => cs.content_header(header).await,
        AMQPFrame::ContentBody(body) => cs.content_body(body).await,
        AMQPFrame::Heartbeat(_) => Ok(()),
    }
}

/// Handle AMQP frames coming from the server side
async fn handle_in_method_frame(
    channel: frame::Channel,
    cm: frame::ClassMethod,
    ma: frame::MethodFrameArgs,
    cs: &mut ClientState,
) -> Result<()> {
    use frame::MethodFrameArgs::*;

    match ma {
        ConnectionStart(args) => cs.connection_start(args).await,
        ConnectionTune(args) => cs.connection_tune(args).await,
        ConnectionOpenOk => cs.connection_open_ok().await,
        ConnectionClose(args) => cs.handle_connection_close(args).await,
        ConnectionCloseOk => cs.connection_close_ok().await,
        ChannelOpenOk => cs.channel_open_ok(channel).await,
        ChannelClose(args) => cs.handle_channel_close(channel, args).await,
        ExchangeDeclareOk => cs.exchange_declare_ok(channel).await,
        ExchangeDeleteOk => cs.exchange_delete_ok(channel).await,
        QueueDeclareOk(args) => cs.queue_declare_ok(channel, args).await,
        QueueBindOk => cs.queue_bind_ok(channel).await,
        QueueUnbindOk => cs.queue_unbind_ok(channel).await,
        QueuePurgeOk(args) => cs.queue_purge_ok(channel, args).await,
        QueueDeleteOk(args) => cs.queue_delete_ok(channel, args).await,
        BasicQosOk => cs.basic_qos_ok(channel).await,
        BasicConsumeOk(args) => cs.basic_consume_ok(channel, args).await,
        BasicCancelOk(args) => cs.basic_cancel_ok(channel, args).await,
        BasicCancel(args) => cs.on_basic_cancel(channel, args).await,
        BasicDeliver(args) => cs.basic_deliver(channel, args).await,
        BasicGetOk(args) => cs.basic_get_ok(channel, args).await,
        BasicGetEmpty => cs.basic_get_empty(channel).await,
        BasicReturn(args) => cs.basic_return(channel, args).await,
        BasicAck(args) => cs.on_basic_ack(channel, args).await,
        ConfirmSelectOk => cs.confirm_select_ok(channel).await,
        _ => cs.unknown_method(channel, cm).await,
    }
}
