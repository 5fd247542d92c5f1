//! `state` module holds the per-connection protocol state machine. Commands
//! from the client api side and AMQP frames from the server side meet here:
//! a command grabs a channel, sends its method frame and leaves a pending
//! operation behind; the matching reply resolves the promise of the caller.
//!
//! Everything mutable lives inside the connection task, so there is exactly
//! one writer of the channel table and the promise routing at any time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use anyhow::Result;
use cobaltmq_codec::{
    codec::Frame,
    frame::{self, AMQPFrame},
};
use log::{error, trace, warn};
use tokio::sync::mpsc;

use crate::{
    client_api::{Command, QueueDeclared},
    client_error,
    usage_error,
    consumer::{Consumer, ConsumerSignal, ConsumerSink},
    error::{ClientError, UsageError},
    message::{self, Content, DeliveredMessage, GetMessage, Message, PublishedMessage, ReturnedMessage},
    model::ChannelNumber,
    pool::{Acquired, ChannelPool},
    promise::PromiseResolver,
};

const DEFAULT_CHANNEL_MAX: u16 = 2047;
const DEFAULT_FRAME_MAX: u32 = 131_072;

/// Overhead of a content body frame: type, channel, length and the frame end
/// octet.
const FRAME_OVERHEAD: usize = 8;

#[derive(Debug, PartialEq)]
enum Phase {
    Uninitialized,
    Connected,
    Authenticated,
    Closed,
}

/// A synchronous operation occupying a channel. At most one of these is
/// outstanding per channel; a consumer receives deliveries besides it.
enum PendingOp {
    /// `Channel.Open` is in flight, the boxed command runs when it succeeds.
    Opening(Box<Command>),
    /// `Confirm.Select` is in flight before the first publish on the channel.
    SelectingConfirm(Box<Command>),
    /// `Basic.Qos` is in flight before the consume it belongs to.
    SettingPrefetch(Box<Command>),
    /// A request method was sent, exactly one matching reply is expected.
    Rpc(PendingRpc),
    /// A publish went out on a confirm mode channel, `Basic.Ack` or a
    /// preceding `Basic.Return` decides the outcome.
    WaitingConfirm(PromiseResolver<()>),
}

enum PendingRpc {
    ExchangeDeclare(PromiseResolver<()>),
    ExchangeDelete(PromiseResolver<()>),
    QueueDeclare(PromiseResolver<QueueDeclared>),
    QueueBind(PromiseResolver<()>),
    QueueUnbind(PromiseResolver<()>),
    QueuePurge(PromiseResolver<u32>),
    QueueDelete(PromiseResolver<u32>),
    StartConsume {
        handle: Consumer,
        sink: ConsumerSink,
        no_ack: bool,
        resolver: PromiseResolver<Consumer>,
    },
    CancelConsume(PromiseResolver<String>),
    Get {
        no_ack: bool,
        resolver: PromiseResolver<Option<GetMessage>>,
    },
    Qos(PromiseResolver<()>),
}

struct ConsumerSlot {
    consumer_tag: String,
    no_ack: bool,
    sink: ConsumerSink,
}

/// Everything the connection knows about one open channel. The slot survives
/// while the channel is open on the wire, also between two operations, so
/// channel scoped negotiations like confirm mode are done only once.
#[derive(Default)]
struct ChannelSlot {
    pending: Option<PendingOp>,
    consumer: Option<ConsumerSlot>,
    confirm_mode: bool,
    /// Delivery tags not yet acked or rejected. The channel is not released
    /// to the pool until this is empty.
    unacked: HashSet<u64>,
    /// A `Basic.Return` arrived, the `Basic.Ack` pairing it fails the
    /// publish promise with this code and text.
    returned: Option<(u16, String)>,
}

impl ChannelSlot {
    fn is_idle(&self) -> bool {
        self.pending.is_none() && self.consumer.is_none() && self.unacked.is_empty()
    }
}

/// A content being delivered by content frames, building step by step.
#[derive(Debug)]
struct DeliveredContent {
    message: Message,
    body_size: u64,
}

enum Settlement {
    Ack,
    Reject { requeue: bool },
    Nack { multiple: bool, requeue: bool },
}

pub(crate) struct ClientState {
    phase: Phase,
    username: String,
    password: String,
    virtual_host: String,
    client_properties: Option<frame::FieldTable>,
    requested_heartbeat: Option<u16>,
    channel_max: u16,
    frame_max: u32,
    heartbeat: Option<Duration>,
    /// Notified when the connection opening process finishes.
    connected: Option<PromiseResolver<()>>,
    /// Notified when a client initiated close is confirmed by the server.
    closing: Option<PromiseResolver<()>>,
    pool: ChannelPool,
    channels: HashMap<ChannelNumber, ChannelSlot>,
    /// Content frames follow a `Basic.Deliver`, `Basic.GetOk` or
    /// `Basic.Return`; the partial message is collected here until the body
    /// frames sum up to the size the content header declared.
    in_delivery: HashMap<ChannelNumber, DeliveredContent>,
    /// Commands waiting for a free channel. They run in arrival order as
    /// channels are released.
    backlog: VecDeque<Command>,
    outgoing: mpsc::Sender<Frame>,
}

impl std::fmt::Debug for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ClientState {{ phase={:?}, virtual_host={}, channels={} }}",
            &self.phase,
            &self.virtual_host,
            self.channels.len()
        )
    }
}

pub(crate) fn new(outgoing: mpsc::Sender<Frame>) -> ClientState {
    ClientState {
        phase: Phase::Uninitialized,
        username: "".to_owned(),
        password: "".to_owned(),
        virtual_host: "/".to_owned(),
        client_properties: None,
        requested_heartbeat: None,
        channel_max: DEFAULT_CHANNEL_MAX,
        frame_max: DEFAULT_FRAME_MAX,
        heartbeat: None,
        connected: None,
        closing: None,
        pool: ChannelPool::new(DEFAULT_CHANNEL_MAX),
        channels: HashMap::new(),
        in_delivery: HashMap::new(),
        backlog: VecDeque::new(),
        outgoing,
    }
}

impl ClientState {
    pub(crate) fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    pub(crate) fn heartbeat(&self) -> Option<Duration> {
        self.heartbeat
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.outgoing.send(frame).await.is_err() {
            return client_error!(None, 501, "Connection closed by peer", 0);
        }

        Ok(())
    }

    pub(crate) async fn send_heartbeat(&self) -> Result<()> {
        self.send_frame(Frame::Frame(frame::heartbeat())).await
    }

    // ------------------------------------------------------------------
    // Commands arriving from the client api
    // ------------------------------------------------------------------

    pub(crate) async fn handle_command(&mut self, command: Command) -> Result<()> {
        trace!("Client command {:?}", command);

        if self.is_closed() {
            fail_command(
                command,
                &ClientError {
                    channel: None,
                    code: 501,
                    message: "Connection is closed".to_string(),
                    class_method: 0,
                },
            );

            return Ok(());
        }

        match command {
            Command::Connect {
                username,
                password,
                virtual_host,
                properties,
                heartbeat,
                connected,
            } => {
                self.username = username;
                self.password = password;
                self.virtual_host = virtual_host;
                self.client_properties = properties;
                self.requested_heartbeat = heartbeat;
                self.connected = Some(connected);

                self.send_frame(Frame::Frame(AMQPFrame::Header)).await
            }
            Command::Ack {
                channel,
                delivery_tag,
                resolver,
            } => self.settle(channel, delivery_tag, Settlement::Ack, resolver).await,
            Command::Reject {
                channel,
                delivery_tag,
                requeue,
                resolver,
            } => {
                self.settle(channel, delivery_tag, Settlement::Reject { requeue }, resolver)
                    .await
            }
            Command::Nack {
                channel,
                delivery_tag,
                multiple,
                requeue,
                resolver,
            } => {
                self.settle(channel, delivery_tag, Settlement::Nack { multiple, requeue }, resolver)
                    .await
            }
            Command::Qos {
                channel,
                prefetch_count,
                resolver,
            } => self.update_qos(channel, prefetch_count, resolver).await,
            Command::CancelConsume {
                channel,
                consumer_tag,
                resolver,
            } => self.cancel_consume(channel, consumer_tag, resolver).await,
            Command::Close { resolver } => {
                self.closing = Some(resolver);

                self.send_frame(Frame::Frame(frame::connection_close(200, "Normal close", 0)))
                    .await
            }
            other => self.assign_channel(other).await,
        }
    }

    /// Gives the command a channel, or queues it until one is released.
    async fn assign_channel(&mut self, command: Command) -> Result<()> {
        match self.pool.acquire() {
            None => {
                trace!("Channel pool exhausted, queuing {:?}", command);
                self.backlog.push_back(command);

                Ok(())
            }
            Some(acquired) => self.place_command(acquired, command).await,
        }
    }

    async fn place_command(&mut self, acquired: Acquired, command: Command) -> Result<()> {
        match acquired {
            Acquired::Reused(ch) => self.start_command(ch, command).await,
            Acquired::Fresh(ch) => {
                let slot = ChannelSlot {
                    pending: Some(PendingOp::Opening(Box::new(command))),
                    ..Default::default()
                };

                self.channels.insert(ch, slot);

                self.send_frame(Frame::Frame(frame::channel_open(ch))).await
            }
        }
    }

    /// Sends the method frame of the command on an open channel and registers
    /// what reply resolves it.
    async fn start_command(&mut self, ch: ChannelNumber, command: Command) -> Result<()> {
        match command {
            Command::ExchangeDeclare { args, resolver } => {
                self.send_frame(Frame::Frame(args.frame(ch))).await?;
                self.set_pending(ch, PendingOp::Rpc(PendingRpc::ExchangeDeclare(resolver)));
            }
            Command::ExchangeDelete { args, resolver } => {
                self.send_frame(Frame::Frame(args.frame(ch))).await?;
                self.set_pending(ch, PendingOp::Rpc(PendingRpc::ExchangeDelete(resolver)));
            }
            Command::QueueDeclare { args, resolver } => {
                self.send_frame(Frame::Frame(args.frame(ch))).await?;
                self.set_pending(ch, PendingOp::Rpc(PendingRpc::QueueDeclare(resolver)));
            }
            Command::QueueBind { args, resolver } => {
                self.send_frame(Frame::Frame(args.frame(ch))).await?;
                self.set_pending(ch, PendingOp::Rpc(PendingRpc::QueueBind(resolver)));
            }
            Command::QueueUnbind { args, resolver } => {
                self.send_frame(Frame::Frame(args.frame(ch))).await?;
                self.set_pending(ch, PendingOp::Rpc(PendingRpc::QueueUnbind(resolver)));
            }
            Command::QueuePurge { args, resolver } => {
                self.send_frame(Frame::Frame(args.frame(ch))).await?;
                self.set_pending(ch, PendingOp::Rpc(PendingRpc::QueuePurge(resolver)));
            }
            Command::QueueDelete { args, resolver } => {
                self.send_frame(Frame::Frame(args.frame(ch))).await?;
                self.set_pending(ch, PendingOp::Rpc(PendingRpc::QueueDelete(resolver)));
            }
            Command::Get { queue, no_ack, resolver } => {
                let f = frame::BasicGetArgs::new(&queue).no_ack(no_ack).frame(ch);

                self.send_frame(Frame::Frame(f)).await?;
                self.set_pending(ch, PendingOp::Rpc(PendingRpc::Get { no_ack, resolver }));
            }
            Command::Consume {
                queue,
                no_ack,
                exclusive,
                no_local,
                prefetch_count,
                arguments,
                sink,
                handle,
                resolver,
            } => {
                if let Some(count) = prefetch_count {
                    // prefetch first, the consume frame goes out after Basic.QosOk
                    let qos = frame::BasicQosArgs::default().prefetch_count(count).frame(ch);

                    self.send_frame(Frame::Frame(qos)).await?;
                    self.set_pending(
                        ch,
                        PendingOp::SettingPrefetch(Box::new(Command::Consume {
                            queue,
                            no_ack,
                            exclusive,
                            no_local,
                            prefetch_count: None,
                            arguments,
                            sink,
                            handle,
                            resolver,
                        })),
                    );
                } else {
                    let f = frame::BasicConsumeArgs::default()
                        .queue(&queue)
                        .consumer_tag(&handle.consumer_tag)
                        .no_ack(no_ack)
                        .exclusive(exclusive)
                        .no_local(no_local)
                        .args(arguments)
                        .frame(ch);

                    self.send_frame(Frame::Frame(f)).await?;
                    self.set_pending(
                        ch,
                        PendingOp::Rpc(PendingRpc::StartConsume {
                            handle,
                            sink,
                            no_ack,
                            resolver,
                        }),
                    );
                }
            }
            Command::Publish {
                exchange,
                routing_key,
                message,
                resolver,
            } => {
                let confirm_mode = self.channels.get(&ch).map(|s| s.confirm_mode).unwrap_or_default();

                if !confirm_mode {
                    self.send_frame(Frame::Frame(frame::confirm_select(ch))).await?;
                    self.set_pending(
                        ch,
                        PendingOp::SelectingConfirm(Box::new(Command::Publish {
                            exchange,
                            routing_key,
                            message,
                            resolver,
                        })),
                    );
                } else {
                    self.send_publish(ch, exchange, routing_key, message).await?;
                    self.set_pending(ch, PendingOp::WaitingConfirm(resolver));
                }
            }
            other => unreachable!("{:?} does not need a channel", other),
        }

        Ok(())
    }

    async fn send_publish(
        &mut self,
        ch: ChannelNumber,
        exchange: String,
        routing_key: String,
        message: PublishedMessage,
    ) -> Result<()> {
        let args = frame::BasicPublishArgs::new(&exchange)
            .routing_key(&routing_key)
            .mandatory(message.mandatory)
            .immediate(message.immediate);

        let mut content = message.message;
        content.channel = ch;

        let (mut header, body) = message::to_content_frames(content);
        header.class_id = (frame::BASIC_PUBLISH >> 16) as u16;

        let mut fs = vec![args.frame(ch), header.frame()];

        // a body above frame max goes out in several body frames
        let max_body = (self.frame_max as usize).saturating_sub(FRAME_OVERHEAD).max(1);

        for chunk in body.body.chunks(max_body) {
            fs.push(AMQPFrame::ContentBody(frame::ContentBodyFrame {
                channel: ch,
                body: chunk.to_vec(),
            }));
        }

        self.send_frame(Frame::Frames(fs)).await
    }

    async fn settle(
        &mut self,
        ch: ChannelNumber,
        delivery_tag: u64,
        settlement: Settlement,
        resolver: PromiseResolver<()>,
    ) -> Result<()> {
        let settled = match self.channels.get_mut(&ch) {
            None => false,
            Some(slot) => match &settlement {
                Settlement::Nack { multiple: true, .. } => {
                    let before = slot.unacked.len();

                    if delivery_tag == 0 {
                        slot.unacked.clear();
                    } else {
                        slot.unacked.retain(|tag| *tag > delivery_tag);
                    }

                    before != slot.unacked.len()
                }
                _ => slot.unacked.remove(&delivery_tag),
            },
        };

        if !settled {
            resolver
                .send(usage_error!(format!(
                    "Delivery tag {} on channel {} is already settled or unknown",
                    delivery_tag, ch
                )))
                .ok();

            return Ok(());
        }

        let f = match settlement {
            Settlement::Ack => frame::BasicAckArgs::default().delivery_tag(delivery_tag).frame(ch),
            Settlement::Reject { requeue } => frame::BasicRejectArgs::default()
                .delivery_tag(delivery_tag)
                .requeue(requeue)
                .frame(ch),
            Settlement::Nack { multiple, requeue } => frame::BasicNackArgs::default()
                .delivery_tag(delivery_tag)
                .multiple(multiple)
                .requeue(requeue)
                .frame(ch),
        };

        self.send_frame(Frame::Frame(f)).await?;
        resolver.send(Ok(())).ok();

        self.maybe_release(ch).await
    }

    async fn update_qos(&mut self, ch: ChannelNumber, prefetch_count: u16, resolver: PromiseResolver<()>) -> Result<()> {
        match self.channels.get_mut(&ch) {
            Some(slot) if slot.consumer.is_some() => {
                if slot.pending.is_some() {
                    resolver.send(usage_error!(format!("Another operation is outstanding on channel {}", ch))).ok();

                    return Ok(());
                }

                slot.pending = Some(PendingOp::Rpc(PendingRpc::Qos(resolver)));

                let f = frame::BasicQosArgs::default().prefetch_count(prefetch_count).frame(ch);

                self.send_frame(Frame::Frame(f)).await
            }
            _ => {
                resolver.send(usage_error!(format!("No consumer on channel {}", ch))).ok();

                Ok(())
            }
        }
    }

    async fn cancel_consume(
        &mut self,
        ch: ChannelNumber,
        consumer_tag: String,
        resolver: PromiseResolver<String>,
    ) -> Result<()> {
        match self.channels.get_mut(&ch) {
            Some(slot)
                if slot
                    .consumer
                    .as_ref()
                    .map(|c| c.consumer_tag == consumer_tag)
                    .unwrap_or_default() =>
            {
                if slot.pending.is_some() {
                    resolver.send(usage_error!(format!("Another operation is outstanding on channel {}", ch))).ok();

                    return Ok(());
                }

                slot.pending = Some(PendingOp::Rpc(PendingRpc::CancelConsume(resolver)));

                self.send_frame(Frame::Frame(frame::BasicCancelArgs::new(&consumer_tag).frame(ch)))
                    .await
            }
            _ => {
                resolver.send(usage_error!(format!("No consumer {} on channel {}", consumer_tag, ch))).ok();

                Ok(())
            }
        }
    }

    fn set_pending(&mut self, ch: ChannelNumber, op: PendingOp) {
        if let Some(slot) = self.channels.get_mut(&ch) {
            debug_assert!(slot.pending.is_none());

            slot.pending = Some(op);
        }
    }

    fn take_pending(&mut self, ch: ChannelNumber) -> Option<PendingOp> {
        self.channels.get_mut(&ch).and_then(|slot| slot.pending.take())
    }

    /// An idle channel goes back to the pool and the oldest queued command
    /// gets its chance.
    async fn maybe_release(&mut self, ch: ChannelNumber) -> Result<()> {
        let idle = self.channels.get(&ch).map(ChannelSlot::is_idle).unwrap_or_default();

        if idle {
            self.pool.release(ch);
            self.pump_backlog().await?;
        }

        Ok(())
    }

    async fn pump_backlog(&mut self) -> Result<()> {
        while !self.backlog.is_empty() {
            match self.pool.acquire() {
                None => break,
                Some(acquired) => {
                    let command = self.backlog.pop_front().unwrap();

                    self.place_command(acquired, command).await?;
                }
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Frames arriving from the server
    // ------------------------------------------------------------------

    pub(crate) async fn connection_start(&mut self, args: frame::ConnectionStartArgs) -> Result<()> {
        if (args.version_major, args.version_minor) != (0, 9) {
            return self
                .unexpected_frame(0, frame::CONNECTION_START, "Unsupported protocol version")
                .await;
        }

        self.phase = Phase::Connected;

        let mut start_ok = frame::ConnectionStartOkArgs::new(&self.username, &self.password);

        if let Some(props) = self.client_properties.clone() {
            start_ok = start_ok.properties(props);
        }

        self.send_frame(Frame::Frame(start_ok.frame())).await
    }

    pub(crate) async fn connection_tune(&mut self, args: frame::ConnectionTuneArgs) -> Result<()> {
        self.phase = Phase::Authenticated;

        self.channel_max = if args.channel_max == 0 { u16::MAX } else { args.channel_max };
        self.pool.set_channel_max(self.channel_max);

        if args.frame_max > 0 {
            self.frame_max = args.frame_max;
        }

        let heartbeat = self.requested_heartbeat.unwrap_or(args.heartbeat);

        self.heartbeat = match heartbeat {
            0 => None,
            secs => Some(Duration::from_secs(secs as u64)),
        };

        let tune_ok = frame::ConnectionTuneOkArgs::default()
            .channel_max(self.channel_max)
            .frame_max(self.frame_max)
            .heartbeat(heartbeat);

        self.send_frame(Frame::Frame(tune_ok.frame())).await?;

        self.send_frame(Frame::Frame(
            frame::ConnectionOpenArgs::default().virtual_host(&self.virtual_host).frame(),
        ))
        .await
    }

    pub(crate) async fn connection_open_ok(&mut self) -> Result<()> {
        if let Some(connected) = self.connected.take() {
            connected.send(Ok(())).ok();
        }

        Ok(())
    }

    /// The server closes the connection; everything pending fails with the
    /// code and text it sent.
    pub(crate) async fn handle_connection_close(&mut self, args: frame::ConnectionCloseArgs) -> Result<()> {
        let err = ClientError {
            channel: None,
            code: args.code,
            message: args.text,
            class_method: frame::unify_class_method(args.class_id, args.method_id),
        };

        self.send_frame(Frame::Frame(frame::connection_close_ok())).await.ok();
        self.fail_all(&err);

        Ok(())
    }

    pub(crate) async fn connection_close_ok(&mut self) -> Result<()> {
        if let Some(closing) = self.closing.take() {
            closing.send(Ok(())).ok();
        }

        let err = ClientError {
            channel: None,
            code: 200,
            message: "Normal close".to_string(),
            class_method: frame::CONNECTION_CLOSE,
        };

        self.fail_all(&err);

        Ok(())
    }

    pub(crate) async fn channel_open_ok(&mut self, ch: ChannelNumber) -> Result<()> {
        match self.take_pending(ch) {
            Some(PendingOp::Opening(command)) => self.start_command(ch, *command).await,
            other => self.mismatched_reply(ch, frame::CHANNEL_OPEN_OK, other).await,
        }
    }

    /// The server closes one channel; only the promises living on that
    /// channel fail, the number is reusable after a reopen.
    pub(crate) async fn handle_channel_close(&mut self, ch: ChannelNumber, args: frame::ChannelCloseArgs) -> Result<()> {
        let err = ClientError {
            channel: Some(ch),
            code: args.code,
            message: args.text,
            class_method: frame::unify_class_method(args.class_id, args.method_id),
        };

        if let Some(mut slot) = self.channels.remove(&ch) {
            if let Some(op) = slot.pending.take() {
                fail_op(op, &err);
            }

            if let Some(consumer) = slot.consumer.take() {
                consumer.sink.send(ConsumerSignal::ChannelClosed(err.clone())).ok();
            }
        }

        self.in_delivery.remove(&ch);
        self.pool.forget(ch);

        self.send_frame(Frame::Frame(frame::channel_close_ok(ch))).await?;

        self.pump_backlog().await
    }

    pub(crate) async fn confirm_select_ok(&mut self, ch: ChannelNumber) -> Result<()> {
        match self.take_pending(ch) {
            Some(PendingOp::SelectingConfirm(command)) => {
                if let Some(slot) = self.channels.get_mut(&ch) {
                    slot.confirm_mode = true;
                }

                self.start_command(ch, *command).await
            }
            other => self.mismatched_reply(ch, frame::CONFIRM_SELECT_OK, other).await,
        }
    }

    pub(crate) async fn exchange_declare_ok(&mut self, ch: ChannelNumber) -> Result<()> {
        match self.take_pending(ch) {
            Some(PendingOp::Rpc(PendingRpc::ExchangeDeclare(resolver))) => {
                resolver.send(Ok(())).ok();

                self.maybe_release(ch).await
            }
            other => self.mismatched_reply(ch, frame::EXCHANGE_DECLARE_OK, other).await,
        }
    }

    pub(crate) async fn exchange_delete_ok(&mut self, ch: ChannelNumber) -> Result<()> {
        match self.take_pending(ch) {
            Some(PendingOp::Rpc(PendingRpc::ExchangeDelete(resolver))) => {
                resolver.send(Ok(())).ok();

                self.maybe_release(ch).await
            }
            other => self.mismatched_reply(ch, frame::EXCHANGE_DELETE_OK, other).await,
        }
    }

    pub(crate) async fn queue_declare_ok(&mut self, ch: ChannelNumber, args: frame::QueueDeclareOkArgs) -> Result<()> {
        match self.take_pending(ch) {
            Some(PendingOp::Rpc(PendingRpc::QueueDeclare(resolver))) => {
                resolver
                    .send(Ok(QueueDeclared {
                        queue: args.name,
                        message_count: args.message_count,
                        consumer_count: args.consumer_count,
                    }))
                    .ok();

                self.maybe_release(ch).await
            }
            other => self.mismatched_reply(ch, frame::QUEUE_DECLARE_OK, other).await,
        }
    }

    pub(crate) async fn queue_bind_ok(&mut self, ch: ChannelNumber) -> Result<()> {
        match self.take_pending(ch) {
            Some(PendingOp::Rpc(PendingRpc::QueueBind(resolver))) => {
                resolver.send(Ok(())).ok();

                self.maybe_release(ch).await
            }
            other => self.mismatched_reply(ch, frame::QUEUE_BIND_OK, other).await,
        }
    }

    pub(crate) async fn queue_unbind_ok(&mut self, ch: ChannelNumber) -> Result<()> {
        match self.take_pending(ch) {
            Some(PendingOp::Rpc(PendingRpc::QueueUnbind(resolver))) => {
                resolver.send(Ok(())).ok();

                self.maybe_release(ch).await
            }
            other => self.mismatched_reply(ch, frame::QUEUE_UNBIND_OK, other).await,
        }
    }

    pub(crate) async fn queue_purge_ok(&mut self, ch: ChannelNumber, args: frame::QueuePurgeOkArgs) -> Result<()> {
        match self.take_pending(ch) {
            Some(PendingOp::Rpc(PendingRpc::QueuePurge(resolver))) => {
                resolver.send(Ok(args.message_count)).ok();

                self.maybe_release(ch).await
            }
            other => self.mismatched_reply(ch, frame::QUEUE_PURGE_OK, other).await,
        }
    }

    pub(crate) async fn queue_delete_ok(&mut self, ch: ChannelNumber, args: frame::QueueDeleteOkArgs) -> Result<()> {
        match self.take_pending(ch) {
            Some(PendingOp::Rpc(PendingRpc::QueueDelete(resolver))) => {
                resolver.send(Ok(args.message_count)).ok();

                self.maybe_release(ch).await
            }
            other => self.mismatched_reply(ch, frame::QUEUE_DELETE_OK, other).await,
        }
    }

    pub(crate) async fn basic_qos_ok(&mut self, ch: ChannelNumber) -> Result<()> {
        match self.take_pending(ch) {
            Some(PendingOp::SettingPrefetch(command)) => self.start_command(ch, *command).await,
            Some(PendingOp::Rpc(PendingRpc::Qos(resolver))) => {
                resolver.send(Ok(())).ok();

                self.maybe_release(ch).await
            }
            other => self.mismatched_reply(ch, frame::BASIC_QOS_OK, other).await,
        }
    }

    pub(crate) async fn basic_consume_ok(&mut self, ch: ChannelNumber, args: frame::BasicConsumeOkArgs) -> Result<()> {
        match self.take_pending(ch) {
            Some(PendingOp::Rpc(PendingRpc::StartConsume {
                mut handle,
                sink,
                no_ack,
                resolver,
            })) => {
                handle.channel = ch;
                handle.consumer_tag = args.consumer_tag.clone();

                if let Some(slot) = self.channels.get_mut(&ch) {
                    slot.consumer = Some(ConsumerSlot {
                        consumer_tag: args.consumer_tag,
                        no_ack,
                        sink,
                    });
                }

                resolver.send(Ok(handle)).ok();

                Ok(())
            }
            other => self.mismatched_reply(ch, frame::BASIC_CONSUME_OK, other).await,
        }
    }

    pub(crate) async fn basic_cancel_ok(&mut self, ch: ChannelNumber, args: frame::BasicCancelOkArgs) -> Result<()> {
        match self.take_pending(ch) {
            Some(PendingOp::Rpc(PendingRpc::CancelConsume(resolver))) => {
                if let Some(slot) = self.channels.get_mut(&ch) {
                    if let Some(consumer) = slot.consumer.take() {
                        consumer.sink.send(ConsumerSignal::Cancelled).ok();
                    }
                }

                resolver.send(Ok(args.consumer_tag)).ok();

                self.maybe_release(ch).await
            }
            other => self.mismatched_reply(ch, frame::BASIC_CANCEL_OK, other).await,
        }
    }

    /// The server cancels the consumer, e.g. because its queue was deleted.
    pub(crate) async fn on_basic_cancel(&mut self, ch: ChannelNumber, args: frame::BasicCancelArgs) -> Result<()> {
        let cancelled = match self.channels.get_mut(&ch).and_then(|slot| slot.consumer.take()) {
            Some(consumer) => {
                consumer.sink.send(ConsumerSignal::Cancelled).ok();

                true
            }
            None => false,
        };

        if !args.no_wait {
            self.send_frame(Frame::Frame(
                frame::BasicCancelOkArgs::new(&args.consumer_tag).frame(ch),
            ))
            .await?;
        }

        if cancelled {
            self.maybe_release(ch).await?;
        }

        Ok(())
    }

    pub(crate) async fn basic_deliver(&mut self, ch: ChannelNumber, args: frame::BasicDeliverArgs) -> Result<()> {
        let message = Message::Delivered(DeliveredMessage {
            message: Content {
                channel: ch,
                ..Default::default()
            },
            consumer_tag: args.consumer_tag,
            delivery_tag: args.delivery_tag,
            redelivered: args.redelivered,
            exchange: args.exchange_name,
            routing_key: args.routing_key,
        });

        self.in_delivery.insert(ch, DeliveredContent { message, body_size: 0 });

        Ok(())
    }

    pub(crate) async fn basic_get_ok(&mut self, ch: ChannelNumber, args: frame::BasicGetOkArgs) -> Result<()> {
        let waiting_get = matches!(
            self.channels.get(&ch).and_then(|slot| slot.pending.as_ref()),
            Some(PendingOp::Rpc(PendingRpc::Get { .. }))
        );

        if !waiting_get {
            let op = self.take_pending(ch);

            return self.mismatched_reply(ch, frame::BASIC_GET_OK, op).await;
        }

        let message = Message::Get(GetMessage {
            message: Content {
                channel: ch,
                ..Default::default()
            },
            delivery_tag: args.delivery_tag,
            redelivered: args.redelivered,
            exchange: args.exchange_name,
            routing_key: args.routing_key,
            message_count: args.message_count,
        });

        self.in_delivery.insert(ch, DeliveredContent { message, body_size: 0 });

        Ok(())
    }

    pub(crate) async fn basic_get_empty(&mut self, ch: ChannelNumber) -> Result<()> {
        match self.take_pending(ch) {
            Some(PendingOp::Rpc(PendingRpc::Get { resolver, .. })) => {
                resolver.send(Ok(None)).ok();

                self.maybe_release(ch).await
            }
            other => self.mismatched_reply(ch, frame::BASIC_GET_EMPTY, other).await,
        }
    }

    pub(crate) async fn basic_return(&mut self, ch: ChannelNumber, args: frame::BasicReturnArgs) -> Result<()> {
        if let Some(slot) = self.channels.get_mut(&ch) {
            slot.returned = Some((args.reply_code, args.reply_text.clone()));
        }

        let message = Message::Returned(ReturnedMessage {
            message: Content {
                channel: ch,
                ..Default::default()
            },
            reply_code: args.reply_code,
            reply_text: args.reply_text,
            exchange: args.exchange_name,
            routing_key: args.routing_key,
        });

        self.in_delivery.insert(ch, DeliveredContent { message, body_size: 0 });

        Ok(())
    }

    /// Confirm from the server for a publish sent on a confirm mode channel.
    pub(crate) async fn on_basic_ack(&mut self, ch: ChannelNumber, _args: frame::BasicAckArgs) -> Result<()> {
        match self.take_pending(ch) {
            Some(PendingOp::WaitingConfirm(resolver)) => {
                let returned = self.channels.get_mut(&ch).and_then(|slot| slot.returned.take());

                match returned {
                    Some((code, text)) => {
                        resolver
                            .send(client_error!(Some(ch), code, text, frame::BASIC_PUBLISH))
                            .ok();
                    }
                    None => {
                        resolver.send(Ok(())).ok();
                    }
                }

                self.maybe_release(ch).await
            }
            other => self.mismatched_reply(ch, frame::BASIC_ACK, other).await,
        }
    }

    pub(crate) async fn content_header(&mut self, header: frame::ContentHeaderFrame) -> Result<()> {
        let ch = header.channel;
        let body_size = header.body_size;

        match self.in_delivery.get_mut(&ch) {
            Some(dc) => {
                dc.body_size = body_size;
                dc.message.content_mut().properties = header.into();

                if body_size == 0 {
                    let dc = self.in_delivery.remove(&ch).unwrap();

                    self.finish_delivery(ch, dc.message).await?;
                }

                Ok(())
            }
            None => {
                self.unexpected_frame(ch, 0, "Content header without a method frame")
                    .await
            }
        }
    }

    pub(crate) async fn content_body(&mut self, body: frame::ContentBodyFrame) -> Result<()> {
        let ch = body.channel;

        match self.in_delivery.get_mut(&ch) {
            Some(dc) => {
                let content = dc.message.content_mut();

                content.body.extend_from_slice(&body.body);

                if content.body.len() as u64 >= dc.body_size {
                    let dc = self.in_delivery.remove(&ch).unwrap();

                    self.finish_delivery(ch, dc.message).await?;
                }

                Ok(())
            }
            None => {
                self.unexpected_frame(ch, 0, "Content body without a content header")
                    .await
            }
        }
    }

    /// The content is complete, hand the message to whoever asked for it.
    async fn finish_delivery(&mut self, ch: ChannelNumber, message: Message) -> Result<()> {
        match message {
            Message::Delivered(dm) => {
                let target = self
                    .channels
                    .get_mut(&ch)
                    .and_then(|slot| slot.consumer.as_ref().map(|c| (c.no_ack, c.sink.clone())));

                match target {
                    Some((no_ack, sink)) => {
                        if !no_ack {
                            if let Some(slot) = self.channels.get_mut(&ch) {
                                slot.unacked.insert(dm.delivery_tag);
                            }
                        }

                        if sink.send(ConsumerSignal::Delivered(Box::new(dm))).is_err() {
                            warn!("Consumer on channel {} dropped its signal stream", ch);
                        }
                    }
                    None => warn!("Delivery on channel {} without active consumer", ch),
                }

                Ok(())
            }
            Message::Get(gm) => match self.take_pending(ch) {
                Some(PendingOp::Rpc(PendingRpc::Get { no_ack, resolver })) => {
                    if !no_ack {
                        if let Some(slot) = self.channels.get_mut(&ch) {
                            slot.unacked.insert(gm.delivery_tag);
                        }
                    }

                    resolver.send(Ok(Some(gm))).ok();

                    self.maybe_release(ch).await
                }
                other => self.mismatched_reply(ch, frame::BASIC_GET_OK, other).await,
            },
            Message::Returned(rm) => {
                trace!("Returned message consumed on channel {}: {:?}", ch, rm.reply_text);

                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Failure paths
    // ------------------------------------------------------------------

    /// A reply arrived which does not pair with the outstanding request of
    /// the channel. That is a protocol violation and kills the connection.
    async fn mismatched_reply(&mut self, ch: ChannelNumber, cm: frame::ClassMethod, op: Option<PendingOp>) -> Result<()> {
        error!("Reply {:08X} does not match the outstanding request on channel {}", cm, ch);

        let err = ClientError {
            channel: None,
            code: 505,
            message: "Unexpected frame".to_string(),
            class_method: cm,
        };

        if let Some(op) = op {
            fail_op(op, &err);
        }

        let _ = self
            .send_frame(Frame::Frame(frame::connection_close(505, "Unexpected frame", cm)))
            .await;

        self.fail_all(&err);

        Ok(())
    }

    /// A method the client never expects, e.g. a request only the server
    /// should receive.
    pub(crate) async fn unknown_method(&mut self, ch: ChannelNumber, cm: frame::ClassMethod) -> Result<()> {
        self.unexpected_frame(ch, cm, "Unexpected method").await
    }

    async fn unexpected_frame(&mut self, ch: ChannelNumber, cm: frame::ClassMethod, text: &str) -> Result<()> {
        error!("Unexpected frame on channel {}: {}", ch, text);

        let err = ClientError {
            channel: None,
            code: 505,
            message: text.to_string(),
            class_method: cm,
        };

        let _ = self
            .send_frame(Frame::Frame(frame::connection_close(505, text, cm)))
            .await;

        self.fail_all(&err);

        Ok(())
    }

    /// Resolves every outstanding promise with the error and signals all
    /// consumers. After this the state accepts no frames, the socket loop
    /// exits.
    pub(crate) fn fail_all(&mut self, err: &ClientError) {
        self.phase = Phase::Closed;

        if let Some(connected) = self.connected.take() {
            connected.send(Err(anyhow::Error::new(err.clone()))).ok();
        }

        if let Some(closing) = self.closing.take() {
            closing.send(Err(anyhow::Error::new(err.clone()))).ok();
        }

        for (_, mut slot) in self.channels.drain() {
            if let Some(op) = slot.pending.take() {
                fail_op(op, err);
            }

            if let Some(consumer) = slot.consumer.take() {
                consumer.sink.send(ConsumerSignal::ConnectionClosed(err.clone())).ok();
            }
        }

        self.in_delivery.clear();

        for command in self.backlog.drain(..) {
            fail_command(command, err);
        }
    }
}

fn fail_op(op: PendingOp, err: &ClientError) {
    match op {
        PendingOp::Opening(command) => fail_command(*command, err),
        PendingOp::SelectingConfirm(command) => fail_command(*command, err),
        PendingOp::SettingPrefetch(command) => fail_command(*command, err),
        PendingOp::WaitingConfirm(resolver) => {
            resolver.send(Err(anyhow::Error::new(err.clone()))).ok();
        }
        PendingOp::Rpc(rpc) => fail_rpc(rpc, err),
    }
}

fn fail_rpc(rpc: PendingRpc, err: &ClientError) {
    let e = || anyhow::Error::new(err.clone());

    match rpc {
        PendingRpc::ExchangeDeclare(resolver) => {
            resolver.send(Err(e())).ok();
        }
        PendingRpc::ExchangeDelete(resolver) => {
            resolver.send(Err(e())).ok();
        }
        PendingRpc::QueueDeclare(resolver) => {
            resolver.send(Err(e())).ok();
        }
        PendingRpc::QueueBind(resolver) => {
            resolver.send(Err(e())).ok();
        }
        PendingRpc::QueueUnbind(resolver) => {
            resolver.send(Err(e())).ok();
        }
        PendingRpc::QueuePurge(resolver) => {
            resolver.send(Err(e())).ok();
        }
        PendingRpc::QueueDelete(resolver) => {
            resolver.send(Err(e())).ok();
        }
        PendingRpc::StartConsume { resolver, .. } => {
            resolver.send(Err(e())).ok();
        }
        PendingRpc::CancelConsume(resolver) => {
            resolver.send(Err(e())).ok();
        }
        PendingRpc::Get { resolver, .. } => {
            resolver.send(Err(e())).ok();
        }
        PendingRpc::Qos(resolver) => {
            resolver.send(Err(e())).ok();
        }
    }
}

fn fail_command(command: Command, err: &ClientError) {
    let e = || anyhow::Error::new(err.clone());

    match command {
        Command::Connect { connected, .. } => {
            connected.send(Err(e())).ok();
        }
        Command::ExchangeDeclare { resolver, .. } => {
            resolver.send(Err(e())).ok();
        }
        Command::ExchangeDelete { resolver, .. } => {
            resolver.send(Err(e())).ok();
        }
        Command::QueueDeclare { resolver, .. } => {
            resolver.send(Err(e())).ok();
        }
        Command::QueueBind { resolver, .. } => {
            resolver.send(Err(e())).ok();
        }
        Command::QueueUnbind { resolver, .. } => {
            resolver.send(Err(e())).ok();
        }
        Command::QueuePurge { resolver, .. } => {
            resolver.send(Err(e())).ok();
        }
        Command::QueueDelete { resolver, .. } => {
            resolver.send(Err(e())).ok();
        }
        Command::Publish { resolver, .. } => {
            resolver.send(Err(e())).ok();
        }
        Command::Consume { resolver, .. } => {
            resolver.send(Err(e())).ok();
        }
        Command::CancelConsume { resolver, .. } => {
            resolver.send(Err(e())).ok();
        }
        Command::Get { resolver, .. } => {
            resolver.send(Err(e())).ok();
        }
        Command::Qos { resolver, .. } => {
            resolver.send(Err(e())).ok();
        }
        Command::Ack { resolver, .. } => {
            resolver.send(Err(e())).ok();
        }
        Command::Reject { resolver, .. } => {
            resolver.send(Err(e())).ok();
        }
        Command::Nack { resolver, .. } => {
            resolver.send(Err(e())).ok();
        }
        Command::Close { resolver } => {
            resolver.send(Err(e())).ok();
        }
    }
}
