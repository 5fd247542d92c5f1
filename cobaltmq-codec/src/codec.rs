use crate::frame::*;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const FRAME_METHOD_FRAME: u8 = 0x01;
const FRAME_CONTENT_HEADER: u8 = 0x02;
const FRAME_CONTENT_BODY: u8 = 0x03;
const FRAME_HEARTBEAT: u8 = 0x08;
const FRAME_AMQP_VERSION: u8 = 0x41;

const FRAME_END: u8 = 0xCE;

/// AMQP encoder and decoder functions.
pub struct AMQPCodec {}

#[derive(Debug)]
pub enum Frame {
    Frame(AMQPFrame),
    Frames(Vec<AMQPFrame>),
}

type DecodeResult<T> = std::result::Result<T, std::io::Error>;

fn malformed(message: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.into())
}

impl Encoder<Frame> for AMQPCodec {
    type Error = std::io::Error;

    fn encode(&mut self, event: Frame, mut buf: &mut BytesMut) -> Result<(), Self::Error> {
        match event {
            Frame::Frame(frame) => encode_amqp_frame(&mut buf, frame),
            Frame::Frames(frames) => {
                for frame in frames {
                    encode_amqp_frame(&mut buf, frame);
                }
            }
        }

        Ok(())
    }
}

impl Decoder for AMQPCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 7 || !is_full_frame(src) {
            return Ok(None);
        }

        match src.get_u8() {
            FRAME_METHOD_FRAME => {
                let channel = src.get_u16();
                let frame_len = src.get_u32() as usize;

                let mut frame_buf = src.split_to(frame_len);
                let frame = decode_method_frame(&mut frame_buf, channel)?;

                expect_frame_end(src)?;

                Ok(Some(Frame::Frame(frame)))
            }
            FRAME_CONTENT_HEADER => {
                let channel = src.get_u16();
                let frame_len = src.get_u32() as usize;

                let mut frame_buf = src.split_to(frame_len);
                let frame = decode_content_header_frame(&mut frame_buf, channel)?;

                expect_frame_end(src)?;

                Ok(Some(Frame::Frame(frame)))
            }
            FRAME_CONTENT_BODY => {
                let channel = src.get_u16();
                let body_len = src.get_u32();
                let bytes = src.split_to(body_len as usize);

                expect_frame_end(src)?;

                let frame = AMQPFrame::ContentBody(ContentBodyFrame {
                    channel,
                    body: bytes.to_vec(),
                });

                Ok(Some(Frame::Frame(frame)))
            }
            FRAME_HEARTBEAT => {
                let channel = src.get_u16();
                let len = src.get_u32();
                let _ = src.split_to(len as usize);

                expect_frame_end(src)?;

                Ok(Some(Frame::Frame(AMQPFrame::Heartbeat(channel))))
            }
            FRAME_AMQP_VERSION => {
                let mut head = [0u8; 7];
                src.copy_to_slice(&mut head);

                if head != *b"MQP\x00\x00\x09\x01" {
                    return Err(malformed("Unsupported protocol header"));
                }

                Ok(Some(Frame::Frame(AMQPFrame::Header)))
            }
            f => Err(malformed(format!("Unknown frame type {}", f))),
        }
    }
}

/// Check if the buffer contains the full frame. We can do that easily since
/// most of the time the frame contains the length information.
fn is_full_frame(src: &BytesMut) -> bool {
    match src[0] {
        FRAME_AMQP_VERSION => src.len() >= 8,
        _ => {
            let mut bs = [0u8; 4];
            bs.copy_from_slice(&src[3..7]);

            let len = u32::from_be_bytes(bs) as usize;

            src.len() >= len + 8
        }
    }
}

fn expect_frame_end(src: &mut BytesMut) -> DecodeResult<()> {
    match src.get_u8() {
        FRAME_END => Ok(()),
        b => Err(malformed(format!("Frame end expected, got {:02X}", b))),
    }
}

fn take_u8(src: &mut BytesMut) -> DecodeResult<u8> {
    if src.remaining() < 1 {
        return Err(malformed("Truncated frame"));
    }

    Ok(src.get_u8())
}

fn take_u16(src: &mut BytesMut) -> DecodeResult<u16> {
    if src.remaining() < 2 {
        return Err(malformed("Truncated frame"));
    }

    Ok(src.get_u16())
}

fn take_u32(src: &mut BytesMut) -> DecodeResult<u32> {
    if src.remaining() < 4 {
        return Err(malformed("Truncated frame"));
    }

    Ok(src.get_u32())
}

fn take_u64(src: &mut BytesMut) -> DecodeResult<u64> {
    if src.remaining() < 8 {
        return Err(malformed("Truncated frame"));
    }

    Ok(src.get_u64())
}

fn take_bool(src: &mut BytesMut) -> DecodeResult<bool> {
    Ok(take_u8(src)? != 0)
}

fn decode_method_frame(mut src: &mut BytesMut, channel: u16) -> DecodeResult<AMQPFrame> {
    let class_method = take_u32(&mut src)?;

    let method_frame_args = match class_method {
        CONNECTION_START => decode_connection_start(&mut src)?,
        CONNECTION_START_OK => decode_connection_start_ok(&mut src)?,
        CONNECTION_TUNE => decode_connection_tune(&mut src)?,
        CONNECTION_TUNE_OK => decode_connection_tune_ok(&mut src)?,
        CONNECTION_OPEN => decode_connection_open(&mut src)?,
        CONNECTION_OPEN_OK => {
            let _ = decode_short_string(&mut src)?;
            MethodFrameArgs::ConnectionOpenOk
        }
        CONNECTION_CLOSE => decode_connection_close(&mut src)?,
        CONNECTION_CLOSE_OK => MethodFrameArgs::ConnectionCloseOk,
        CHANNEL_OPEN => {
            let _ = decode_short_string(&mut src)?;
            MethodFrameArgs::ChannelOpen
        }
        CHANNEL_OPEN_OK => {
            let _ = decode_long_string(&mut src)?;
            MethodFrameArgs::ChannelOpenOk
        }
        CHANNEL_CLOSE => decode_channel_close(&mut src)?,
        CHANNEL_CLOSE_OK => MethodFrameArgs::ChannelCloseOk,
        EXCHANGE_DECLARE => decode_exchange_declare(&mut src)?,
        EXCHANGE_DECLARE_OK => MethodFrameArgs::ExchangeDeclareOk,
        EXCHANGE_DELETE => decode_exchange_delete(&mut src)?,
        EXCHANGE_DELETE_OK => MethodFrameArgs::ExchangeDeleteOk,
        QUEUE_DECLARE => decode_queue_declare(&mut src)?,
        QUEUE_DECLARE_OK => decode_queue_declare_ok(&mut src)?,
        QUEUE_BIND => decode_queue_bind(&mut src)?,
        QUEUE_BIND_OK => MethodFrameArgs::QueueBindOk,
        QUEUE_PURGE => decode_queue_purge(&mut src)?,
        QUEUE_PURGE_OK => MethodFrameArgs::QueuePurgeOk(QueuePurgeOkArgs {
            message_count: take_u32(&mut src)?,
        }),
        QUEUE_DELETE => decode_queue_delete(&mut src)?,
        QUEUE_DELETE_OK => MethodFrameArgs::QueueDeleteOk(QueueDeleteOkArgs {
            message_count: take_u32(&mut src)?,
        }),
        QUEUE_UNBIND => decode_queue_unbind(&mut src)?,
        QUEUE_UNBIND_OK => MethodFrameArgs::QueueUnbindOk,
        BASIC_QOS => decode_basic_qos(&mut src)?,
        BASIC_QOS_OK => MethodFrameArgs::BasicQosOk,
        BASIC_CONSUME => decode_basic_consume(&mut src)?,
        BASIC_CONSUME_OK => MethodFrameArgs::BasicConsumeOk(BasicConsumeOkArgs {
            consumer_tag: decode_short_string(&mut src)?,
        }),
        BASIC_CANCEL => decode_basic_cancel(&mut src)?,
        BASIC_CANCEL_OK => MethodFrameArgs::BasicCancelOk(BasicCancelOkArgs {
            consumer_tag: decode_short_string(&mut src)?,
        }),
        BASIC_GET => decode_basic_get(&mut src)?,
        BASIC_GET_OK => decode_basic_get_ok(&mut src)?,
        BASIC_GET_EMPTY => {
            let _ = decode_short_string(&mut src)?;
            MethodFrameArgs::BasicGetEmpty
        }
        BASIC_PUBLISH => decode_basic_publish(&mut src)?,
        BASIC_RETURN => decode_basic_return(&mut src)?,
        BASIC_DELIVER => decode_basic_deliver(&mut src)?,
        BASIC_ACK => MethodFrameArgs::BasicAck(BasicAckArgs {
            delivery_tag: take_u64(&mut src)?,
            multiple: take_bool(&mut src)?,
        }),
        BASIC_REJECT => MethodFrameArgs::BasicReject(BasicRejectArgs {
            delivery_tag: take_u64(&mut src)?,
            requeue: take_bool(&mut src)?,
        }),
        BASIC_NACK => MethodFrameArgs::BasicNack(BasicNackArgs {
            delivery_tag: take_u64(&mut src)?,
            flags: BasicNackFlags::from_bits(take_u8(&mut src)?).unwrap_or_default(),
        }),
        CONFIRM_SELECT => MethodFrameArgs::ConfirmSelect(ConfirmSelectArgs {
            no_wait: take_bool(&mut src)?,
        }),
        CONFIRM_SELECT_OK => MethodFrameArgs::ConfirmSelectOk,
        cm => return Err(malformed(format!("Unknown class method {:08X}", cm))),
    };

    Ok(AMQPFrame::Method(channel, class_method, method_frame_args))
}

fn decode_connection_start(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let args = ConnectionStartArgs {
        version_major: take_u8(&mut src)?,
        version_minor: take_u8(&mut src)?,
        properties: decode_optional_field_table(&mut src)?,
        mechanisms: decode_long_string(&mut src)?,
        locales: decode_long_string(&mut src)?,
    };

    Ok(MethodFrameArgs::ConnectionStart(args))
}

fn decode_connection_start_ok(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let args = ConnectionStartOkArgs {
        properties: decode_optional_field_table(&mut src)?,
        mechanism: decode_short_string(&mut src)?,
        response: decode_long_string(&mut src)?,
        locale: decode_short_string(&mut src)?,
    };

    Ok(MethodFrameArgs::ConnectionStartOk(args))
}

fn decode_connection_tune(src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let args = ConnectionTuneArgs {
        channel_max: take_u16(src)?,
        frame_max: take_u32(src)?,
        heartbeat: take_u16(src)?,
    };

    Ok(MethodFrameArgs::ConnectionTune(args))
}

fn decode_connection_tune_ok(src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let args = ConnectionTuneOkArgs {
        channel_max: take_u16(src)?,
        frame_max: take_u32(src)?,
        heartbeat: take_u16(src)?,
    };

    Ok(MethodFrameArgs::ConnectionTuneOk(args))
}

fn decode_connection_open(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let virtual_host = decode_short_string(&mut src)?;
    let _reserved = decode_short_string(&mut src)?;
    let flags = take_u8(&mut src)?;

    Ok(MethodFrameArgs::ConnectionOpen(ConnectionOpenArgs {
        virtual_host,
        insist: flags & 0x01 != 0,
    }))
}

fn decode_connection_close(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let args = ConnectionCloseArgs {
        code: take_u16(&mut src)?,
        text: decode_short_string(&mut src)?,
        class_id: take_u16(&mut src)?,
        method_id: take_u16(&mut src)?,
    };

    Ok(MethodFrameArgs::ConnectionClose(args))
}

fn decode_channel_close(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let args = ChannelCloseArgs {
        code: take_u16(&mut src)?,
        text: decode_short_string(&mut src)?,
        class_id: take_u16(&mut src)?,
        method_id: take_u16(&mut src)?,
    };

    Ok(MethodFrameArgs::ChannelClose(args))
}

fn decode_exchange_declare(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let mut args = ExchangeDeclareArgs::default();
    let _ = take_u16(&mut src)?;
    args.exchange_name = decode_short_string(&mut src)?;
    args.exchange_type = decode_short_string(&mut src)?;
    args.flags = ExchangeDeclareFlags::from_bits(take_u8(&mut src)?).unwrap_or_default();
    args.args = decode_optional_field_table(&mut src)?;

    Ok(MethodFrameArgs::ExchangeDeclare(args))
}

fn decode_exchange_delete(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let mut args = ExchangeDeleteArgs::default();
    let _ = take_u16(&mut src)?;
    args.exchange_name = decode_short_string(&mut src)?;
    args.flags = ExchangeDeleteFlags::from_bits(take_u8(&mut src)?).unwrap_or_default();

    Ok(MethodFrameArgs::ExchangeDelete(args))
}

fn decode_queue_declare(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let mut args = QueueDeclareArgs::default();
    let _ = take_u16(&mut src)?;
    args.name = decode_short_string(&mut src)?;
    args.flags = QueueDeclareFlags::from_bits(take_u8(&mut src)?).unwrap_or_default();
    args.args = decode_optional_field_table(&mut src)?;

    Ok(MethodFrameArgs::QueueDeclare(args))
}

fn decode_queue_declare_ok(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let args = QueueDeclareOkArgs {
        name: decode_short_string(&mut src)?,
        message_count: take_u32(&mut src)?,
        consumer_count: take_u32(&mut src)?,
    };

    Ok(MethodFrameArgs::QueueDeclareOk(args))
}

fn decode_queue_bind(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let mut args = QueueBindArgs::default();
    let _ = take_u16(&mut src)?;
    args.queue_name = decode_short_string(&mut src)?;
    args.exchange_name = decode_short_string(&mut src)?;
    args.routing_key = decode_short_string(&mut src)?;
    args.no_wait = take_bool(&mut src)?;
    args.args = decode_optional_field_table(&mut src)?;

    Ok(MethodFrameArgs::QueueBind(args))
}

fn decode_queue_purge(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let mut args = QueuePurgeArgs::default();
    let _ = take_u16(&mut src)?;
    args.queue_name = decode_short_string(&mut src)?;
    args.no_wait = take_bool(&mut src)?;

    Ok(MethodFrameArgs::QueuePurge(args))
}

fn decode_queue_delete(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let mut args = QueueDeleteArgs::default();
    let _ = take_u16(&mut src)?;
    args.queue_name = decode_short_string(&mut src)?;
    args.flags = QueueDeleteFlags::from_bits(take_u8(&mut src)?).unwrap_or_default();

    Ok(MethodFrameArgs::QueueDelete(args))
}

fn decode_queue_unbind(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let mut args = QueueUnbindArgs::default();
    let _ = take_u16(&mut src)?;
    args.queue_name = decode_short_string(&mut src)?;
    args.exchange_name = decode_short_string(&mut src)?;
    args.routing_key = decode_short_string(&mut src)?;
    args.args = decode_optional_field_table(&mut src)?;

    Ok(MethodFrameArgs::QueueUnbind(args))
}

fn decode_basic_qos(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let args = BasicQosArgs {
        prefetch_size: take_u32(&mut src)?,
        prefetch_count: take_u16(&mut src)?,
        global: take_bool(&mut src)?,
    };

    Ok(MethodFrameArgs::BasicQos(args))
}

fn decode_basic_consume(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let mut args = BasicConsumeArgs::default();
    let _ = take_u16(&mut src)?;
    args.queue = decode_short_string(&mut src)?;
    args.consumer_tag = decode_short_string(&mut src)?;
    args.flags = BasicConsumeFlags::from_bits(take_u8(&mut src)?).unwrap_or_default();
    args.args = decode_optional_field_table(&mut src)?;

    Ok(MethodFrameArgs::BasicConsume(args))
}

fn decode_basic_cancel(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let args = BasicCancelArgs {
        consumer_tag: decode_short_string(&mut src)?,
        no_wait: take_bool(&mut src)?,
    };

    Ok(MethodFrameArgs::BasicCancel(args))
}

fn decode_basic_get(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let _ = take_u16(&mut src)?;
    let args = BasicGetArgs {
        queue: decode_short_string(&mut src)?,
        no_ack: take_bool(&mut src)?,
    };

    Ok(MethodFrameArgs::BasicGet(args))
}

fn decode_basic_get_ok(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let args = BasicGetOkArgs {
        delivery_tag: take_u64(&mut src)?,
        redelivered: take_bool(&mut src)?,
        exchange_name: decode_short_string(&mut src)?,
        routing_key: decode_short_string(&mut src)?,
        message_count: take_u32(&mut src)?,
    };

    Ok(MethodFrameArgs::BasicGetOk(args))
}

fn decode_basic_publish(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let mut args = BasicPublishArgs::default();
    let _ = take_u16(&mut src)?;
    args.exchange_name = decode_short_string(&mut src)?;
    args.routing_key = decode_short_string(&mut src)?;
    args.flags = BasicPublishFlags::from_bits(take_u8(&mut src)?).unwrap_or_default();

    Ok(MethodFrameArgs::BasicPublish(args))
}

fn decode_basic_return(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let args = BasicReturnArgs {
        reply_code: take_u16(&mut src)?,
        reply_text: decode_short_string(&mut src)?,
        exchange_name: decode_short_string(&mut src)?,
        routing_key: decode_short_string(&mut src)?,
    };

    Ok(MethodFrameArgs::BasicReturn(args))
}

fn decode_basic_deliver(mut src: &mut BytesMut) -> DecodeResult<MethodFrameArgs> {
    let args = BasicDeliverArgs {
        consumer_tag: decode_short_string(&mut src)?,
        delivery_tag: take_u64(&mut src)?,
        redelivered: take_bool(&mut src)?,
        exchange_name: decode_short_string(&mut src)?,
        routing_key: decode_short_string(&mut src)?,
    };

    Ok(MethodFrameArgs::BasicDeliver(args))
}

fn decode_content_header_frame(mut src: &mut BytesMut, channel: u16) -> DecodeResult<AMQPFrame> {
    let class_id = take_u16(&mut src)?;
    let weight = take_u16(&mut src)?;
    let body_size = take_u64(&mut src)?;
    let prop_flags =
        HeaderPropertyFlags::from_bits(take_u16(&mut src)?).ok_or_else(|| malformed("Invalid property flags"))?;

    let mut header = ContentHeaderFrame {
        channel,
        class_id,
        weight,
        body_size,
        prop_flags,
        ..Default::default()
    };

    // Properties are laid out in flag order, from the highest bit down.
    if prop_flags.contains(HeaderPropertyFlags::CONTENT_TYPE) {
        header.content_type = Some(decode_short_string(&mut src)?);
    }
    if prop_flags.contains(HeaderPropertyFlags::CONTENT_ENCODING) {
        header.content_encoding = Some(decode_short_string(&mut src)?);
    }
    if prop_flags.contains(HeaderPropertyFlags::HEADERS) {
        header.headers = Some(decode_field_table(&mut src)?);
    }
    if prop_flags.contains(HeaderPropertyFlags::DELIVERY_MODE) {
        header.delivery_mode = Some(take_u8(&mut src)?);
    }
    if prop_flags.contains(HeaderPropertyFlags::PRIORITY) {
        header.priority = Some(take_u8(&mut src)?);
    }
    if prop_flags.contains(HeaderPropertyFlags::CORRELATION_ID) {
        header.correlation_id = Some(decode_short_string(&mut src)?);
    }
    if prop_flags.contains(HeaderPropertyFlags::REPLY_TO) {
        header.reply_to = Some(decode_short_string(&mut src)?);
    }
    if prop_flags.contains(HeaderPropertyFlags::EXPIRATION) {
        header.expiration = Some(decode_short_string(&mut src)?);
    }
    if prop_flags.contains(HeaderPropertyFlags::MESSAGE_ID) {
        header.message_id = Some(decode_short_string(&mut src)?);
    }
    if prop_flags.contains(HeaderPropertyFlags::TIMESTAMP) {
        header.timestamp = Some(take_u64(&mut src)?);
    }
    if prop_flags.contains(HeaderPropertyFlags::MESSAGE_TYPE) {
        header.message_type = Some(decode_short_string(&mut src)?);
    }
    if prop_flags.contains(HeaderPropertyFlags::USER_ID) {
        header.user_id = Some(decode_short_string(&mut src)?);
    }
    if prop_flags.contains(HeaderPropertyFlags::APP_ID) {
        header.app_id = Some(decode_short_string(&mut src)?);
    }
    if prop_flags.contains(HeaderPropertyFlags::CLUSTER_ID) {
        header.cluster_id = Some(decode_short_string(&mut src)?);
    }

    Ok(AMQPFrame::ContentHeader(header))
}

fn decode_field_value(mut buf: &mut BytesMut) -> DecodeResult<AMQPFieldValue> {
    let value = match take_u8(&mut buf)? {
        b't' => AMQPFieldValue::Bool(take_u8(&mut buf)? != 0),
        b'b' => AMQPFieldValue::I8(take_u8(&mut buf)? as i8),
        b's' => AMQPFieldValue::I16(take_u16(&mut buf)? as i16),
        b'I' => AMQPFieldValue::I32(take_u32(&mut buf)? as i32),
        b'l' => AMQPFieldValue::I64(take_u64(&mut buf)? as i64),
        b'd' => AMQPFieldValue::Double(f64::from_bits(take_u64(&mut buf)?)),
        b'S' => AMQPFieldValue::LongString(decode_long_string(&mut buf)?),
        b'F' => AMQPFieldValue::FieldTable(Box::new(decode_field_table(&mut buf)?)),
        b'A' => AMQPFieldValue::FieldArray(decode_field_array(&mut buf)?),
        b'V' => AMQPFieldValue::Void,
        t => return Err(malformed(format!("Unknown field value type {:02X}", t))),
    };

    Ok(value)
}

fn decode_short_string(buf: &mut BytesMut) -> DecodeResult<String> {
    let len = take_u8(buf)? as usize;

    if buf.remaining() < len {
        return Err(malformed("Truncated string"));
    }

    let sb = buf.split_to(len);

    String::from_utf8(sb.to_vec()).map_err(|_| malformed("Invalid string"))
}

fn decode_long_string(buf: &mut BytesMut) -> DecodeResult<String> {
    let len = take_u32(buf)? as usize;

    if buf.remaining() < len {
        return Err(malformed("Truncated string"));
    }

    let sb = buf.split_to(len);

    String::from_utf8(sb.to_vec()).map_err(|_| malformed("Invalid string"))
}

/// Decode a field table.
///
/// The buffer points to the beginning of the field table which is a `u32`
/// length information. Field order is kept as read from the wire.
fn decode_field_table(buf: &mut BytesMut) -> DecodeResult<FieldTable> {
    let ft_len = take_u32(buf)? as usize;

    if buf.remaining() < ft_len {
        return Err(malformed("Truncated field table"));
    }

    let mut ft_buf = buf.split_to(ft_len);
    let mut table = FieldTable::new();

    while ft_buf.has_remaining() {
        let field_name = decode_short_string(&mut ft_buf)?;
        let field_value = decode_field_value(&mut ft_buf)?;

        table.insert(field_name, field_value);
    }

    Ok(table)
}

fn decode_optional_field_table(buf: &mut BytesMut) -> DecodeResult<Option<FieldTable>> {
    let table = decode_field_table(buf)?;

    Ok(if table.is_empty() { None } else { Some(table) })
}

fn decode_field_array(buf: &mut BytesMut) -> DecodeResult<Vec<AMQPFieldValue>> {
    let fa_len = take_u32(buf)? as usize;

    if buf.remaining() < fa_len {
        return Err(malformed("Truncated field array"));
    }

    let mut fa_buf = buf.split_to(fa_len);
    let mut values = Vec::new();

    while fa_buf.has_remaining() {
        values.push(decode_field_value(&mut fa_buf)?);
    }

    Ok(values)
}

fn encode_amqp_frame(mut buf: &mut BytesMut, frame: AMQPFrame) {
    match frame {
        AMQPFrame::Header => buf.put(&b"AMQP\x00\x00\x09\x01"[..]),

        AMQPFrame::Method(ch, cm, args) => encode_method_frame(&mut buf, ch, cm, &args),

        AMQPFrame::ContentHeader(header_frame) => encode_content_header_frame(&mut buf, &header_frame),

        AMQPFrame::ContentBody(body_frame) => encode_content_body_frame(&mut buf, &body_frame),

        AMQPFrame::Heartbeat(channel) => encode_heartbeat_frame(&mut buf, channel),
    }
}

fn encode_method_frame(buf: &mut BytesMut, channel: Channel, cm: ClassMethod, args: &MethodFrameArgs) {
    buf.put_u8(FRAME_METHOD_FRAME);
    buf.put_u16(channel);

    let mut fr = BytesMut::with_capacity(4096);
    fr.put_u32(cm);

    match args {
        MethodFrameArgs::ConnectionStart(args) => encode_connection_start(&mut fr, args),
        MethodFrameArgs::ConnectionStartOk(args) => encode_connection_start_ok(&mut fr, args),
        MethodFrameArgs::ConnectionTune(args) => encode_connection_tune(&mut fr, args),
        MethodFrameArgs::ConnectionTuneOk(args) => encode_connection_tune_ok(&mut fr, args),
        MethodFrameArgs::ConnectionOpen(args) => encode_connection_open(&mut fr, args),
        MethodFrameArgs::ConnectionOpenOk => encode_empty_short_string(&mut fr),
        MethodFrameArgs::ConnectionClose(args) => encode_connection_close(&mut fr, args),
        MethodFrameArgs::ConnectionCloseOk => (),
        MethodFrameArgs::ChannelOpen => encode_empty_short_string(&mut fr),
        MethodFrameArgs::ChannelOpenOk => fr.put_u32(0),
        MethodFrameArgs::ChannelClose(args) => encode_channel_close(&mut fr, args),
        MethodFrameArgs::ChannelCloseOk => (),
        MethodFrameArgs::ExchangeDeclare(args) => encode_exchange_declare(&mut fr, args),
        MethodFrameArgs::ExchangeDeclareOk => (),
        MethodFrameArgs::ExchangeDelete(args) => encode_exchange_delete(&mut fr, args),
        MethodFrameArgs::ExchangeDeleteOk => (),
        MethodFrameArgs::QueueDeclare(args) => encode_queue_declare(&mut fr, args),
        MethodFrameArgs::QueueDeclareOk(args) => encode_queue_declare_ok(&mut fr, args),
        MethodFrameArgs::QueueBind(args) => encode_queue_bind(&mut fr, args),
        MethodFrameArgs::QueueBindOk => (),
        MethodFrameArgs::QueuePurge(args) => encode_queue_purge(&mut fr, args),
        MethodFrameArgs::QueuePurgeOk(args) => fr.put_u32(args.message_count),
        MethodFrameArgs::QueueDelete(args) => encode_queue_delete(&mut fr, args),
        MethodFrameArgs::QueueDeleteOk(args) => fr.put_u32(args.message_count),
        MethodFrameArgs::QueueUnbind(args) => encode_queue_unbind(&mut fr, args),
        MethodFrameArgs::QueueUnbindOk => (),
        MethodFrameArgs::BasicQos(args) => encode_basic_qos(&mut fr, args),
        MethodFrameArgs::BasicQosOk => (),
        MethodFrameArgs::BasicConsume(args) => encode_basic_consume(&mut fr, args),
        MethodFrameArgs::BasicConsumeOk(args) => encode_short_string(&mut fr, &args.consumer_tag),
        MethodFrameArgs::BasicCancel(args) => encode_basic_cancel(&mut fr, args),
        MethodFrameArgs::BasicCancelOk(args) => encode_short_string(&mut fr, &args.consumer_tag),
        MethodFrameArgs::BasicGet(args) => encode_basic_get(&mut fr, args),
        MethodFrameArgs::BasicGetOk(args) => encode_basic_get_ok(&mut fr, args),
        MethodFrameArgs::BasicGetEmpty => encode_empty_short_string(&mut fr),
        MethodFrameArgs::BasicPublish(args) => encode_basic_publish(&mut fr, args),
        MethodFrameArgs::BasicReturn(args) => encode_basic_return(&mut fr, args),
        MethodFrameArgs::BasicDeliver(args) => encode_basic_deliver(&mut fr, args),
        MethodFrameArgs::BasicAck(args) => {
            fr.put_u64(args.delivery_tag);
            fr.put_u8(args.multiple as u8);
        }
        MethodFrameArgs::BasicReject(args) => {
            fr.put_u64(args.delivery_tag);
            fr.put_u8(args.requeue as u8);
        }
        MethodFrameArgs::BasicNack(args) => {
            fr.put_u64(args.delivery_tag);
            fr.put_u8(args.flags.bits());
        }
        MethodFrameArgs::ConfirmSelect(args) => fr.put_u8(args.no_wait as u8),
        MethodFrameArgs::ConfirmSelectOk => (),
    }

    buf.put_u32(fr.len() as u32);
    buf.put(fr);
    buf.put_u8(FRAME_END);
}

fn encode_connection_start(mut buf: &mut BytesMut, args: &ConnectionStartArgs) {
    buf.put_u8(args.version_major);
    buf.put_u8(args.version_minor);
    encode_optional_field_table(&mut buf, args.properties.as_ref());
    encode_long_string(&mut buf, &args.mechanisms);
    encode_long_string(&mut buf, &args.locales);
}

fn encode_connection_start_ok(mut buf: &mut BytesMut, args: &ConnectionStartOkArgs) {
    encode_optional_field_table(&mut buf, args.properties.as_ref());
    encode_short_string(&mut buf, &args.mechanism);
    encode_long_string(&mut buf, &args.response);
    encode_short_string(&mut buf, &args.locale);
}

fn encode_connection_tune(buf: &mut BytesMut, args: &ConnectionTuneArgs) {
    buf.put_u16(args.channel_max);
    buf.put_u32(args.frame_max);
    buf.put_u16(args.heartbeat);
}

fn encode_connection_tune_ok(buf: &mut BytesMut, args: &ConnectionTuneOkArgs) {
    buf.put_u16(args.channel_max);
    buf.put_u32(args.frame_max);
    buf.put_u16(args.heartbeat);
}

fn encode_connection_open(buf: &mut BytesMut, args: &ConnectionOpenArgs) {
    encode_short_string(buf, &args.virtual_host);
    encode_short_string(buf, "");

    let mut flags = 0x00;

    if args.insist {
        flags |= 0x01;
    }

    buf.put_u8(flags);
}

fn encode_connection_close(mut buf: &mut BytesMut, args: &ConnectionCloseArgs) {
    buf.put_u16(args.code);
    encode_short_string(&mut buf, &args.text);
    buf.put_u16(args.class_id);
    buf.put_u16(args.method_id);
}

fn encode_channel_close(mut buf: &mut BytesMut, args: &ChannelCloseArgs) {
    buf.put_u16(args.code);
    encode_short_string(&mut buf, &args.text);
    buf.put_u16(args.class_id);
    buf.put_u16(args.method_id);
}

fn encode_exchange_declare(mut buf: &mut BytesMut, args: &ExchangeDeclareArgs) {
    buf.put_u16(0);
    encode_short_string(&mut buf, &args.exchange_name);
    encode_short_string(&mut buf, &args.exchange_type);
    buf.put_u8(args.flags.bits());
    encode_optional_field_table(&mut buf, args.args.as_ref());
}

fn encode_exchange_delete(mut buf: &mut BytesMut, args: &ExchangeDeleteArgs) {
    buf.put_u16(0);
    encode_short_string(&mut buf, &args.exchange_name);
    buf.put_u8(args.flags.bits());
}

fn encode_queue_declare(mut buf: &mut BytesMut, args: &QueueDeclareArgs) {
    buf.put_u16(0);
    encode_short_string(&mut buf, &args.name);
    buf.put_u8(args.flags.bits());
    encode_optional_field_table(&mut buf, args.args.as_ref());
}

fn encode_queue_declare_ok(mut buf: &mut BytesMut, args: &QueueDeclareOkArgs) {
    encode_short_string(&mut buf, &args.name);
    buf.put_u32(args.message_count);
    buf.put_u32(args.consumer_count);
}

fn encode_queue_bind(mut buf: &mut BytesMut, args: &QueueBindArgs) {
    buf.put_u16(0);
    encode_short_string(&mut buf, &args.queue_name);
    encode_short_string(&mut buf, &args.exchange_name);
    encode_short_string(&mut buf, &args.routing_key);
    buf.put_u8(args.no_wait as u8);
    encode_optional_field_table(&mut buf, args.args.as_ref());
}

fn encode_queue_purge(mut buf: &mut BytesMut, args: &QueuePurgeArgs) {
    buf.put_u16(0);
    encode_short_string(&mut buf, &args.queue_name);
    buf.put_u8(args.no_wait as u8);
}

fn encode_queue_delete(mut buf: &mut BytesMut, args: &QueueDeleteArgs) {
    buf.put_u16(0);
    encode_short_string(&mut buf, &args.queue_name);
    buf.put_u8(args.flags.bits());
}

fn encode_queue_unbind(mut buf: &mut BytesMut, args: &QueueUnbindArgs) {
    buf.put_u16(0);
    encode_short_string(&mut buf, &args.queue_name);
    encode_short_string(&mut buf, &args.exchange_name);
    encode_short_string(&mut buf, &args.routing_key);
    encode_optional_field_table(&mut buf, args.args.as_ref());
}

fn encode_basic_qos(buf: &mut BytesMut, args: &BasicQosArgs) {
    buf.put_u32(args.prefetch_size);
    buf.put_u16(args.prefetch_count);
    buf.put_u8(args.global as u8);
}

fn encode_basic_consume(mut buf: &mut BytesMut, args: &BasicConsumeArgs) {
    buf.put_u16(0);
    encode_short_string(&mut buf, &args.queue);
    encode_short_string(&mut buf, &args.consumer_tag);
    buf.put_u8(args.flags.bits());
    encode_optional_field_table(&mut buf, args.args.as_ref());
}

fn encode_basic_cancel(mut buf: &mut BytesMut, args: &BasicCancelArgs) {
    encode_short_string(&mut buf, &args.consumer_tag);
    buf.put_u8(args.no_wait as u8);
}

fn encode_basic_get(mut buf: &mut BytesMut, args: &BasicGetArgs) {
    buf.put_u16(0);
    encode_short_string(&mut buf, &args.queue);
    buf.put_u8(args.no_ack as u8);
}

fn encode_basic_get_ok(mut buf: &mut BytesMut, args: &BasicGetOkArgs) {
    buf.put_u64(args.delivery_tag);
    buf.put_u8(args.redelivered as u8);
    encode_short_string(&mut buf, &args.exchange_name);
    encode_short_string(&mut buf, &args.routing_key);
    buf.put_u32(args.message_count);
}

fn encode_basic_publish(mut buf: &mut BytesMut, args: &BasicPublishArgs) {
    buf.put_u16(0);
    encode_short_string(&mut buf, &args.exchange_name);
    encode_short_string(&mut buf, &args.routing_key);
    buf.put_u8(args.flags.bits());
}

fn encode_basic_return(mut buf: &mut BytesMut, args: &BasicReturnArgs) {
    buf.put_u16(args.reply_code);
    encode_short_string(&mut buf, &args.reply_text);
    encode_short_string(&mut buf, &args.exchange_name);
    encode_short_string(&mut buf, &args.routing_key);
}

fn encode_basic_deliver(mut buf: &mut BytesMut, args: &BasicDeliverArgs) {
    encode_short_string(&mut buf, &args.consumer_tag);
    buf.put_u64(args.delivery_tag);
    buf.put_u8(args.redelivered as u8);
    encode_short_string(&mut buf, &args.exchange_name);
    encode_short_string(&mut buf, &args.routing_key);
}

fn encode_content_header_frame(buf: &mut BytesMut, hf: &ContentHeaderFrame) {
    buf.put_u8(FRAME_CONTENT_HEADER);
    buf.put_u16(hf.channel);

    let mut fr = BytesMut::with_capacity(4096);
    fr.put_u16(hf.class_id);
    fr.put_u16(hf.weight);
    fr.put_u64(hf.body_size);
    fr.put_u16(hf.prop_flags.bits());

    if let Some(ref content_type) = hf.content_type {
        encode_short_string(&mut fr, content_type);
    }
    if let Some(ref content_encoding) = hf.content_encoding {
        encode_short_string(&mut fr, content_encoding);
    }
    if let Some(ref headers) = hf.headers {
        encode_field_table(&mut fr, headers);
    }
    if let Some(delivery_mode) = hf.delivery_mode {
        fr.put_u8(delivery_mode);
    }
    if let Some(priority) = hf.priority {
        fr.put_u8(priority);
    }
    if let Some(ref correlation_id) = hf.correlation_id {
        encode_short_string(&mut fr, correlation_id);
    }
    if let Some(ref reply_to) = hf.reply_to {
        encode_short_string(&mut fr, reply_to);
    }
    if let Some(ref expiration) = hf.expiration {
        encode_short_string(&mut fr, expiration);
    }
    if let Some(ref message_id) = hf.message_id {
        encode_short_string(&mut fr, message_id);
    }
    if let Some(timestamp) = hf.timestamp {
        fr.put_u64(timestamp);
    }
    if let Some(ref message_type) = hf.message_type {
        encode_short_string(&mut fr, message_type);
    }
    if let Some(ref user_id) = hf.user_id {
        encode_short_string(&mut fr, user_id);
    }
    if let Some(ref app_id) = hf.app_id {
        encode_short_string(&mut fr, app_id);
    }
    if let Some(ref cluster_id) = hf.cluster_id {
        encode_short_string(&mut fr, cluster_id);
    }

    buf.put_u32(fr.len() as u32);
    buf.put(fr);
    buf.put_u8(FRAME_END);
}

fn encode_content_body_frame(buf: &mut BytesMut, bf: &ContentBodyFrame) {
    buf.put_u8(FRAME_CONTENT_BODY);
    buf.put_u16(bf.channel);
    buf.put_u32(bf.body.len() as u32);
    buf.put(bf.body.as_slice());
    buf.put_u8(FRAME_END);
}

fn encode_heartbeat_frame(buf: &mut BytesMut, channel: Channel) {
    buf.put_u8(FRAME_HEARTBEAT);
    buf.put_u16(channel);
    buf.put_u32(0);
    buf.put_u8(FRAME_END);
}

fn encode_empty_short_string(buf: &mut BytesMut) {
    buf.put_u8(0);
}

fn encode_short_string(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() < 256);

    buf.put_u8(s.len() as u8);
    buf.put(s.as_bytes());
}

fn encode_long_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put(s.as_bytes());
}

fn encode_optional_field_table(mut buf: &mut BytesMut, ft: Option<&FieldTable>) {
    match ft {
        None => buf.put_u32(0),
        Some(t) => encode_field_table(&mut buf, t),
    }
}

fn encode_field_table(buf: &mut BytesMut, ft: &FieldTable) {
    let mut ft_buf = BytesMut::with_capacity(4096);

    for (name, value) in ft {
        encode_short_string(&mut ft_buf, name);
        encode_field_value(&mut ft_buf, value);
    }

    buf.put_u32(ft_buf.len() as u32);
    buf.put(ft_buf);
}

fn encode_field_array(buf: &mut BytesMut, values: &[AMQPFieldValue]) {
    let mut fa_buf = BytesMut::with_capacity(4096);

    for value in values {
        encode_field_value(&mut fa_buf, value);
    }

    buf.put_u32(fa_buf.len() as u32);
    buf.put(fa_buf);
}

fn encode_field_value(mut buf: &mut BytesMut, value: &AMQPFieldValue) {
    match value {
        AMQPFieldValue::Bool(v) => {
            buf.put_u8(b't');
            buf.put_u8(*v as u8);
        }
        AMQPFieldValue::I8(v) => {
            buf.put_u8(b'b');
            buf.put_i8(*v);
        }
        AMQPFieldValue::I16(v) => {
            buf.put_u8(b's');
            buf.put_i16(*v);
        }
        AMQPFieldValue::I32(v) => {
            buf.put_u8(b'I');
            buf.put_i32(*v);
        }
        AMQPFieldValue::I64(v) => {
            buf.put_u8(b'l');
            buf.put_i64(*v);
        }
        AMQPFieldValue::Double(v) => {
            buf.put_u8(b'd');
            buf.put_u64(v.to_bits());
        }
        AMQPFieldValue::LongString(v) => {
            buf.put_u8(b'S');
            encode_long_string(&mut buf, v);
        }
        AMQPFieldValue::FieldTable(v) => {
            buf.put_u8(b'F');
            encode_field_table(&mut buf, v);
        }
        AMQPFieldValue::FieldArray(v) => {
            buf.put_u8(b'A');
            encode_field_array(&mut buf, v);
        }
        AMQPFieldValue::Void => buf.put_u8(b'V'),
    }
}
