use cobaltmq_codec::frame::{ContentBodyFrame, ContentHeaderFrame, FieldTable, HeaderPropertyFlags};

use crate::model::ChannelNumber;

/// A message sent to the server or received from the server.
#[derive(Debug, Default)]
pub struct Content {
    pub channel: ChannelNumber,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Standard set of message properties.
///
/// Header values are an opaque field table, the client passes them to the
/// server and back without interpreting them.
#[derive(Clone, Debug, Default)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    /// 1 - non-persistent, 2 - persistent
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub message_type: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

/// A delivered message.
///
/// With the `channel` of the content and the `delivery_tag` a client can
/// acknowledge or reject the message.
#[derive(Debug, Default)]
pub struct DeliveredMessage {
    pub message: Content,
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// A message fetched by a single poll (`Basic.Get`).
#[derive(Debug, Default)]
pub struct GetMessage {
    pub message: Content,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub message_count: u32,
}

/// A mandatory message returned to the client because it cannot be routed.
#[derive(Debug, Default)]
pub struct ReturnedMessage {
    pub message: Content,
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
}

/// A message published by the client.
#[derive(Debug, Default)]
pub struct PublishedMessage {
    pub message: Content,
    pub mandatory: bool,
    pub immediate: bool,
}

/// Internally it is comfortable to handle delivered, fetched or returned
/// messages in the same variable.
#[derive(Debug)]
pub(crate) enum Message {
    Delivered(DeliveredMessage),
    Get(GetMessage),
    Returned(ReturnedMessage),
}

impl Message {
    pub(crate) fn content_mut(&mut self) -> &mut Content {
        match self {
            Message::Delivered(dm) => &mut dm.message,
            Message::Get(gm) => &mut gm.message,
            Message::Returned(rm) => &mut rm.message,
        }
    }
}

impl From<&str> for PublishedMessage {
    fn from(value: &str) -> Self {
        Self {
            message: Content {
                channel: 0u16,
                body: value.as_bytes().to_vec(),
                properties: MessageProperties::default(),
            },
            ..Default::default()
        }
    }
}

impl PublishedMessage {
    pub fn text(mut self, value: &str) -> Self {
        self.message.body = value.as_bytes().to_vec();
        self
    }

    pub fn body(mut self, value: Vec<u8>) -> Self {
        self.message.body = value;
        self
    }

    pub fn properties(mut self, value: MessageProperties) -> Self {
        self.message.properties = value;
        self
    }

    /// Condition for mandatory publishing. Mandatory messages are failed if the exchange doesn't
    /// have a bound queue or if the routing keys are not matched.
    pub fn mandatory(mut self, value: bool) -> Self {
        self.mandatory = value;
        self
    }

    /// Condition for immediate publishing. Immediate messages are received by a server successfully
    /// if they managed to be sent to a consumer immediately.
    pub fn immediate(mut self, value: bool) -> Self {
        self.immediate = value;
        self
    }
}

pub(crate) fn to_content_frames(message: Content) -> (ContentHeaderFrame, ContentBodyFrame) {
    let props = message.properties;

    let mut header = ContentHeaderFrame {
        channel: message.channel,
        class_id: 0,
        weight: 0,
        body_size: message.body.len() as u64,
        prop_flags: HeaderPropertyFlags::default(),
        cluster_id: props.cluster_id,
        app_id: props.app_id,
        user_id: props.user_id,
        message_type: props.message_type,
        timestamp: props.timestamp,
        message_id: props.message_id,
        expiration: props.expiration,
        reply_to: props.reply_to,
        correlation_id: props.correlation_id,
        priority: props.priority,
        delivery_mode: props.delivery_mode,
        headers: props.headers,
        content_encoding: props.content_encoding,
        content_type: props.content_type,
    };

    set_property_flags(&mut header);

    let body = ContentBodyFrame {
        channel: message.channel,
        body: message.body,
    };

    (header, body)
}

fn set_property_flags(header: &mut ContentHeaderFrame) {
    let flags = &mut header.prop_flags;

    flags.set(HeaderPropertyFlags::CONTENT_TYPE, header.content_type.is_some());
    flags.set(HeaderPropertyFlags::CONTENT_ENCODING, header.content_encoding.is_some());
    flags.set(HeaderPropertyFlags::HEADERS, header.headers.is_some());
    flags.set(HeaderPropertyFlags::DELIVERY_MODE, header.delivery_mode.is_some());
    flags.set(HeaderPropertyFlags::PRIORITY, header.priority.is_some());
    flags.set(HeaderPropertyFlags::CORRELATION_ID, header.correlation_id.is_some());
    flags.set(HeaderPropertyFlags::REPLY_TO, header.reply_to.is_some());
    flags.set(HeaderPropertyFlags::EXPIRATION, header.expiration.is_some());
    flags.set(HeaderPropertyFlags::MESSAGE_ID, header.message_id.is_some());
    flags.set(HeaderPropertyFlags::TIMESTAMP, header.timestamp.is_some());
    flags.set(HeaderPropertyFlags::MESSAGE_TYPE, header.message_type.is_some());
    flags.set(HeaderPropertyFlags::USER_ID, header.user_id.is_some());
    flags.set(HeaderPropertyFlags::APP_ID, header.app_id.is_some());
    flags.set(HeaderPropertyFlags::CLUSTER_ID, header.cluster_id.is_some());
}

impl From<ContentHeaderFrame> for MessageProperties {
    fn from(value: ContentHeaderFrame) -> Self {
        MessageProperties {
            content_type: value.content_type,
            content_encoding: value.content_encoding,
            headers: value.headers,
            delivery_mode: value.delivery_mode,
            priority: value.priority,
            correlation_id: value.correlation_id,
            reply_to: value.reply_to,
            expiration: value.expiration,
            message_id: value.message_id,
            timestamp: value.timestamp,
            message_type: value.message_type,
            user_id: value.user_id,
            app_id: value.app_id,
            cluster_id: value.cluster_id,
        }
    }
}
