use super::{AMQPFieldValue, AMQPFrame, FieldTable, MethodFrameArgs};

#[derive(Debug, Default)]
pub struct ConnectionStartArgs {
    pub version_major: u8,
    pub version_minor: u8,
    pub properties: Option<FieldTable>,
    pub mechanisms: String,
    pub locales: String,
}

#[derive(Debug, Default)]
pub struct ConnectionStartOkArgs {
    pub properties: Option<FieldTable>,
    pub mechanism: String,
    pub response: String,
    pub locale: String,
}

#[derive(Debug, Default)]
pub struct ConnectionTuneArgs {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
}

#[derive(Debug, Default)]
pub struct ConnectionTuneOkArgs {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
}

#[derive(Debug, Default)]
pub struct ConnectionOpenArgs {
    pub virtual_host: String,
    pub insist: bool,
}

impl ConnectionStartArgs {
    pub fn frame(self) -> AMQPFrame {
        AMQPFrame::Method(0, super::CONNECTION_START, MethodFrameArgs::ConnectionStart(self))
    }
}

impl ConnectionStartOkArgs {
    /// Builds the usual PLAIN authentication reply with the default client
    /// properties.
    pub fn new(username: &str, password: &str) -> Self {
        let mut caps = FieldTable::new();

        caps.insert("authentication_failure_close".to_string(), AMQPFieldValue::Bool(true));
        caps.insert("publisher_confirms".to_string(), AMQPFieldValue::Bool(true));
        caps.insert("consumer_cancel_notify".to_string(), AMQPFieldValue::Bool(true));
        caps.insert("per_consumer_qos".to_string(), AMQPFieldValue::Bool(true));

        let mut client_properties = FieldTable::new();

        client_properties.insert("product".into(), AMQPFieldValue::LongString("cobaltmq-client".into()));
        client_properties.insert("platform".into(), AMQPFieldValue::LongString("Rust".into()));
        client_properties.insert("capabilities".into(), AMQPFieldValue::FieldTable(Box::new(caps)));
        client_properties.insert(
            "version".into(),
            AMQPFieldValue::LongString(env!("CARGO_PKG_VERSION").into()),
        );

        let mut auth = vec![0x00];
        auth.extend_from_slice(username.as_bytes());
        auth.push(0x00);
        auth.extend_from_slice(password.as_bytes());

        let auth_string = String::from_utf8(auth).unwrap();

        Self {
            properties: Some(client_properties),
            mechanism: "PLAIN".into(),
            response: auth_string,
            locale: "en_US".into(),
        }
    }

    /// Merges caller-supplied connection properties into the property table,
    /// untouched, on top of the defaults.
    pub fn properties(mut self, extra: FieldTable) -> Self {
        let props = self.properties.get_or_insert_with(FieldTable::new);

        for (k, v) in extra {
            props.insert(k, v);
        }

        self
    }

    pub fn frame(self) -> AMQPFrame {
        AMQPFrame::Method(0, super::CONNECTION_START_OK, MethodFrameArgs::ConnectionStartOk(self))
    }
}

impl ConnectionTuneArgs {
    pub fn frame(self) -> AMQPFrame {
        AMQPFrame::Method(0, super::CONNECTION_TUNE, MethodFrameArgs::ConnectionTune(self))
    }
}

impl ConnectionTuneOkArgs {
    pub fn channel_max(mut self, value: u16) -> Self {
        self.channel_max = value;
        self
    }

    pub fn frame_max(mut self, value: u32) -> Self {
        self.frame_max = value;
        self
    }

    pub fn heartbeat(mut self, value: u16) -> Self {
        self.heartbeat = value;
        self
    }

    pub fn frame(self) -> AMQPFrame {
        AMQPFrame::Method(0, super::CONNECTION_TUNE_OK, MethodFrameArgs::ConnectionTuneOk(self))
    }
}

impl ConnectionOpenArgs {
    pub fn virtual_host(mut self, virtual_host: &str) -> Self {
        self.virtual_host = virtual_host.to_string();
        self
    }

    pub fn frame(self) -> AMQPFrame {
        AMQPFrame::Method(0, super::CONNECTION_OPEN, super::MethodFrameArgs::ConnectionOpen(self))
    }
}

#[derive(Debug, Default)]
pub struct ConnectionCloseArgs {
    pub code: u16,
    pub text: String,
    pub class_id: u16,
    pub method_id: u16,
}

pub fn connection_tune(channel_max: u16, frame_max: u32, heartbeat: u16) -> AMQPFrame {
    AMQPFrame::Method(
        0,
        super::CONNECTION_TUNE,
        MethodFrameArgs::ConnectionTune(ConnectionTuneArgs {
            channel_max,
            frame_max,
            heartbeat,
        }),
    )
}

pub fn connection_open_ok() -> AMQPFrame {
    AMQPFrame::Method(0, super::CONNECTION_OPEN_OK, MethodFrameArgs::ConnectionOpenOk)
}

pub fn connection_close(code: u16, text: &str, class_method: u32) -> AMQPFrame {
    let (class_id, method_id) = super::split_class_method(class_method);

    AMQPFrame::Method(
        0,
        super::CONNECTION_CLOSE,
        MethodFrameArgs::ConnectionClose(ConnectionCloseArgs {
            code,
            text: text.into(),
            class_id,
            method_id,
        }),
    )
}

pub fn connection_close_ok() -> AMQPFrame {
    AMQPFrame::Method(0, super::CONNECTION_CLOSE_OK, MethodFrameArgs::ConnectionCloseOk)
}
