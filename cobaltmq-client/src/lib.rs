//! Client of AMQP 0-9-1 servers, built around promise style operation
//! handles.
//!
//! Every operation sends its frames and returns a [`Promise`] right away;
//! waiting is separate and optional, also possible with a timeout. One
//! connection multiplexes concurrent operations over a pool of channels
//! which are reused most-recently-released first.
//!
//! ```no_run
//! use cobaltmq_client::{Client, NoAck, PublishedMessage, QueueDeclareOpts};
//!
//! async fn hello() -> anyhow::Result<()> {
//!     let client = Client::connect("localhost:5672", "guest", "guest").await?;
//!
//!     client.queue_declare("hello", QueueDeclareOpts::default()).await?.wait().await?;
//!
//!     let publish = client
//!         .basic_publish("", "hello", PublishedMessage::default().text("Hello, World!"))
//!         .await?;
//!     publish.wait().await?;
//!
//!     if let Some(msg) = client.basic_get("hello", NoAck(false)).await?.wait().await? {
//!         client.basic_ack(msg.message.channel, msg.delivery_tag).await?;
//!     }
//!
//!     client.close().await
//! }
//! ```
mod client_api;
pub use client_api::{
    connect, Client, ConnectionOpts, ConsumeOpts, ExchangeDeclareOpts, ExchangeType, IfEmpty, IfUnused, NoAck,
    QueueDeclareOpts, QueueDeclared, Requeue,
};

mod consumer;
pub use consumer::{Consumer, ConsumerSignal};

mod dev;
pub use dev::setup_logger;

mod error;
pub use error::{ClientError, UsageError};

mod message;
pub use message::{
    Content, DeliveredMessage, GetMessage, MessageProperties, PublishedMessage, ReturnedMessage,
};

mod model;
pub use model::{ChannelError, ChannelNumber, ClassId, ClassMethod, ConnectionError};

mod pool;
mod processor;

mod promise;
pub use promise::Promise;

mod state;
