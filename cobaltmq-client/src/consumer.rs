use std::time::Duration;

use crate::{
    client_api::{send_command, Command, CommandSink},
    error::ClientError,
    message::DeliveredMessage,
    model::ChannelNumber,
    promise::{promise, Promise},
};
use anyhow::Result;
use tokio::sync::mpsc;

/// A signal arriving from the server while consuming a queue.
#[derive(Debug)]
pub enum ConsumerSignal {
    Delivered(Box<DeliveredMessage>),
    /// The consume was cancelled, by this client or by the server.
    Cancelled,
    ChannelClosed(ClientError),
    ConnectionClosed(ClientError),
}

pub(crate) type ConsumerSink = mpsc::UnboundedSender<ConsumerSignal>;

/// An established subscription (`Basic.Consume`).
///
/// This is the multi-shot side of the promise model: one subscription keeps
/// yielding signals, once per delivered message, until it is cancelled.
/// Signals arrive in the order the server sent the deliveries.
pub struct Consumer {
    /// The channel the messages are delivered on. One consumer per channel.
    pub channel: ChannelNumber,
    /// Identifier of the consumer in the server.
    pub consumer_tag: String,
    pub(crate) command_sink: CommandSink,
    pub(crate) signal_stream: mpsc::UnboundedReceiver<ConsumerSignal>,
}

impl Consumer {
    /// Waits for the next signal. `None` means the connection task is gone.
    pub async fn next(&mut self) -> Option<ConsumerSignal> {
        self.signal_stream.recv().await
    }

    /// Waits for the next signal at most `timeout` long. `None` means no
    /// signal arrived in time; the consumer keeps working and a later call
    /// picks up where this one left.
    pub async fn receive(&mut self, timeout: Duration) -> Option<ConsumerSignal> {
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        tokio::select! {
            signal = self.signal_stream.recv() => {
                signal
            }
            _ = &mut sleep => {
                None
            }
        }
    }

    /// Changes how many unacknowledged deliveries the server pushes to this
    /// consumer before it withholds further ones. The limit is enforced by
    /// the server, the client only forwards it.
    pub async fn qos(&self, prefetch_count: u16) -> Result<Promise<()>> {
        let (resolver, promise) = promise();

        send_command(
            &self.command_sink,
            Command::Qos {
                channel: self.channel,
                prefetch_count,
                resolver,
            },
        )
        .await?;

        Ok(promise)
    }

    /// Cancels the subscription. The cancel is acknowledged by the server and
    /// the promise resolves with the consumer tag; deliveries which were in
    /// flight before the server processed the cancel still arrive on this
    /// consumer.
    pub async fn cancel(&mut self) -> Result<Promise<String>> {
        let (resolver, promise) = promise();

        send_command(
            &self.command_sink,
            Command::CancelConsume {
                channel: self.channel,
                consumer_tag: self.consumer_tag.clone(),
                resolver,
            },
        )
        .await?;

        Ok(promise)
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Consumer {{ channel: {}, consumer_tag: {} }}",
            self.channel, self.consumer_tag
        )
    }
}
