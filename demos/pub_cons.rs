use anyhow::Result;
use cobaltmq_client::*;
use std::time::Instant;

#[tokio::main]
async fn main() -> Result<()> {
    let exchange = "x_pubsub";
    let queue = "q_pubsub";

    cobaltmq_client::setup_logger();

    let client = cobaltmq_client::connect("localhost:5672", "guest", "guest").await?;

    client
        .exchange_declare(exchange, ExchangeType::Direct, ExchangeDeclareOpts::default())
        .await?
        .wait()
        .await?;
    client.queue_declare(queue, QueueDeclareOpts::default()).await?.wait().await?;
    client.queue_bind(queue, exchange, "").await?.wait().await?;

    let message_count = 1024u32;
    let message = "This will be the test message what we send over multiple times";

    let mut consumer = client.basic_consume(queue, ConsumeOpts::default()).await?.wait().await?;

    let start = Instant::now();

    for _ in 0..message_count {
        client
            .basic_publish(exchange, "", PublishedMessage::default().text(message))
            .await?;
    }

    let mut received = 0u32;

    while received < message_count {
        match consumer.next().await {
            Some(ConsumerSignal::Delivered(m)) => {
                received += 1;

                client.basic_ack(m.message.channel, m.delivery_tag).await?;
            }
            other => {
                eprintln!("Consuming stopped by {:?}", other);
                break;
            }
        }
    }

    println!(
        "Send and receive {} messages: {:?}",
        message_count,
        Instant::elapsed(&start)
    );

    let cancelled = consumer.cancel().await?;
    cancelled.wait().await?;

    client.close().await?;

    Ok(())
}
