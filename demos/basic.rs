use anyhow::Result;
use cobaltmq_client::{ExchangeDeclareOpts, ExchangeType, PublishedMessage, QueueDeclareOpts};

#[tokio::main]
async fn main() -> Result<()> {
    let exchange = "test-xchg";
    let queue = "test-queue";

    cobaltmq_client::setup_logger();

    let client = cobaltmq_client::connect("localhost:5672", "guest", "guest").await?;

    client
        .exchange_declare(exchange, ExchangeType::Fanout, ExchangeDeclareOpts::default())
        .await?
        .wait()
        .await?;
    client.queue_declare(queue, QueueDeclareOpts::default()).await?.wait().await?;
    client.queue_bind(queue, exchange, "").await?.wait().await?;

    let publish = client
        .basic_publish(exchange, "no-key", PublishedMessage::default().text("Hey man"))
        .await?;

    publish.wait().await?;

    client.close().await?;

    Ok(())
}
