//! Broker intake: queue topology and the consume loop.

use std::sync::Arc;

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, ExchangeKind};
use tracing::{error, info, warn};

use crate::dispatch::{Dispatcher, InboundDelivery};

pub const EXCHANGE: &str = "adaptation-exchange";
pub const QUEUE: &str = "adaptation-request-queue";
pub const ROUTING_KEY: &str = "adaptation-request";

const CONSUMER_TAG: &str = "adaptrun-dispatcher";

/// Declare the exchange and queue and bind them together.
pub async fn bind_topology(channel: &Channel) -> Result<(), lapin::Error> {
    channel
        .exchange_declare(
            EXCHANGE,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_declare(
            QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_bind(
            QUEUE,
            EXCHANGE,
            ROUTING_KEY,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    Ok(())
}

/// Consume deliveries until the broker connection closes. Each delivery is
/// handled on its own task so a slow transformation never blocks intake;
/// per-request failures are logged and the loop continues.
pub async fn serve(channel: Channel, dispatcher: Arc<Dispatcher>) -> Result<(), lapin::Error> {
    let mut consumer = channel
        .basic_consume(
            QUEUE,
            CONSUMER_TAG,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    info!(queue = QUEUE, "waiting for adaptation requests");

    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(error = %e, "consumer stream error");
                continue;
            }
        };

        let inbound = decode_delivery(&delivery.properties);
        let dispatcher = dispatcher.clone();

        tokio::spawn(async move {
            if let Err(e) = dispatcher.handle(inbound).await {
                error!(error = %e, "failed to process delivery");
            }
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                warn!(error = %e, "failed to ack delivery");
            }
        });
    }

    info!("consumer stream closed");
    Ok(())
}

/// Decode the delivery envelope: string-valued headers plus the reply
/// destination. Non-string header values are ignored; validation of the
/// required keys is the dispatcher's job.
fn decode_delivery(properties: &BasicProperties) -> InboundDelivery {
    let mut inbound = InboundDelivery::default();

    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.to_string(),
                _ => continue,
            };
            inbound.headers.insert(key.to_string(), value);
        }
    }

    if let Some(reply_to) = properties.reply_to() {
        inbound.reply_to = reply_to.to_string();
    }

    inbound
}

#[cfg(test)]
mod tests {
    use super::*;
    use adaptrun_core::headers;
    use lapin::types::ShortString;

    #[test]
    fn test_decode_delivery_extracts_headers_and_reply_to() {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from(headers::FILE_ID),
            AMQPValue::LongString("abc123".into()),
        );
        table.insert(
            ShortString::from(headers::SOURCE_URL),
            AMQPValue::LongString("http://store/in/abc123".into()),
        );
        table.insert(ShortString::from("attempt"), AMQPValue::LongInt(2));

        let properties = BasicProperties::default()
            .with_headers(table)
            .with_reply_to(ShortString::from("reply-q"));

        let inbound = decode_delivery(&properties);

        assert_eq!(inbound.headers.get(headers::FILE_ID).unwrap(), "abc123");
        assert_eq!(
            inbound.headers.get(headers::SOURCE_URL).unwrap(),
            "http://store/in/abc123"
        );
        assert!(!inbound.headers.contains_key("attempt"));
        assert_eq!(inbound.reply_to, "reply-q");
    }

    #[test]
    fn test_decode_delivery_without_headers_is_empty() {
        let inbound = decode_delivery(&BasicProperties::default());

        assert!(inbound.headers.is_empty());
        assert!(inbound.reply_to.is_empty());
    }
}
