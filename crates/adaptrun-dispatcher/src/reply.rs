//! Correlated reply publication.

use std::collections::BTreeMap;

use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel};
use thiserror::Error;
use tracing::debug;

/// Reply publication errors. Terminal for the request; never retried.
#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("broker publish failed: {0}")]
    Broker(#[from] lapin::Error),
}

/// Emits one correlated outbound message per request.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn publish(
        &self,
        routing_key: &str,
        headers: &BTreeMap<String, String>,
        body: &[u8],
    ) -> Result<(), ReplyError>;
}

/// Publishes replies on a long-lived broker channel shared across all
/// in-flight requests; the channel handle is safe for concurrent use.
#[derive(Clone)]
pub struct ReplyPublisher {
    channel: Channel,
}

impl ReplyPublisher {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ReplySink for ReplyPublisher {
    async fn publish(
        &self,
        routing_key: &str,
        headers: &BTreeMap<String, String>,
        body: &[u8],
    ) -> Result<(), ReplyError> {
        let properties = BasicProperties::default().with_headers(to_field_table(headers));

        self.channel
            .basic_publish(
                "",
                routing_key,
                lapin::options::BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?
            .await?;

        debug!(routing_key = %routing_key, "published reply");
        Ok(())
    }
}

fn to_field_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.as_str()),
            AMQPValue::LongString(value.as_str().into()),
        );
    }
    table
}
