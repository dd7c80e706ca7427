use std::time::Duration;

use async_nats::jetstream::{self, consumer::pull, AckKind, Context};
use bytes::Bytes;
use futures::StreamExt;

use hzn_bus::{Bus, Delivery, DeliveryStream};
use hzn_types::HznError;

use crate::stream_of;

/// [`Bus`] over JetStream durable pull consumers.
///
/// A consumer group maps to a durable consumer named after the group and
/// filtered on the subscribed subject; all replicas using the same group pull
/// from the same consumer.
#[derive(Clone)]
pub struct NatsBus {
    context: Context,
    ack_wait: Duration,
}

impl NatsBus {
    pub fn new(context: Context, ack_wait: Duration) -> Self {
        NatsBus { context, ack_wait }
    }
}

impl Bus for NatsBus {
    type Delivery = NatsDelivery;

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), HznError> {
        self.context
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| HznError::Bus(format!("publish to {topic}: {e}")))?
            .await
            .map_err(|e| HznError::Bus(format!("publish ack from {topic}: {e}")))?;
        Ok(())
    }

    async fn subscribe(&self, filter: &str, group: &str) -> Result<DeliveryStream<NatsDelivery>, HznError> {
        let stream_name = stream_of(filter);
        let stream = self
            .context
            .get_stream(stream_name)
            .await
            .map_err(|e| HznError::Bus(format!("stream {stream_name}: {e}")))?;

        let consumer = stream
            .get_or_create_consumer(
                group,
                pull::Config {
                    durable_name: Some(group.to_string()),
                    filter_subject: filter.to_string(),
                    ack_wait: self.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| HznError::Bus(format!("consumer {group} on {filter}: {e}")))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| HznError::Bus(format!("pull from {group}: {e}")))?;
        tracing::info!(stream = stream_name, filter, group, "consuming");

        let deliveries = messages.map(|message| {
            message
                .map(NatsDelivery::new)
                .map_err(|e| HznError::Bus(e.to_string()))
        });
        Ok(Box::pin(deliveries))
    }
}

pub struct NatsDelivery {
    message: jetstream::Message,
    delivered: u64,
}

impl NatsDelivery {
    fn new(message: jetstream::Message) -> Self {
        let delivered = message
            .info()
            .map(|info| info.delivered.max(1) as u64)
            .unwrap_or(1);
        NatsDelivery { message, delivered }
    }
}

impl Delivery for NatsDelivery {
    fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    fn delivery_count(&self) -> u64 {
        self.delivered
    }

    async fn ack(self) -> Result<(), HznError> {
        self.message.ack().await.map_err(|e| HznError::Bus(format!("ack: {e}")))
    }

    async fn nak(self, delay: Option<Duration>) -> Result<(), HznError> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| HznError::Bus(format!("nak: {e}")))
    }
}
