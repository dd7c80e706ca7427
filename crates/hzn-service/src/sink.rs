use std::sync::Arc;

use bytes::Bytes;

use hzn_bus::Bus;
use hzn_types::{ErrorRecord, HznError};

use crate::config::Topics;

/// Publishes dead-letter records to `<errors>.<sender>`.
///
/// Reporting never fails: a record that cannot be published is logged and
/// dropped so that the message that produced it can still be settled.
pub struct ErrorSink<B: Bus> {
    bus: Arc<B>,
    topic: String,
    sender: String,
}

impl<B: Bus> ErrorSink<B> {
    pub fn new(bus: Arc<B>, topics: &Topics, sender: &str) -> Self {
        ErrorSink { bus, topic: topics.error_topic(sender), sender: sender.to_string() }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn report(&self, input: &[u8], reason: &HznError) {
        let record = ErrorRecord::new(input, reason, &self.sender);
        let payload = match record.encode() {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                tracing::error!(request_id = %record.request_id, error = %e, "cannot encode error record");
                return;
            }
        };
        if let Err(e) = self.bus.publish(&self.topic, payload).await {
            tracing::error!(
                topic = %self.topic,
                request_id = %record.request_id,
                reason = %reason,
                error = %e,
                "cannot publish error record"
            );
        }
    }
}
