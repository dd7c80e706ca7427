//! Durable publish/subscribe with competing consumer groups.
//!
//! Both services only ever see the [`Bus`] and [`Delivery`] traits. The
//! production backend is JetStream (`hzn-nats`); [`mem::MemBus`] is the
//! in-process backend used by `standalone` mode and by every behavioural test.

pub mod mem;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;

use hzn_types::HznError;

pub use mem::{GroupStats, MemBus, MemDelivery};

/// One message handed to one member of a consumer group.
///
/// A delivery must be settled exactly once with [`ack`](Delivery::ack) or
/// [`nak`](Delivery::nak). A delivery that is dropped unsettled is redelivered
/// by the backend after its ack-wait.
pub trait Delivery: Send + 'static {
    fn subject(&self) -> &str;

    fn payload(&self) -> &Bytes;

    /// 1 on first delivery, incremented on every redelivery.
    fn delivery_count(&self) -> u64;

    fn ack(self) -> impl Future<Output = Result<(), HznError>> + Send;

    /// Ask for a redelivery, after `delay` when given.
    fn nak(self, delay: Option<Duration>) -> impl Future<Output = Result<(), HznError>> + Send;
}

pub type DeliveryStream<D> = Pin<Box<dyn Stream<Item = Result<D, HznError>> + Send>>;

/// Methods use RPITIT (`-> impl Future + Send`), like the storage traits.
pub trait Bus: Send + Sync + 'static {
    type Delivery: Delivery;

    /// Durably append `payload` to `topic`.
    fn publish(&self, topic: &str, payload: Bytes)
        -> impl Future<Output = Result<(), HznError>> + Send;

    /// Join consumer group `group` on subjects matching `filter`.
    ///
    /// Every subscriber of the same group competes for the same messages; each
    /// message is handed to one live member at a time.
    fn subscribe(&self, filter: &str, group: &str)
        -> impl Future<Output = Result<DeliveryStream<Self::Delivery>, HznError>> + Send;
}

/// NATS-style subject matching: `*` matches exactly one token, a trailing `>`
/// matches one or more.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return filter_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_subjects() {
        assert!(subject_matches("SPOTS.get-horizon", "SPOTS.get-horizon"));
        assert!(!subject_matches("SPOTS.get-horizon", "SPOTS.compute-horizon"));
        assert!(!subject_matches("SPOTS", "SPOTS.get-horizon"));
        assert!(!subject_matches("SPOTS.get-horizon", "SPOTS"));
    }

    #[test]
    fn wildcards() {
        assert!(subject_matches("ERRORS.*", "ERRORS.horizon-get-service"));
        assert!(!subject_matches("ERRORS.*", "ERRORS"));
        assert!(!subject_matches("ERRORS.*", "ERRORS.a.b"));
        assert!(subject_matches("ERRORS.>", "ERRORS.a.b"));
        assert!(!subject_matches("ERRORS.>", "ERRORS"));
        assert!(subject_matches("*.sunsets", "HORIZONS.sunsets"));
    }
}
