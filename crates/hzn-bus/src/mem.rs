use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, RwLock};

use hzn_types::HznError;

use crate::{subject_matches, Bus, Delivery, DeliveryStream};

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Queued {
    subject: String,
    payload: Bytes,
    delivered: u64,
}

#[derive(Debug, Default)]
struct GroupCounters {
    acked: AtomicU64,
    naked: AtomicU64,
    redelivered: AtomicU64,
}

/// Settlement counters of one consumer group.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GroupStats {
    pub acked: u64,
    pub naked: u64,
    /// Deliveries dropped without being settled.
    pub redelivered: u64,
}

/// Shared by every subscriber of one group: whoever holds the receiver lock
/// gets the next message.
#[derive(Clone)]
struct GroupQueue {
    tx: mpsc::UnboundedSender<Queued>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Queued>>>,
    counters: Arc<GroupCounters>,
}

impl GroupQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        GroupQueue {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            counters: Arc::new(GroupCounters::default()),
        }
    }

    fn enqueue(&self, subject: &str, payload: Bytes) {
        // The bus owns a receiver handle for every group, so this cannot fail.
        let _ = self.tx.send(Queued { subject: subject.to_string(), payload, delivered: 1 });
    }
}

struct MemBusInner {
    /// Every message ever published, in publish order.
    log: Vec<(String, Bytes)>,
    /// Keyed by `(filter, group)`.
    groups: HashMap<(String, String), GroupQueue>,
}

// ---------------------------------------------------------------------------
// MemBus
// ---------------------------------------------------------------------------

/// In-process [`Bus`] with JetStream-like delivery semantics.
///
/// * A group created after messages were published receives the whole log
///   (deliver-all), like a fresh durable consumer.
/// * `nak` redelivers after the requested delay with `delivery_count + 1`.
/// * A delivery dropped without `ack`/`nak` is redelivered immediately, which
///   stands in for ack-wait expiry.
#[derive(Clone)]
pub struct MemBus {
    inner: Arc<RwLock<MemBusInner>>,
}

impl Default for MemBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemBus {
    pub fn new() -> Self {
        MemBus {
            inner: Arc::new(RwLock::new(MemBusInner { log: Vec::new(), groups: HashMap::new() })),
        }
    }

    /// Payloads published on subjects matching `filter`, in publish order.
    pub async fn published(&self, filter: &str) -> Vec<Bytes> {
        let inner = self.inner.read().await;
        inner
            .log
            .iter()
            .filter(|(subject, _)| subject_matches(filter, subject))
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub async fn stats(&self, filter: &str, group: &str) -> Option<GroupStats> {
        let inner = self.inner.read().await;
        inner.groups.get(&(filter.to_string(), group.to_string())).map(|queue| GroupStats {
            acked: queue.counters.acked.load(Ordering::SeqCst),
            naked: queue.counters.naked.load(Ordering::SeqCst),
            redelivered: queue.counters.redelivered.load(Ordering::SeqCst),
        })
    }
}

impl Bus for MemBus {
    type Delivery = MemDelivery;

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), HznError> {
        if topic.is_empty() || topic.contains(['*', '>']) {
            return Err(HznError::InvalidArgument(format!("cannot publish to '{topic}'")));
        }
        let mut inner = self.inner.write().await;
        inner.log.push((topic.to_string(), payload.clone()));
        for ((filter, _), queue) in inner.groups.iter() {
            if subject_matches(filter, topic) {
                queue.enqueue(topic, payload.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str, group: &str) -> Result<DeliveryStream<MemDelivery>, HznError> {
        let queue = {
            let mut inner = self.inner.write().await;
            let id = (filter.to_string(), group.to_string());
            match inner.groups.get(&id) {
                Some(queue) => queue.clone(),
                None => {
                    let queue = GroupQueue::new();
                    for (subject, payload) in inner.log.iter() {
                        if subject_matches(filter, subject) {
                            queue.enqueue(subject, payload.clone());
                        }
                    }
                    inner.groups.insert(id, queue.clone());
                    queue
                }
            }
        };
        tracing::debug!(filter, group, "subscribed");

        let deliveries = futures::stream::unfold(queue, |queue| async move {
            let next = queue.rx.lock().await.recv().await;
            next.map(|message| {
                let delivery = MemDelivery::new(message, &queue);
                (Ok(delivery), queue)
            })
        });
        Ok(Box::pin(deliveries))
    }
}

// ---------------------------------------------------------------------------
// MemDelivery
// ---------------------------------------------------------------------------

pub struct MemDelivery {
    subject: String,
    payload: Bytes,
    delivered: u64,
    requeue: mpsc::UnboundedSender<Queued>,
    counters: Arc<GroupCounters>,
    settled: bool,
}

impl MemDelivery {
    fn new(message: Queued, queue: &GroupQueue) -> Self {
        MemDelivery {
            subject: message.subject,
            payload: message.payload,
            delivered: message.delivered,
            requeue: queue.tx.clone(),
            counters: Arc::clone(&queue.counters),
            settled: false,
        }
    }

    fn redelivery(&self) -> Queued {
        Queued {
            subject: self.subject.clone(),
            payload: self.payload.clone(),
            delivered: self.delivered + 1,
        }
    }
}

impl Delivery for MemDelivery {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn payload(&self) -> &Bytes {
        &self.payload
    }

    fn delivery_count(&self) -> u64 {
        self.delivered
    }

    async fn ack(mut self) -> Result<(), HznError> {
        self.settled = true;
        self.counters.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nak(mut self, delay: Option<Duration>) -> Result<(), HznError> {
        self.settled = true;
        self.counters.naked.fetch_add(1, Ordering::SeqCst);
        let message = self.redelivery();
        match delay.filter(|d| !d.is_zero()) {
            None => {
                let _ = self.requeue.send(message);
            }
            Some(delay) => {
                let requeue = self.requeue.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = requeue.send(message);
                });
            }
        }
        Ok(())
    }
}

impl Drop for MemDelivery {
    fn drop(&mut self) {
        if !self.settled {
            self.counters.redelivered.fetch_add(1, Ordering::SeqCst);
            let _ = self.requeue.send(self.redelivery());
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    async fn next(stream: &mut DeliveryStream<MemDelivery>) -> MemDelivery {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("delivery")
            .expect("stream open")
            .expect("delivery ok")
    }

    async fn nothing_within(stream: &mut DeliveryStream<MemDelivery>, wait: Duration) -> bool {
        tokio::time::timeout(wait, stream.next()).await.is_err()
    }

    #[tokio::test]
    async fn publish_then_subscribe_delivers_log() {
        let bus = MemBus::new();
        bus.publish("SPOTS.get-horizon", Bytes::from_static(b"a")).await.unwrap();
        bus.publish("SPOTS.compute-horizon", Bytes::from_static(b"x")).await.unwrap();
        bus.publish("SPOTS.get-horizon", Bytes::from_static(b"b")).await.unwrap();

        let mut stream = bus.subscribe("SPOTS.get-horizon", "resolver").await.unwrap();
        let first = next(&mut stream).await;
        assert_eq!(first.payload().as_ref(), b"a");
        assert_eq!(first.subject(), "SPOTS.get-horizon");
        assert_eq!(first.delivery_count(), 1);
        first.ack().await.unwrap();

        let second = next(&mut stream).await;
        assert_eq!(second.payload().as_ref(), b"b");
        second.ack().await.unwrap();

        assert!(nothing_within(&mut stream, Duration::from_millis(30)).await);
        assert_eq!(
            bus.stats("SPOTS.get-horizon", "resolver").await,
            Some(GroupStats { acked: 2, naked: 0, redelivered: 0 })
        );
    }

    #[tokio::test]
    async fn members_of_a_group_compete() {
        let bus = MemBus::new();
        let mut a = bus.subscribe("T", "g").await.unwrap();
        let mut b = bus.subscribe("T", "g").await.unwrap();

        for i in 0..10u8 {
            bus.publish("T", Bytes::from(vec![i])).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            let d = next(&mut a).await;
            seen.push(d.payload()[0]);
            d.ack().await.unwrap();
            let d = next(&mut b).await;
            seen.push(d.payload()[0]);
            d.ack().await.unwrap();
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<u8>>());
        assert!(nothing_within(&mut a, Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn separate_groups_each_get_every_message() {
        let bus = MemBus::new();
        let mut results = bus.subscribe("HORIZONS.sunsets", "printer").await.unwrap();
        let mut audit = bus.subscribe("HORIZONS.*", "audit").await.unwrap();

        bus.publish("HORIZONS.sunsets", Bytes::from_static(b"r")).await.unwrap();

        next(&mut results).await.ack().await.unwrap();
        next(&mut audit).await.ack().await.unwrap();
    }

    #[tokio::test]
    async fn nak_redelivers_with_incremented_count() {
        let bus = MemBus::new();
        bus.publish("T", Bytes::from_static(b"m")).await.unwrap();
        let mut stream = bus.subscribe("T", "g").await.unwrap();

        let first = next(&mut stream).await;
        first.nak(Some(Duration::from_millis(20))).await.unwrap();

        assert!(nothing_within(&mut stream, Duration::from_millis(5)).await);
        let again = next(&mut stream).await;
        assert_eq!(again.delivery_count(), 2);
        assert_eq!(again.payload().as_ref(), b"m");
        again.ack().await.unwrap();

        let stats = bus.stats("T", "g").await.unwrap();
        assert_eq!(stats, GroupStats { acked: 1, naked: 1, redelivered: 0 });
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered() {
        let bus = MemBus::new();
        bus.publish("T", Bytes::from_static(b"m")).await.unwrap();
        let mut stream = bus.subscribe("T", "g").await.unwrap();

        drop(next(&mut stream).await);

        let again = next(&mut stream).await;
        assert_eq!(again.delivery_count(), 2);
        again.ack().await.unwrap();
        assert_eq!(bus.stats("T", "g").await.unwrap().redelivered, 1);
    }

    #[tokio::test]
    async fn wildcard_publish_is_rejected() {
        let bus = MemBus::new();
        let err = bus.publish("ERRORS.*", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, HznError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn published_filters_by_subject() {
        let bus = MemBus::new();
        bus.publish("ERRORS.horizon-get-service", Bytes::from_static(b"1")).await.unwrap();
        bus.publish("ERRORS.horizon-compute-service", Bytes::from_static(b"2")).await.unwrap();
        bus.publish("HORIZONS.sunsets", Bytes::from_static(b"3")).await.unwrap();

        assert_eq!(bus.published("ERRORS.*").await.len(), 2);
        assert_eq!(bus.published("HORIZONS.sunsets").await, vec![Bytes::from_static(b"3")]);
        assert!(bus.published("SPOTS.get-horizon").await.is_empty());
    }
}
