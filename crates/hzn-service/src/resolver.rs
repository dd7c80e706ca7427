//! The resolver answers horizon requests from the cache and makes sure at most
//! one computation per key is in flight.
//!
//! # How It Works
//!
//! For every inbound request:
//!
//! 1. **Cache check**: a cached profile is answered right away.
//! 2. **Lock check**: with no computation in flight the resolver claims the
//!    key and hands the request to the compute service.
//! 3. **Await release**: when another request already holds the key, the
//!    resolver watches the lock until it is released or the wait times out.
//!    A release is followed by a second cache read; a timeout (or a release
//!    that left no profile behind) requeues the request on the inbound topic.
//!
//! Every path that completes settles the delivery with an ack. Transient
//! store or bus failures are Nak'ed until the delivery budget is spent.

use std::sync::Arc;

use bytes::Bytes;

use hzn_bus::{Bus, Delivery};
use hzn_storage::{derive_key, CacheStore, ClaimOutcome, KvBucket, LockEvent, LockState, LockStore};
use hzn_types::{attach_horizon, HorizonKey, HorizonRequest, HznError, Radius};

use crate::await_release::{await_first, WaitOutcome};
use crate::config::{ResolverSettings, Topics};
use crate::sink::ErrorSink;
use crate::MessageHandler;

/// Service name used as consumer group and error record sender.
pub const RESOLVER_NAME: &str = "horizon-get-service";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Answered from the cache.
    CacheHit,
    /// Claimed the key and forwarded the request to the compute service.
    Delegated,
    /// Waited for another request's computation and answered from the cache.
    Coalesced,
    /// Put back on the inbound topic.
    Requeued { reason: RequeueReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueReason {
    TimedOut,
    /// The watch ended before the lock was released.
    WatchClosed,
    /// The lock was released but no profile was cached, e.g. the computation
    /// failed or the lock expired.
    ReleasedWithoutProfile,
}

pub struct Resolver<K: KvBucket, B: Bus> {
    cache: CacheStore<K>,
    locks: LockStore<K>,
    bus: Arc<B>,
    topics: Topics,
    radius: Radius,
    settings: ResolverSettings,
    errors: ErrorSink<B>,
}

impl<K: KvBucket, B: Bus> Resolver<K, B> {
    pub fn new(
        cache: CacheStore<K>,
        locks: LockStore<K>,
        bus: Arc<B>,
        topics: Topics,
        radius: Radius,
        settings: ResolverSettings,
    ) -> Self {
        let errors = ErrorSink::new(Arc::clone(&bus), &topics, RESOLVER_NAME);
        Resolver { cache, locks, bus, topics, radius, settings, errors }
    }

    /// Resolve one delivery and settle it.
    ///
    /// Returns the resolution, or the error that made this delivery fail; the
    /// error has already been reported and the delivery Nak'ed or acked.
    pub async fn process(&self, delivery: B::Delivery) -> Result<Resolution, HznError> {
        let delivered = delivery.delivery_count();
        let result = self.resolve(delivery.payload()).await;

        match &result {
            Ok(resolution) => {
                tracing::debug!(delivered, ?resolution, "request resolved");
                settle(delivery.ack().await);
            }
            Err(e) if e.is_transient() && self.settings.redeliver(delivered) => {
                tracing::warn!(delivered, error = %e, "transient failure, requesting redelivery");
                self.errors.report(delivery.payload(), e).await;
                settle(delivery.nak(self.settings.nak_delay()).await);
            }
            Err(e) => {
                tracing::warn!(delivered, error = %e, "request dead-lettered");
                self.errors.report(delivery.payload(), e).await;
                settle(delivery.ack().await);
            }
        }
        result
    }

    async fn resolve(&self, payload: &Bytes) -> Result<Resolution, HznError> {
        let request = HorizonRequest::decode(payload)?;
        let key = derive_key(&request.spot.loc, self.radius);
        let request_id = request.request_id.as_str();

        if self.cache.get(&key).await?.is_some() {
            tracing::debug!(request_id, %key, "cache hit");
            self.publish_result(payload, &key).await?;
            return Ok(Resolution::CacheHit);
        }

        let observed = match self.locks.get(&key).await? {
            LockState::Present { revision } => revision,
            LockState::Absent => match self.locks.claim(&key).await? {
                ClaimOutcome::Claimed { .. } => {
                    self.delegate(payload, &key).await?;
                    tracing::info!(request_id, %key, "claimed, delegated to compute");
                    return Ok(Resolution::Delegated);
                }
                // Lost the race: every release from now on is a fresh one.
                ClaimOutcome::AlreadyClaimed => 0,
            },
        };

        tracing::debug!(request_id, %key, observed, "computation in flight, awaiting release");
        match self.await_release(&key, observed).await? {
            WaitOutcome::Matched(_) => match self.cache.get(&key).await? {
                Some(_) => {
                    self.publish_result(payload, &key).await?;
                    tracing::debug!(request_id, %key, "released, answered from cache");
                    Ok(Resolution::Coalesced)
                }
                None => self.requeue(payload, request_id, RequeueReason::ReleasedWithoutProfile).await,
            },
            WaitOutcome::TimedOut => self.requeue(payload, request_id, RequeueReason::TimedOut).await,
            WaitOutcome::Closed => self.requeue(payload, request_id, RequeueReason::WatchClosed).await,
        }
    }

    /// Hand the request to the compute service, giving the claim back when
    /// that fails so the next delivery can claim again.
    async fn delegate(&self, payload: &Bytes, key: &HorizonKey) -> Result<(), HznError> {
        if let Err(e) = self.bus.publish(&self.topics.compute, payload.clone()).await {
            if let Err(release) = self.locks.release(key).await {
                tracing::warn!(%key, error = %release, "cannot release claim after failed hand-off");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Wait for a release newer than `observed`. Watch events that describe
    /// the state seen at lock check, and re-claims, are not releases.
    async fn await_release(
        &self,
        key: &HorizonKey,
        observed: u64,
    ) -> Result<WaitOutcome<LockEvent>, HznError> {
        let mut watch = self.locks.watch(key).await?;
        await_first(&mut watch, self.settings.await_release_timeout(), |event| {
            matches!(event, LockEvent::Deleted { revision } if *revision > observed)
        })
        .await
    }

    async fn publish_result(&self, payload: &Bytes, key: &HorizonKey) -> Result<(), HznError> {
        let result = attach_horizon(payload, key)?;
        self.bus.publish(&self.topics.results, Bytes::from(result)).await
    }

    async fn requeue(
        &self,
        payload: &Bytes,
        request_id: &str,
        reason: RequeueReason,
    ) -> Result<Resolution, HznError> {
        self.bus.publish(&self.topics.inbound, payload.clone()).await?;
        tracing::info!(request_id, ?reason, "request requeued");
        Ok(Resolution::Requeued { reason })
    }
}

fn settle(result: Result<(), HznError>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "cannot settle delivery, the bus will redeliver it");
    }
}

impl<K: KvBucket, B: Bus> MessageHandler<B::Delivery> for Resolver<K, B> {
    async fn handle(&self, delivery: B::Delivery) {
        let _ = self.process(delivery).await;
    }
}
