//! Horizon resolver and compute services.
//!
//! Both services are plain message handlers; [`WorkerPool`] drives either of
//! them from a bus subscription with bounded concurrency until shutdown.

pub mod await_release;
pub mod compute;
pub mod computer;
pub mod config;
pub mod resolver;
pub mod sink;

#[cfg(test)]
mod testing;

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;

use hzn_bus::{Bus, Delivery};
use hzn_types::HznError;

pub use compute::{Computation, Computer, HorizonComputer, COMPUTE_NAME};
pub use computer::CommandComputer;
pub use config::{ComputeSettings, HorizonSettings, ResolverSettings, Topics};
pub use resolver::{RequeueReason, Resolution, Resolver, RESOLVER_NAME};
pub use sink::ErrorSink;

/// Processes and settles one delivery. Failures are handled inside: one
/// message's failure never stops the pool.
pub trait MessageHandler<D: Delivery>: Send + Sync + 'static {
    fn handle(&self, delivery: D) -> impl Future<Output = ()> + Send;
}

/// Competing consumer over one subscription.
pub struct WorkerPool<B: Bus> {
    bus: Arc<B>,
    filter: String,
    group: String,
    concurrency: usize,
}

impl<B: Bus> WorkerPool<B> {
    pub fn new(bus: Arc<B>, filter: impl Into<String>, group: impl Into<String>, concurrency: usize) -> Self {
        WorkerPool { bus, filter: filter.into(), group: group.into(), concurrency: concurrency.max(1) }
    }

    /// Handle deliveries until `shutdown` resolves or the subscription ends.
    ///
    /// Shutdown drops in-flight handlers; their deliveries stay unsettled and
    /// are redelivered by the bus.
    pub async fn run<H, F>(self, handler: Arc<H>, shutdown: F) -> Result<(), HznError>
    where
        H: MessageHandler<B::Delivery>,
        F: Future<Output = ()> + Send,
    {
        let deliveries = self.bus.subscribe(&self.filter, &self.group).await?;
        tracing::info!(filter = %self.filter, group = %self.group, concurrency = self.concurrency, "worker pool started");

        let work = deliveries.for_each_concurrent(self.concurrency, |delivery| {
            let handler = Arc::clone(&handler);
            async move {
                match delivery {
                    Ok(delivery) => handler.handle(delivery).await,
                    Err(e) => tracing::warn!(error = %e, "delivery stream error"),
                }
            }
        });

        tokio::select! {
            _ = work => tracing::warn!(filter = %self.filter, group = %self.group, "subscription ended"),
            _ = shutdown => tracing::info!(filter = %self.filter, group = %self.group, "worker pool stopped"),
        }
        Ok(())
    }
}
