//! JetStream backends for [`hzn_bus::Bus`] and [`hzn_storage::KvBucket`].
//!
//! Topics follow the `<STREAM>.<action>` convention: the first subject token
//! names the stream that captures it. Streams and buckets are provisioned with
//! get-or-create, so any number of replicas may start concurrently.

pub mod bus;
pub mod kv;

use std::time::Duration;

use async_nats::jetstream::{self, kv as js_kv, stream, Context};

use hzn_types::HznError;

pub use bus::{NatsBus, NatsDelivery};
pub use kv::NatsBucket;

pub async fn connect(url: &str) -> Result<Context, HznError> {
    let client = async_nats::connect(url)
        .await
        .map_err(|e| HznError::Bus(format!("connect to {url}: {e}")))?;
    tracing::info!(url, "connected to NATS");
    Ok(jetstream::new(client))
}

/// Stream that captures `topic`: its first subject token.
pub fn stream_of(topic: &str) -> &str {
    topic.split('.').next().unwrap_or(topic)
}

/// Make sure a stream exists for every topic, capturing `<name>` and
/// `<name>.*`.
pub async fn provision_streams(context: &Context, topics: &[&str]) -> Result<(), HznError> {
    let mut names: Vec<&str> = topics.iter().map(|t| stream_of(t)).collect();
    names.sort_unstable();
    names.dedup();

    for name in names {
        context
            .get_or_create_stream(stream::Config {
                name: name.to_string(),
                subjects: vec![name.to_string(), format!("{name}.*")],
                ..Default::default()
            })
            .await
            .map_err(|e| HznError::Bus(format!("provision stream {name}: {e}")))?;
        tracing::debug!(stream = name, "stream ready");
    }
    Ok(())
}

/// Open bucket `name`, creating it with history 1 when missing. `max_age`
/// turns every entry into an expiring one.
pub async fn open_bucket(
    context: &Context,
    name: &str,
    max_age: Option<Duration>,
) -> Result<NatsBucket, HznError> {
    let store = match context.get_key_value(name).await {
        Ok(store) => store,
        Err(_) => context
            .create_key_value(js_kv::Config {
                bucket: name.to_string(),
                history: 1,
                max_age: max_age.unwrap_or_default(),
                ..Default::default()
            })
            .await
            .map_err(|e| HznError::Storage(format!("provision bucket {name}: {e}")))?,
    };
    tracing::debug!(bucket = name, "bucket ready");
    Ok(NatsBucket::new(name, store))
}
