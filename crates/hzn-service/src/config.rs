use std::time::Duration;

use hzn_types::Radius;

/// Bus subjects shared by both services.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Topics {
    /// Consumed by the resolver; requeued requests go back here.
    pub inbound: String,
    /// Published by the resolver after a successful claim.
    pub compute: String,
    pub results: String,
    /// Error stream; each service publishes to `<errors>.<service-name>`.
    pub errors: String,
}

impl Default for Topics {
    fn default() -> Self {
        Topics {
            inbound: "SPOTS.get-horizon".to_string(),
            compute: "SPOTS.compute-horizon".to_string(),
            results: "HORIZONS.sunsets".to_string(),
            errors: "ERRORS".to_string(),
        }
    }
}

impl Topics {
    pub fn error_topic(&self, sender: &str) -> String {
        format!("{}.{}", self.errors, sender)
    }
}

/// Parameters of the horizon itself. Both services derive keys from these,
/// so they must be read from one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct HorizonSettings {
    pub radius: Radius,
}

impl Default for HorizonSettings {
    fn default() -> Self {
        HorizonSettings { radius: 500 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    pub await_release_timeout_ms: u64,
    /// Added to the timeout to cover the compute service's own overhead.
    pub processing_margin_ms: u64,
    pub concurrency: usize,
    /// Deliveries of one message before a transient failure is dead-lettered.
    /// 0 means no limit, as with JetStream's `max_deliver`.
    pub max_deliveries: u64,
    pub nak_delay_ms: u64,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        ResolverSettings {
            await_release_timeout_ms: 10_000,
            processing_margin_ms: 2_000,
            concurrency: 64,
            max_deliveries: 5,
            nak_delay_ms: 1_000,
        }
    }
}

impl ResolverSettings {
    /// How long one delivery may wait for a lock release before requeueing.
    pub fn await_release_timeout(&self) -> Duration {
        Duration::from_millis(self.await_release_timeout_ms.saturating_add(self.processing_margin_ms))
    }

    pub fn nak_delay(&self) -> Option<Duration> {
        (self.nak_delay_ms > 0).then(|| Duration::from_millis(self.nak_delay_ms))
    }

    /// Whether a transient failure on the `delivered`-th delivery gets another one.
    pub fn redeliver(&self, delivered: u64) -> bool {
        self.max_deliveries == 0 || delivered < self.max_deliveries
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ComputeSettings {
    pub concurrency: usize,
    pub timeout_secs: u64,
    /// Horizon calculator executable, see `CommandComputer`.
    pub program: String,
    /// Arguments placed before `--lat/--lon/--radius`.
    pub args: Vec<String>,
}

impl Default for ComputeSettings {
    fn default() -> Self {
        ComputeSettings {
            concurrency: 4,
            timeout_secs: 300,
            program: "horizon".to_string(),
            args: Vec::new(),
        }
    }
}

impl ComputeSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
