use std::fmt;

/// Horizon radius in metres.
pub type Radius = u32;

/// Coordinates in degrees.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

/// Identifies one fragment of a batched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Part {
    pub id: u64,
    pub of: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Spot {
    pub dir: f64,
    pub kind: String,
    pub loc: Location,
}

/// Inbound unit of work consumed by the resolver and the compute service.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HorizonRequest {
    pub part: Part,
    pub spot: Spot,
    pub request_id: String,
}

impl HorizonRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, HznError> {
        serde_json::from_slice(payload).map_err(|e| HznError::Decode(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, HznError> {
        serde_json::to_vec(self).map_err(|e| HznError::InvalidArgument(e.to_string()))
    }
}

/// Cache identity of a horizon profile. Produced by `hzn_storage::keys::derive_key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct HorizonKey(String);

impl HorizonKey {
    pub fn new(raw: impl Into<String>) -> Self {
        HorizonKey(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HorizonKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Published to the result topic: every request field plus the key of the
/// cached profile.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HorizonResult {
    #[serde(flatten)]
    pub request: HorizonRequest,
    pub horizon: HorizonKey,
}

/// Insert `horizon` into the inbound JSON object.
///
/// Works on the raw payload rather than a decoded `HorizonRequest` so that
/// producer fields unknown to this crate survive the round trip.
pub fn attach_horizon(payload: &[u8], key: &HorizonKey) -> Result<Vec<u8>, HznError> {
    let mut object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(payload).map_err(|e| HznError::Decode(e.to_string()))?;
    object.insert(
        "horizon".to_string(),
        serde_json::Value::String(key.as_str().to_string()),
    );
    serde_json::to_vec(&object).map_err(|e| HznError::InvalidArgument(e.to_string()))
}

/// Best-effort extraction of `request_id` from a payload that may not decode
/// as a `HorizonRequest`.
pub fn request_id_of(payload: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    value.get("request_id")?.as_str().map(str::to_string)
}

/// Dead-letter record published to `<errors>.<sender>`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorRecord {
    pub input: String,
    pub reason: String,
    pub request_id: String,
    pub sender: String,
}

impl ErrorRecord {
    pub fn new(input: &[u8], reason: &HznError, sender: &str) -> Self {
        ErrorRecord {
            input: String::from_utf8_lossy(input).into_owned(),
            reason: reason.to_string(),
            request_id: request_id_of(input).unwrap_or_default(),
            sender: sender.to_string(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, HznError> {
        serde_json::to_vec(self).map_err(|e| HznError::InvalidArgument(e.to_string()))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum HznError {
    #[error("malformed payload: {0}")]
    Decode(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("bus error: {0}")]
    Bus(String),
    #[error("computation failed: {0}")]
    Compute(String),
    #[error("operation timed out")]
    Timeout,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl HznError {
    /// Transient errors are worth a redelivery; everything else is terminal
    /// for the message that produced it.
    pub fn is_transient(&self) -> bool {
        matches!(self, HznError::Storage(_) | HznError::Bus(_) | HznError::Timeout)
    }
}
