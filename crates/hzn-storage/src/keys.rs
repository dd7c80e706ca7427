use uuid::Uuid;

use hzn_types::{HorizonKey, Location, Radius};

/// Version tag of the key format. Any change to [`canonical_name`] must bump it,
/// otherwise replicas on different versions silently stop sharing the cache.
pub const KEY_PREFIX: &str = "horizon-v1.0.0-";

/// Canonical text hashed into the key: both coordinates with five decimals
/// (~1.1 m at the equator), radius as an integer.
pub fn canonical_name(location: &Location, radius: Radius) -> String {
    format!(
        "lat: {:.5}, lon: {:.5}, rad: {}",
        location.lat, location.lon, radius
    )
}

/// `KEY_PREFIX ++ uuid_v5(nil, canonical_name)`.
///
/// Pure and replica-independent: the cache and the lock bucket are both keyed
/// by it.
pub fn derive_key(location: &Location, radius: Radius) -> HorizonKey {
    let id = Uuid::new_v5(&Uuid::nil(), canonical_name(location, radius).as_bytes());
    HorizonKey::new(format!("{KEY_PREFIX}{id}"))
}
