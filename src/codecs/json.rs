//! JSON Codec using `serde_json`

use crate::error::Result;
use crate::traits::CacheCodec;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// JSON Codec using `serde_json`
///
/// Default encoding for disk entries; human-readable, which makes a cache
/// directory easy to inspect when diagnosing stale data.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl CacheCodec for JsonCodec {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn name(&self) -> &'static str {
        "serde_json"
    }
}
