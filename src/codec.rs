use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CacheError;

/// Serialization used for cached payloads and backend records, backed by
/// `bincode`.
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeCodec;

impl BincodeCodec {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CacheError> {
        bincode::serialize(value)
            .map(Bytes::from)
            .map_err(|err| CacheError::Codec(err.to_string()))
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CacheError> {
        bincode::deserialize(bytes).map_err(|err| CacheError::Codec(err.to_string()))
    }
}
