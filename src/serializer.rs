use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Pluggable payload codec: application value to bytes and back. The frame
///  identifies service and method, so the encoding does not need to be
///  self-describing.
pub trait Serializer: Send + Sync + 'static {
    fn marshal<T: Serialize>(&self, value: &T) -> anyhow::Result<Vec<u8>>;

    fn unmarshal<T: DeserializeOwned>(&self, buf: &[u8]) -> anyhow::Result<T>;
}

/// JSON payloads via serde.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn marshal<T: Serialize>(&self, value: &T) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(value).context("marshalling value to JSON")
    }

    fn unmarshal<T: DeserializeOwned>(&self, buf: &[u8]) -> anyhow::Result<T> {
        serde_json::from_slice(buf).context("unmarshalling value from JSON")
    }
}
