use anyhow::{bail, Context};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use rustc_hash::FxHashMap;

/// A multi-valued header map attached to a call. Values for a key keep their
///  append order; keys are unordered.
///
/// Every call has two scopes of metadata: *incoming* (what the peer sent) and
///  *outgoing* (what will be sent to the peer). Both live on the call context,
///  this type is the bag itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: FxHashMap<String, Vec<String>>,
}

impl Metadata {
    pub fn new() -> Metadata {
        Metadata::default()
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.entry(key.into()).or_default().push(value.into());
    }

    /// Replace all values stored for a key.
    pub fn set(&mut self, key: impl Into<String>, values: Vec<String>) {
        self.entries.insert(key.into(), values);
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|values| values.first()).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.entries.iter()
    }

    /// Self-describing byte representation:
    /// ```ascii
    /// 0: number of keys (u16 LE)
    /// *: per key: key length (u16 LE) + key bytes, number of values (u16 LE),
    ///     then per value: value length (u16 LE) + value bytes
    /// ```
    ///
    /// Keys are written in sorted order so that equal bags encode to equal
    ///  bytes.
    pub fn encode(&self) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::new();

        buf.put_u16_le(checked_u16(self.entries.len()).context("number of keys")?);

        let mut keys = self.entries.keys().collect::<Vec<_>>();
        keys.sort();

        for key in keys {
            let values = &self.entries[key];

            buf.put_u16_le(checked_u16(key.len()).context("key length")?);
            buf.put_slice(key.as_bytes());
            buf.put_u16_le(checked_u16(values.len()).context("number of values")?);
            for value in values {
                buf.put_u16_le(checked_u16(value.len()).context("value length")?);
                buf.put_slice(value.as_bytes());
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(buf: &mut impl Buf) -> anyhow::Result<Metadata> {
        let num_keys = buf.try_get_u16_le()?;

        let mut entries = FxHashMap::default();
        for _ in 0..num_keys {
            let key = try_get_string(buf).context("key")?;

            let num_values = buf.try_get_u16_le()?;
            let mut values = Vec::with_capacity(num_values as usize);
            for _ in 0..num_values {
                values.push(try_get_string(buf).context("value")?);
            }
            entries.insert(key, values);
        }
        Ok(Metadata { entries })
    }
}

fn checked_u16(len: usize) -> anyhow::Result<u16> {
    match len.try_into() {
        Ok(len) => Ok(len),
        Err(_) => bail!("{} does not fit the u16 wire format", len),
    }
}

fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_u16_le()? as usize;
    if buf.remaining() < len {
        bail!("length prefix {} runs past the end of the buffer", len);
    }
    let raw = buf.copy_to_bytes(len);
    Ok(String::from_utf8(raw.to_vec())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_roundtrip() {
        let mut md = Metadata::new();
        md.append("trace-id", "abc");
        md.append("tags", "primary");
        md.append("tags", "eu-west");
        md.append("tags", "canary");

        let encoded = md.encode().unwrap();
        let decoded = Metadata::decode(&mut encoded.clone()).unwrap();

        assert_eq!(decoded, md);
        // order within a value list survives the round trip
        assert_eq!(
            decoded.get("tags").unwrap(),
            &["primary".to_string(), "eu-west".to_string(), "canary".to_string()],
        );
    }

    #[rstest]
    fn test_roundtrip_empty() {
        let md = Metadata::new();
        let encoded = md.encode().unwrap();
        assert_eq!(encoded.as_ref(), &[0, 0]);
        assert_eq!(Metadata::decode(&mut encoded.clone()).unwrap(), md);
    }

    #[rstest]
    fn test_encode_deterministic() {
        let mut a = Metadata::new();
        a.append("x", "1");
        a.append("y", "2");
        let mut b = Metadata::new();
        b.append("y", "2");
        b.append("x", "1");

        assert_eq!(a.encode().unwrap(), b.encode().unwrap());
    }

    #[rstest]
    #[case::empty(b"".as_slice())]
    #[case::key_overruns(b"\x01\x00\xff\xffab".as_slice())]
    #[case::missing_values(b"\x01\x00\x01\x00k".as_slice())]
    #[case::value_overruns(b"\x01\x00\x01\x00k\x01\x00\x09\x00ab".as_slice())]
    fn test_decode_malformed(#[case] buf: &[u8]) {
        let mut buf = buf;
        assert!(Metadata::decode(&mut buf).is_err());
    }

    #[rstest]
    fn test_first() {
        let mut md = Metadata::new();
        md.append("k", "a");
        md.append("k", "b");

        assert_eq!(md.first("k"), Some("a"));
        assert_eq!(md.first("missing"), None);
    }
}
