use anyhow::{bail, Context};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

/// The application-visible layout carried inside a reassembled payload, for
///  requests and responses alike:
/// ```ascii
/// 0: service name length (u16 LE), followed by that many bytes of UTF-8
/// *: method name length (u16 LE), followed by that many bytes of UTF-8
/// *: header section length (u16 LE), followed by that many bytes of encoded
///     metadata
/// *: user payload - everything up to the end of the buffer
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub service: String,
    pub method: String,
    pub headers: Bytes,
    pub payload: Bytes,
}

impl Frame {
    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        put_len_prefixed(buf, self.service.as_bytes()).context("service name")?;
        put_len_prefixed(buf, self.method.as_bytes()).context("method name")?;
        put_len_prefixed(buf, &self.headers).context("header section")?;
        buf.put_slice(&self.payload);
        Ok(())
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        let service = String::from_utf8(try_get_len_prefixed(buf).context("service name")?.to_vec())
            .context("service name is not UTF-8")?;
        let method = String::from_utf8(try_get_len_prefixed(buf).context("method name")?.to_vec())
            .context("method name is not UTF-8")?;
        let headers = try_get_len_prefixed(buf).context("header section")?;
        let payload = buf.copy_to_bytes(buf.remaining());

        Ok(Frame {
            service,
            method,
            headers,
            payload,
        })
    }
}

fn put_len_prefixed(buf: &mut BytesMut, value: &[u8]) -> anyhow::Result<()> {
    let len: u16 = match value.len().try_into() {
        Ok(len) => len,
        Err(_) => bail!("section of {} bytes exceeds the u16 length prefix", value.len()),
    };
    buf.put_u16_le(len);
    buf.put_slice(value);
    Ok(())
}

fn try_get_len_prefixed(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_u16_le()? as usize;
    if buf.remaining() < len {
        bail!("length prefix {} runs past the end of the buffer", len);
    }
    Ok(buf.copy_to_bytes(len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::simple("Echo", "Say", b"hdrs".as_slice(), b"payload".as_slice())]
    #[case::empty_sections("", "", b"".as_slice(), b"".as_slice())]
    #[case::no_payload("Greeter", "Hello", b"\x00\x00".as_slice(), b"".as_slice())]
    #[case::unicode_names("Üben", "こんにちは", b"".as_slice(), &[0u8, 1, 2, 255])]
    fn test_roundtrip(
        #[case] service: &str,
        #[case] method: &str,
        #[case] headers: &[u8],
        #[case] payload: &[u8],
    ) {
        let frame = Frame {
            service: service.to_string(),
            method: method.to_string(),
            headers: Bytes::copy_from_slice(headers),
            payload: Bytes::copy_from_slice(payload),
        };

        let mut buf = BytesMut::new();
        frame.ser(&mut buf).unwrap();

        let parsed = Frame::deser(&mut buf.freeze()).unwrap();
        assert_eq!(parsed, frame);
    }

    #[rstest]
    #[case::empty(b"".as_slice())]
    #[case::truncated_service(b"\x05\x00Ec".as_slice())]
    #[case::missing_method(b"\x04\x00Echo".as_slice())]
    #[case::header_len_overruns(b"\x04\x00Echo\x03\x00Say\xff\xff".as_slice())]
    fn test_deser_malformed(#[case] buf: &[u8]) {
        let mut buf = buf;
        assert!(Frame::deser(&mut buf).is_err());
    }

    #[rstest]
    fn test_ser_oversized_section() {
        let frame = Frame {
            service: "x".repeat(usize::from(u16::MAX) + 1),
            method: "Say".to_string(),
            headers: Bytes::new(),
            payload: Bytes::new(),
        };
        assert!(frame.ser(&mut BytesMut::new()).is_err());
    }
}
