//! Encoding and decoding of the 5-byte schema header.

/// Leading byte of every framed payload.
pub const MAGIC_BYTE: u8 = 0x00;

/// Header length: magic byte plus a big-endian `u32` schema id.
pub const HEADER_LEN: usize = 5;

/// Frame a payload with its schema id.
///
/// Produces `0x00 || be32(schema_id) || payload`. Empty payloads are valid.
///
/// # Examples
///
/// ```
/// use schemabus_wire::encode;
///
/// assert_eq!(encode(1, b"hello"), b"\x00\x00\x00\x00\x01hello");
/// assert_eq!(encode(256, b"data"), b"\x00\x00\x00\x01\x00data");
/// ```
#[must_use]
pub fn encode(schema_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(MAGIC_BYTE);
    frame.extend_from_slice(&schema_id.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Split a frame into its schema id and payload.
///
/// The payload is borrowed from `frame`. Whether the id names a real schema
/// is not checked here.
///
/// # Errors
///
/// - [`FrameError::MalformedFrame`] if `frame` is shorter than [`HEADER_LEN`]
/// - [`FrameError::BadMagicByte`] if the first byte is not [`MAGIC_BYTE`]
///
/// # Examples
///
/// ```
/// use schemabus_wire::decode;
///
/// let (id, payload) = decode(&[0, 0, 0, 0, 5]).unwrap();
/// assert_eq!(id, 5);
/// assert!(payload.is_empty());
/// ```
pub fn decode(frame: &[u8]) -> Result<(u32, &[u8]), FrameError> {
    let parsed = Frame::parse(frame)?;
    Ok((parsed.schema_id(), parsed.payload()))
}

/// Cheap probe: does `bytes` start with a well-formed header?
#[must_use]
pub fn is_framed(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_LEN && bytes[0] == MAGIC_BYTE
}

/// A validated, borrowed view over a framed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    schema_id: u32,
    payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Validate the header of `bytes`.
    ///
    /// # Errors
    ///
    /// See [`decode`].
    pub fn parse(bytes: &'a [u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::MalformedFrame { len: bytes.len() });
        }
        if bytes[0] != MAGIC_BYTE {
            return Err(FrameError::BadMagicByte { found: bytes[0] });
        }

        let schema_id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);

        Ok(Self {
            schema_id,
            payload: &bytes[HEADER_LEN..],
        })
    }

    /// Schema id carried in the header.
    #[must_use]
    pub fn schema_id(&self) -> u32 {
        self.schema_id
    }

    /// Bytes after the header, possibly empty.
    #[must_use]
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Re-encode this frame into an owned buffer.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        encode(self.schema_id, self.payload)
    }
}

/// Errors produced while decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Fewer bytes than the fixed header
    #[error("malformed frame: expected at least 5 bytes, got {len}")]
    MalformedFrame {
        /// Actual input length
        len: usize,
    },
    /// First byte is not the magic byte
    #[error("bad magic byte: expected 0x00, got {found:#04x}")]
    BadMagicByte {
        /// Byte found at offset 0
        found: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_known_vectors() {
        assert_eq!(encode(1, b"hello"), vec![0, 0, 0, 0, 1, b'h', b'e', b'l', b'l', b'o']);
        assert_eq!(encode(256, b"data"), vec![0, 0, 0, 1, 0, b'd', b'a', b't', b'a']);
        assert_eq!(encode(7, b""), vec![0, 0, 0, 0, 7]);
    }

    #[test]
    fn decode_empty_payload() {
        let (id, payload) = decode(&[0, 0, 0, 0, 5]).unwrap();
        assert_eq!(id, 5);
        assert_eq!(payload, b"");
    }

    #[test]
    fn decode_max_schema_id() {
        let frame = encode(u32::MAX, b"x");
        assert_eq!(&frame[..5], &[0, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(decode(&frame).unwrap(), (u32::MAX, &b"x"[..]));
    }

    #[test]
    fn roundtrip_preserves_id_and_payload() {
        let payloads: [&[u8]; 3] = [b"", b"\x00\x00\x00", b"a longer payload with \xff bytes"];
        for (id, payload) in [0_u32, 42, 1 << 24].into_iter().zip(payloads) {
            let frame = encode(id, payload);
            assert_eq!(decode(&frame).unwrap(), (id, payload));
        }
    }

    #[test]
    fn short_input_is_malformed() {
        for len in 0..HEADER_LEN {
            let input = vec![0_u8; len];
            assert_eq!(decode(&input), Err(FrameError::MalformedFrame { len }));
        }
    }

    #[test]
    fn short_input_with_bad_magic_is_still_malformed() {
        assert_eq!(decode(&[9, 9]), Err(FrameError::MalformedFrame { len: 2 }));
    }

    #[test]
    fn bad_magic_byte() {
        assert_eq!(
            decode(b"{\"id\":1}"),
            Err(FrameError::BadMagicByte { found: b'{' })
        );
        assert_eq!(
            decode(&[1, 0, 0, 0, 1]),
            Err(FrameError::BadMagicByte { found: 1 })
        );
    }

    #[test]
    fn frame_view_reencodes() {
        let bytes = encode(99, b"payload");
        let frame = Frame::parse(&bytes).unwrap();
        assert_eq!(frame.schema_id(), 99);
        assert_eq!(frame.payload(), b"payload");
        assert_eq!(frame.to_vec(), bytes);
    }

    #[test]
    fn probe_matches_decode() {
        assert!(is_framed(&[0, 0, 0, 0, 1]));
        assert!(!is_framed(&[0, 0, 0, 0]));
        assert!(!is_framed(b"plain text"));
    }

    #[test]
    fn error_messages_carry_detail() {
        let err = decode(&[0xab, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err.to_string(), "bad magic byte: expected 0x00, got 0xab");
        let err = decode(&[0]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "malformed frame: expected at least 5 bytes, got 1"
        );
    }
}
