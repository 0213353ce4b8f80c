//! Declarative wire codec shared by the RDP and RFB engines.
//!
//! Every PDU is a plain struct implementing [`Wire`]: `size` reports the
//! exact serialized length, `encode` appends that many bytes, `decode`
//! consumes them or fails with a typed error. Length fields that depend on
//! sibling fields are computed inside `encode` from the current field
//! values — never cached, so a structure mutated after construction still
//! serializes self-consistently.
//!
//! Decoding is strict: a payload shorter than a declared or computed
//! length is rejected, never truncated. Zero-length variable fields are
//! valid and distinct from absent ones (absent fields are `Option`s).

pub mod ber;
pub mod per;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::OcularError;

/// A self-describing wire structure.
pub trait Wire: Sized {
    /// Exact number of bytes [`encode`](Wire::encode) will append.
    fn size(&self) -> usize;

    /// Serialize into `buf`. Infallible: computed lengths are resolved
    /// from owned sibling fields, so a well-formed value always encodes.
    fn encode(&self, buf: &mut BytesMut);

    /// Parse one value from the front of `buf`, consuming exactly
    /// [`size`](Wire::size) bytes on success.
    fn decode(buf: &mut Bytes) -> Result<Self, OcularError>;
}

/// Encode a [`Wire`] value into a fresh buffer.
pub fn encode_to_bytes<T: Wire>(value: &T) -> Bytes {
    let mut buf = BytesMut::with_capacity(value.size());
    value.encode(&mut buf);
    buf.freeze()
}

/// Guard: fail with a [`Decode`](OcularError::Decode) error when fewer
/// than `needed` bytes remain.
pub fn ensure_len(buf: &impl Buf, needed: usize, context: &'static str) -> Result<(), OcularError> {
    if buf.remaining() < needed {
        return Err(OcularError::Decode {
            context,
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

/// Read `len` bytes as an owned [`Bytes`], rejecting short input.
pub fn take_bytes(buf: &mut Bytes, len: usize, context: &'static str) -> Result<Bytes, OcularError> {
    ensure_len(&*buf, len, context)?;
    Ok(buf.split_to(len))
}

/// Read a fixed-size array, rejecting short input.
pub fn take_array<const N: usize>(
    buf: &mut Bytes,
    context: &'static str,
) -> Result<[u8; N], OcularError> {
    ensure_len(&*buf, N, context)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

macro_rules! int_readers {
    ($($name:ident => $ty:ty, $get:ident, $width:expr;)*) => {
        $(
            #[doc = concat!("Read a `", stringify!($ty), "` or fail with a typed short-read error.")]
            pub fn $name(buf: &mut Bytes, context: &'static str) -> Result<$ty, OcularError> {
                ensure_len(&*buf, $width, context)?;
                Ok(buf.$get())
            }
        )*
    };
}

int_readers! {
    read_u8 => u8, get_u8, 1;
    read_u16_le => u16, get_u16_le, 2;
    read_u16_be => u16, get_u16, 2;
    read_u32_le => u32, get_u32_le, 4;
    read_u32_be => u32, get_u32, 4;
}

/// Write a UTF-16LE string padded with zeros to exactly `total` bytes.
///
/// Used by the GCC client core block, whose name fields are fixed-size
/// regardless of content. Truncates on overflow rather than failing —
/// the callers clamp the inputs first.
pub fn put_utf16_fixed(buf: &mut BytesMut, text: &str, total: usize) {
    let mut written = 0;
    for unit in text.encode_utf16() {
        if written + 2 > total {
            break;
        }
        buf.put_u16_le(unit);
        written += 2;
    }
    buf.put_bytes(0, total - written);
}

/// UTF-16LE bytes of `text` with a trailing NUL unit.
pub fn utf16_z(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() * 2 + 2);
    for unit in text.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&[0, 0]);
    out
}

/// UTF-16LE bytes of `text` without a terminator.
pub fn utf16(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() * 2);
    for unit in text.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_len_rejects_short_input() {
        let buf = Bytes::from_static(&[1, 2]);
        let err = ensure_len(&buf, 4, "test").unwrap_err();
        match err {
            OcularError::Decode {
                needed, available, ..
            } => {
                assert_eq!(needed, 4);
                assert_eq!(available, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn take_bytes_consumes_exactly() {
        let mut buf = Bytes::from_static(b"abcdef");
        let head = take_bytes(&mut buf, 4, "test").unwrap();
        assert_eq!(&head[..], b"abcd");
        assert_eq!(&buf[..], b"ef");
    }

    #[test]
    fn zero_length_take_is_valid() {
        let mut buf = Bytes::from_static(b"xy");
        let empty = take_bytes(&mut buf, 0, "test").unwrap();
        assert!(empty.is_empty());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn int_readers_round_trip() {
        let mut enc = BytesMut::new();
        enc.put_u8(0x7F);
        enc.put_u16_le(0x1234);
        enc.put_u16(0x5678);
        enc.put_u32_le(0xDEADBEEF);
        enc.put_u32(0xCAFEBABE);
        let mut buf = enc.freeze();

        assert_eq!(read_u8(&mut buf, "t").unwrap(), 0x7F);
        assert_eq!(read_u16_le(&mut buf, "t").unwrap(), 0x1234);
        assert_eq!(read_u16_be(&mut buf, "t").unwrap(), 0x5678);
        assert_eq!(read_u32_le(&mut buf, "t").unwrap(), 0xDEADBEEF);
        assert_eq!(read_u32_be(&mut buf, "t").unwrap(), 0xCAFEBABE);
        assert!(read_u8(&mut buf, "t").is_err());
    }

    #[test]
    fn utf16_fixed_pads_and_truncates() {
        let mut buf = BytesMut::new();
        put_utf16_fixed(&mut buf, "ab", 8);
        assert_eq!(&buf[..], &[b'a', 0, b'b', 0, 0, 0, 0, 0]);

        let mut buf = BytesMut::new();
        put_utf16_fixed(&mut buf, "abcdef", 4);
        assert_eq!(&buf[..], &[b'a', 0, b'b', 0]);
    }

    #[test]
    fn utf16_z_terminates() {
        assert_eq!(utf16_z(""), vec![0, 0]);
        assert_eq!(utf16_z("A"), vec![b'A', 0, 0, 0]);
        assert_eq!(utf16("A"), vec![b'A', 0]);
    }
}
