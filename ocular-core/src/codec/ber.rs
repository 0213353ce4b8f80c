//! ITU X.690 BER/DER subset.
//!
//! Exactly the encodings the engine needs: MCS Connect-Initial and
//! Connect-Response (T.125 wraps its connect PDUs in BER), the CredSSP
//! TSRequest family (DER), and the `RSAPublicKey` structure inside X.509
//! certificates. Definite lengths only; indefinite forms are rejected.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{ensure_len, read_u8, take_bytes};
use crate::error::OcularError;

// Universal tags.
pub const TAG_BOOLEAN: u8 = 0x01;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_ENUMERATED: u8 = 0x0A;
pub const TAG_SEQUENCE: u8 = 0x30;

// ── Length determinants ──────────────────────────────────────────

/// Bytes a definite-form length determinant occupies.
pub const fn length_size(len: usize) -> usize {
    match len {
        0..=0x7F => 1,
        0x80..=0xFF => 2,
        _ => 3,
    }
}

/// Write a definite-form length (short form, or long form with 1–2
/// length octets; nothing in these protocols exceeds 64 KiB).
pub fn put_length(buf: &mut BytesMut, len: usize) {
    match len {
        0..=0x7F => buf.put_u8(len as u8),
        0x80..=0xFF => {
            buf.put_u8(0x81);
            buf.put_u8(len as u8);
        }
        _ => {
            buf.put_u8(0x82);
            buf.put_u16(len as u16);
        }
    }
}

/// Read a definite-form length determinant.
pub fn read_length(buf: &mut Bytes) -> Result<usize, OcularError> {
    let first = read_u8(buf, "ber length")?;
    if first & 0x80 == 0 {
        return Ok(first as usize);
    }
    let octets = (first & 0x7F) as usize;
    if octets == 0 || octets > 4 {
        return Err(OcularError::Malformed {
            context: "ber length",
            reason: "indefinite or oversized length form",
        });
    }
    ensure_len(&*buf, octets, "ber length octets")?;
    let mut len = 0usize;
    for _ in 0..octets {
        len = (len << 8) | read_u8(buf, "ber length octets")? as usize;
    }
    Ok(len)
}

// ── Tags ─────────────────────────────────────────────────────────

/// Read a tag byte and its length, failing unless the tag matches.
pub fn read_tag(buf: &mut Bytes, expected: u8, context: &'static str) -> Result<usize, OcularError> {
    let tag = read_u8(buf, context)?;
    if tag != expected {
        return Err(OcularError::Malformed {
            context,
            reason: "unexpected BER tag",
        });
    }
    read_length(buf)
}

/// Write an APPLICATION-class constructed tag with a high tag number
/// (T.125 uses APPLICATION 101/102 for its connect PDUs).
pub fn put_application_tag(buf: &mut BytesMut, tag: u8, payload_len: usize) {
    buf.put_u8(0x7F);
    buf.put_u8(tag);
    put_length(buf, payload_len);
}

/// Read an APPLICATION-class constructed tag, returning the payload length.
pub fn read_application_tag(
    buf: &mut Bytes,
    expected: u8,
    context: &'static str,
) -> Result<usize, OcularError> {
    let lead = read_u8(buf, context)?;
    let tag = read_u8(buf, context)?;
    if lead != 0x7F || tag != expected {
        return Err(OcularError::Malformed {
            context,
            reason: "unexpected BER application tag",
        });
    }
    read_length(buf)
}

/// Write a context-specific constructed tag `[n]` (CredSSP TSRequest).
pub fn put_context_tag(buf: &mut BytesMut, n: u8, payload_len: usize) {
    buf.put_u8(0xA0 | n);
    put_length(buf, payload_len);
}

/// `true` when the next byte is the context-specific constructed tag `[n]`.
pub fn peek_context_tag(buf: &Bytes, n: u8) -> bool {
    buf.first().copied() == Some(0xA0 | n)
}

/// Read a context-specific constructed tag `[n]`, returning the payload
/// length.
pub fn read_context_tag(
    buf: &mut Bytes,
    n: u8,
    context: &'static str,
) -> Result<usize, OcularError> {
    let tag = read_u8(buf, context)?;
    if tag != 0xA0 | n {
        return Err(OcularError::Malformed {
            context,
            reason: "unexpected BER context tag",
        });
    }
    read_length(buf)
}

// ── Primitive values ─────────────────────────────────────────────

/// Minimal big-endian content octets for an unsigned INTEGER.
fn integer_content(value: u32) -> ([u8; 5], usize) {
    let be = value.to_be_bytes();
    let skip = be.iter().take_while(|&&b| b == 0).count().min(3);
    let body = &be[skip..];
    let mut out = [0u8; 5];
    // A set top bit would flip the sign; prepend a zero octet.
    if body[0] & 0x80 != 0 {
        out[1..1 + body.len()].copy_from_slice(body);
        (out, body.len() + 1)
    } else {
        out[..body.len()].copy_from_slice(body);
        (out, body.len())
    }
}

/// Serialized size of an INTEGER including tag and length.
pub fn integer_size(value: u32) -> usize {
    let (_, n) = integer_content(value);
    1 + length_size(n) + n
}

pub fn put_integer(buf: &mut BytesMut, value: u32) {
    let (content, n) = integer_content(value);
    buf.put_u8(TAG_INTEGER);
    put_length(buf, n);
    buf.put_slice(&content[..n]);
}

pub fn read_integer(buf: &mut Bytes, context: &'static str) -> Result<u32, OcularError> {
    let len = read_tag(buf, TAG_INTEGER, context)?;
    if len == 0 || len > 5 {
        return Err(OcularError::Malformed {
            context,
            reason: "integer length out of range",
        });
    }
    let raw = take_bytes(buf, len, context)?;
    let mut value: u64 = 0;
    for b in raw.iter() {
        value = (value << 8) | *b as u64;
    }
    if value > u32::MAX as u64 {
        return Err(OcularError::Malformed {
            context,
            reason: "integer exceeds 32 bits",
        });
    }
    Ok(value as u32)
}

pub fn octet_string_size(len: usize) -> usize {
    1 + length_size(len) + len
}

pub fn put_octet_string(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u8(TAG_OCTET_STRING);
    put_length(buf, data.len());
    buf.put_slice(data);
}

pub fn read_octet_string(buf: &mut Bytes, context: &'static str) -> Result<Bytes, OcularError> {
    let len = read_tag(buf, TAG_OCTET_STRING, context)?;
    take_bytes(buf, len, context)
}

pub fn put_boolean(buf: &mut BytesMut, value: bool) {
    buf.put_u8(TAG_BOOLEAN);
    buf.put_u8(1);
    buf.put_u8(if value { 0xFF } else { 0x00 });
}

pub fn read_boolean(buf: &mut Bytes, context: &'static str) -> Result<bool, OcularError> {
    let len = read_tag(buf, TAG_BOOLEAN, context)?;
    if len != 1 {
        return Err(OcularError::Malformed {
            context,
            reason: "boolean length must be 1",
        });
    }
    Ok(read_u8(buf, context)? != 0)
}

pub fn read_enumerated(buf: &mut Bytes, context: &'static str) -> Result<u8, OcularError> {
    let len = read_tag(buf, TAG_ENUMERATED, context)?;
    if len != 1 {
        return Err(OcularError::Malformed {
            context,
            reason: "enumerated length must be 1",
        });
    }
    read_u8(buf, context)
}

// ── RSAPublicKey ─────────────────────────────────────────────────

/// An RSA public key pulled out of a DER `RSAPublicKey` structure:
/// `SEQUENCE { modulus INTEGER, publicExponent INTEGER }`.
///
/// The modulus is returned big-endian with any sign-padding zero octet
/// stripped.
pub fn parse_rsa_public_key(der: &[u8]) -> Result<(Vec<u8>, Vec<u8>), OcularError> {
    let mut buf = Bytes::copy_from_slice(der);
    let seq_len = read_tag(&mut buf, TAG_SEQUENCE, "rsa public key")?;
    ensure_len(&buf, seq_len, "rsa public key")?;

    let read_big_integer = |buf: &mut Bytes| -> Result<Vec<u8>, OcularError> {
        let len = read_tag(buf, TAG_INTEGER, "rsa public key integer")?;
        let raw = take_bytes(buf, len, "rsa public key integer")?;
        let skip = raw.iter().take_while(|&&b| b == 0).count();
        let skip = skip.min(raw.len().saturating_sub(1));
        Ok(raw[skip..].to_vec())
    };

    let modulus = read_big_integer(&mut buf)?;
    let exponent = read_big_integer(&mut buf)?;
    Ok((modulus, exponent))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_round_trip() {
        for len in [0usize, 1, 0x7F, 0x80, 0xFF, 0x100, 0xFFFF] {
            let mut buf = BytesMut::new();
            put_length(&mut buf, len);
            assert_eq!(buf.len(), length_size(len));
            let mut bytes = buf.freeze();
            assert_eq!(read_length(&mut bytes).unwrap(), len);
            assert!(bytes.is_empty());
        }
    }

    #[test]
    fn integer_round_trip() {
        for value in [0u32, 1, 0x7F, 0x80, 0xFF, 0x100, 0xFFFF, 0x10000, 0xFFFF_FFFF] {
            let mut buf = BytesMut::new();
            put_integer(&mut buf, value);
            assert_eq!(buf.len(), integer_size(value));
            let mut bytes = buf.freeze();
            assert_eq!(read_integer(&mut bytes, "t").unwrap(), value);
        }
    }

    #[test]
    fn integer_sign_padding() {
        // 0x80 needs a leading zero octet to stay non-negative.
        let mut buf = BytesMut::new();
        put_integer(&mut buf, 0x80);
        assert_eq!(&buf[..], &[TAG_INTEGER, 0x02, 0x00, 0x80]);
    }

    #[test]
    fn octet_string_round_trip() {
        let mut buf = BytesMut::new();
        put_octet_string(&mut buf, b"hello");
        let mut bytes = buf.freeze();
        assert_eq!(&read_octet_string(&mut bytes, "t").unwrap()[..], b"hello");
    }

    #[test]
    fn boolean_forms() {
        let mut buf = BytesMut::new();
        put_boolean(&mut buf, true);
        put_boolean(&mut buf, false);
        let mut bytes = buf.freeze();
        assert!(read_boolean(&mut bytes, "t").unwrap());
        assert!(!read_boolean(&mut bytes, "t").unwrap());
    }

    #[test]
    fn application_tag_round_trip() {
        let mut buf = BytesMut::new();
        put_application_tag(&mut buf, 101, 0x123);
        let mut bytes = buf.freeze();
        assert_eq!(read_application_tag(&mut bytes, 101, "t").unwrap(), 0x123);
    }

    #[test]
    fn context_tag_round_trip() {
        let mut buf = BytesMut::new();
        put_context_tag(&mut buf, 3, 17);
        let bytes = buf.freeze();
        assert!(peek_context_tag(&bytes, 3));
        assert!(!peek_context_tag(&bytes, 1));
        let mut bytes = bytes;
        assert_eq!(read_context_tag(&mut bytes, 3, "t").unwrap(), 17);
    }

    #[test]
    fn rsa_public_key_parse() {
        // SEQUENCE { INTEGER 0x00C1..., INTEGER 65537 }
        let mut buf = BytesMut::new();
        let modulus = [0xC1u8, 0x02, 0x03, 0x04];
        let mut body = BytesMut::new();
        body.put_u8(TAG_INTEGER);
        put_length(&mut body, 5);
        body.put_u8(0x00); // sign padding
        body.put_slice(&modulus);
        body.put_u8(TAG_INTEGER);
        put_length(&mut body, 3);
        body.put_slice(&[0x01, 0x00, 0x01]);
        buf.put_u8(TAG_SEQUENCE);
        put_length(&mut buf, body.len());
        buf.put_slice(&body);

        let (m, e) = parse_rsa_public_key(&buf).unwrap();
        assert_eq!(m, modulus);
        assert_eq!(e, vec![0x01, 0x00, 0x01]);
    }

    #[test]
    fn truncated_input_rejected() {
        let mut bytes = Bytes::from_static(&[TAG_OCTET_STRING, 0x05, b'a']);
        assert!(read_octet_string(&mut bytes, "t").is_err());
    }
}
