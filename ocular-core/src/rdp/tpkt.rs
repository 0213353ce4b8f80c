//! Fast-path/slow-path framer — the lowest RDP layer.
//!
//! Demultiplexes the raw byte stream into ISO-8073 TPKT segments (slow
//! path, used for the whole handshake) and compact fast-path PDUs (used
//! for high-frequency display updates once the session is live).
//!
//! ## Wire format
//!
//! **Slow path** (TPKT, 4-byte header):
//! ```text
//! version:   u8   (always 3)
//! reserved:  u8
//! length:    u16  big-endian, includes the header
//! payload:   [u8] (length − 4 bytes, an X.224 TPDU)
//! ```
//!
//! **Fast path** (1 + 1..2 byte header):
//! ```text
//! header:    u8   bits 0-1 action (0 = fast path), bits 6-7 flags
//! length:    u8   high bit clear: total length in this byte
//!         or u16  high bit set: 15-bit big-endian total length
//! payload:   [u8] (total − header bytes)
//! ```
//!
//! The decoder never yields a partial frame: bytes accumulate in the
//! read buffer until the declared length is available. The underlying
//! transport delivers arbitrary chunks, so a frame may arrive across
//! any number of reads — or several frames inside one read.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::OcularError;

/// Largest frame either path can declare (TPKT carries a 16-bit length).
pub const MAX_FRAME_SIZE: usize = 0xFFFF;

/// TPKT version octet.
const TPKT_VERSION: u8 = 3;

bitflags! {
    /// Flags carried in bits 6-7 of a fast-path header byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FastPathFlags: u8 {
        const SECURE_CHECKSUM = 0x1;
        const ENCRYPTED       = 0x2;
    }
}

// ── TpktFrame ────────────────────────────────────────────────────

/// One reassembled frame from either path, header stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpktFrame {
    /// An X.224 TPDU (handshake and all slow-path session traffic).
    SlowPath(Bytes),
    /// A fast-path PDU body with its header flags.
    FastPath { flags: FastPathFlags, payload: Bytes },
}

impl TpktFrame {
    pub fn fast_path(flags: FastPathFlags, payload: Bytes) -> Self {
        Self::FastPath { flags, payload }
    }
}

// ── TpktCodec ────────────────────────────────────────────────────

/// Framed codec for the outermost RDP byte stream.
///
/// Outbound framing is chosen by the frame variant: the client sends
/// slow-path frames until the session is established and fast-path
/// input events afterwards.
#[derive(Debug, Default)]
pub struct TpktCodec;

impl Decoder for TpktCodec {
    type Item = TpktFrame;
    type Error = OcularError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        if src[0] == TPKT_VERSION {
            // Slow path: fixed 4-byte header.
            if src.len() < 4 {
                return Ok(None);
            }
            let declared = u16::from_be_bytes([src[2], src[3]]) as usize;
            if declared < 4 {
                return Err(OcularError::Framing("tpkt length shorter than header"));
            }
            if src.len() < declared {
                src.reserve(declared - src.len());
                return Ok(None);
            }
            let mut frame = src.split_to(declared);
            frame.advance(4);
            return Ok(Some(TpktFrame::SlowPath(frame.freeze())));
        }

        // Fast path: compact header.
        let header = src[0];
        let (declared, header_len) = if src[1] & 0x80 != 0 {
            if src.len() < 3 {
                return Ok(None);
            }
            ((((src[1] & 0x7F) as usize) << 8) | src[2] as usize, 3)
        } else {
            (src[1] as usize, 2)
        };
        if declared < header_len {
            return Err(OcularError::Framing("fast-path length shorter than header"));
        }
        if src.len() < declared {
            src.reserve(declared - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(declared);
        frame.advance(header_len);
        Ok(Some(TpktFrame::FastPath {
            flags: FastPathFlags::from_bits_truncate(header >> 6),
            payload: frame.freeze(),
        }))
    }
}

impl Encoder<TpktFrame> for TpktCodec {
    type Error = OcularError;

    fn encode(&mut self, item: TpktFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            TpktFrame::SlowPath(payload) => {
                let total = payload.len() + 4;
                if total > MAX_FRAME_SIZE {
                    return Err(OcularError::FrameTooLarge {
                        size: total,
                        max: MAX_FRAME_SIZE,
                    });
                }
                dst.reserve(total);
                dst.put_u8(TPKT_VERSION);
                dst.put_u8(0);
                dst.put_u16(total as u16);
                dst.put_slice(&payload);
            }
            TpktFrame::FastPath { flags, payload } => {
                // Fast-path input header: action 0, flags in bits 6-7.
                let header = flags.bits() << 6;
                let short_total = payload.len() + 2;
                if short_total <= 0x7F {
                    dst.reserve(short_total);
                    dst.put_u8(header);
                    dst.put_u8(short_total as u8);
                } else {
                    let total = payload.len() + 3;
                    if total > 0x7FFF {
                        return Err(OcularError::FrameTooLarge {
                            size: total,
                            max: 0x7FFF,
                        });
                    }
                    dst.reserve(total);
                    dst.put_u8(header);
                    dst.put_u16(0x8000 | total as u16);
                }
                dst.put_slice(&payload);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slow_frame(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![3, 0];
        out.extend_from_slice(&((payload.len() as u16 + 4).to_be_bytes()));
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn slow_path_single_chunk() {
        let mut codec = TpktCodec;
        let mut buf = BytesMut::from(&slow_frame(b"hello")[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, TpktFrame::SlowPath(Bytes::from_static(b"hello")));
        assert!(buf.is_empty());
    }

    #[test]
    fn slow_path_reassembles_across_arbitrary_splits() {
        let wire = slow_frame(b"split across many reads");
        // Every possible split point, including byte-by-byte.
        for split in 1..wire.len() {
            let mut codec = TpktCodec;
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&wire[..split]);
            assert!(codec.decode(&mut buf).unwrap().is_none() || split == wire.len());
            buf.extend_from_slice(&wire[split..]);
            let frame = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(
                frame,
                TpktFrame::SlowPath(Bytes::from_static(b"split across many reads"))
            );
        }
    }

    #[test]
    fn fast_path_short_length_form() {
        let mut codec = TpktCodec;
        // header 0x80 (encrypted flag in bits 6-7), total 6, payload 4.
        let mut buf = BytesMut::from(&[0x80u8, 0x06, 1, 2, 3, 4][..]);
        match codec.decode(&mut buf).unwrap().unwrap() {
            TpktFrame::FastPath { flags, payload } => {
                assert_eq!(flags, FastPathFlags::ENCRYPTED);
                assert_eq!(&payload[..], &[1, 2, 3, 4]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn fast_path_long_length_form() {
        let mut codec = TpktCodec;
        let payload = vec![0xAB; 300];
        let total = payload.len() + 3;
        let mut wire = vec![0x00, 0x80 | (total >> 8) as u8, (total & 0xFF) as u8];
        wire.extend_from_slice(&payload);
        let mut buf = BytesMut::from(&wire[..]);
        match codec.decode(&mut buf).unwrap().unwrap() {
            TpktFrame::FastPath { flags, payload: p } => {
                assert!(flags.is_empty());
                assert_eq!(p.len(), 300);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn fast_path_then_slow_path_in_one_chunk() {
        let mut codec = TpktCodec;
        let mut wire = vec![0x00u8, 0x05, 9, 9, 9];
        wire.extend_from_slice(&slow_frame(b"after"));
        let mut buf = BytesMut::from(&wire[..]);

        match codec.decode(&mut buf).unwrap().unwrap() {
            TpktFrame::FastPath { payload, .. } => assert_eq!(&payload[..], &[9, 9, 9]),
            other => panic!("unexpected frame: {other:?}"),
        }
        match codec.decode(&mut buf).unwrap().unwrap() {
            TpktFrame::SlowPath(payload) => assert_eq!(&payload[..], b"after"),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn lying_length_rejected() {
        let mut codec = TpktCodec;
        let mut buf = BytesMut::from(&[3u8, 0, 0, 2][..]);
        assert!(codec.decode(&mut buf).is_err());

        let mut codec = TpktCodec;
        let mut buf = BytesMut::from(&[0x00u8, 0x01][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn encoder_round_trips_through_decoder() {
        let mut codec = TpktCodec;
        let mut wire = BytesMut::new();
        codec
            .encode(TpktFrame::SlowPath(Bytes::from_static(b"abc")), &mut wire)
            .unwrap();
        codec
            .encode(
                TpktFrame::fast_path(FastPathFlags::ENCRYPTED, Bytes::from(vec![7u8; 200])),
                &mut wire,
            )
            .unwrap();

        let first = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(first, TpktFrame::SlowPath(Bytes::from_static(b"abc")));
        match codec.decode(&mut wire).unwrap().unwrap() {
            TpktFrame::FastPath { flags, payload } => {
                assert_eq!(flags, FastPathFlags::ENCRYPTED);
                assert_eq!(payload.len(), 200);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn empty_slow_path_payload_is_valid() {
        let mut codec = TpktCodec;
        let mut buf = BytesMut::from(&slow_frame(b"")[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, TpktFrame::SlowPath(Bytes::new()));
    }
}
