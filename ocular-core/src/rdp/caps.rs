//! RDP capability sets exchanged during Demand Active / Confirm Active.
//!
//! The handful of sets whose contents this client actually consults are
//! fully typed; everything else travels as a raw type/body pair so the
//! exchange stays loss-free. Each set is framed by a 4-byte header:
//! type `u16` LE, length `u16` LE including the header.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{Wire, read_u16_le, read_u32_le, take_bytes};
use crate::error::OcularError;
use crate::observer::Controller;
use crate::rdp::channels::CHANNEL_CHUNK_LENGTH;

pub const CAPSTYPE_GENERAL: u16 = 0x0001;
pub const CAPSTYPE_BITMAP: u16 = 0x0002;
pub const CAPSTYPE_ORDER: u16 = 0x0003;
pub const CAPSTYPE_BITMAPCACHE: u16 = 0x0004;
pub const CAPSTYPE_POINTER: u16 = 0x0008;
pub const CAPSTYPE_SHARE: u16 = 0x0009;
pub const CAPSTYPE_COLORCACHE: u16 = 0x000A;
pub const CAPSTYPE_SOUND: u16 = 0x000C;
pub const CAPSTYPE_INPUT: u16 = 0x000D;
pub const CAPSTYPE_FONT: u16 = 0x000E;
pub const CAPSTYPE_BRUSH: u16 = 0x000F;
pub const CAPSTYPE_GLYPHCACHE: u16 = 0x0010;
pub const CAPSTYPE_OFFSCREENCACHE: u16 = 0x0011;
pub const CAPSTYPE_VIRTUALCHANNEL: u16 = 0x0014;
pub const CAPSETTYPE_MULTIFRAGMENTUPDATE: u16 = 0x001A;

bitflags! {
    /// General capability extra flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GeneralExtraFlags: u16 {
        const FASTPATH_OUTPUT_SUPPORTED  = 0x0001;
        const LONG_CREDENTIALS_SUPPORTED = 0x0004;
        const AUTORECONNECT_SUPPORTED    = 0x0008;
        const ENC_SALTED_CHECKSUM        = 0x0010;
        const NO_BITMAP_COMPRESSION_HDR  = 0x0400;
    }
}

bitflags! {
    /// Input capability flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InputFlags: u16 {
        const SCANCODES       = 0x0001;
        const MOUSEX          = 0x0004;
        const FASTPATH_INPUT  = 0x0008;
        const UNICODE         = 0x0010;
        const FASTPATH_INPUT2 = 0x0020;
    }
}

// ── Typed capability sets ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneralCapability {
    pub extra_flags: GeneralExtraFlags,
    pub refresh_rect: bool,
    pub suppress_output: bool,
}

impl GeneralCapability {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(1); // OS major: Windows
        buf.put_u16_le(3); // OS minor: NT
        buf.put_u16_le(0x0200); // protocol version
        buf.put_u16_le(0); // pad
        buf.put_u16_le(0); // general compression types
        buf.put_u16_le(self.extra_flags.bits());
        buf.put_u16_le(0); // update capability
        buf.put_u16_le(0); // remote unshare
        buf.put_u16_le(0); // general compression level
        buf.put_u8(self.refresh_rect as u8);
        buf.put_u8(self.suppress_output as u8);
    }

    fn decode(body: &mut Bytes) -> Result<Self, OcularError> {
        take_bytes(body, 10, "general capability")?;
        let extra_flags =
            GeneralExtraFlags::from_bits_truncate(read_u16_le(body, "general capability")?);
        take_bytes(body, 6, "general capability")?;
        let tail = take_bytes(body, 2, "general capability").unwrap_or_default();
        Ok(Self {
            extra_flags,
            refresh_rect: tail.first().copied().unwrap_or(0) != 0,
            suppress_output: tail.get(1).copied().unwrap_or(0) != 0,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapCapability {
    pub preferred_bits_per_pixel: u16,
    pub desktop_width: u16,
    pub desktop_height: u16,
    pub desktop_resize: bool,
}

impl BitmapCapability {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.preferred_bits_per_pixel);
        buf.put_u16_le(1); // receive 1 bpp
        buf.put_u16_le(1); // receive 4 bpp
        buf.put_u16_le(1); // receive 8 bpp
        buf.put_u16_le(self.desktop_width);
        buf.put_u16_le(self.desktop_height);
        buf.put_u16_le(0); // pad
        buf.put_u16_le(self.desktop_resize as u16);
        buf.put_u16_le(1); // bitmap compression supported
        buf.put_u8(0); // high color flags
        buf.put_u8(0); // drawing flags
        buf.put_u16_le(1); // multiple rectangle support
        buf.put_u16_le(0); // pad
    }

    fn decode(body: &mut Bytes) -> Result<Self, OcularError> {
        let preferred_bits_per_pixel = read_u16_le(body, "bitmap capability")?;
        take_bytes(body, 6, "bitmap capability")?;
        let desktop_width = read_u16_le(body, "bitmap capability")?;
        let desktop_height = read_u16_le(body, "bitmap capability")?;
        read_u16_le(body, "bitmap capability")?; // pad
        let desktop_resize = read_u16_le(body, "bitmap capability")? != 0;
        Ok(Self {
            preferred_bits_per_pixel,
            desktop_width,
            desktop_height,
            desktop_resize,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderCapability {
    /// Which drawing orders the client accepts; this client draws
    /// nothing itself, so the table is all zeros unless a consumer
    /// opts in.
    pub order_support: [u8; 32],
}

impl Default for OrderCapability {
    fn default() -> Self {
        Self {
            order_support: [0u8; 32],
        }
    }
}

impl OrderCapability {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_bytes(0, 16); // terminal descriptor
        buf.put_u32_le(0); // pad
        buf.put_u16_le(1); // desktop save X granularity
        buf.put_u16_le(20); // desktop save Y granularity
        buf.put_u16_le(0); // pad
        buf.put_u16_le(1); // maximum order level
        buf.put_u16_le(0); // number of fonts
        buf.put_u16_le(0x002A); // order flags: negotiate, zero-bounds deltas, color indices
        buf.put_slice(&self.order_support);
        buf.put_u16_le(0); // text flags
        buf.put_u16_le(0); // order support ex
        buf.put_u32_le(0); // pad
        buf.put_u32_le(480 * 480); // desktop save size
        buf.put_u16_le(0); // pad
        buf.put_u16_le(0); // pad
        buf.put_u16_le(0); // ANSI code page
        buf.put_u16_le(0); // pad
    }

    fn decode(body: &mut Bytes) -> Result<Self, OcularError> {
        take_bytes(body, 32, "order capability")?;
        let raw = take_bytes(body, 32, "order capability")?;
        let mut order_support = [0u8; 32];
        order_support.copy_from_slice(&raw);
        Ok(Self { order_support })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputCapability {
    pub flags: InputFlags,
    pub keyboard_layout: u32,
}

impl InputCapability {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.flags.bits());
        buf.put_u16_le(0); // pad
        buf.put_u32_le(self.keyboard_layout);
        buf.put_u32_le(4); // keyboard type: IBM enhanced
        buf.put_u32_le(0); // sub type
        buf.put_u32_le(12); // function keys
        buf.put_bytes(0, 64); // IME file name
    }

    fn decode(body: &mut Bytes) -> Result<Self, OcularError> {
        let flags = InputFlags::from_bits_truncate(read_u16_le(body, "input capability")?);
        read_u16_le(body, "input capability")?;
        let keyboard_layout = read_u32_le(body, "input capability")?;
        Ok(Self {
            flags,
            keyboard_layout,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualChannelCapability {
    pub chunk_size: u32,
}

impl VirtualChannelCapability {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(0); // no channel compression
        buf.put_u32_le(self.chunk_size);
    }

    fn decode(body: &mut Bytes) -> Result<Self, OcularError> {
        read_u32_le(body, "virtual channel capability")?;
        let chunk_size = match read_u32_le(body, "virtual channel capability") {
            Ok(size) if size > 0 => size,
            _ => CHANNEL_CHUNK_LENGTH as u32,
        };
        Ok(Self { chunk_size })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultifragmentUpdateCapability {
    pub max_request_size: u32,
}

impl MultifragmentUpdateCapability {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.max_request_size);
    }

    fn decode(body: &mut Bytes) -> Result<Self, OcularError> {
        Ok(Self {
            max_request_size: read_u32_le(body, "multifragment capability")?,
        })
    }
}

// ── CapabilitySet ────────────────────────────────────────────────

/// One capability set, typed when this client reads it, raw otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilitySet {
    General(GeneralCapability),
    Bitmap(BitmapCapability),
    Order(OrderCapability),
    Input(InputCapability),
    VirtualChannel(VirtualChannelCapability),
    MultifragmentUpdate(MultifragmentUpdateCapability),
    Raw { set_type: u16, body: Bytes },
}

impl CapabilitySet {
    pub fn set_type(&self) -> u16 {
        match self {
            Self::General(_) => CAPSTYPE_GENERAL,
            Self::Bitmap(_) => CAPSTYPE_BITMAP,
            Self::Order(_) => CAPSTYPE_ORDER,
            Self::Input(_) => CAPSTYPE_INPUT,
            Self::VirtualChannel(_) => CAPSTYPE_VIRTUALCHANNEL,
            Self::MultifragmentUpdate(_) => CAPSETTYPE_MULTIFRAGMENTUPDATE,
            Self::Raw { set_type, .. } => *set_type,
        }
    }
}

impl Wire for CapabilitySet {
    fn size(&self) -> usize {
        4 + match self {
            Self::General(_) => 20,
            Self::Bitmap(_) => 24,
            Self::Order(_) => 84,
            Self::Input(_) => 84,
            Self::VirtualChannel(_) => 8,
            Self::MultifragmentUpdate(_) => 4,
            Self::Raw { body, .. } => body.len(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::new();
        match self {
            Self::General(c) => c.encode(&mut body),
            Self::Bitmap(c) => c.encode(&mut body),
            Self::Order(c) => c.encode(&mut body),
            Self::Input(c) => c.encode(&mut body),
            Self::VirtualChannel(c) => c.encode(&mut body),
            Self::MultifragmentUpdate(c) => c.encode(&mut body),
            Self::Raw { body: raw, .. } => body.put_slice(raw),
        }
        buf.put_u16_le(self.set_type());
        buf.put_u16_le(body.len() as u16 + 4);
        buf.put_slice(&body);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, OcularError> {
        let set_type = read_u16_le(buf, "capability header")?;
        let length = read_u16_le(buf, "capability header")? as usize;
        if length < 4 {
            return Err(OcularError::Malformed {
                context: "capability header",
                reason: "length shorter than header",
            });
        }
        let mut body = take_bytes(buf, length - 4, "capability body")?;
        Ok(match set_type {
            CAPSTYPE_GENERAL => Self::General(GeneralCapability::decode(&mut body)?),
            CAPSTYPE_BITMAP => Self::Bitmap(BitmapCapability::decode(&mut body)?),
            CAPSTYPE_ORDER => Self::Order(OrderCapability::decode(&mut body)?),
            CAPSTYPE_INPUT => Self::Input(InputCapability::decode(&mut body)?),
            CAPSTYPE_VIRTUALCHANNEL => {
                Self::VirtualChannel(VirtualChannelCapability::decode(&mut body)?)
            }
            CAPSETTYPE_MULTIFRAGMENTUPDATE => {
                Self::MultifragmentUpdate(MultifragmentUpdateCapability::decode(&mut body)?)
            }
            other => Self::Raw {
                set_type: other,
                body,
            },
        })
    }
}

/// Decode a `numberCapabilities`-prefixed capability region.
pub fn decode_capability_list(
    buf: &mut Bytes,
    count: usize,
) -> Result<Vec<CapabilitySet>, OcularError> {
    let mut sets = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        sets.push(CapabilitySet::decode(buf)?);
    }
    Ok(sets)
}

// ── Client capability assembly ───────────────────────────────────

/// The capability set the client confirms with, derived from the
/// session parameters.
pub fn client_capabilities(controller: &Controller) -> Vec<CapabilitySet> {
    vec![
        CapabilitySet::General(GeneralCapability {
            extra_flags: GeneralExtraFlags::FASTPATH_OUTPUT_SUPPORTED
                | GeneralExtraFlags::LONG_CREDENTIALS_SUPPORTED
                | GeneralExtraFlags::NO_BITMAP_COMPRESSION_HDR,
            refresh_rect: false,
            suppress_output: false,
        }),
        CapabilitySet::Bitmap(BitmapCapability {
            preferred_bits_per_pixel: controller.color_depth,
            desktop_width: controller.width,
            desktop_height: controller.height,
            desktop_resize: true,
        }),
        CapabilitySet::Order(OrderCapability::default()),
        CapabilitySet::Raw {
            set_type: CAPSTYPE_BITMAPCACHE,
            body: Bytes::from_static(&[0u8; 36]),
        },
        CapabilitySet::Raw {
            set_type: CAPSTYPE_POINTER,
            // color pointers supported, cache sizes 20/20
            body: Bytes::from_static(&[0x01, 0x00, 0x14, 0x00, 0x14, 0x00]),
        },
        CapabilitySet::Input(InputCapability {
            flags: InputFlags::SCANCODES
                | InputFlags::MOUSEX
                | InputFlags::UNICODE
                | InputFlags::FASTPATH_INPUT
                | InputFlags::FASTPATH_INPUT2,
            keyboard_layout: controller.keyboard_layout,
        }),
        CapabilitySet::Raw {
            set_type: CAPSTYPE_BRUSH,
            body: Bytes::from_static(&[0u8; 4]),
        },
        CapabilitySet::Raw {
            set_type: CAPSTYPE_GLYPHCACHE,
            body: Bytes::from_static(&[0u8; 48]),
        },
        CapabilitySet::Raw {
            set_type: CAPSTYPE_OFFSCREENCACHE,
            body: Bytes::from_static(&[0u8; 8]),
        },
        CapabilitySet::VirtualChannel(VirtualChannelCapability {
            chunk_size: CHANNEL_CHUNK_LENGTH as u32,
        }),
        CapabilitySet::Raw {
            set_type: CAPSTYPE_SOUND,
            body: Bytes::from_static(&[0u8; 4]),
        },
        CapabilitySet::Raw {
            set_type: CAPSTYPE_SHARE,
            body: Bytes::from_static(&[0u8; 4]),
        },
        CapabilitySet::Raw {
            set_type: CAPSTYPE_COLORCACHE,
            body: Bytes::from_static(&[0x06, 0x00, 0x00, 0x00]),
        },
        CapabilitySet::Raw {
            set_type: CAPSTYPE_FONT,
            // font support flags: fontlist supported
            body: Bytes::from_static(&[0x01, 0x00, 0x00, 0x00]),
        },
        CapabilitySet::MultifragmentUpdate(MultifragmentUpdateCapability {
            max_request_size: 0xFFFF,
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_sets_round_trip() {
        let sets = client_capabilities(&Controller::default());
        let mut buf = BytesMut::new();
        for set in &sets {
            set.encode(&mut buf);
        }
        let mut bytes = buf.freeze();
        let decoded = decode_capability_list(&mut bytes, sets.len()).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(decoded.len(), sets.len());
        // size() must agree with what encode() emits, per set.
        for set in &sets {
            let mut one = BytesMut::new();
            set.encode(&mut one);
            assert_eq!(one.len(), set.size(), "size mismatch for {:#06x}", set.set_type());
        }
        // Typed sets must survive exactly; raw ones keep their type.
        for (a, b) in sets.iter().zip(&decoded) {
            assert_eq!(a.set_type(), b.set_type());
        }
        assert!(matches!(
            (&sets[0], &decoded[0]),
            (CapabilitySet::General(x), CapabilitySet::General(y)) if x == y
        ));
        assert!(matches!(
            (&sets[1], &decoded[1]),
            (CapabilitySet::Bitmap(x), CapabilitySet::Bitmap(y)) if x == y
        ));
    }

    #[test]
    fn bitmap_capability_reflects_controller() {
        let mut controller = Controller::default();
        controller.width = 800;
        controller.height = 600;
        controller.color_depth = 24;
        let sets = client_capabilities(&controller);
        let Some(CapabilitySet::Bitmap(bitmap)) = sets
            .iter()
            .find(|s| s.set_type() == CAPSTYPE_BITMAP)
        else {
            panic!("bitmap capability missing");
        };
        assert_eq!(bitmap.desktop_width, 800);
        assert_eq!(bitmap.desktop_height, 600);
        assert_eq!(bitmap.preferred_bits_per_pixel, 24);
    }

    #[test]
    fn unknown_set_survives_as_raw() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(0x7777);
        buf.put_u16_le(4 + 3);
        buf.put_slice(&[1, 2, 3]);
        let mut bytes = buf.freeze();
        match CapabilitySet::decode(&mut bytes).unwrap() {
            CapabilitySet::Raw { set_type, body } => {
                assert_eq!(set_type, 0x7777);
                assert_eq!(&body[..], &[1, 2, 3]);
            }
            other => panic!("unexpected set: {other:?}"),
        }
    }

    #[test]
    fn truncated_capability_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(CAPSTYPE_GENERAL);
        buf.put_u16_le(24);
        buf.put_slice(&[0u8; 4]); // far short of the declared 20
        let mut bytes = buf.freeze();
        assert!(CapabilitySet::decode(&mut bytes).is_err());
    }
}
