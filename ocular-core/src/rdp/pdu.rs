//! Share-level PDUs: capability exchange, finalization, the update
//! stream, and input events.
//!
//! Slow-path traffic uses the share control header (Demand/Confirm
//! Active, Deactivate All) and the share data header (everything else).
//! Display updates also arrive on the fast path with their own compact
//! update headers, including a fragmentation scheme of their own that
//! is reassembled here before decoding.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::codec::{Wire, ensure_len, read_u8, read_u16_le, read_u32_le, take_bytes};
use crate::error::OcularError;
use crate::observer::UpdateRect;
use crate::rdp::caps::{self, CapabilitySet};

// Share control PDU types.
const PDUTYPE_DEMAND_ACTIVE: u16 = 0x1;
const PDUTYPE_CONFIRM_ACTIVE: u16 = 0x3;
const PDUTYPE_DEACTIVATE_ALL: u16 = 0x6;
const PDUTYPE_DATA: u16 = 0x7;
/// Protocol version bits folded into the pduType field.
const PDU_VERSION: u16 = 0x10;

// Share data PDU types.
pub const PDUTYPE2_UPDATE: u8 = 2;
pub const PDUTYPE2_CONTROL: u8 = 20;
pub const PDUTYPE2_POINTER: u8 = 27;
pub const PDUTYPE2_INPUT: u8 = 28;
pub const PDUTYPE2_SYNCHRONIZE: u8 = 31;
pub const PDUTYPE2_SHUTDOWN_DENIED: u8 = 37;
pub const PDUTYPE2_FONTLIST: u8 = 39;
pub const PDUTYPE2_FONTMAP: u8 = 40;
pub const PDUTYPE2_SET_ERROR_INFO: u8 = 47;

// Control PDU actions.
pub const CTRLACTION_REQUEST_CONTROL: u16 = 1;
pub const CTRLACTION_GRANTED_CONTROL: u16 = 2;
pub const CTRLACTION_COOPERATE: u16 = 4;

// Bitmap data flags.
const BITMAP_COMPRESSION: u16 = 0x0001;
const NO_BITMAP_COMPRESSION_HDR: u16 = 0x0400;

// ── Share control layer ──────────────────────────────────────────

/// One parsed slow-path share PDU.
#[derive(Debug, Clone)]
pub enum SharePdu {
    DemandActive(DemandActive),
    DeactivateAll,
    Data(ShareData),
}

/// Server Demand Active: the share id plus the server capability set.
#[derive(Debug, Clone)]
pub struct DemandActive {
    pub share_id: u32,
    pub capabilities: Vec<CapabilitySet>,
}

/// A share data PDU, header parsed, body untouched.
#[derive(Debug, Clone)]
pub struct ShareData {
    pub share_id: u32,
    pub pdu_type2: u8,
    pub body: Bytes,
}

/// Parse one slow-path share control PDU.
pub fn decode_share_control(mut pdu: Bytes) -> Result<SharePdu, OcularError> {
    let total = read_u16_le(&mut pdu, "share control header")? as usize;
    let pdu_type = read_u16_le(&mut pdu, "share control header")? & 0x0F;
    let _source = read_u16_le(&mut pdu, "share control header")?;
    if total < 6 {
        return Err(OcularError::Malformed {
            context: "share control header",
            reason: "total length shorter than header",
        });
    }

    match pdu_type {
        PDUTYPE_DEMAND_ACTIVE => {
            let share_id = read_u32_le(&mut pdu, "demand active")?;
            let source_len = read_u16_le(&mut pdu, "demand active")? as usize;
            let _caps_len = read_u16_le(&mut pdu, "demand active")? as usize;
            take_bytes(&mut pdu, source_len, "demand active source")?;
            let count = read_u16_le(&mut pdu, "demand active")? as usize;
            read_u16_le(&mut pdu, "demand active")?; // pad
            let capabilities = caps::decode_capability_list(&mut pdu, count)?;
            debug!(share_id, count, "demand active received");
            Ok(SharePdu::DemandActive(DemandActive {
                share_id,
                capabilities,
            }))
        }
        PDUTYPE_DEACTIVATE_ALL => Ok(SharePdu::DeactivateAll),
        PDUTYPE_DATA => {
            let share_id = read_u32_le(&mut pdu, "share data header")?;
            read_u8(&mut pdu, "share data header")?; // pad
            read_u8(&mut pdu, "share data header")?; // stream id
            read_u16_le(&mut pdu, "share data header")?; // uncompressed length
            let pdu_type2 = read_u8(&mut pdu, "share data header")?;
            read_u8(&mut pdu, "share data header")?; // compressed type
            read_u16_le(&mut pdu, "share data header")?; // compressed length
            Ok(SharePdu::Data(ShareData {
                share_id,
                pdu_type2,
                body: pdu,
            }))
        }
        other => Err(OcularError::UnknownVariant {
            type_name: "SharePduType",
            value: other as u64,
        }),
    }
}

fn put_share_control_header(buf: &mut BytesMut, total: usize, pdu_type: u16, source: u16) {
    buf.put_u16_le(total as u16);
    buf.put_u16_le(pdu_type | PDU_VERSION);
    buf.put_u16_le(source);
}

/// Client Confirm Active carrying the client capability set.
pub fn confirm_active(share_id: u32, source: u16, capabilities: &[CapabilitySet]) -> Bytes {
    let mut caps_buf = BytesMut::new();
    for set in capabilities {
        set.encode(&mut caps_buf);
    }
    const SOURCE_DESCRIPTOR: &[u8] = b"ocular";
    let combined = caps_buf.len() + 4;
    let total = 6 + 4 + 2 + 2 + 2 + SOURCE_DESCRIPTOR.len() + 2 + 2 + caps_buf.len();

    let mut buf = BytesMut::with_capacity(total);
    put_share_control_header(&mut buf, total, PDUTYPE_CONFIRM_ACTIVE, source);
    buf.put_u32_le(share_id);
    buf.put_u16_le(0x03EA); // originator: server channel
    buf.put_u16_le(SOURCE_DESCRIPTOR.len() as u16);
    buf.put_u16_le(combined as u16);
    buf.put_slice(SOURCE_DESCRIPTOR);
    buf.put_u16_le(capabilities.len() as u16);
    buf.put_u16_le(0); // pad
    buf.put_slice(&caps_buf);
    buf.freeze()
}

/// Frame a share data PDU around `body`.
pub fn share_data(share_id: u32, source: u16, pdu_type2: u8, body: &[u8]) -> Bytes {
    let total = 6 + 12 + body.len();
    let mut buf = BytesMut::with_capacity(total);
    put_share_control_header(&mut buf, total, PDUTYPE_DATA, source);
    buf.put_u32_le(share_id);
    buf.put_u8(0); // pad
    buf.put_u8(1); // stream: low
    buf.put_u16_le(body.len() as u16 + 12);
    buf.put_u8(pdu_type2);
    buf.put_u8(0); // no compression
    buf.put_u16_le(0);
    buf.put_slice(body);
    buf.freeze()
}

// ── Finalization bodies ──────────────────────────────────────────

pub fn synchronize_body(target_user: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u16_le(1); // SYNCMSGTYPE_SYNC
    buf.put_u16_le(target_user);
    buf.freeze()
}

pub fn control_body(action: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u16_le(action);
    buf.put_u16_le(0); // grant id
    buf.put_u32_le(0); // control id
    buf.freeze()
}

pub fn font_list_body() -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u16_le(0); // number fonts
    buf.put_u16_le(0); // total fonts
    buf.put_u16_le(0x0003); // first + last
    buf.put_u16_le(50); // entry size
    buf.freeze()
}

/// Map the common Set Error Info codes to a readable reason.
pub fn error_info_reason(code: u32) -> String {
    let known = match code {
        0x0000_0001 => Some("disconnected by administration tool"),
        0x0000_0002 => Some("logged off by administration tool"),
        0x0000_0003 => Some("idle session time limit reached"),
        0x0000_0004 => Some("logon time limit reached"),
        0x0000_0005 => Some("another connection replaced this session"),
        0x0000_0006 => Some("server ran out of memory"),
        0x0000_0007 => Some("server denied the connection"),
        0x0000_0009 => Some("user privileges insufficient"),
        0x0000_000A => Some("fresh credentials required"),
        0x0000_000B => Some("disconnected by user on server"),
        0x0000_000C => Some("logged off by user on server"),
        _ => None,
    };
    match known {
        Some(text) => format!("server error info: {text} ({code:#010x})"),
        None => format!("server error info code {code:#010x}"),
    }
}

// ── Input events ─────────────────────────────────────────────────

/// One user input event, encodable on both paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    /// Keyboard scancode. `release` sets the key-up flag, `extended`
    /// the extended-key flag.
    Scancode {
        code: u16,
        release: bool,
        extended: bool,
    },
    /// A UTF-16 code unit.
    Unicode { code: u16, release: bool },
    /// Pointer move/button with raw pointer flags.
    Mouse { flags: u16, x: u16, y: u16 },
    /// Keyboard toggle-state synchronization.
    SyncToggles { flags: u32 },
}

const KBDFLAGS_RELEASE: u16 = 0x8000;
const KBDFLAGS_EXTENDED: u16 = 0x0100;

// Fast-path event codes (bits 5-7 of the event header).
const FASTPATH_EVENT_SCANCODE: u8 = 0;
const FASTPATH_EVENT_MOUSE: u8 = 1;
const FASTPATH_EVENT_SYNC: u8 = 3;
const FASTPATH_EVENT_UNICODE: u8 = 4;
const FASTPATH_FLAG_RELEASE: u8 = 0x01;
const FASTPATH_FLAG_EXTENDED: u8 = 0x02;

impl InputEvent {
    fn encode_slow_path(&self, buf: &mut BytesMut) {
        buf.put_u32_le(0); // event time: ignored by servers
        match *self {
            Self::SyncToggles { flags } => {
                buf.put_u16_le(0x0000);
                buf.put_u16_le(0); // pad
                buf.put_u32_le(flags);
            }
            Self::Scancode {
                code,
                release,
                extended,
            } => {
                buf.put_u16_le(0x0004);
                let mut flags = 0u16;
                if release {
                    flags |= KBDFLAGS_RELEASE;
                }
                if extended {
                    flags |= KBDFLAGS_EXTENDED;
                }
                buf.put_u16_le(flags);
                buf.put_u16_le(code);
                buf.put_u16_le(0); // pad
            }
            Self::Unicode { code, release } => {
                buf.put_u16_le(0x0005);
                buf.put_u16_le(if release { KBDFLAGS_RELEASE } else { 0 });
                buf.put_u16_le(code);
                buf.put_u16_le(0); // pad
            }
            Self::Mouse { flags, x, y } => {
                buf.put_u16_le(0x8001);
                buf.put_u16_le(flags);
                buf.put_u16_le(x);
                buf.put_u16_le(y);
            }
        }
    }

    fn encode_fast_path(&self, buf: &mut BytesMut) {
        match *self {
            Self::Scancode {
                code,
                release,
                extended,
            } => {
                let mut flags = 0u8;
                if release {
                    flags |= FASTPATH_FLAG_RELEASE;
                }
                if extended {
                    flags |= FASTPATH_FLAG_EXTENDED;
                }
                buf.put_u8(FASTPATH_EVENT_SCANCODE << 5 | flags);
                buf.put_u8(code as u8);
            }
            Self::Unicode { code, release } => {
                let flags = if release { FASTPATH_FLAG_RELEASE } else { 0 };
                buf.put_u8(FASTPATH_EVENT_UNICODE << 5 | flags);
                buf.put_u16_le(code);
            }
            Self::Mouse { flags, x, y } => {
                buf.put_u8(FASTPATH_EVENT_MOUSE << 5);
                buf.put_u16_le(flags);
                buf.put_u16_le(x);
                buf.put_u16_le(y);
            }
            Self::SyncToggles { flags } => {
                buf.put_u8(FASTPATH_EVENT_SYNC << 5 | (flags as u8 & 0x0F));
            }
        }
    }
}

/// Slow-path Input Event PDU body.
pub fn input_event_body(events: &[InputEvent]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + events.len() * 12);
    buf.put_u16_le(events.len() as u16);
    buf.put_u16_le(0); // pad
    for event in events {
        event.encode_slow_path(&mut buf);
    }
    buf.freeze()
}

/// Fast-path input payload: explicit event count, then packed events.
pub fn fast_path_input(events: &[InputEvent]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + events.len() * 7);
    buf.put_u8(events.len() as u8);
    for event in events {
        event.encode_fast_path(&mut buf);
    }
    buf.freeze()
}

// ── Update stream ────────────────────────────────────────────────

/// A decoded display update.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    Bitmap(Vec<UpdateRect>),
    /// Pointer/palette/synchronize updates this client does not render.
    Other(u8),
}

/// Decode the body of a slow-path Update Data PDU.
pub fn decode_slow_path_update(mut body: Bytes) -> Result<UpdateEvent, OcularError> {
    let update_type = read_u16_le(&mut body, "update data pdu")?;
    match update_type {
        0x0001 => Ok(UpdateEvent::Bitmap(decode_bitmap_update(&mut body)?)),
        other => {
            trace!(update_type = other, "ignoring non-bitmap slow-path update");
            Ok(UpdateEvent::Other(other as u8))
        }
    }
}

/// Decode a bitmap update body (shared by both paths, after the
/// `updateType` field).
fn decode_bitmap_update(body: &mut Bytes) -> Result<Vec<UpdateRect>, OcularError> {
    let count = read_u16_le(body, "bitmap update")? as usize;
    let mut rects = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let left = read_u16_le(body, "bitmap data")?;
        let top = read_u16_le(body, "bitmap data")?;
        let right = read_u16_le(body, "bitmap data")?;
        let bottom = read_u16_le(body, "bitmap data")?;
        let width = read_u16_le(body, "bitmap data")?;
        let height = read_u16_le(body, "bitmap data")?;
        let bits_per_pixel = read_u16_le(body, "bitmap data")?;
        let flags = read_u16_le(body, "bitmap data")?;
        let mut length = read_u16_le(body, "bitmap data")? as usize;

        let compressed = flags & BITMAP_COMPRESSION != 0;
        if compressed && flags & NO_BITMAP_COMPRESSION_HDR == 0 {
            // Strip the optional compression header; its main-body size
            // bounds the actual pixel stream.
            ensure_len(&*body, 8, "bitmap compression header")?;
            read_u16_le(body, "bitmap compression header")?; // first row size
            let main_body = read_u16_le(body, "bitmap compression header")? as usize;
            read_u16_le(body, "bitmap compression header")?; // scan width
            read_u16_le(body, "bitmap compression header")?; // uncompressed size
            length = main_body;
        }
        let data = take_bytes(body, length, "bitmap data")?;
        rects.push(UpdateRect {
            left,
            top,
            right,
            bottom,
            width,
            height,
            bits_per_pixel,
            is_compressed: compressed,
            data,
        });
    }
    Ok(rects)
}

// ── Fast-path update decoding ────────────────────────────────────

// Fast-path update codes.
const FASTPATH_UPDATETYPE_BITMAP: u8 = 0x1;

// Fast-path fragmentation values.
const FRAGMENTATION_SINGLE: u8 = 0;
const FRAGMENTATION_LAST: u8 = 1;
const FRAGMENTATION_FIRST: u8 = 2;
const FRAGMENTATION_NEXT: u8 = 3;

/// Reassembles and decodes fast-path update PDUs.
///
/// One fast-path frame may carry several updates, and a single large
/// update may span several frames via the FIRST/NEXT/LAST fragment
/// bits; partial updates accumulate here until LAST.
#[derive(Debug, Default)]
pub struct FastPathUpdateDecoder {
    fragment: BytesMut,
    fragment_code: u8,
}

impl FastPathUpdateDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decrypted fast-path frame body; returns every update
    /// completed by it.
    pub fn decode(&mut self, mut payload: Bytes) -> Result<Vec<UpdateEvent>, OcularError> {
        let mut events = Vec::new();
        while !payload.is_empty() {
            let header = read_u8(&mut payload, "fast-path update header")?;
            let code = header & 0x0F;
            let fragmentation = (header >> 4) & 0x03;
            let compression = (header >> 6) & 0x03;
            if compression == 0x2 {
                read_u8(&mut payload, "fast-path compression flags")?;
            }
            let size = read_u16_le(&mut payload, "fast-path update size")? as usize;
            let chunk = take_bytes(&mut payload, size, "fast-path update body")?;

            let complete = match fragmentation {
                FRAGMENTATION_SINGLE => Some(chunk),
                FRAGMENTATION_FIRST => {
                    if !self.fragment.is_empty() {
                        warn!("discarding stale fast-path fragment");
                        self.fragment.clear();
                    }
                    self.fragment_code = code;
                    self.fragment.extend_from_slice(&chunk);
                    None
                }
                FRAGMENTATION_NEXT => {
                    self.append_fragment(code, &chunk)?;
                    None
                }
                FRAGMENTATION_LAST => {
                    self.append_fragment(code, &chunk)?;
                    Some(self.fragment.split().freeze())
                }
                _ => unreachable!("two-bit field"),
            };

            if let Some(body) = complete {
                events.push(Self::decode_update(code, body)?);
            }
        }
        Ok(events)
    }

    fn append_fragment(&mut self, code: u8, chunk: &[u8]) -> Result<(), OcularError> {
        if self.fragment.is_empty() || self.fragment_code != code {
            self.fragment.clear();
            return Err(OcularError::Framing(
                "fast-path fragment continuation without a first fragment",
            ));
        }
        self.fragment.extend_from_slice(chunk);
        Ok(())
    }

    fn decode_update(code: u8, mut body: Bytes) -> Result<UpdateEvent, OcularError> {
        match code {
            FASTPATH_UPDATETYPE_BITMAP => {
                let update_type = read_u16_le(&mut body, "fast-path bitmap update")?;
                if update_type != 0x0001 {
                    return Err(OcularError::Malformed {
                        context: "fast-path bitmap update",
                        reason: "unexpected inner update type",
                    });
                }
                Ok(UpdateEvent::Bitmap(decode_bitmap_update(&mut body)?))
            }
            other => {
                trace!(code = other, "ignoring non-bitmap fast-path update");
                Ok(UpdateEvent::Other(other))
            }
        }
    }
}

// ── Scripted-server builders ─────────────────────────────────────

/// PDU builders for the scripted servers in the integration tests.
#[doc(hidden)]
pub mod testing {
    use super::*;

    pub fn demand_active(share_id: u32, capabilities: &[CapabilitySet]) -> Bytes {
        let mut caps_buf = BytesMut::new();
        for set in capabilities {
            set.encode(&mut caps_buf);
        }
        let source = b"RDP";
        let total = 6 + 4 + 2 + 2 + source.len() + 2 + 2 + caps_buf.len() + 4;
        let mut buf = BytesMut::with_capacity(total);
        put_share_control_header(&mut buf, total, PDUTYPE_DEMAND_ACTIVE, 0x03EA);
        buf.put_u32_le(share_id);
        buf.put_u16_le(source.len() as u16);
        buf.put_u16_le(caps_buf.len() as u16 + 4);
        buf.put_slice(source);
        buf.put_u16_le(capabilities.len() as u16);
        buf.put_u16_le(0);
        buf.put_slice(&caps_buf);
        buf.put_u32_le(0); // session id
        buf.freeze()
    }

    pub fn font_map(share_id: u32) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u16_le(0);
        body.put_u16_le(0);
        body.put_u16_le(0x0003);
        body.put_u16_le(4);
        share_data(share_id, 0x03EA, PDUTYPE2_FONTMAP, &body)
    }

    pub fn synchronize(share_id: u32, target: u16) -> Bytes {
        share_data(share_id, 0x03EA, PDUTYPE2_SYNCHRONIZE, &synchronize_body(target))
    }

    pub fn control(share_id: u32, action: u16) -> Bytes {
        share_data(share_id, 0x03EA, PDUTYPE2_CONTROL, &control_body(action))
    }

    pub fn bitmap_update(share_id: u32, rect: &UpdateRect) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u16_le(0x0001); // bitmap update
        body.put_u16_le(1); // one rectangle
        body.put_u16_le(rect.left);
        body.put_u16_le(rect.top);
        body.put_u16_le(rect.right);
        body.put_u16_le(rect.bottom);
        body.put_u16_le(rect.width);
        body.put_u16_le(rect.height);
        body.put_u16_le(rect.bits_per_pixel);
        body.put_u16_le(if rect.is_compressed {
            BITMAP_COMPRESSION | NO_BITMAP_COMPRESSION_HDR
        } else {
            0
        });
        body.put_u16_le(rect.data.len() as u16);
        body.put_slice(&rect.data);
        share_data(share_id, 0x03EA, PDUTYPE2_UPDATE, &body)
    }

    pub fn error_info(share_id: u32, code: u32) -> Bytes {
        share_data(share_id, 0x03EA, PDUTYPE2_SET_ERROR_INFO, &code.to_le_bytes())
    }

    /// A fast-path frame body carrying one bitmap update, optionally
    /// split into FIRST/NEXT/LAST fragments of `fragment_size` bytes.
    pub fn fast_path_bitmap(rect: &UpdateRect, fragment_size: Option<usize>) -> Vec<Bytes> {
        let mut update = BytesMut::new();
        update.put_u16_le(0x0001);
        update.put_u16_le(1);
        update.put_u16_le(rect.left);
        update.put_u16_le(rect.top);
        update.put_u16_le(rect.right);
        update.put_u16_le(rect.bottom);
        update.put_u16_le(rect.width);
        update.put_u16_le(rect.height);
        update.put_u16_le(rect.bits_per_pixel);
        update.put_u16_le(0);
        update.put_u16_le(rect.data.len() as u16);
        update.put_slice(&rect.data);
        let update = update.freeze();

        match fragment_size {
            None => {
                let mut frame = BytesMut::new();
                frame.put_u8(FASTPATH_UPDATETYPE_BITMAP);
                frame.put_u16_le(update.len() as u16);
                frame.put_slice(&update);
                vec![frame.freeze()]
            }
            Some(size) => {
                let chunks: Vec<&[u8]> = update.chunks(size).collect();
                chunks
                    .iter()
                    .enumerate()
                    .map(|(i, chunk)| {
                        let fragmentation = if chunks.len() == 1 {
                            FRAGMENTATION_SINGLE
                        } else if i == 0 {
                            FRAGMENTATION_FIRST
                        } else if i == chunks.len() - 1 {
                            FRAGMENTATION_LAST
                        } else {
                            FRAGMENTATION_NEXT
                        };
                        let mut frame = BytesMut::new();
                        frame.put_u8(FASTPATH_UPDATETYPE_BITMAP | fragmentation << 4);
                        frame.put_u16_le(chunk.len() as u16);
                        frame.put_slice(chunk);
                        frame.freeze()
                    })
                    .collect()
            }
        }
    }
}
