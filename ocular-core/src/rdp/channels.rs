//! Virtual channel multiplexer.
//!
//! Static virtual channels (clipboard, sound, device redirection…)
//! share the MCS domain with the I/O channel. Payloads of arbitrary
//! length are fragmented into chunks of at most the negotiated size,
//! each behind an 8-byte channel PDU header, and reassembled per
//! channel on the way in.
//!
//! ## Wire format (per chunk)
//! ```text
//! length: u32  little-endian, total payload length across all chunks
//! flags:  u32  little-endian (FIRST/LAST/compression/protocol bits)
//! data:   [u8] at most the negotiated chunk size
//! ```
//!
//! Reassembly is defensive: a FIRST chunk always resets any stale
//! partial buffer (a peer that never sent LAST must not poison the
//! channel), totals are capped, and chunks for unknown channel ids are
//! dropped with a warning rather than killing the connection.

use std::collections::HashMap;

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::read_u32_le;
use crate::error::OcularError;
use crate::rdp::gcc::{ChannelDef, ChannelOptions};

/// Default negotiated chunk size.
pub const CHANNEL_CHUNK_LENGTH: usize = 1600;

/// Upper bound a peer may declare for one reassembled payload.
const MAX_REASSEMBLY: usize = 8 * 1024 * 1024;

bitflags! {
    /// Channel PDU header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelFlags: u32 {
        const FIRST              = 0x0000_0001;
        const LAST               = 0x0000_0002;
        const SHOW_PROTOCOL      = 0x0000_0010;
        const SUSPEND            = 0x0000_0020;
        const RESUME             = 0x0000_0040;
        const SHADOW_PERSISTENT  = 0x0000_0080;
        const PACKET_COMPRESSED  = 0x0020_0000;
        const PACKET_AT_FRONT    = 0x0040_0000;
        const PACKET_FLUSHED     = 0x0080_0000;
    }
}

// ── Channel bookkeeping ──────────────────────────────────────────

struct Reassembly {
    total: usize,
    data: BytesMut,
}

struct ChannelEntry {
    def: ChannelDef,
    id: u16,
    joined: bool,
    consumer: Option<mpsc::UnboundedSender<Bytes>>,
    partial: Option<Reassembly>,
}

// ── ChannelMux ───────────────────────────────────────────────────

/// Owns every negotiated static virtual channel. Consumers hold
/// receivers, never the channels themselves.
pub struct ChannelMux {
    entries: Vec<ChannelEntry>,
    by_id: HashMap<u16, usize>,
    chunk_size: usize,
}

impl ChannelMux {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            by_id: HashMap::new(),
            chunk_size,
        }
    }

    /// Adopt the chunk size granted in the server's virtual-channel
    /// capability.
    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        if chunk_size >= 8 {
            self.chunk_size = chunk_size;
        }
    }

    /// Register a channel definition before connect. Order matters: ids
    /// granted by the server are assigned in registration order.
    pub fn register(&mut self, def: ChannelDef) {
        self.entries.push(ChannelEntry {
            def,
            id: 0,
            joined: false,
            consumer: None,
            partial: None,
        });
    }

    /// The definitions to advertise in the GCC network block.
    pub fn definitions(&self) -> Vec<ChannelDef> {
        self.entries.iter().map(|e| e.def.clone()).collect()
    }

    /// Pair the server-granted id list with the registered definitions.
    pub fn assign_ids(&mut self, ids: &[u16]) -> Result<(), OcularError> {
        if ids.len() < self.entries.len() {
            // Channels beyond the granted list simply do not exist.
            warn!(
                requested = self.entries.len(),
                granted = ids.len(),
                "server granted fewer channels than requested"
            );
        }
        self.by_id.clear();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            entry.id = ids.get(index).copied().unwrap_or_default();
            if entry.id != 0 {
                self.by_id.insert(entry.id, index);
            }
        }
        Ok(())
    }

    /// Every id that needs an MCS channel join.
    pub fn ids(&self) -> Vec<u16> {
        self.entries.iter().map(|e| e.id).filter(|&id| id != 0).collect()
    }

    /// Record a join outcome for one channel id.
    pub fn set_joined(&mut self, id: u16, joined: bool) {
        if let Some(&index) = self.by_id.get(&id) {
            self.entries[index].joined = joined;
            if !joined {
                debug!(channel = %self.entries[index].def.name, "channel unavailable");
            }
        }
    }

    /// Obtain the receiving end of a named channel's payload stream.
    pub fn subscribe(&mut self, name: &str) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        let entry = self.entries.iter_mut().find(|e| e.def.name == name)?;
        let (tx, rx) = mpsc::unbounded_channel();
        entry.consumer = Some(tx);
        Some(rx)
    }

    /// Look up the id a named channel was granted (0 when unjoined).
    pub fn channel_id(&self, name: &str) -> Option<u16> {
        self.entries
            .iter()
            .find(|e| e.def.name == name && e.joined)
            .map(|e| e.id)
    }

    // ── Outbound ─────────────────────────────────────────────────

    /// Fragment `payload` for `channel_id` into ready-to-send channel
    /// PDUs: `ceil(len / chunk_size)` chunks, FIRST on the first, LAST
    /// on the last, the declared total on each header.
    ///
    /// `compressed` marks the chunks as carrying pre-compressed data;
    /// compression itself is a collaborator's job, never this layer's.
    pub fn fragment(
        &self,
        channel_id: u16,
        payload: &[u8],
        compressed: bool,
    ) -> Result<Vec<Bytes>, OcularError> {
        let index = *self
            .by_id
            .get(&channel_id)
            .ok_or(OcularError::ProtocolViolation("send on unknown channel id"))?;
        let entry = &self.entries[index];
        if !entry.joined {
            return Err(OcularError::Channel {
                name: entry.def.name.clone(),
                reason: "channel was not joined",
            });
        }

        let mut base_flags = ChannelFlags::empty();
        if entry.def.options.contains(ChannelOptions::SHOW_PROTOCOL) {
            base_flags |= ChannelFlags::SHOW_PROTOCOL;
        }
        if compressed {
            base_flags |= ChannelFlags::PACKET_COMPRESSED;
        }

        let chunk_count = payload.len().div_ceil(self.chunk_size).max(1);
        let mut pdus = Vec::with_capacity(chunk_count);
        for i in 0..chunk_count {
            let chunk = &payload[i * self.chunk_size..payload.len().min((i + 1) * self.chunk_size)];
            let mut flags = base_flags;
            if i == 0 {
                flags |= ChannelFlags::FIRST;
            }
            if i == chunk_count - 1 {
                flags |= ChannelFlags::LAST;
            }
            let mut buf = BytesMut::with_capacity(8 + chunk.len());
            buf.put_u32_le(payload.len() as u32);
            buf.put_u32_le(flags.bits());
            buf.put_slice(chunk);
            pdus.push(buf.freeze());
        }
        Ok(pdus)
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Feed one inbound channel PDU. Completed payloads are delivered
    /// to the channel's consumer; chunks for unknown ids are dropped.
    pub fn receive(&mut self, channel_id: u16, mut pdu: Bytes) -> Result<(), OcularError> {
        let Some(&index) = self.by_id.get(&channel_id) else {
            warn!(channel_id, "dropping chunk for unknown channel id");
            return Ok(());
        };
        let entry = &mut self.entries[index];

        let total = read_u32_le(&mut pdu, "channel pdu header")? as usize;
        let flags =
            ChannelFlags::from_bits_truncate(read_u32_le(&mut pdu, "channel pdu header")?);

        if total > MAX_REASSEMBLY {
            return Err(OcularError::Channel {
                name: entry.def.name.clone(),
                reason: "declared payload length exceeds the reassembly cap",
            });
        }

        if flags.contains(ChannelFlags::FIRST) {
            // A stale partial buffer means the peer never sent LAST;
            // discard it without delivering.
            if entry.partial.is_some() {
                warn!(channel = %entry.def.name, "discarding stale partial reassembly");
            }
            entry.partial = Some(Reassembly {
                total,
                data: BytesMut::with_capacity(total),
            });
        }

        let overflow = match entry.partial.as_mut() {
            Some(partial) if partial.data.len() + pdu.len() > partial.total => true,
            Some(partial) => {
                partial.data.extend_from_slice(&pdu);
                false
            }
            None => {
                warn!(channel = %entry.def.name, "chunk outside any reassembly; dropped");
                return Ok(());
            }
        };
        if overflow {
            entry.partial = None;
            return Err(OcularError::Channel {
                name: entry.def.name.clone(),
                reason: "chunks exceed the declared total length",
            });
        }

        if flags.contains(ChannelFlags::LAST)
            && let Some(assembled) = entry.partial.take()
        {
            if assembled.data.len() != assembled.total {
                return Err(OcularError::Channel {
                    name: entry.def.name.clone(),
                    reason: "reassembled length does not match the declared total",
                });
            }
            let payload = assembled.data.freeze();
            match &entry.consumer {
                Some(tx) if tx.send(payload).is_ok() => {}
                Some(_) => {
                    warn!(channel = %entry.def.name, "consumer dropped; payload lost");
                    entry.consumer = None;
                }
                None => {
                    warn!(channel = %entry.def.name, "payload with no registered consumer");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mux_with_channel(name: &str) -> ChannelMux {
        let mut mux = ChannelMux::new(CHANNEL_CHUNK_LENGTH);
        mux.register(ChannelDef::new(name, ChannelOptions::INITIALIZED).unwrap());
        mux.assign_ids(&[1004]).unwrap();
        mux.set_joined(1004, true);
        mux
    }

    #[test]
    fn fragment_count_is_ceil() {
        let mux = mux_with_channel("cliprdr");
        for (len, expected) in [
            (0usize, 1usize),
            (1, 1),
            (CHANNEL_CHUNK_LENGTH, 1),
            (CHANNEL_CHUNK_LENGTH + 1, 2),
            (CHANNEL_CHUNK_LENGTH * 3, 3),
            (CHANNEL_CHUNK_LENGTH * 3 + 7, 4),
        ] {
            let payload = vec![0xAB; len];
            let pdus = mux.fragment(1004, &payload, false).unwrap();
            assert_eq!(pdus.len(), expected, "len {len}");
        }
    }

    #[test]
    fn single_chunk_carries_first_and_last() {
        let mux = mux_with_channel("cliprdr");
        let pdus = mux.fragment(1004, b"small", false).unwrap();
        assert_eq!(pdus.len(), 1);
        let flags = u32::from_le_bytes(pdus[0][4..8].try_into().unwrap());
        let flags = ChannelFlags::from_bits_truncate(flags);
        assert!(flags.contains(ChannelFlags::FIRST | ChannelFlags::LAST));
    }

    #[test]
    fn round_trip_reassembly_in_order() {
        let mut mux = mux_with_channel("cliprdr");
        let mut rx = mux.subscribe("cliprdr").unwrap();

        let payload: Vec<u8> = (0..CHANNEL_CHUNK_LENGTH * 2 + 123)
            .map(|i| (i % 251) as u8)
            .collect();
        let pdus = mux.fragment(1004, &payload, false).unwrap();
        assert_eq!(pdus.len(), 3);
        // Total length appears in the first chunk's header.
        assert_eq!(
            u32::from_le_bytes(pdus[0][0..4].try_into().unwrap()) as usize,
            payload.len()
        );

        for pdu in pdus {
            mux.receive(1004, pdu).unwrap();
        }
        let delivered = rx.try_recv().unwrap();
        assert_eq!(&delivered[..], &payload[..]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn first_resets_stale_partial() {
        let mut mux = mux_with_channel("cliprdr");
        let mut rx = mux.subscribe("cliprdr").unwrap();

        let orphan = vec![1u8; CHANNEL_CHUNK_LENGTH * 2];
        let pdus = mux.fragment(1004, &orphan, false).unwrap();
        // Deliver only the FIRST chunk: reassembly left dangling.
        mux.receive(1004, pdus[0].clone()).unwrap();

        // A fresh payload must supersede it and deliver cleanly.
        let fresh = b"fresh payload".to_vec();
        for pdu in mux.fragment(1004, &fresh, false).unwrap() {
            mux.receive(1004, pdu).unwrap();
        }
        let delivered = rx.try_recv().unwrap();
        assert_eq!(&delivered[..], &fresh[..]);
        assert!(rx.try_recv().is_err(), "stale partial must never deliver");
    }

    #[test]
    fn unknown_channel_is_dropped_not_fatal() {
        let mut mux = mux_with_channel("cliprdr");
        let mut pdu = BytesMut::new();
        pdu.put_u32_le(4);
        pdu.put_u32_le((ChannelFlags::FIRST | ChannelFlags::LAST).bits());
        pdu.put_slice(b"data");
        assert!(mux.receive(9999, pdu.freeze()).is_ok());
    }

    #[test]
    fn compressed_flag_marks_chunks() {
        let mux = mux_with_channel("cliprdr");
        let pdus = mux
            .fragment(1004, &vec![0u8; CHANNEL_CHUNK_LENGTH + 1], true)
            .unwrap();
        for pdu in pdus {
            let flags = u32::from_le_bytes(pdu[4..8].try_into().unwrap());
            assert!(ChannelFlags::from_bits_truncate(flags)
                .contains(ChannelFlags::PACKET_COMPRESSED));
        }
    }

    #[test]
    fn oversized_total_is_contained_channel_error() {
        let mut mux = mux_with_channel("cliprdr");
        let mut pdu = BytesMut::new();
        pdu.put_u32_le(u32::MAX);
        pdu.put_u32_le(ChannelFlags::FIRST.bits());
        pdu.put_slice(b"x");
        let err = mux.receive(1004, pdu.freeze()).unwrap_err();
        assert!(matches!(err, OcularError::Channel { .. }));
    }

    #[test]
    fn send_on_unjoined_channel_is_channel_error() {
        let mut mux = ChannelMux::new(CHANNEL_CHUNK_LENGTH);
        mux.register(ChannelDef::new("rdpsnd", ChannelOptions::INITIALIZED).unwrap());
        mux.assign_ids(&[1005]).unwrap();
        mux.set_joined(1005, false);
        let err = mux.fragment(1005, b"x", false).unwrap_err();
        assert!(matches!(err, OcularError::Channel { .. }));
    }

    #[test]
    fn zero_length_payload_round_trips() {
        let mut mux = mux_with_channel("cliprdr");
        let mut rx = mux.subscribe("cliprdr").unwrap();
        for pdu in mux.fragment(1004, b"", false).unwrap() {
            mux.receive(1004, pdu).unwrap();
        }
        let delivered = rx.try_recv().unwrap();
        assert!(delivered.is_empty());
    }
}
