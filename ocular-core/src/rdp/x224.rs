//! X.224 (ISO 8073 class 0) connection layer with the RDP security
//! negotiation extension.
//!
//! The first exchange of every RDP connection: a Connection Request
//! carrying the client's acceptable security protocols, answered by a
//! Connection Confirm carrying either the server's selection or a typed
//! negotiation failure. After the confirm, every slow-path frame rides a
//! 3-byte Data TPDU header.
//!
//! ## Wire format
//!
//! **Connection Request / Confirm**:
//! ```text
//! li:        u8   header length (excluding itself)
//! code:      u8   0xE0 CR / 0xD0 CC
//! dst_ref:   u16  big-endian, 0
//! src_ref:   u16  big-endian, 0
//! class:     u8   0
//! nego:      optional 8-byte negotiation TLV:
//!   type:    u8   1 request / 2 response / 3 failure
//!   flags:   u8
//!   length:  u16  little-endian, always 8
//!   value:   u32  little-endian (protocols, selection, or failure code)
//! ```
//!
//! **Data TPDU**: `[0x02, 0xF0, 0x80]` followed by the payload.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::codec::{read_u8, read_u16_be, read_u16_le, read_u32_le, take_bytes};
use crate::error::{NegotiationFailureCode, OcularError};
use crate::layer::LayerState;

// TPDU codes.
const TPDU_CONNECTION_REQUEST: u8 = 0xE0;
const TPDU_CONNECTION_CONFIRM: u8 = 0xD0;
const TPDU_DATA: u8 = 0xF0;

// Negotiation TLV types.
const TYPE_RDP_NEG_REQ: u8 = 0x01;
const TYPE_RDP_NEG_RSP: u8 = 0x02;
const TYPE_RDP_NEG_FAILURE: u8 = 0x03;

bitflags! {
    /// Security protocols offered in the negotiation request.
    ///
    /// Standard RDP security is the empty set: it is what remains when
    /// no enhanced protocol is offered.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Protocols: u32 {
        const SSL       = 0x0000_0001;
        const HYBRID    = 0x0000_0002;
        const HYBRID_EX = 0x0000_0008;
    }
}

/// The single protocol granted by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedProtocol {
    Rdp,
    Ssl,
    Hybrid,
    HybridEx,
}

impl TryFrom<u32> for SelectedProtocol {
    type Error = OcularError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Rdp),
            0x1 => Ok(Self::Ssl),
            0x2 => Ok(Self::Hybrid),
            0x8 => Ok(Self::HybridEx),
            _ => Err(OcularError::UnknownVariant {
                type_name: "SelectedProtocol",
                value: value as u64,
            }),
        }
    }
}

impl SelectedProtocol {
    /// Whether this selection requires a TLS wrap of the transport.
    pub fn uses_tls(self) -> bool {
        !matches!(self, Self::Rdp)
    }

    /// Whether this selection requires CredSSP before RDP traffic.
    pub fn uses_nla(self) -> bool {
        matches!(self, Self::Hybrid | Self::HybridEx)
    }
}

/// Data TPDU header prefixed to every slow-path frame after the confirm.
const DATA_HEADER: [u8; 3] = [0x02, TPDU_DATA, 0x80];

// ── X224Layer ────────────────────────────────────────────────────

/// The X.224 connection automaton.
#[derive(Debug, Default)]
pub struct X224Layer {
    state: LayerState,
    requested: Protocols,
}

impl X224Layer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LayerState {
        self.state
    }

    /// Build the Connection Request TPDU offering `protocols`.
    pub fn connection_request(&mut self, protocols: Protocols) -> Result<Bytes, OcularError> {
        self.state.begin_connect()?;
        self.requested = protocols;

        let mut buf = BytesMut::with_capacity(14);
        buf.put_u8(6 + 8); // li: fixed part + negotiation TLV
        buf.put_u8(TPDU_CONNECTION_REQUEST);
        buf.put_u16(0); // dst_ref
        buf.put_u16(0); // src_ref
        buf.put_u8(0); // class 0
        buf.put_u8(TYPE_RDP_NEG_REQ);
        buf.put_u8(0); // flags
        buf.put_u16_le(8);
        buf.put_u32_le(protocols.bits());
        Ok(buf.freeze())
    }

    /// Parse the Connection Confirm and return the granted protocol.
    ///
    /// A confirm without a negotiation TLV is a legacy server granting
    /// Standard RDP. A negotiation failure surfaces as a typed
    /// [`OcularError::Negotiation`] carrying the failure code.
    pub fn handle_connection_confirm(
        &mut self,
        mut tpdu: Bytes,
    ) -> Result<SelectedProtocol, OcularError> {
        let li = read_u8(&mut tpdu, "x224 confirm")? as usize;
        let code = read_u8(&mut tpdu, "x224 confirm")?;
        if code != TPDU_CONNECTION_CONFIRM {
            self.state.force_close();
            return Err(OcularError::ProtocolViolation(
                "expected X.224 Connection Confirm",
            ));
        }
        read_u16_be(&mut tpdu, "x224 confirm dst_ref")?;
        read_u16_be(&mut tpdu, "x224 confirm src_ref")?;
        read_u8(&mut tpdu, "x224 confirm class")?;
        // li counts the bytes after itself; anything beyond the fixed
        // part is the negotiation TLV.
        let selected = if li > 6 {
            let nego_type = read_u8(&mut tpdu, "rdp negotiation")?;
            let _flags = read_u8(&mut tpdu, "rdp negotiation")?;
            let length = read_u16_le(&mut tpdu, "rdp negotiation")?;
            if length != 8 {
                self.state.force_close();
                return Err(OcularError::Malformed {
                    context: "rdp negotiation",
                    reason: "TLV length must be 8",
                });
            }
            let value = read_u32_le(&mut tpdu, "rdp negotiation")?;
            match nego_type {
                TYPE_RDP_NEG_RSP => SelectedProtocol::try_from(value)?,
                TYPE_RDP_NEG_FAILURE => {
                    self.state.force_close();
                    return Err(OcularError::Negotiation(NegotiationFailureCode::try_from(
                        value,
                    )?));
                }
                other => {
                    self.state.force_close();
                    return Err(OcularError::UnknownVariant {
                        type_name: "NegotiationType",
                        value: other as u64,
                    });
                }
            }
        } else {
            SelectedProtocol::Rdp
        };

        // A granted protocol we never offered is a violation.
        let offered = match selected {
            SelectedProtocol::Rdp => true,
            SelectedProtocol::Ssl => self.requested.contains(Protocols::SSL),
            SelectedProtocol::Hybrid => self.requested.contains(Protocols::HYBRID),
            SelectedProtocol::HybridEx => self.requested.contains(Protocols::HYBRID_EX),
        };
        if !offered {
            self.state.force_close();
            return Err(OcularError::ProtocolViolation(
                "server granted a protocol that was not offered",
            ));
        }

        self.state.complete_connect()?;
        debug!(?selected, "x224 negotiation complete");
        Ok(selected)
    }

    /// Wrap a payload in a Data TPDU header.
    pub fn wrap_data(&self, payload: &[u8]) -> Result<Bytes, OcularError> {
        self.state.expect_connected("x224 send before connected")?;
        let mut buf = BytesMut::with_capacity(3 + payload.len());
        buf.put_slice(&DATA_HEADER);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    /// Strip a Data TPDU header from an inbound slow-path frame.
    pub fn unwrap_data(&self, mut tpdu: Bytes) -> Result<Bytes, OcularError> {
        self.state.expect_connected("x224 recv before connected")?;
        let header = take_bytes(&mut tpdu, 3, "x224 data header")?;
        if header[1] != TPDU_DATA {
            return Err(OcularError::ProtocolViolation("expected X.224 Data TPDU"));
        }
        Ok(tpdu)
    }

    pub fn close(&mut self) {
        self.state.force_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirm(nego: Option<(u8, u32)>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(if nego.is_some() { 14 } else { 6 });
        buf.put_u8(TPDU_CONNECTION_CONFIRM);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_u8(0);
        if let Some((nego_type, value)) = nego {
            buf.put_u8(nego_type);
            buf.put_u8(0);
            buf.put_u16_le(8);
            buf.put_u32_le(value);
        }
        buf.freeze()
    }

    #[test]
    fn connection_request_wire_shape() {
        let mut layer = X224Layer::new();
        let req = layer.connection_request(Protocols::SSL).unwrap();
        // li, code, refs, class, then the negotiation TLV.
        assert_eq!(
            &req[..],
            &[
                0x0E, 0xE0, 0x00, 0x00, 0x00, 0x00, 0x00, // fixed part
                0x01, 0x00, 0x08, 0x00, // TLV header
                0x01, 0x00, 0x00, 0x00, // PROTOCOL_SSL
            ]
        );
    }

    #[test]
    fn confirm_grants_offered_protocol() {
        let mut layer = X224Layer::new();
        layer
            .connection_request(Protocols::SSL | Protocols::HYBRID)
            .unwrap();
        let selected = layer
            .handle_connection_confirm(confirm(Some((TYPE_RDP_NEG_RSP, 0x2))))
            .unwrap();
        assert_eq!(selected, SelectedProtocol::Hybrid);
        assert!(layer.state().is_connected());
    }

    #[test]
    fn legacy_confirm_selects_standard_rdp() {
        let mut layer = X224Layer::new();
        layer.connection_request(Protocols::empty()).unwrap();
        let selected = layer.handle_connection_confirm(confirm(None)).unwrap();
        assert_eq!(selected, SelectedProtocol::Rdp);
    }

    #[test]
    fn negotiation_failure_is_typed_and_coded() {
        let mut layer = X224Layer::new();
        layer.connection_request(Protocols::SSL).unwrap();
        let err = layer
            .handle_connection_confirm(confirm(Some((TYPE_RDP_NEG_FAILURE, 0x02))))
            .unwrap_err();
        match err {
            OcularError::Negotiation(code) => {
                assert_eq!(code, NegotiationFailureCode::SslNotAllowedByServer);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(layer.state().is_closed());
    }

    #[test]
    fn unoffered_grant_rejected() {
        let mut layer = X224Layer::new();
        layer.connection_request(Protocols::empty()).unwrap();
        let err = layer
            .handle_connection_confirm(confirm(Some((TYPE_RDP_NEG_RSP, 0x1))))
            .unwrap_err();
        assert!(matches!(err, OcularError::ProtocolViolation(_)));
    }

    #[test]
    fn data_wrap_round_trip() {
        let mut layer = X224Layer::new();
        layer.connection_request(Protocols::empty()).unwrap();
        layer.handle_connection_confirm(confirm(None)).unwrap();

        let wrapped = layer.wrap_data(b"payload").unwrap();
        assert_eq!(&wrapped[..3], &DATA_HEADER);
        let unwrapped = layer.unwrap_data(wrapped).unwrap();
        assert_eq!(&unwrapped[..], b"payload");
    }

    #[test]
    fn data_before_connected_is_violation() {
        let layer = X224Layer::new();
        assert!(layer.wrap_data(b"x").is_err());
    }
}
