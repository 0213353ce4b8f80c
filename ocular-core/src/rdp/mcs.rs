//! MCS (T.125) — the multiplexed-channel domain RDP rides on.
//!
//! BER-encoded Connect-Initial/Connect-Response carry the GCC blocks;
//! the subsequent domain PDUs (erect domain, attach user, channel join,
//! send data) use the compact PER forms. After the join sequence, every
//! slow-path PDU is a Send Data Request/Indication tagged with a channel
//! id, which is what makes virtual channels possible.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::codec::{read_u8, read_u16_be, take_bytes};
use crate::codec::{ber, per};
use crate::error::OcularError;
use crate::layer::LayerState;

/// The broadcast/I-O channel every RDP session joins.
pub const GLOBAL_CHANNEL: u16 = 1003;
/// User ids are biased by this base in the PER forms.
pub const USER_CHANNEL_BASE: u16 = 1001;

// Domain PDU opcodes (choice number; wire byte is `choice << 2`).
const ERECT_DOMAIN_REQUEST: u8 = 1;
const DISCONNECT_PROVIDER_ULTIMATUM: u8 = 8;
const ATTACH_USER_REQUEST: u8 = 10;
const ATTACH_USER_CONFIRM: u8 = 11;
const CHANNEL_JOIN_REQUEST: u8 = 14;
const CHANNEL_JOIN_CONFIRM: u8 = 15;
const SEND_DATA_REQUEST: u8 = 25;
const SEND_DATA_INDICATION: u8 = 26;

// ── Events ───────────────────────────────────────────────────────

/// An inbound domain PDU after the join sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McsEvent {
    /// Payload addressed to one channel.
    Data { channel: u16, payload: Bytes },
    /// The server tore the domain down.
    Disconnected { reason: u8 },
}

/// Result of one channel-join round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelJoinOutcome {
    /// The channel id the join was for.
    pub channel: u16,
    /// Whether the server admitted us.
    pub joined: bool,
}

// ── Domain parameters ────────────────────────────────────────────

/// T.125 domain parameter set. Only the PDU size matters in practice;
/// the rest are fixed by every deployed implementation.
#[derive(Debug, Clone, Copy)]
struct DomainParameters {
    max_channels: u32,
    max_users: u32,
    max_tokens: u32,
    max_pdu_size: u32,
}

impl DomainParameters {
    fn body_size(&self) -> usize {
        ber::integer_size(self.max_channels)
            + ber::integer_size(self.max_users)
            + ber::integer_size(self.max_tokens)
            + ber::integer_size(1)
            + ber::integer_size(0)
            + ber::integer_size(1)
            + ber::integer_size(self.max_pdu_size)
            + ber::integer_size(2)
    }

    fn encode(&self, buf: &mut BytesMut) {
        let body = self.body_size();
        buf.put_u8(ber::TAG_SEQUENCE);
        ber::put_length(buf, body);
        ber::put_integer(buf, self.max_channels);
        ber::put_integer(buf, self.max_users);
        ber::put_integer(buf, self.max_tokens);
        ber::put_integer(buf, 1); // priorities
        ber::put_integer(buf, 0); // min throughput
        ber::put_integer(buf, 1); // max height
        ber::put_integer(buf, self.max_pdu_size);
        ber::put_integer(buf, 2); // protocol version
    }

    fn size(&self) -> usize {
        let body = self.body_size();
        1 + ber::length_size(body) + body
    }
}

const TARGET_PARAMETERS: DomainParameters = DomainParameters {
    max_channels: 34,
    max_users: 2,
    max_tokens: 0,
    max_pdu_size: 0xFFFF,
};
const MINIMUM_PARAMETERS: DomainParameters = DomainParameters {
    max_channels: 1,
    max_users: 1,
    max_tokens: 1,
    max_pdu_size: 0x420,
};
const MAXIMUM_PARAMETERS: DomainParameters = DomainParameters {
    max_channels: 0xFFFF,
    max_users: 0xFC17,
    max_tokens: 0xFFFF,
    max_pdu_size: 0xFFFF,
};

// ── McsLayer ─────────────────────────────────────────────────────

/// The MCS connection automaton. Owns the user id granted by Attach
/// User; channel bookkeeping lives in the multiplexer above.
#[derive(Debug, Default)]
pub struct McsLayer {
    state: LayerState,
    user_id: u16,
}

impl McsLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LayerState {
        self.state
    }

    pub fn user_id(&self) -> u16 {
        self.user_id
    }

    /// The user's own channel id (user id biased into channel space).
    pub fn user_channel(&self) -> u16 {
        self.user_id + USER_CHANNEL_BASE
    }

    /// Build the BER Connect-Initial wrapping `gcc_data`.
    pub fn connect_initial(&mut self, gcc_data: &[u8]) -> Result<Bytes, OcularError> {
        self.state.begin_connect()?;

        let selector_size = ber::octet_string_size(1);
        let body_len = selector_size * 2
            + 3 // BOOLEAN upward flag
            + TARGET_PARAMETERS.size()
            + MINIMUM_PARAMETERS.size()
            + MAXIMUM_PARAMETERS.size()
            + ber::octet_string_size(gcc_data.len());

        let mut buf = BytesMut::with_capacity(body_len + 8);
        ber::put_application_tag(&mut buf, 101, body_len);
        ber::put_octet_string(&mut buf, &[0x01]); // calling domain selector
        ber::put_octet_string(&mut buf, &[0x01]); // called domain selector
        ber::put_boolean(&mut buf, true); // upward flag
        TARGET_PARAMETERS.encode(&mut buf);
        MINIMUM_PARAMETERS.encode(&mut buf);
        MAXIMUM_PARAMETERS.encode(&mut buf);
        ber::put_octet_string(&mut buf, gcc_data);
        Ok(buf.freeze())
    }

    /// Parse the Connect-Response, returning the server's GCC payload.
    pub fn handle_connect_response(&mut self, mut pdu: Bytes) -> Result<Bytes, OcularError> {
        ber::read_application_tag(&mut pdu, 102, "mcs connect response")?;
        let result = ber::read_enumerated(&mut pdu, "mcs connect result")?;
        if result != 0 {
            self.state.force_close();
            return Err(OcularError::ProtocolViolation("mcs connect rejected"));
        }
        ber::read_integer(&mut pdu, "mcs called connect id")?;
        let params_len = ber::read_tag(&mut pdu, ber::TAG_SEQUENCE, "mcs domain parameters")?;
        take_bytes(&mut pdu, params_len, "mcs domain parameters")?;
        let user_data = ber::read_octet_string(&mut pdu, "mcs user data")?;
        debug!(len = user_data.len(), "mcs connect response accepted");
        Ok(user_data)
    }

    /// Erect Domain Request — fixed two zero parameters.
    pub fn erect_domain_request(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(ERECT_DOMAIN_REQUEST << 2);
        per::put_integer(&mut buf, 0); // sub-height
        per::put_integer(&mut buf, 0); // sub-interval
        buf.freeze()
    }

    pub fn attach_user_request(&self) -> Bytes {
        Bytes::from_static(&[ATTACH_USER_REQUEST << 2])
    }

    /// Parse Attach User Confirm and record the granted user id.
    pub fn handle_attach_user_confirm(&mut self, mut pdu: Bytes) -> Result<u16, OcularError> {
        let opcode = read_u8(&mut pdu, "mcs attach user confirm")?;
        if opcode >> 2 != ATTACH_USER_CONFIRM {
            return Err(OcularError::ProtocolViolation(
                "expected MCS Attach User Confirm",
            ));
        }
        let result = per::read_enumerated(&mut pdu, "mcs attach user result")?;
        if result != 0 {
            self.state.force_close();
            return Err(OcularError::ProtocolViolation("mcs attach user rejected"));
        }
        if opcode & 0x02 == 0 {
            return Err(OcularError::Malformed {
                context: "mcs attach user confirm",
                reason: "missing initiator field",
            });
        }
        self.user_id = per::read_integer16(&mut pdu, USER_CHANNEL_BASE, "mcs user id")?
            - USER_CHANNEL_BASE;
        Ok(self.user_id)
    }

    pub fn channel_join_request(&self, channel: u16) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(CHANNEL_JOIN_REQUEST << 2);
        per::put_integer16(&mut buf, self.user_id + USER_CHANNEL_BASE, USER_CHANNEL_BASE);
        buf.put_u16(channel);
        buf.freeze()
    }

    /// Parse Channel Join Confirm. A refusal is reported, not raised —
    /// the caller decides whether the channel was essential.
    pub fn handle_channel_join_confirm(
        &self,
        mut pdu: Bytes,
    ) -> Result<ChannelJoinOutcome, OcularError> {
        let opcode = read_u8(&mut pdu, "mcs channel join confirm")?;
        if opcode >> 2 != CHANNEL_JOIN_CONFIRM {
            return Err(OcularError::ProtocolViolation(
                "expected MCS Channel Join Confirm",
            ));
        }
        let result = per::read_enumerated(&mut pdu, "mcs channel join result")?;
        per::read_integer16(&mut pdu, USER_CHANNEL_BASE, "mcs join initiator")?;
        let requested = read_u16_be(&mut pdu, "mcs join requested channel")?;
        let joined = result == 0 && opcode & 0x02 != 0;
        if joined {
            read_u16_be(&mut pdu, "mcs join granted channel")?;
        } else {
            warn!(channel = requested, result, "mcs channel join refused");
        }
        Ok(ChannelJoinOutcome {
            channel: requested,
            joined,
        })
    }

    /// Mark the join sequence complete; data may now flow.
    pub fn joins_complete(&mut self) -> Result<(), OcularError> {
        self.state.complete_connect()
    }

    /// Wrap a payload in a Send Data Request on `channel`.
    pub fn send_data_request(&self, channel: u16, payload: &[u8]) -> Result<Bytes, OcularError> {
        self.state.expect_connected("mcs send before joined")?;
        let mut buf = BytesMut::with_capacity(payload.len() + 8);
        buf.put_u8(SEND_DATA_REQUEST << 2);
        per::put_integer16(&mut buf, self.user_id + USER_CHANNEL_BASE, USER_CHANNEL_BASE);
        buf.put_u16(channel);
        buf.put_u8(0x70); // priority high, complete segmentation
        per::put_length(&mut buf, payload.len());
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    /// Classify an inbound domain PDU after the join sequence.
    pub fn handle_data(&mut self, mut pdu: Bytes) -> Result<McsEvent, OcularError> {
        let opcode = read_u8(&mut pdu, "mcs domain pdu")?;
        match opcode >> 2 {
            SEND_DATA_INDICATION => {
                per::read_integer16(&mut pdu, USER_CHANNEL_BASE, "mcs data initiator")?;
                let channel = read_u16_be(&mut pdu, "mcs data channel")?;
                read_u8(&mut pdu, "mcs data flags")?;
                let len = per::read_length(&mut pdu, "mcs data length")?;
                let payload = take_bytes(&mut pdu, len, "mcs data payload")?;
                Ok(McsEvent::Data { channel, payload })
            }
            DISCONNECT_PROVIDER_ULTIMATUM => {
                // Reason is a 3-bit field straddling the opcode byte.
                let reason = (opcode & 0x01) << 2
                    | pdu.first().map(|b| *b >> 6).unwrap_or_default();
                self.state.force_close();
                Ok(McsEvent::Disconnected { reason })
            }
            other => Err(OcularError::UnknownVariant {
                type_name: "McsDomainPdu",
                value: other as u64,
            }),
        }
    }

    pub fn close(&mut self) {
        self.state.force_close();
    }
}

/// Build a Send Data Indication — the server-side mirror of
/// [`McsLayer::send_data_request`], used by the scripted test servers.
pub fn encode_send_data_indication(initiator: u16, channel: u16, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 8);
    buf.put_u8(SEND_DATA_INDICATION << 2);
    per::put_integer16(&mut buf, initiator + USER_CHANNEL_BASE, USER_CHANNEL_BASE);
    buf.put_u16(channel);
    buf.put_u8(0x70);
    per::put_length(&mut buf, payload.len());
    buf.put_slice(payload);
    buf.freeze()
}

/// Build a Connect-Response, Attach User Confirm, or Channel Join
/// Confirm for the scripted test servers.
#[doc(hidden)]
pub mod testing {
    use super::*;

    pub fn connect_response(gcc_data: &[u8]) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u8(ber::TAG_ENUMERATED);
        ber::put_length(&mut body, 1);
        body.put_u8(0); // rt-successful
        ber::put_integer(&mut body, 0);
        TARGET_PARAMETERS.encode(&mut body);
        ber::put_octet_string(&mut body, gcc_data);

        let mut buf = BytesMut::with_capacity(body.len() + 8);
        ber::put_application_tag(&mut buf, 102, body.len());
        buf.put_slice(&body);
        buf.freeze()
    }

    pub fn attach_user_confirm(user_id: u16) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(ATTACH_USER_CONFIRM << 2 | 0x02);
        buf.put_u8(0); // result: successful
        per::put_integer16(&mut buf, user_id + USER_CHANNEL_BASE, USER_CHANNEL_BASE);
        buf.freeze()
    }

    pub fn channel_join_confirm(user_id: u16, channel: u16, success: bool) -> Bytes {
        let mut buf = BytesMut::new();
        if success {
            buf.put_u8(CHANNEL_JOIN_CONFIRM << 2 | 0x02);
            buf.put_u8(0);
        } else {
            buf.put_u8(CHANNEL_JOIN_CONFIRM << 2);
            buf.put_u8(1); // rt-domain-not-hierarchical, any nonzero refusal
        }
        per::put_integer16(&mut buf, user_id + USER_CHANNEL_BASE, USER_CHANNEL_BASE);
        buf.put_u16(channel);
        if success {
            buf.put_u16(channel);
        }
        buf.freeze()
    }

    pub fn disconnect_provider_ultimatum() -> Bytes {
        // reason: rn-provider-initiated (1) spread over the two bytes.
        Bytes::from_static(&[DISCONNECT_PROVIDER_ULTIMATUM << 2, 0x40])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_round_trip_carries_gcc_payload() {
        let mut client = McsLayer::new();
        let initial = client.connect_initial(b"client-gcc").unwrap();
        // Self-describing: application tag 101, then BER fields.
        assert_eq!(&initial[..2], &[0x7F, 101]);

        let response = testing::connect_response(b"server-gcc");
        let user_data = client.handle_connect_response(response).unwrap();
        assert_eq!(&user_data[..], b"server-gcc");
    }

    #[test]
    fn attach_user_confirm_yields_user_id() {
        let mut client = McsLayer::new();
        client.state.begin_connect().unwrap();
        let confirm = testing::attach_user_confirm(7);
        assert_eq!(client.handle_attach_user_confirm(confirm).unwrap(), 7);
        assert_eq!(client.user_channel(), 1008);
    }

    #[test]
    fn channel_join_refusal_is_soft() {
        let mut client = McsLayer::new();
        client.state.begin_connect().unwrap();
        client
            .handle_attach_user_confirm(testing::attach_user_confirm(3))
            .unwrap();

        let ok = client
            .handle_channel_join_confirm(testing::channel_join_confirm(3, GLOBAL_CHANNEL, true))
            .unwrap();
        assert!(ok.joined);
        assert_eq!(ok.channel, GLOBAL_CHANNEL);

        let refused = client
            .handle_channel_join_confirm(testing::channel_join_confirm(3, 1004, false))
            .unwrap();
        assert!(!refused.joined);
        assert_eq!(refused.channel, 1004);
    }

    #[test]
    fn data_round_trip() {
        let mut client = McsLayer::new();
        client.state.begin_connect().unwrap();
        client
            .handle_attach_user_confirm(testing::attach_user_confirm(2))
            .unwrap();
        client.joins_complete().unwrap();

        let request = client.send_data_request(GLOBAL_CHANNEL, b"payload").unwrap();
        assert_eq!(request[0], SEND_DATA_REQUEST << 2);

        let indication = encode_send_data_indication(1002, GLOBAL_CHANNEL, b"reply");
        match client.handle_data(indication).unwrap() {
            McsEvent::Data { channel, payload } => {
                assert_eq!(channel, GLOBAL_CHANNEL);
                assert_eq!(&payload[..], b"reply");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn send_before_joined_is_violation() {
        let client = McsLayer::new();
        assert!(client.send_data_request(GLOBAL_CHANNEL, b"x").is_err());
    }

    #[test]
    fn ultimatum_closes_layer() {
        let mut client = McsLayer::new();
        client.state.begin_connect().unwrap();
        client.state.complete_connect().unwrap();
        match client
            .handle_data(testing::disconnect_provider_ultimatum())
            .unwrap()
        {
            McsEvent::Disconnected { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(client.state().is_closed());
    }

    #[test]
    fn large_payload_uses_long_per_length() {
        let mut client = McsLayer::new();
        client.state.begin_connect().unwrap();
        client.state.complete_connect().unwrap();
        let payload = vec![0u8; 0x400];
        let pdu = client.send_data_request(GLOBAL_CHANNEL, &payload).unwrap();
        // opcode + initiator(2) + channel(2) + flags + 2-byte length
        assert_eq!(pdu.len(), 8 + payload.len());
    }
}
