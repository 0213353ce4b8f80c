//! GCC (T.124) conference-create payloads — RDP's capability
//! negotiation during connect.
//!
//! The client sends core/security/network/cluster data blocks wrapped in
//! a PER conference-create request inside MCS Connect-Initial; the server
//! answers with its own blocks, including the granted channel ids and the
//! random/certificate material the Standard RDP security path needs.
//!
//! Every block starts with a 4-byte user-data header: type `u16` LE,
//! length `u16` LE (header included).

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;
use x509_cert::der::Decode as _;

use crate::codec::{Wire, ensure_len, put_utf16_fixed, read_u16_le, read_u32_le, take_bytes};
use crate::codec::{ber, per};
use crate::error::OcularError;
use crate::observer::Controller;
use crate::rdp::x224::SelectedProtocol;

// Client-to-server block types.
const CS_CORE: u16 = 0xC001;
const CS_SECURITY: u16 = 0xC002;
const CS_NET: u16 = 0xC003;
const CS_CLUSTER: u16 = 0xC004;

// Server-to-client block types.
const SC_CORE: u16 = 0x0C01;
const SC_SECURITY: u16 = 0x0C02;
const SC_NET: u16 = 0x0C03;

/// RDP 5.0+ client version stamp.
const RDP_VERSION_5_PLUS: u32 = 0x0008_0004;

bitflags! {
    /// Virtual-channel option flags (GCC network data).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelOptions: u32 {
        const INITIALIZED        = 0x8000_0000;
        const ENCRYPT_RDP        = 0x4000_0000;
        const ENCRYPT_SC         = 0x2000_0000;
        const ENCRYPT_CS         = 0x1000_0000;
        const PRIORITY_HIGH      = 0x0800_0000;
        const PRIORITY_MEDIUM    = 0x0400_0000;
        const PRIORITY_LOW       = 0x0200_0000;
        const COMPRESS_RDP       = 0x0080_0000;
        const COMPRESS           = 0x0040_0000;
        const SHOW_PROTOCOL      = 0x0020_0000;
    }
}

bitflags! {
    /// Encryption methods offered/granted in the security blocks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EncryptionMethod: u32 {
        const BIT_40  = 0x0000_0001;
        const BIT_128 = 0x0000_0002;
        const BIT_56  = 0x0000_0008;
        const FIPS    = 0x0000_0010;
    }
}

/// Server-dictated encryption level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EncryptionLevel {
    None = 0,
    Low = 1,
    ClientCompatible = 2,
    High = 3,
    Fips = 4,
}

impl TryFrom<u32> for EncryptionLevel {
    type Error = OcularError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Low),
            2 => Ok(Self::ClientCompatible),
            3 => Ok(Self::High),
            4 => Ok(Self::Fips),
            _ => Err(OcularError::UnknownVariant {
                type_name: "EncryptionLevel",
                value: value as u64,
            }),
        }
    }
}

// ── ChannelDef ───────────────────────────────────────────────────

/// A virtual channel requested during connect: a name of at most seven
/// characters and its option flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDef {
    pub name: String,
    pub options: ChannelOptions,
}

impl ChannelDef {
    pub fn new(name: &str, options: ChannelOptions) -> Result<Self, OcularError> {
        if name.len() > 7 || !name.is_ascii() {
            return Err(OcularError::Malformed {
                context: "channel definition",
                reason: "name must be at most 7 ascii characters",
            });
        }
        Ok(Self {
            name: name.to_owned(),
            options,
        })
    }
}

impl Wire for ChannelDef {
    fn size(&self) -> usize {
        12
    }

    fn encode(&self, buf: &mut BytesMut) {
        let mut name = [0u8; 8];
        name[..self.name.len()].copy_from_slice(self.name.as_bytes());
        buf.put_slice(&name);
        buf.put_u32_le(self.options.bits());
    }

    fn decode(buf: &mut Bytes) -> Result<Self, OcularError> {
        let raw = take_bytes(buf, 8, "channel definition")?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(8).min(7);
        let name = std::str::from_utf8(&raw[..end])
            .map_err(|_| OcularError::Malformed {
                context: "channel definition",
                reason: "name is not ascii",
            })?
            .to_owned();
        let options = ChannelOptions::from_bits_truncate(read_u32_le(buf, "channel options")?);
        Ok(Self { name, options })
    }
}

// ── Client blocks ────────────────────────────────────────────────

/// The full client-side conference-create payload.
#[derive(Debug, Clone)]
pub struct ClientGccBlocks {
    pub width: u16,
    pub height: u16,
    pub high_color_depth: u16,
    pub keyboard_layout: u32,
    pub client_name: String,
    pub selected_protocol: SelectedProtocol,
    pub encryption_methods: EncryptionMethod,
    pub channels: Vec<ChannelDef>,
}

impl ClientGccBlocks {
    pub fn from_controller(
        controller: &Controller,
        selected: SelectedProtocol,
        channels: Vec<ChannelDef>,
    ) -> Self {
        Self {
            width: controller.width,
            height: controller.height,
            high_color_depth: match controller.color_depth {
                32 | 24 => 24,
                15 => 15,
                _ => 16,
            },
            keyboard_layout: controller.keyboard_layout,
            client_name: controller.hostname.clone(),
            selected_protocol: selected,
            encryption_methods: EncryptionMethod::BIT_40 | EncryptionMethod::BIT_128,
            channels,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256 + self.channels.len() * 12);
        self.encode_core(&mut buf);
        self.encode_security(&mut buf);
        self.encode_network(&mut buf);
        self.encode_cluster(&mut buf);
        buf.freeze()
    }

    fn encode_core(&self, buf: &mut BytesMut) {
        buf.put_u16_le(CS_CORE);
        buf.put_u16_le(4 + 216);
        buf.put_u32_le(RDP_VERSION_5_PLUS);
        buf.put_u16_le(self.width);
        buf.put_u16_le(self.height);
        buf.put_u16_le(0xCA01); // legacy color depth field
        buf.put_u16_le(0xAA03); // SAS sequence
        buf.put_u32_le(self.keyboard_layout);
        buf.put_u32_le(3790); // client build
        put_utf16_fixed(buf, &self.client_name, 32);
        buf.put_u32_le(4); // keyboard type: IBM enhanced
        buf.put_u32_le(0); // keyboard sub-type
        buf.put_u32_le(12); // function keys
        buf.put_bytes(0, 64); // IME file name
        buf.put_u16_le(0xCA01); // post-beta2 color depth
        buf.put_u16_le(1); // client product id
        buf.put_u32_le(0); // serial number
        buf.put_u16_le(self.high_color_depth);
        buf.put_u16_le(0x0007); // supports 24/16/15 bpp
        buf.put_u16_le(0x0001); // early caps: error-info PDU
        buf.put_bytes(0, 64); // dig product id
        buf.put_u8(0); // connection type
        buf.put_u8(0); // pad
        let proto = match self.selected_protocol {
            SelectedProtocol::Rdp => 0x0,
            SelectedProtocol::Ssl => 0x1,
            SelectedProtocol::Hybrid => 0x2,
            SelectedProtocol::HybridEx => 0x8,
        };
        buf.put_u32_le(proto);
    }

    fn encode_security(&self, buf: &mut BytesMut) {
        buf.put_u16_le(CS_SECURITY);
        buf.put_u16_le(4 + 8);
        buf.put_u32_le(self.encryption_methods.bits());
        buf.put_u32_le(0); // ext encryption methods (French locale)
    }

    fn encode_network(&self, buf: &mut BytesMut) {
        buf.put_u16_le(CS_NET);
        buf.put_u16_le(4 + 4 + self.channels.len() as u16 * 12);
        buf.put_u32_le(self.channels.len() as u32);
        for channel in &self.channels {
            channel.encode(buf);
        }
    }

    fn encode_cluster(&self, buf: &mut BytesMut) {
        buf.put_u16_le(CS_CLUSTER);
        buf.put_u16_le(4 + 8);
        buf.put_u32_le(0x0D); // redirection supported, version 4
        buf.put_u32_le(0); // redirected session id
    }
}

// ── Server blocks ────────────────────────────────────────────────

/// An RSA public key extracted from the server certificate, big-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPublicKey {
    pub modulus: Vec<u8>,
    pub exponent: Vec<u8>,
}

/// Server security data: granted method/level plus the key material the
/// Standard RDP security exchange consumes.
#[derive(Debug, Clone)]
pub struct ServerSecurityData {
    pub method: EncryptionMethod,
    pub level: EncryptionLevel,
    pub server_random: Vec<u8>,
    pub public_key: Option<ServerPublicKey>,
}

/// Server network data: the I/O channel id and the granted channel ids,
/// in the order the client requested them.
#[derive(Debug, Clone, Default)]
pub struct ServerNetworkData {
    pub io_channel: u16,
    pub channel_ids: Vec<u16>,
}

/// All parsed server conference-create blocks.
#[derive(Debug, Clone)]
pub struct ServerGccBlocks {
    pub version: u32,
    pub security: ServerSecurityData,
    pub network: ServerNetworkData,
}

impl ServerGccBlocks {
    /// Parse the server data-block region of a conference-create response.
    pub fn decode(mut buf: Bytes) -> Result<Self, OcularError> {
        let mut version = 0u32;
        let mut security = None;
        let mut network = None;

        while !buf.is_empty() {
            ensure_len(&buf, 4, "server gcc block header")?;
            let block_type = read_u16_le(&mut buf, "server gcc block header")?;
            let block_len = read_u16_le(&mut buf, "server gcc block header")? as usize;
            if block_len < 4 {
                return Err(OcularError::Malformed {
                    context: "server gcc block header",
                    reason: "block length shorter than header",
                });
            }
            let mut body = take_bytes(&mut buf, block_len - 4, "server gcc block body")?;
            match block_type {
                SC_CORE => {
                    version = read_u32_le(&mut body, "server core data")?;
                }
                SC_SECURITY => {
                    security = Some(Self::decode_security(&mut body)?);
                }
                SC_NET => {
                    network = Some(Self::decode_network(&mut body)?);
                }
                other => {
                    debug!(block_type = other, "ignoring unknown server gcc block");
                }
            }
        }

        Ok(Self {
            version,
            security: security.ok_or(OcularError::Malformed {
                context: "conference create response",
                reason: "missing server security data",
            })?,
            network: network.ok_or(OcularError::Malformed {
                context: "conference create response",
                reason: "missing server network data",
            })?,
        })
    }

    fn decode_security(body: &mut Bytes) -> Result<ServerSecurityData, OcularError> {
        let method = EncryptionMethod::from_bits_truncate(read_u32_le(body, "server security")?);
        let level = EncryptionLevel::try_from(read_u32_le(body, "server security")?)?;
        if method.is_empty() && level == EncryptionLevel::None {
            // Enhanced security (TLS/NLA): no RDP-layer key material.
            return Ok(ServerSecurityData {
                method,
                level,
                server_random: Vec::new(),
                public_key: None,
            });
        }
        let random_len = read_u32_le(body, "server security")? as usize;
        let cert_len = read_u32_le(body, "server security")? as usize;
        let server_random = take_bytes(body, random_len, "server random")?.to_vec();
        let mut cert = take_bytes(body, cert_len, "server certificate")?;
        let public_key = Some(decode_server_certificate(&mut cert)?);
        Ok(ServerSecurityData {
            method,
            level,
            server_random,
            public_key,
        })
    }

    fn decode_network(body: &mut Bytes) -> Result<ServerNetworkData, OcularError> {
        let io_channel = read_u16_le(body, "server network")?;
        let count = read_u16_le(body, "server network")? as usize;
        let mut channel_ids = Vec::with_capacity(count);
        for _ in 0..count {
            channel_ids.push(read_u16_le(body, "server channel id")?);
        }
        Ok(ServerNetworkData {
            io_channel,
            channel_ids,
        })
    }
}

// ── Server certificate ───────────────────────────────────────────

const CERT_CHAIN_VERSION_1: u32 = 1; // proprietary
const CERT_CHAIN_VERSION_2: u32 = 2; // X.509 chain
const RSA1_MAGIC: u32 = 0x3141_5352; // "RSA1"
const BB_RSA_KEY_BLOB: u16 = 0x0006;

/// Parse either certificate form down to the RSA public key.
pub fn decode_server_certificate(buf: &mut Bytes) -> Result<ServerPublicKey, OcularError> {
    let version = read_u32_le(buf, "server certificate")? & 0x7FFF_FFFF;
    match version {
        CERT_CHAIN_VERSION_1 => decode_proprietary_certificate(buf),
        CERT_CHAIN_VERSION_2 => decode_x509_chain(buf),
        other => Err(OcularError::UnknownVariant {
            type_name: "ServerCertificateVersion",
            value: other as u64,
        }),
    }
}

fn decode_proprietary_certificate(buf: &mut Bytes) -> Result<ServerPublicKey, OcularError> {
    read_u32_le(buf, "proprietary certificate")?; // signature algorithm
    read_u32_le(buf, "proprietary certificate")?; // key algorithm
    let blob_type = read_u16_le(buf, "proprietary certificate")?;
    if blob_type != BB_RSA_KEY_BLOB {
        return Err(OcularError::Malformed {
            context: "proprietary certificate",
            reason: "expected an RSA public key blob",
        });
    }
    let blob_len = read_u16_le(buf, "proprietary certificate")? as usize;
    let mut blob = take_bytes(buf, blob_len, "rsa public key blob")?;

    if read_u32_le(&mut blob, "rsa public key blob")? != RSA1_MAGIC {
        return Err(OcularError::Malformed {
            context: "rsa public key blob",
            reason: "bad RSA1 magic",
        });
    }
    let key_len = read_u32_le(&mut blob, "rsa public key blob")? as usize;
    read_u32_le(&mut blob, "rsa public key blob")?; // bit length
    read_u32_le(&mut blob, "rsa public key blob")?; // data length
    let exponent = read_u32_le(&mut blob, "rsa public key blob")?;
    if key_len < 8 {
        return Err(OcularError::Malformed {
            context: "rsa public key blob",
            reason: "modulus shorter than its padding",
        });
    }
    // Modulus is little-endian with 8 trailing padding bytes.
    let raw = take_bytes(&mut blob, key_len, "rsa modulus")?;
    let mut modulus: Vec<u8> = raw[..key_len - 8].iter().rev().copied().collect();
    while modulus.first() == Some(&0) && modulus.len() > 1 {
        modulus.remove(0);
    }
    // The trailing signature blob is not verified; the proprietary
    // signature key is public knowledge and proves nothing.
    Ok(ServerPublicKey {
        modulus,
        exponent: exponent.to_be_bytes().to_vec(),
    })
}

fn decode_x509_chain(buf: &mut Bytes) -> Result<ServerPublicKey, OcularError> {
    let count = read_u32_le(buf, "x509 chain")? as usize;
    if count == 0 {
        return Err(OcularError::Malformed {
            context: "x509 chain",
            reason: "empty certificate chain",
        });
    }
    let mut leaf = Bytes::new();
    for _ in 0..count {
        let cert_len = read_u32_le(buf, "x509 chain")? as usize;
        leaf = take_bytes(buf, cert_len, "x509 certificate")?;
    }
    public_key_from_x509(&leaf)
}

/// Extract the RSA public key from a DER certificate (the leaf of a
/// GCC chain, or the TLS peer certificate for the CredSSP binding).
pub fn public_key_from_x509(der: &[u8]) -> Result<ServerPublicKey, OcularError> {
    let cert = x509_cert::Certificate::from_der(der).map_err(|_| OcularError::Malformed {
        context: "x509 certificate",
        reason: "certificate does not parse",
    })?;
    let spki = &cert.tbs_certificate.subject_public_key_info;
    let key_der = spki
        .subject_public_key
        .as_bytes()
        .ok_or(OcularError::Malformed {
            context: "x509 certificate",
            reason: "public key is not byte-aligned",
        })?;
    let (modulus, exponent) = ber::parse_rsa_public_key(key_der)?;
    Ok(ServerPublicKey { modulus, exponent })
}

/// The subjectPublicKey BIT STRING contents of a certificate (the DER
/// `RSAPublicKey`) — the exact bytes the CredSSP public-key binding
/// proof covers.
pub fn subject_public_key_der(der: &[u8]) -> Result<Vec<u8>, OcularError> {
    let cert = x509_cert::Certificate::from_der(der).map_err(|_| OcularError::Malformed {
        context: "x509 certificate",
        reason: "certificate does not parse",
    })?;
    cert.tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .as_bytes()
        .map(|bytes| bytes.to_vec())
        .ok_or(OcularError::Malformed {
            context: "x509 certificate",
            reason: "public key is not byte-aligned",
        })
}

// ── Conference-create wrapper ────────────────────────────────────

/// H.221 keys identifying the embedded client/server data.
const H221_CS_KEY: &[u8] = b"Duca";
const H221_SC_KEY: &[u8] = b"McDn";

/// Wrap client user data in a PER conference-create request.
pub fn conference_create_request(user_data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(user_data.len() + 32);
    per::put_choice(&mut buf, 0); // CHOICE: from Key object
    per::put_object_identifier(&mut buf, &per::T124_IDENTIFIER);
    per::put_length(&mut buf, user_data.len() + 14);
    per::put_choice(&mut buf, 0); // CHOICE: conference-create-request
    per::put_selection(&mut buf, 0x08); // user-data present
    per::put_numeric_string(&mut buf, b"1", 1); // conference name
    per::put_padding(&mut buf, 1);
    per::put_number_of_set(&mut buf, 1);
    per::put_choice(&mut buf, 0xC0); // value present, h221NonStandard
    per::put_octet_string(&mut buf, H221_CS_KEY, 4);
    per::put_octet_string(&mut buf, user_data, 0);
    buf.freeze()
}

/// Unwrap a PER conference-create response down to the server data
/// blocks.
pub fn conference_create_response(mut buf: Bytes) -> Result<Bytes, OcularError> {
    per::read_choice(&mut buf, "conference create response")?;
    per::expect_object_identifier(&mut buf, &per::T124_IDENTIFIER, "conference create response")?;
    per::read_length(&mut buf, "conference create response")?;
    per::read_choice(&mut buf, "conference create response")?;
    per::read_integer16(&mut buf, 1001, "conference create response")?; // node id
    per::read_integer(&mut buf, "conference create response")?; // tag
    per::read_enumerated(&mut buf, "conference create response")?; // result
    per::read_number_of_set(&mut buf, "conference create response")?;
    per::read_choice(&mut buf, "conference create response")?;
    per::expect_octet_string(&mut buf, H221_SC_KEY, 4, "conference create response")?;
    let len = per::read_length(&mut buf, "conference create response")?;
    take_bytes(&mut buf, len, "server gcc data")
}

/// Build the PER body of a conference-create response. Used by the
/// scripted servers in the integration tests.
pub fn encode_conference_create_response(server_data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(server_data.len() + 32);
    per::put_choice(&mut buf, 0);
    per::put_object_identifier(&mut buf, &per::T124_IDENTIFIER);
    per::put_length(&mut buf, server_data.len() + 14);
    per::put_choice(&mut buf, 0x14);
    per::put_integer16(&mut buf, 0x79F3, 1001); // node id
    per::put_integer(&mut buf, 1); // tag
    buf.put_u8(0); // result: success
    per::put_number_of_set(&mut buf, 1);
    per::put_choice(&mut buf, 0xC0);
    per::put_octet_string(&mut buf, H221_SC_KEY, 4);
    per::put_octet_string(&mut buf, server_data, 0);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_channels() -> Vec<ChannelDef> {
        vec![
            ChannelDef::new("cliprdr", ChannelOptions::INITIALIZED | ChannelOptions::COMPRESS_RDP)
                .unwrap(),
            ChannelDef::new("rdpsnd", ChannelOptions::INITIALIZED).unwrap(),
        ]
    }

    #[test]
    fn channel_name_limits() {
        assert!(ChannelDef::new("cliprdr", ChannelOptions::empty()).is_ok());
        assert!(ChannelDef::new("toolongname", ChannelOptions::empty()).is_err());
    }

    #[test]
    fn channel_def_round_trip() {
        for def in sample_channels() {
            let mut buf = BytesMut::new();
            def.encode(&mut buf);
            assert_eq!(buf.len(), 12);
            let mut bytes = buf.freeze();
            assert_eq!(ChannelDef::decode(&mut bytes).unwrap(), def);
        }
    }

    #[test]
    fn client_blocks_sizes() {
        let controller = Controller::default();
        let blocks =
            ClientGccBlocks::from_controller(&controller, SelectedProtocol::Rdp, sample_channels());
        let encoded = blocks.encode();
        // core 220 + security 12 + network (8 + 2*12) + cluster 12
        assert_eq!(encoded.len(), 220 + 12 + 32 + 12);
        assert_eq!(&encoded[..2], &CS_CORE.to_le_bytes());
        assert_eq!(&encoded[2..4], &220u16.to_le_bytes());
    }

    fn proprietary_cert(modulus_be: &[u8], exponent: u32) -> Vec<u8> {
        let key_len = modulus_be.len() + 8;
        let mut blob = BytesMut::new();
        blob.put_u32_le(RSA1_MAGIC);
        blob.put_u32_le(key_len as u32);
        blob.put_u32_le((modulus_be.len() * 8) as u32);
        blob.put_u32_le(modulus_be.len() as u32 - 1);
        blob.put_u32_le(exponent);
        let le: Vec<u8> = modulus_be.iter().rev().copied().collect();
        blob.put_slice(&le);
        blob.put_bytes(0, 8);

        let mut cert = BytesMut::new();
        cert.put_u32_le(CERT_CHAIN_VERSION_1);
        cert.put_u32_le(1);
        cert.put_u32_le(1);
        cert.put_u16_le(BB_RSA_KEY_BLOB);
        cert.put_u16_le(blob.len() as u16);
        cert.put_slice(&blob);
        cert.put_u16_le(0x0008);
        cert.put_u16_le(4);
        cert.put_bytes(0, 4); // signature, unverified
        cert.to_vec()
    }

    #[test]
    fn proprietary_certificate_extracts_public_key() {
        let modulus = [0xC9u8, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77];
        let mut bytes = Bytes::from(proprietary_cert(&modulus, 0x10001));
        let key = decode_server_certificate(&mut bytes).unwrap();
        assert_eq!(key.modulus, modulus);
        assert_eq!(key.exponent, 0x10001u32.to_be_bytes());
    }

    #[test]
    fn server_blocks_parse() {
        let modulus = [0xB7u8; 64];
        let cert = proprietary_cert(&modulus, 0x10001);
        let mut data = BytesMut::new();
        // core
        data.put_u16_le(SC_CORE);
        data.put_u16_le(8);
        data.put_u32_le(RDP_VERSION_5_PLUS);
        // security
        let random = [0x5Au8; 32];
        data.put_u16_le(SC_SECURITY);
        data.put_u16_le((4 + 16 + random.len() + cert.len()) as u16);
        data.put_u32_le(EncryptionMethod::BIT_128.bits());
        data.put_u32_le(EncryptionLevel::ClientCompatible as u32);
        data.put_u32_le(random.len() as u32);
        data.put_u32_le(cert.len() as u32);
        data.put_slice(&random);
        data.put_slice(&cert);
        // network
        data.put_u16_le(SC_NET);
        data.put_u16_le(4 + 4 + 4);
        data.put_u16_le(1003);
        data.put_u16_le(2);
        data.put_u16_le(1004);
        data.put_u16_le(1005);

        let blocks = ServerGccBlocks::decode(data.freeze()).unwrap();
        assert_eq!(blocks.version, RDP_VERSION_5_PLUS);
        assert_eq!(blocks.security.method, EncryptionMethod::BIT_128);
        assert_eq!(blocks.security.level, EncryptionLevel::ClientCompatible);
        assert_eq!(blocks.security.server_random, random);
        assert_eq!(blocks.network.io_channel, 1003);
        assert_eq!(blocks.network.channel_ids, vec![1004, 1005]);
    }

    #[test]
    fn enhanced_security_block_has_no_key_material() {
        let mut data = BytesMut::new();
        data.put_u16_le(SC_CORE);
        data.put_u16_le(8);
        data.put_u32_le(RDP_VERSION_5_PLUS);
        data.put_u16_le(SC_SECURITY);
        data.put_u16_le(12);
        data.put_u32_le(0);
        data.put_u32_le(0);
        data.put_u16_le(SC_NET);
        data.put_u16_le(8);
        data.put_u16_le(1003);
        data.put_u16_le(0);

        let blocks = ServerGccBlocks::decode(data.freeze()).unwrap();
        assert!(blocks.security.public_key.is_none());
        assert!(blocks.security.server_random.is_empty());
    }

    #[test]
    fn conference_wrapper_round_trip() {
        let payload = b"server-settings-bytes";
        let wrapped = encode_conference_create_response(payload);
        let unwrapped = conference_create_response(wrapped).unwrap();
        assert_eq!(&unwrapped[..], payload);
    }

    #[test]
    fn truncated_server_block_rejected() {
        let mut data = BytesMut::new();
        data.put_u16_le(SC_CORE);
        data.put_u16_le(20); // claims more than available
        data.put_u32_le(RDP_VERSION_5_PLUS);
        assert!(ServerGccBlocks::decode(data.freeze()).is_err());
    }
}
