//! RDP security layer.
//!
//! Executes whichever of the three negotiated paths applies:
//!
//! - **Standard RDP**: security exchange (client random encrypted to the
//!   server's certificate key), the MS-RDPBCGR 5.3.5 key-derivation
//!   schedule, then per-PDU RC4 with an 8-byte MAC signature. Keys are
//!   refreshed every 4096 protected PDUs.
//! - **TLS / NLA**: the stream itself is already encrypted; this layer
//!   only frames the info/license handshake PDUs and passes session data
//!   through untouched.
//!
//! Inbound protected PDUs are decrypted and their MAC verified against
//! the recovered plaintext; a mismatch is a fatal security error — it
//! means corruption or an active attacker, and is never retried.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest as _, Md5};
use num_bigint::BigUint;
use rand::RngCore;
use rc4::consts::{U8, U16};
use rc4::{KeyInit, Rc4, StreamCipher};
use sha1::Sha1;
use tracing::{debug, warn};

use crate::codec::{read_u16_le, take_bytes, utf16_z};
use crate::error::OcularError;
use crate::observer::Controller;
use crate::rdp::gcc::{EncryptionLevel, EncryptionMethod, ServerPublicKey};

bitflags! {
    /// Flags of the 4-byte security header (low 16 bits; the high half
    /// is reserved).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SecurityFlags: u16 {
        const EXCHANGE_PKT    = 0x0001;
        const ENCRYPT         = 0x0008;
        const RESET_SEQNO     = 0x0010;
        const IGNORE_SEQNO    = 0x0020;
        const INFO_PKT        = 0x0040;
        const LICENSE_PKT     = 0x0080;
        const LICENSE_ENCRYPT = 0x0200;
        const REDIRECTION_PKT = 0x0400;
        const SECURE_CHECKSUM = 0x0800;
    }
}

bitflags! {
    /// Info-packet flags for the client info PDU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InfoFlags: u32 {
        const MOUSE              = 0x0000_0001;
        const DISABLE_CTRL_ALT_DEL = 0x0000_0002;
        const AUTOLOGON          = 0x0000_0008;
        const UNICODE            = 0x0000_0010;
        const MAXIMIZE_SHELL     = 0x0000_0020;
        const LOGON_NOTIFY       = 0x0000_0040;
        const ENABLE_WINDOWS_KEY = 0x0000_0100;
        const LOGON_ERRORS       = 0x0010_0000;
    }
}

/// PDUs between which the RC4 states are refreshed.
const REKEY_INTERVAL: u64 = 4096;

const PAD_54: [u8; 40] = [0x36; 40];
const PAD_92: [u8; 48] = [0x5C; 48];

// ── Hash primitives ──────────────────────────────────────────────

fn sha1_of(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn md5_of(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// `SaltedHash(S, I) = MD5(I + SHA1(S + I + ClientRandom + ServerRandom))`
fn salted_hash(salt: &[u8], input: &[u8], client_random: &[u8], server_random: &[u8]) -> [u8; 16] {
    let sha = sha1_of(&[salt, input, client_random, server_random]);
    md5_of(&[input, &sha])
}

/// Three salted hashes concatenated — used for both the master secret
/// and the session key blob.
fn expand_48(
    salts: [&[u8]; 3],
    input: &[u8],
    client_random: &[u8],
    server_random: &[u8],
) -> [u8; 48] {
    let mut out = [0u8; 48];
    for (i, salt) in salts.into_iter().enumerate() {
        out[i * 16..(i + 1) * 16]
            .copy_from_slice(&salted_hash(salt, input, client_random, server_random));
    }
    out
}

/// `FinalHash(K) = MD5(K + ClientRandom + ServerRandom)`
pub(crate) fn final_hash(key: &[u8], client_random: &[u8], server_random: &[u8]) -> [u8; 16] {
    md5_of(&[key, client_random, server_random])
}

/// The `"A"/"BB"/"CCC"` 48-byte expansion shared with the licensing key
/// schedule (which calls it twice, the second time with the randoms
/// swapped).
pub(crate) fn master_secret(input: &[u8], random1: &[u8], random2: &[u8]) -> [u8; 48] {
    expand_48([b"A", b"BB", b"CCC"], input, random1, random2)
}

/// Full-width (16-byte) MAC used by the licensing exchange.
pub(crate) fn license_mac(mac_salt: &[u8], data: &[u8]) -> [u8; 16] {
    let len = (data.len() as u32).to_le_bytes();
    let sha = sha1_of(&[mac_salt, &PAD_54, &len, data]);
    md5_of(&[mac_salt, &PAD_92, &sha])
}

/// RC4 a buffer in place under a licensing key.
pub(crate) fn rc4_apply(key: &[u8], data: &mut [u8]) {
    Rc4Stream::new(key).apply(data);
}

/// Reduce a 128-bit key to the negotiated strength, salting the
/// well-known export prefix in for 40/56-bit sessions.
fn reduce_key(key128: [u8; 16], method: EncryptionMethod) -> Vec<u8> {
    if method == EncryptionMethod::BIT_40 {
        let mut key = key128[..8].to_vec();
        key[0] = 0xD1;
        key[1] = 0x26;
        key[2] = 0x9E;
        key
    } else if method == EncryptionMethod::BIT_56 {
        let mut key = key128[..8].to_vec();
        key[0] = 0xD1;
        key
    } else {
        key128.to_vec()
    }
}

// ── Session keys ─────────────────────────────────────────────────

/// The derived key material for one Standard RDP session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub mac_key: Vec<u8>,
    /// Client-to-server RC4 key.
    pub encrypt_key: Vec<u8>,
    /// Server-to-client RC4 key.
    pub decrypt_key: Vec<u8>,
}

/// Run the full MS-RDPBCGR 5.3.5 schedule.
pub fn derive_session_keys(
    client_random: &[u8; 32],
    server_random: &[u8],
    method: EncryptionMethod,
) -> SessionKeys {
    let mut pre_master = [0u8; 48];
    pre_master[..24].copy_from_slice(&client_random[..24]);
    pre_master[24..].copy_from_slice(&server_random[..24]);

    let master = expand_48(
        [b"A", b"BB", b"CCC"],
        &pre_master,
        client_random,
        server_random,
    );
    let blob = expand_48([b"X", b"YY", b"ZZZ"], &master, client_random, server_random);

    let mac_key128: [u8; 16] = blob[..16].try_into().unwrap();
    let decrypt128 = final_hash(&blob[16..32], client_random, server_random);
    let encrypt128 = final_hash(&blob[32..48], client_random, server_random);

    SessionKeys {
        mac_key: reduce_key(mac_key128, method),
        encrypt_key: reduce_key(encrypt128, method),
        decrypt_key: reduce_key(decrypt128, method),
    }
}

/// `MACData` over a plaintext payload.
pub fn mac_data(mac_key: &[u8], data: &[u8]) -> [u8; 8] {
    let len = (data.len() as u32).to_le_bytes();
    let sha = sha1_of(&[mac_key, &PAD_54, &len, data]);
    let md5 = md5_of(&[mac_key, &PAD_92, &sha]);
    md5[..8].try_into().unwrap()
}

/// Salted `MACData` — the secure-checksum variant mixes the running
/// encryption count into the inner hash.
pub fn mac_salted_data(mac_key: &[u8], data: &[u8], count: u32) -> [u8; 8] {
    let len = (data.len() as u32).to_le_bytes();
    let count = count.to_le_bytes();
    let sha = sha1_of(&[mac_key, &PAD_54, &len, data, &count]);
    let md5 = md5_of(&[mac_key, &PAD_92, &sha]);
    md5[..8].try_into().unwrap()
}

/// MS-RDPBCGR 5.3.7 session-key refresh.
fn update_key(initial: &[u8], current: &[u8], method: EncryptionMethod) -> Vec<u8> {
    let sha = sha1_of(&[initial, &PAD_54, current]);
    let temp = md5_of(&[initial, &PAD_92, &sha]);
    let mut key = reduce_key(temp, method);
    let mut rc4 = Rc4Stream::new(&key);
    rc4.apply(&mut key);
    if method == EncryptionMethod::BIT_40 {
        key[0] = 0xD1;
        key[1] = 0x26;
        key[2] = 0x9E;
    } else if method == EncryptionMethod::BIT_56 {
        key[0] = 0xD1;
    }
    key
}

// ── RC4 wrapper ──────────────────────────────────────────────────

/// RC4 keystream over either key width the protocols use.
pub(crate) enum Rc4Stream {
    Export(Rc4<U8>),
    Full(Rc4<U16>),
}

impl Rc4Stream {
    pub(crate) fn new(key: &[u8]) -> Self {
        match key.len() {
            8 => Self::Export(Rc4::new_from_slice(key).expect("8-byte rc4 key")),
            _ => Self::Full(Rc4::new_from_slice(key).expect("16-byte rc4 key")),
        }
    }

    pub(crate) fn apply(&mut self, data: &mut [u8]) {
        match self {
            Self::Export(rc4) => rc4.apply_keystream(data),
            Self::Full(rc4) => rc4.apply_keystream(data),
        }
    }
}

/// One direction of the protected stream: current RC4 state plus the
/// bookkeeping the rekey schedule needs.
struct CipherDirection {
    initial_key: Vec<u8>,
    current_key: Vec<u8>,
    rc4: Rc4Stream,
    /// PDUs protected under the current key.
    used: u64,
    method: EncryptionMethod,
}

impl CipherDirection {
    fn new(key: Vec<u8>, method: EncryptionMethod) -> Self {
        Self {
            rc4: Rc4Stream::new(&key),
            initial_key: key.clone(),
            current_key: key,
            used: 0,
            method,
        }
    }

    fn apply(&mut self, data: &mut [u8]) {
        if self.used == REKEY_INTERVAL {
            self.current_key = update_key(&self.initial_key, &self.current_key, self.method);
            self.rc4 = Rc4Stream::new(&self.current_key);
            self.used = 0;
            debug!("rc4 session key refreshed");
        }
        self.rc4.apply(data);
        self.used += 1;
    }
}

// ── Security state ───────────────────────────────────────────────

/// Lifecycle of the security layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityState {
    /// Before the method is known/established.
    #[default]
    Negotiating,
    /// Standard RDP only: the security exchange is in flight.
    KeyExchange,
    /// Waiting for the licensing handshake to finish.
    LicenseExchange,
    /// Per-PDU protection (or pass-through) active.
    Active,
    Closed,
}

/// What an inbound slow-path payload turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecEvent {
    /// A licensing PDU for the license automaton.
    Licensing(Bytes),
    /// Session data for the layers above.
    Data(Bytes),
    /// A PDU this client intentionally ignores (server redirection).
    Ignored,
}

// ── SecurityLayer ────────────────────────────────────────────────

/// The per-connection security context. Created after GCC grants the
/// method and level; destroyed with the connection; never shared.
pub struct SecurityLayer {
    state: SecurityState,
    method: EncryptionMethod,
    client_random: [u8; 32],
    mac_key: Vec<u8>,
    encryptor: Option<CipherDirection>,
    decryptor: Option<CipherDirection>,
}

impl SecurityLayer {
    /// Build the layer for the granted method/level. An empty method at
    /// level `None` means enhanced security (TLS/NLA): pass-through.
    pub fn new(method: EncryptionMethod, level: EncryptionLevel) -> Self {
        let encrypted = !(method.is_empty() && level == EncryptionLevel::None);
        Self {
            state: if encrypted {
                SecurityState::Negotiating
            } else {
                // Enhanced security skips the key exchange entirely.
                SecurityState::LicenseExchange
            },
            method,
            client_random: [0u8; 32],
            mac_key: Vec::new(),
            encryptor: None,
            decryptor: None,
        }
    }

    pub fn state(&self) -> SecurityState {
        self.state
    }

    /// Whether Standard RDP per-PDU protection is in force.
    pub fn is_encrypted(&self) -> bool {
        self.encryptor.is_some()
    }

    /// Run the client half of the security exchange: generate the
    /// client random, derive the session keys, and return the
    /// Security Exchange PDU payload (security header included).
    pub fn security_exchange(
        &mut self,
        server_random: &[u8],
        public_key: &ServerPublicKey,
    ) -> Result<Bytes, OcularError> {
        if self.state != SecurityState::Negotiating {
            return Err(OcularError::ProtocolViolation(
                "security exchange in wrong state",
            ));
        }
        self.state = SecurityState::KeyExchange;

        rand::thread_rng().fill_bytes(&mut self.client_random);
        let keys = derive_session_keys(&self.client_random, server_random, self.method);
        self.install_keys(keys);

        let encrypted = rsa_public_encrypt(&self.client_random, public_key)?;
        let mut buf = BytesMut::with_capacity(encrypted.len() + 16);
        buf.put_u16_le(SecurityFlags::EXCHANGE_PKT.bits());
        buf.put_u16_le(0); // flags hi
        buf.put_u32_le(encrypted.len() as u32 + 8);
        buf.put_slice(&encrypted);
        buf.put_bytes(0, 8); // mandated padding
        self.state = SecurityState::LicenseExchange;
        Ok(buf.freeze())
    }

    fn install_keys(&mut self, keys: SessionKeys) {
        self.mac_key = keys.mac_key;
        self.encryptor = Some(CipherDirection::new(keys.encrypt_key, self.method));
        self.decryptor = Some(CipherDirection::new(keys.decrypt_key, self.method));
    }

    /// Frame an outbound handshake PDU with explicit security flags
    /// (client info, licensing), encrypting when the session requires it.
    pub fn wrap_flagged(
        &mut self,
        flags: SecurityFlags,
        payload: &[u8],
    ) -> Result<Bytes, OcularError> {
        if self.state == SecurityState::Closed {
            return Err(OcularError::Closed);
        }
        let mut flags = flags;
        let mut buf = BytesMut::with_capacity(payload.len() + 12);
        if let Some(encryptor) = self.encryptor.as_mut() {
            flags |= SecurityFlags::ENCRYPT;
            let signature = mac_data(&self.mac_key, payload);
            let mut body = payload.to_vec();
            encryptor.apply(&mut body);
            buf.put_u16_le(flags.bits());
            buf.put_u16_le(0);
            buf.put_slice(&signature);
            buf.put_slice(&body);
        } else {
            buf.put_u16_le(flags.bits());
            buf.put_u16_le(0);
            buf.put_slice(payload);
        }
        Ok(buf.freeze())
    }

    /// Frame an outbound session-data PDU. Under enhanced security the
    /// payload travels bare; under Standard RDP it is signed and
    /// encrypted behind a plain ENCRYPT header.
    pub fn wrap_data(&mut self, payload: &[u8]) -> Result<Bytes, OcularError> {
        match self.state {
            SecurityState::Active | SecurityState::LicenseExchange => {}
            _ => return Err(OcularError::ProtocolViolation("sec send in wrong state")),
        }
        if self.encryptor.is_some() {
            self.wrap_flagged(SecurityFlags::empty(), payload)
        } else {
            Ok(Bytes::copy_from_slice(payload))
        }
    }

    /// Classify and unprotect one inbound slow-path payload.
    pub fn recv(&mut self, mut payload: Bytes) -> Result<SecEvent, OcularError> {
        match self.state {
            SecurityState::LicenseExchange => {}
            SecurityState::Active if self.is_encrypted() => {}
            SecurityState::Active => return Ok(SecEvent::Data(payload)),
            _ => return Err(OcularError::ProtocolViolation("sec recv in wrong state")),
        }

        let flags =
            SecurityFlags::from_bits_truncate(read_u16_le(&mut payload, "security header")?);
        read_u16_le(&mut payload, "security header")?; // flags hi

        let body = if flags.contains(SecurityFlags::ENCRYPT) {
            let signature = take_bytes(&mut payload, 8, "security signature")?;
            let decryptor = self
                .decryptor
                .as_mut()
                .ok_or(OcularError::Security("encrypted pdu without session keys"))?;
            let mut body = payload.to_vec();
            decryptor.apply(&mut body);
            let expected = if flags.contains(SecurityFlags::SECURE_CHECKSUM) {
                mac_salted_data(&self.mac_key, &body, decryptor.used as u32)
            } else {
                mac_data(&self.mac_key, &body)
            };
            if signature[..] != expected {
                self.state = SecurityState::Closed;
                return Err(OcularError::Security("mac signature mismatch"));
            }
            Bytes::from(body)
        } else {
            payload
        };

        if flags.contains(SecurityFlags::LICENSE_PKT) {
            return Ok(SecEvent::Licensing(body));
        }
        if flags.contains(SecurityFlags::REDIRECTION_PKT) {
            warn!("ignoring server redirection pdu");
            return Ok(SecEvent::Ignored);
        }
        Ok(SecEvent::Data(body))
    }

    /// License exchange finished; session data may flow.
    pub fn activate(&mut self) -> Result<(), OcularError> {
        if self.state != SecurityState::LicenseExchange {
            return Err(OcularError::ProtocolViolation(
                "activate outside license exchange",
            ));
        }
        self.state = SecurityState::Active;
        Ok(())
    }

    /// Decrypt a fast-path payload. Fast-path frames carry no security
    /// header; the caller invokes this only when the framer's flags
    /// marked the frame encrypted.
    pub fn decrypt_fast_path(&mut self, payload: Bytes) -> Result<Bytes, OcularError> {
        let Some(decryptor) = self.decryptor.as_mut() else {
            return Err(OcularError::Security(
                "encrypted fast-path frame without session keys",
            ));
        };
        let mut buf = payload;
        let signature = take_bytes(&mut buf, 8, "fast-path signature")?;
        let mut body = buf.to_vec();
        decryptor.apply(&mut body);
        if signature[..] != mac_data(&self.mac_key, &body) {
            self.state = SecurityState::Closed;
            return Err(OcularError::Security("fast-path mac mismatch"));
        }
        Ok(Bytes::from(body))
    }

    pub fn close(&mut self) {
        self.state = SecurityState::Closed;
    }

    // ── Client info PDU ──────────────────────────────────────────

    /// Build the client info PDU body (SEC_INFO_PKT payload).
    pub fn client_info(controller: &Controller) -> Bytes {
        let mut flags = InfoFlags::MOUSE
            | InfoFlags::UNICODE
            | InfoFlags::LOGON_NOTIFY
            | InfoFlags::LOGON_ERRORS
            | InfoFlags::MAXIMIZE_SHELL
            | InfoFlags::ENABLE_WINDOWS_KEY
            | InfoFlags::DISABLE_CTRL_ALT_DEL;
        if controller.has_credentials() {
            flags |= InfoFlags::AUTOLOGON;
        }

        let domain = utf16_z(&controller.domain);
        let username = utf16_z(&controller.username);
        let password = utf16_z(&controller.password);
        let shell = utf16_z("");
        let working_dir = utf16_z("");
        let client_address = utf16_z("");
        let client_dir = utf16_z("");

        let mut buf = BytesMut::with_capacity(
            18 + domain.len() + username.len() + password.len() + shell.len() + working_dir.len(),
        );
        buf.put_u32_le(0); // code page
        buf.put_u32_le(flags.bits());
        // cb fields exclude the terminator.
        buf.put_u16_le(domain.len() as u16 - 2);
        buf.put_u16_le(username.len() as u16 - 2);
        buf.put_u16_le(password.len() as u16 - 2);
        buf.put_u16_le(shell.len() as u16 - 2);
        buf.put_u16_le(working_dir.len() as u16 - 2);
        buf.put_slice(&domain);
        buf.put_slice(&username);
        buf.put_slice(&password);
        buf.put_slice(&shell);
        buf.put_slice(&working_dir);
        // Extended info.
        buf.put_u16_le(0x0002); // AF_INET
        buf.put_u16_le(client_address.len() as u16);
        buf.put_slice(&client_address);
        buf.put_u16_le(client_dir.len() as u16);
        buf.put_slice(&client_dir);
        buf.put_bytes(0, 172); // time zone information
        buf.put_u32_le(0); // session id
        buf.put_u32_le(controller.performance_flags().bits());
        buf.freeze()
    }
}

// ── RSA ──────────────────────────────────────────────────────────

/// Encrypt a client secret (the 32-byte client random, or the 48-byte
/// licensing premaster) with the server's public key, as both exchanges
/// demand: little-endian value, raw modexp, result padded little-endian
/// to the modulus width.
pub(crate) fn rsa_public_encrypt(
    client_random: &[u8],
    key: &ServerPublicKey,
) -> Result<Vec<u8>, OcularError> {
    let n = BigUint::from_bytes_be(&key.modulus);
    if n.bits() < 512 {
        return Err(OcularError::Security("server rsa modulus too small"));
    }
    let e = BigUint::from_bytes_be(&key.exponent);
    let m = BigUint::from_bytes_le(client_random);
    let c = m.modpow(&e, &n);
    let mut out = c.to_bytes_le();
    out.resize(key.modulus.len(), 0);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::read_u32_le;

    const CLIENT_RANDOM: [u8; 32] = [0x11; 32];
    const SERVER_RANDOM: [u8; 32] = [0x22; 32];

    fn test_layer(method: EncryptionMethod) -> SecurityLayer {
        let mut layer = SecurityLayer::new(method, EncryptionLevel::ClientCompatible);
        let keys = derive_session_keys(&CLIENT_RANDOM, &SERVER_RANDOM, method);
        layer.client_random = CLIENT_RANDOM;
        layer.install_keys(keys);
        layer.state = SecurityState::LicenseExchange;
        layer
    }

    /// A second layer with the directions swapped, standing in for the
    /// server end of the same session.
    fn peer_layer(method: EncryptionMethod) -> SecurityLayer {
        let mut layer = test_layer(method);
        let keys = derive_session_keys(&CLIENT_RANDOM, &SERVER_RANDOM, method);
        layer.encryptor = Some(CipherDirection::new(keys.decrypt_key, method));
        layer.decryptor = Some(CipherDirection::new(keys.encrypt_key, method));
        layer
    }

    #[test]
    fn key_derivation_is_deterministic_and_directional() {
        let a = derive_session_keys(&CLIENT_RANDOM, &SERVER_RANDOM, EncryptionMethod::BIT_128);
        let b = derive_session_keys(&CLIENT_RANDOM, &SERVER_RANDOM, EncryptionMethod::BIT_128);
        assert_eq!(a, b);
        assert_eq!(a.mac_key.len(), 16);
        assert_ne!(a.encrypt_key, a.decrypt_key);
        assert_ne!(a.mac_key, a.encrypt_key);
    }

    #[test]
    fn export_keys_carry_well_known_salt() {
        let keys = derive_session_keys(&CLIENT_RANDOM, &SERVER_RANDOM, EncryptionMethod::BIT_40);
        assert_eq!(keys.encrypt_key.len(), 8);
        assert_eq!(&keys.encrypt_key[..3], &[0xD1, 0x26, 0x9E]);
        assert_eq!(&keys.mac_key[..3], &[0xD1, 0x26, 0x9E]);

        let keys = derive_session_keys(&CLIENT_RANDOM, &SERVER_RANDOM, EncryptionMethod::BIT_56);
        assert_eq!(keys.decrypt_key.len(), 8);
        assert_eq!(keys.decrypt_key[0], 0xD1);
    }

    #[test]
    fn mac_length_and_sensitivity() {
        let keys = derive_session_keys(&CLIENT_RANDOM, &SERVER_RANDOM, EncryptionMethod::BIT_128);
        let mac = mac_data(&keys.mac_key, b"hello world");
        assert_eq!(mac.len(), 8);
        assert_ne!(mac, mac_data(&keys.mac_key, b"hello worle"));
        assert_ne!(mac, mac_salted_data(&keys.mac_key, b"hello world", 1));
    }

    #[test]
    fn protected_round_trip_between_peers() {
        let mut client = test_layer(EncryptionMethod::BIT_128);
        let mut server = peer_layer(EncryptionMethod::BIT_128);

        let wrapped = client
            .wrap_flagged(SecurityFlags::INFO_PKT, b"client info body")
            .unwrap();
        match server.recv(wrapped).unwrap() {
            SecEvent::Data(body) => assert_eq!(&body[..], b"client info body"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn corrupted_byte_is_always_rejected() {
        for index_from_end in 1..=16usize {
            let mut client = test_layer(EncryptionMethod::BIT_128);
            let mut server = peer_layer(EncryptionMethod::BIT_128);

            let wrapped = client
                .wrap_flagged(SecurityFlags::empty(), b"sixteen byte body")
                .unwrap();
            let mut bytes = wrapped.to_vec();
            let index = bytes.len() - index_from_end;
            bytes[index] ^= 0x01;
            let err = server.recv(Bytes::from(bytes)).unwrap_err();
            assert!(matches!(err, OcularError::Security(_)), "byte {index_from_end}");
        }
    }

    #[test]
    fn license_pdus_are_classified() {
        let mut client = test_layer(EncryptionMethod::BIT_128);
        let mut server = peer_layer(EncryptionMethod::BIT_128);
        let wrapped = server
            .wrap_flagged(SecurityFlags::LICENSE_PKT, b"license body")
            .unwrap();
        match client.recv(wrapped).unwrap() {
            SecEvent::Licensing(body) => assert_eq!(&body[..], b"license body"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn enhanced_security_passes_data_through() {
        let mut layer = SecurityLayer::new(EncryptionMethod::empty(), EncryptionLevel::None);
        assert!(!layer.is_encrypted());
        layer.activate().unwrap();
        let out = layer.wrap_data(b"bare").unwrap();
        assert_eq!(&out[..], b"bare");
        match layer.recv(Bytes::from_static(b"inbound")).unwrap() {
            SecEvent::Data(body) => assert_eq!(&body[..], b"inbound"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn rekey_preserves_the_stream() {
        let mut client = test_layer(EncryptionMethod::BIT_128);
        let mut server = peer_layer(EncryptionMethod::BIT_128);
        // Drive both directions across the rekey boundary.
        for i in 0..(REKEY_INTERVAL + 8) {
            let body = format!("pdu number {i}");
            let wrapped = client
                .wrap_flagged(SecurityFlags::empty(), body.as_bytes())
                .unwrap();
            match server.recv(wrapped).unwrap() {
                SecEvent::Data(out) => assert_eq!(&out[..], body.as_bytes()),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn update_key_changes_key_material() {
        let keys = derive_session_keys(&CLIENT_RANDOM, &SERVER_RANDOM, EncryptionMethod::BIT_128);
        let updated = update_key(&keys.encrypt_key, &keys.encrypt_key, EncryptionMethod::BIT_128);
        assert_eq!(updated.len(), 16);
        assert_ne!(updated, keys.encrypt_key);

        let export = derive_session_keys(&CLIENT_RANDOM, &SERVER_RANDOM, EncryptionMethod::BIT_40);
        let updated = update_key(&export.encrypt_key, &export.encrypt_key, EncryptionMethod::BIT_40);
        assert_eq!(updated.len(), 8);
        assert_eq!(&updated[..3], &[0xD1, 0x26, 0x9E]);
    }

    #[test]
    fn security_exchange_shape() {
        let mut layer =
            SecurityLayer::new(EncryptionMethod::BIT_128, EncryptionLevel::ClientCompatible);
        // 64-byte modulus, public exponent 65537.
        let key = ServerPublicKey {
            modulus: {
                let mut m = vec![0xE7u8; 64];
                m[0] |= 0x80;
                m
            },
            exponent: vec![0x01, 0x00, 0x01],
        };
        let pdu = layer.security_exchange(&SERVER_RANDOM, &key).unwrap();
        let mut buf = pdu;
        let flags = read_u16_le(&mut buf, "t").unwrap();
        assert_eq!(flags, SecurityFlags::EXCHANGE_PKT.bits());
        read_u16_le(&mut buf, "t").unwrap();
        let len = read_u32_le(&mut buf, "t").unwrap();
        assert_eq!(len as usize, 64 + 8);
        assert_eq!(buf.len(), 64 + 8);
        // Trailing padding must be zero.
        assert!(buf[64..].iter().all(|&b| b == 0));
        assert!(layer.is_encrypted());
        assert_eq!(layer.state(), SecurityState::LicenseExchange);
    }

    #[test]
    fn client_info_reflects_credentials() {
        let mut controller = Controller::default();
        controller.username = "user".into();
        controller.password = "pw".into();
        controller.performance_session = true;
        let body = SecurityLayer::client_info(&controller);
        let mut buf = body;
        read_u32_le(&mut buf, "code page").unwrap();
        let flags = InfoFlags::from_bits_truncate(read_u32_le(&mut buf, "flags").unwrap());
        assert!(flags.contains(InfoFlags::AUTOLOGON));
        let cb_domain = read_u16_le(&mut buf, "cb").unwrap();
        let cb_user = read_u16_le(&mut buf, "cb").unwrap();
        assert_eq!(cb_domain, 0);
        assert_eq!(cb_user, 8); // "user" in UTF-16, terminator excluded
    }
}
