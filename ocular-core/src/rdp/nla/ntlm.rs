//! NTLMv2 — the authentication protocol CredSSP carries.
//!
//! Implements the client side of the three-message exchange
//! (NEGOTIATE → CHALLENGE → AUTHENTICATE) with extended session
//! security and session-key exchange, plus the GSS-style sealing the
//! CredSSP public-key proof and credential delivery use afterwards.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use md4::Md4;
use md5::{Digest as _, Md5};
use rand::RngCore;
use tracing::debug;

use crate::codec::{read_u16_le, read_u32_le, take_bytes, utf16};
use crate::error::OcularError;
use crate::rdp::sec::Rc4Stream;

type HmacMd5 = Hmac<Md5>;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const MESSAGE_NEGOTIATE: u32 = 1;
const MESSAGE_CHALLENGE: u32 = 2;
const MESSAGE_AUTHENTICATE: u32 = 3;

// Negotiate flags.
const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_SIGN: u32 = 0x0000_0010;
const NEGOTIATE_SEAL: u32 = 0x0000_0020;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSION_SECURITY: u32 = 0x0008_0000;
const NEGOTIATE_VERSION: u32 = 0x0200_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_KEY_EXCH: u32 = 0x4000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

const CLIENT_FLAGS: u32 = NEGOTIATE_UNICODE
    | REQUEST_TARGET
    | NEGOTIATE_SIGN
    | NEGOTIATE_SEAL
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSION_SECURITY
    | NEGOTIATE_VERSION
    | NEGOTIATE_128
    | NEGOTIATE_KEY_EXCH
    | NEGOTIATE_56;

/// AV pair id carrying the server timestamp.
const AV_TIMESTAMP: u16 = 0x0007;

/// Version stamp advertised in negotiate/authenticate (6.0, NTLM rev 15).
const VERSION_STAMP: [u8; 8] = [6, 0, 0, 0, 0, 0, 0, 0x0F];

// Sign/seal key derivation constants (MS-NLMP 3.4.5.2/3.4.5.3).
const CLIENT_SIGNING: &[u8] = b"session key to client-to-server signing key magic constant\0";
const SERVER_SIGNING: &[u8] = b"session key to server-to-client signing key magic constant\0";
const CLIENT_SEALING: &[u8] = b"session key to client-to-server sealing key magic constant\0";
const SERVER_SEALING: &[u8] = b"session key to server-to-client sealing key magic constant\0";

// ── Hash helpers ─────────────────────────────────────────────────

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> [u8; 16] {
    let mut mac = HmacMd5::new_from_slice(key).expect("hmac accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

fn md4_of(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md4::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn md5_concat(a: &[u8], b: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// `NTOWFv2(password, user, domain)`.
fn ntowf_v2(password: &str, user: &str, domain: &str) -> [u8; 16] {
    let nt_hash = md4_of(&utf16(password));
    let identity = utf16(&(user.to_uppercase() + domain));
    hmac_md5(&nt_hash, &[&identity])
}

/// Current time as a Windows FILETIME, used when the server offers no
/// timestamp AV pair.
fn filetime_now() -> [u8; 8] {
    let unix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let filetime = unix.as_nanos() as u64 / 100 + 116_444_736_000_000_000;
    filetime.to_le_bytes()
}

// ── Challenge parsing ────────────────────────────────────────────

struct Challenge {
    server_challenge: [u8; 8],
    target_info: Bytes,
    timestamp: Option<[u8; 8]>,
}

fn read_field(buf: &mut Bytes) -> Result<(usize, usize), OcularError> {
    let len = read_u16_le(buf, "ntlm field")? as usize;
    let _max = read_u16_le(buf, "ntlm field")?;
    let offset = read_u32_le(buf, "ntlm field")? as usize;
    Ok((len, offset))
}

fn slice_at(message: &[u8], len: usize, offset: usize) -> Result<Bytes, OcularError> {
    if offset + len > message.len() {
        return Err(OcularError::Decode {
            context: "ntlm payload field",
            needed: offset + len,
            available: message.len(),
        });
    }
    Ok(Bytes::copy_from_slice(&message[offset..offset + len]))
}

fn parse_challenge(message: &[u8]) -> Result<Challenge, OcularError> {
    let mut buf = Bytes::copy_from_slice(message);
    let signature = take_bytes(&mut buf, 8, "ntlm challenge")?;
    if &signature[..] != SIGNATURE {
        return Err(OcularError::Malformed {
            context: "ntlm challenge",
            reason: "bad NTLMSSP signature",
        });
    }
    if read_u32_le(&mut buf, "ntlm challenge")? != MESSAGE_CHALLENGE {
        return Err(OcularError::Malformed {
            context: "ntlm challenge",
            reason: "not a challenge message",
        });
    }
    read_field(&mut buf)?; // target name
    let _flags = read_u32_le(&mut buf, "ntlm challenge")?;
    let mut server_challenge = [0u8; 8];
    take_bytes(&mut buf, 8, "ntlm server challenge")?.copy_to_slice(&mut server_challenge);
    take_bytes(&mut buf, 8, "ntlm reserved")?;
    let (info_len, info_offset) = read_field(&mut buf)?;
    let target_info = slice_at(message, info_len, info_offset)?;

    // Walk AV pairs for the server timestamp.
    let mut timestamp = None;
    let mut pairs = target_info.clone();
    while pairs.len() >= 4 {
        let id = read_u16_le(&mut pairs, "ntlm av pair")?;
        let len = read_u16_le(&mut pairs, "ntlm av pair")? as usize;
        let value = take_bytes(&mut pairs, len, "ntlm av pair")?;
        if id == 0 {
            break;
        }
        if id == AV_TIMESTAMP && len == 8 {
            let mut ts = [0u8; 8];
            ts.copy_from_slice(&value);
            timestamp = Some(ts);
        }
    }

    Ok(Challenge {
        server_challenge,
        target_info,
        timestamp,
    })
}

// ── NtlmContext ──────────────────────────────────────────────────

/// Client-side NTLMv2 state machine plus the derived sealing channel.
pub struct NtlmContext {
    domain: String,
    user: String,
    password: String,
    negotiate_message: Vec<u8>,
    seal_tx: Option<Rc4Stream>,
    seal_rx: Option<Rc4Stream>,
    sign_tx_key: [u8; 16],
    sign_rx_key: [u8; 16],
    seq_tx: u32,
    seq_rx: u32,
}

impl NtlmContext {
    pub fn new(domain: &str, user: &str, password: &str) -> Self {
        Self {
            domain: domain.to_owned(),
            user: user.to_owned(),
            password: password.to_owned(),
            negotiate_message: Vec::new(),
            seal_tx: None,
            seal_rx: None,
            sign_tx_key: [0u8; 16],
            sign_rx_key: [0u8; 16],
            seq_tx: 0,
            seq_rx: 0,
        }
    }

    /// Whether [`authenticate`](Self::authenticate) has completed and
    /// the sealing channel is usable.
    pub fn is_established(&self) -> bool {
        self.seal_tx.is_some()
    }

    /// Build the NEGOTIATE message.
    pub fn negotiate(&mut self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(40);
        buf.put_slice(SIGNATURE);
        buf.put_u32_le(MESSAGE_NEGOTIATE);
        buf.put_u32_le(CLIENT_FLAGS);
        buf.put_u64_le(0); // domain fields: none
        buf.put_u64_le(0); // workstation fields: none
        buf.put_slice(&VERSION_STAMP);
        self.negotiate_message = buf.to_vec();
        self.negotiate_message.clone()
    }

    /// Consume the server CHALLENGE and build the AUTHENTICATE message.
    pub fn authenticate(&mut self, challenge_message: &[u8]) -> Result<Vec<u8>, OcularError> {
        let challenge = parse_challenge(challenge_message)?;

        let mut client_challenge = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut client_challenge);
        let timestamp = challenge.timestamp.unwrap_or_else(filetime_now);

        let key = ntowf_v2(&self.password, &self.user, &self.domain);

        // temp: version, timestamp, client challenge, target info.
        let mut temp = Vec::with_capacity(28 + challenge.target_info.len() + 4);
        temp.extend_from_slice(&[0x01, 0x01, 0, 0, 0, 0, 0, 0]);
        temp.extend_from_slice(&timestamp);
        temp.extend_from_slice(&client_challenge);
        temp.extend_from_slice(&[0u8; 4]);
        temp.extend_from_slice(&challenge.target_info);
        temp.extend_from_slice(&[0u8; 4]);

        let nt_proof = hmac_md5(&key, &[&challenge.server_challenge, &temp]);
        let mut nt_response = Vec::with_capacity(16 + temp.len());
        nt_response.extend_from_slice(&nt_proof);
        nt_response.extend_from_slice(&temp);

        let mut lm_response = [0u8; 24];
        lm_response[..16].copy_from_slice(&hmac_md5(
            &key,
            &[&challenge.server_challenge, &client_challenge],
        ));
        lm_response[16..].copy_from_slice(&client_challenge);

        // For NTLMv2 the key-exchange key is the session base key.
        let session_base_key = hmac_md5(&key, &[&nt_proof]);
        let mut exported_session_key = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut exported_session_key);
        let mut encrypted_session_key = exported_session_key;
        Rc4Stream::new(&session_base_key).apply(&mut encrypted_session_key);

        let domain = utf16(&self.domain);
        let user = utf16(&self.user);
        let workstation: Vec<u8> = Vec::new();

        // Payload emission order: domain, user, workstation, LM, NT,
        // session key. Header field order differs (LM/NT first).
        let header_len = 8 + 4 + 6 * 8 + 4 + VERSION_STAMP.len() + 16;
        let lengths = [
            domain.len(),
            user.len(),
            workstation.len(),
            lm_response.len(),
            nt_response.len(),
            encrypted_session_key.len(),
        ];
        let mut offsets = [0usize; 6];
        let mut cursor = header_len;
        for (slot, len) in offsets.iter_mut().zip(lengths) {
            *slot = cursor;
            cursor += len;
        }

        let put_field = |buf: &mut BytesMut, len: usize, offset: usize| {
            buf.put_u16_le(len as u16);
            buf.put_u16_le(len as u16);
            buf.put_u32_le(offset as u32);
        };

        let mut buf = BytesMut::with_capacity(cursor);
        buf.put_slice(SIGNATURE);
        buf.put_u32_le(MESSAGE_AUTHENTICATE);
        put_field(&mut buf, lengths[3], offsets[3]); // LM response
        put_field(&mut buf, lengths[4], offsets[4]); // NT response
        put_field(&mut buf, lengths[0], offsets[0]); // domain
        put_field(&mut buf, lengths[1], offsets[1]); // user
        put_field(&mut buf, lengths[2], offsets[2]); // workstation
        put_field(&mut buf, lengths[5], offsets[5]); // session key
        buf.put_u32_le(CLIENT_FLAGS);
        buf.put_slice(&VERSION_STAMP);
        let mic_index = buf.len();
        buf.put_bytes(0, 16); // MIC, patched below
        buf.put_slice(&domain);
        buf.put_slice(&user);
        buf.put_slice(&workstation);
        buf.put_slice(&lm_response);
        buf.put_slice(&nt_response);
        buf.put_slice(&encrypted_session_key);

        // MIC over all three messages with the MIC field zeroed.
        let mic = hmac_md5(
            &exported_session_key,
            &[&self.negotiate_message, challenge_message, &buf],
        );
        buf[mic_index..mic_index + 16].copy_from_slice(&mic);

        // Derive the GSS sign/seal channel.
        self.sign_tx_key = md5_concat(&exported_session_key, CLIENT_SIGNING);
        self.sign_rx_key = md5_concat(&exported_session_key, SERVER_SIGNING);
        self.seal_tx = Some(Rc4Stream::new(&md5_concat(
            &exported_session_key,
            CLIENT_SEALING,
        )));
        self.seal_rx = Some(Rc4Stream::new(&md5_concat(
            &exported_session_key,
            SERVER_SEALING,
        )));
        debug!(user = %self.user, "ntlm authenticate message built");
        Ok(buf.to_vec())
    }

    /// GSS wrap: seal `data`, returning `signature || ciphertext`.
    ///
    /// The checksum is encrypted on the same RC4 stream as the payload,
    /// in payload-then-checksum order; both ends must keep that order.
    pub fn seal(&mut self, data: &[u8]) -> Result<Vec<u8>, OcularError> {
        let seal = self
            .seal_tx
            .as_mut()
            .ok_or(OcularError::Security("ntlm seal before establishment"))?;
        let mut ciphertext = data.to_vec();
        seal.apply(&mut ciphertext);

        let checksum_full = hmac_md5(&self.sign_tx_key, &[&self.seq_tx.to_le_bytes(), data]);
        let mut checksum = checksum_full[..8].to_vec();
        seal.apply(&mut checksum);

        let mut out = Vec::with_capacity(16 + ciphertext.len());
        out.extend_from_slice(&1u32.to_le_bytes()); // signature version
        out.extend_from_slice(&checksum);
        out.extend_from_slice(&self.seq_tx.to_le_bytes());
        out.extend_from_slice(&ciphertext);
        self.seq_tx += 1;
        Ok(out)
    }

    /// GSS unwrap: verify and decrypt `signature || ciphertext`.
    pub fn unseal(&mut self, data: &[u8]) -> Result<Vec<u8>, OcularError> {
        if data.len() < 16 {
            return Err(OcularError::Decode {
                context: "ntlm sealed message",
                needed: 16,
                available: data.len(),
            });
        }
        let seal = self
            .seal_rx
            .as_mut()
            .ok_or(OcularError::Security("ntlm unseal before establishment"))?;
        let (signature, ciphertext) = data.split_at(16);

        // Mirror the sender's stream order: payload first, checksum next.
        let mut plaintext = ciphertext.to_vec();
        seal.apply(&mut plaintext);
        let mut received_checksum = signature[4..12].to_vec();
        seal.apply(&mut received_checksum);

        let expected =
            hmac_md5(&self.sign_rx_key, &[&self.seq_rx.to_le_bytes(), &plaintext]);
        if received_checksum != expected[..8] {
            return Err(OcularError::Security("ntlm message signature mismatch"));
        }
        self.seq_rx += 1;
        Ok(plaintext)
    }
}
