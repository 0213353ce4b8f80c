//! Minimal RDP licensing exchange.
//!
//! License issuance is not implemented — only the handshake needed to
//! reach the activation phase. A server content with the client (the
//! common case) sends an error alert with STATUS_VALID_CLIENT straight
//! away; a server that insists on negotiating gets a New License Request
//! and a platform-challenge response built from the licensing key
//! schedule, after which it either issues a license (accepted and
//! discarded) or reports valid-client.

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use tracing::{debug, warn};

use crate::codec::{read_u8, read_u16_le, read_u32_le, take_bytes};
use crate::error::OcularError;
use crate::rdp::gcc::{self, ServerPublicKey};
use crate::rdp::sec;

// Message types.
const SERVER_LICENSE_REQUEST: u8 = 0x01;
const SERVER_PLATFORM_CHALLENGE: u8 = 0x02;
const SERVER_NEW_LICENSE: u8 = 0x03;
const SERVER_UPGRADE_LICENSE: u8 = 0x04;
const CLIENT_NEW_LICENSE_REQUEST: u8 = 0x13;
const CLIENT_PLATFORM_CHALLENGE_RESPONSE: u8 = 0x15;
const ERROR_ALERT: u8 = 0xFF;

const PREAMBLE_VERSION_3: u8 = 0x03;

// Binary blob types.
const BB_DATA_BLOB: u16 = 0x0001;
const BB_RANDOM_BLOB: u16 = 0x0002;
const BB_CERTIFICATE_BLOB: u16 = 0x0003;
const BB_ENCRYPTED_DATA_BLOB: u16 = 0x0009;
const BB_CLIENT_USER_NAME_BLOB: u16 = 0x000F;
const BB_CLIENT_MACHINE_NAME_BLOB: u16 = 0x0010;

/// Error-alert codes.
const STATUS_VALID_CLIENT: u32 = 0x0000_0007;

const KEY_EXCHANGE_ALG_RSA: u32 = 0x0000_0001;
/// WinNT-post-5.2 OS id plus the Microsoft image id.
const CLIENT_PLATFORM_ID: u32 = 0x0401_0000;

// ── Events ───────────────────────────────────────────────────────

/// Outcome of feeding one licensing PDU into the automaton.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LicenseEvent {
    /// Licensing finished; the session may activate.
    Completed,
    /// Send this licensing PDU (body only; the caller frames it with
    /// SEC_LICENSE_PKT) and keep waiting.
    Respond(Bytes),
}

// ── LicenseLayer ─────────────────────────────────────────────────

/// Client licensing automaton.
pub struct LicenseLayer {
    username: String,
    hostname: String,
    client_random: [u8; 32],
    premaster: [u8; 48],
    /// Derived when a license request arrives.
    mac_salt: [u8; 16],
    license_key: [u8; 16],
    completed: bool,
}

impl LicenseLayer {
    pub fn new(username: &str, hostname: &str) -> Self {
        let mut client_random = [0u8; 32];
        let mut premaster = [0u8; 48];
        rand::thread_rng().fill_bytes(&mut client_random);
        rand::thread_rng().fill_bytes(&mut premaster);
        Self {
            username: username.to_owned(),
            hostname: hostname.to_owned(),
            client_random,
            premaster,
            mac_salt: [0u8; 16],
            license_key: [0u8; 16],
            completed: false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Feed one licensing PDU (security header already stripped).
    pub fn handle(&mut self, mut pdu: Bytes) -> Result<LicenseEvent, OcularError> {
        let msg_type = read_u8(&mut pdu, "license preamble")?;
        let _flags = read_u8(&mut pdu, "license preamble")?;
        let size = read_u16_le(&mut pdu, "license preamble")? as usize;
        if size < 4 {
            return Err(OcularError::Malformed {
                context: "license preamble",
                reason: "message size shorter than preamble",
            });
        }

        match msg_type {
            ERROR_ALERT => {
                let code = read_u32_le(&mut pdu, "license error alert")?;
                let _transition = read_u32_le(&mut pdu, "license error alert")?;
                if code == STATUS_VALID_CLIENT {
                    debug!("license exchange complete: client valid");
                    self.completed = true;
                    Ok(LicenseEvent::Completed)
                } else {
                    Err(OcularError::Security("server reported a licensing error"))
                }
            }
            SERVER_NEW_LICENSE | SERVER_UPGRADE_LICENSE => {
                // Issued license is accepted and discarded; nothing is
                // persisted across reconnects.
                debug!("server issued a license; discarding");
                self.completed = true;
                Ok(LicenseEvent::Completed)
            }
            SERVER_LICENSE_REQUEST => self.handle_license_request(pdu),
            SERVER_PLATFORM_CHALLENGE => self.handle_platform_challenge(pdu),
            other => Err(OcularError::UnknownVariant {
                type_name: "LicenseMessage",
                value: other as u64,
            }),
        }
    }

    fn handle_license_request(&mut self, mut pdu: Bytes) -> Result<LicenseEvent, OcularError> {
        let server_random = take_bytes(&mut pdu, 32, "license server random")?;
        // Product info: version, then two length-prefixed strings.
        read_u32_le(&mut pdu, "license product info")?;
        let company_len = read_u32_le(&mut pdu, "license product info")? as usize;
        take_bytes(&mut pdu, company_len, "license company name")?;
        let product_len = read_u32_le(&mut pdu, "license product info")? as usize;
        take_bytes(&mut pdu, product_len, "license product id")?;
        let (_alg_type, _key_exchange_list) = read_blob(&mut pdu)?;
        let (cert_type, cert) = read_blob(&mut pdu)?;
        if cert_type != BB_CERTIFICATE_BLOB {
            return Err(OcularError::Malformed {
                context: "license request",
                reason: "expected a certificate blob",
            });
        }
        let mut cert = cert;
        let public_key = gcc::decode_server_certificate(&mut cert)?;

        self.derive_keys(&server_random);
        let response = self.new_license_request(&public_key)?;
        Ok(LicenseEvent::Respond(response))
    }

    /// MS-RDPELE 5.1.3: note the swapped randoms in the second
    /// expansion.
    fn derive_keys(&mut self, server_random: &[u8]) {
        let master = sec::master_secret(&self.premaster, &self.client_random, server_random);
        let blob = sec::master_secret(&master, server_random, &self.client_random);
        self.mac_salt.copy_from_slice(&blob[..16]);
        self.license_key =
            sec::final_hash(&blob[16..32], &self.client_random, server_random);
    }

    fn new_license_request(&self, key: &ServerPublicKey) -> Result<Bytes, OcularError> {
        let mut encrypted = sec::rsa_public_encrypt(&self.premaster, key)?;
        encrypted.extend_from_slice(&[0u8; 8]);

        let mut user = self.username.clone().into_bytes();
        user.push(0);
        let mut machine = self.hostname.clone().into_bytes();
        machine.push(0);

        let body_len = 4 + 4 + 32 + (4 + encrypted.len()) + (4 + user.len()) + (4 + machine.len());
        let mut buf = BytesMut::with_capacity(body_len + 4);
        put_preamble(&mut buf, CLIENT_NEW_LICENSE_REQUEST, body_len);
        buf.put_u32_le(KEY_EXCHANGE_ALG_RSA);
        buf.put_u32_le(CLIENT_PLATFORM_ID);
        buf.put_slice(&self.client_random);
        put_blob(&mut buf, BB_RANDOM_BLOB, &encrypted);
        put_blob(&mut buf, BB_CLIENT_USER_NAME_BLOB, &user);
        put_blob(&mut buf, BB_CLIENT_MACHINE_NAME_BLOB, &machine);
        Ok(buf.freeze())
    }

    fn handle_platform_challenge(&mut self, mut pdu: Bytes) -> Result<LicenseEvent, OcularError> {
        read_u32_le(&mut pdu, "platform challenge")?; // connect flags
        let (_blob_type, encrypted_challenge) = read_blob(&mut pdu)?;
        // Trailing 16-byte MAC is not verifiable without the server's
        // view of the count; the response MAC is what the server checks.
        let mut challenge = encrypted_challenge.to_vec();
        sec::rc4_apply(&self.license_key, &mut challenge);

        let mut hwid = [0u8; 20];
        hwid[..4].copy_from_slice(&CLIENT_PLATFORM_ID.to_le_bytes());
        rand::thread_rng().fill_bytes(&mut hwid[4..]);

        let mut mac_input = Vec::with_capacity(challenge.len() + hwid.len());
        mac_input.extend_from_slice(&challenge);
        mac_input.extend_from_slice(&hwid);
        let mac = sec::license_mac(&self.mac_salt, &mac_input);

        let mut encrypted_response = challenge.clone();
        sec::rc4_apply(&self.license_key, &mut encrypted_response);
        let mut encrypted_hwid = hwid.to_vec();
        sec::rc4_apply(&self.license_key, &mut encrypted_hwid);

        let body_len = (4 + encrypted_response.len()) + (4 + encrypted_hwid.len()) + 16;
        let mut buf = BytesMut::with_capacity(body_len + 4);
        put_preamble(&mut buf, CLIENT_PLATFORM_CHALLENGE_RESPONSE, body_len);
        put_blob(&mut buf, BB_ENCRYPTED_DATA_BLOB, &encrypted_response);
        put_blob(&mut buf, BB_ENCRYPTED_DATA_BLOB, &encrypted_hwid);
        buf.put_slice(&mac);
        warn!("answering license platform challenge without a stored license");
        Ok(LicenseEvent::Respond(buf.freeze()))
    }
}

// ── Wire helpers ─────────────────────────────────────────────────

fn put_preamble(buf: &mut BytesMut, msg_type: u8, body_len: usize) {
    buf.put_u8(msg_type);
    buf.put_u8(PREAMBLE_VERSION_3);
    buf.put_u16_le(body_len as u16 + 4);
}

fn put_blob(buf: &mut BytesMut, blob_type: u16, data: &[u8]) {
    buf.put_u16_le(blob_type);
    buf.put_u16_le(data.len() as u16);
    buf.put_slice(data);
}

fn read_blob(buf: &mut Bytes) -> Result<(u16, Bytes), OcularError> {
    let blob_type = read_u16_le(buf, "license blob")?;
    let len = read_u16_le(buf, "license blob")? as usize;
    let data = take_bytes(buf, len, "license blob")?;
    Ok((blob_type, data))
}

/// Build an error-alert licensing PDU — the form servers use to report
/// STATUS_VALID_CLIENT, and the scripted test servers with it.
pub fn encode_error_alert(code: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    put_preamble(&mut buf, ERROR_ALERT, 12);
    buf.put_u32_le(code);
    buf.put_u32_le(0x0000_0002); // ST_NO_TRANSITION
    put_blob(&mut buf, BB_DATA_BLOB, &[]);
    buf.freeze()
}

/// The STATUS_VALID_CLIENT error alert.
pub fn encode_valid_client() -> Bytes {
    encode_error_alert(STATUS_VALID_CLIENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn valid_client_completes() {
        let mut layer = LicenseLayer::new("user", "host");
        assert!(!layer.is_completed());
        let event = layer.handle(encode_valid_client()).unwrap();
        assert_eq!(event, LicenseEvent::Completed);
        assert!(layer.is_completed());
    }

    #[test]
    fn other_error_codes_are_fatal() {
        let mut layer = LicenseLayer::new("user", "host");
        let err = layer.handle(encode_error_alert(0x0000_0006)).unwrap_err();
        assert!(matches!(err, OcularError::Security(_)));
    }

    #[test]
    fn new_license_completes() {
        let mut body = BytesMut::new();
        put_preamble(&mut body, SERVER_NEW_LICENSE, 0);
        let mut layer = LicenseLayer::new("user", "host");
        assert_eq!(layer.handle(body.freeze()).unwrap(), LicenseEvent::Completed);
    }

    fn license_request(server_random: &[u8; 32], cert: &[u8]) -> Bytes {
        let mut body = BytesMut::new();
        body.put_slice(server_random);
        body.put_u32_le(0x0006_0000); // product version
        body.put_u32_le(4);
        body.put_slice(b"MS\0\0");
        body.put_u32_le(4);
        body.put_slice(b"A02\0");
        put_blob(&mut body, 0x000D, &KEY_EXCHANGE_ALG_RSA.to_le_bytes());
        put_blob(&mut body, BB_CERTIFICATE_BLOB, cert);
        body.put_u32_le(0); // empty scope list

        let mut buf = BytesMut::new();
        put_preamble(&mut buf, SERVER_LICENSE_REQUEST, body.len());
        buf.put_slice(&body);
        buf.freeze()
    }

    fn proprietary_cert() -> Vec<u8> {
        // Mirrors the GCC proprietary form: RSA1 blob with a 64-byte
        // modulus (top bit set so the key passes the size check).
        let mut modulus_le = vec![0xE5u8; 64];
        modulus_le[63] |= 0x80;
        let mut blob = BytesMut::new();
        blob.put_u32_le(0x3141_5352);
        blob.put_u32_le(72);
        blob.put_u32_le(512);
        blob.put_u32_le(63);
        blob.put_u32_le(0x0001_0001);
        blob.put_slice(&modulus_le);
        blob.put_bytes(0, 8);

        let mut cert = BytesMut::new();
        cert.put_u32_le(1); // proprietary version
        cert.put_u32_le(1);
        cert.put_u32_le(1);
        cert.put_u16_le(0x0006);
        cert.put_u16_le(blob.len() as u16);
        cert.put_slice(&blob);
        cert.put_u16_le(0x0008);
        cert.put_u16_le(0);
        cert.to_vec()
    }

    #[test]
    fn license_request_produces_new_license_request() {
        let mut layer = LicenseLayer::new("user", "host");
        let request = license_request(&[0x42; 32], &proprietary_cert());
        let event = layer.handle(request).unwrap();
        let response = match event {
            LicenseEvent::Respond(r) => r,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(response[0], CLIENT_NEW_LICENSE_REQUEST);
        assert_eq!(response[1], PREAMBLE_VERSION_3);
        let declared = u16::from_le_bytes([response[2], response[3]]) as usize;
        assert_eq!(declared, response.len());
        // Keys were derived for a possible platform challenge.
        assert_ne!(layer.mac_salt, [0u8; 16]);
        assert_ne!(layer.license_key, [0u8; 16]);
    }

    #[test]
    fn platform_challenge_round_trip_under_derived_keys() {
        let mut layer = LicenseLayer::new("user", "host");
        layer.derive_keys(&[0x42; 32]);
        let license_key = layer.license_key;

        let mut challenge = b"TEST_CHALLENGE\0".to_vec();
        sec::rc4_apply(&license_key, &mut challenge);

        let mut body = BytesMut::new();
        body.put_u32_le(0);
        put_blob(&mut body, BB_ENCRYPTED_DATA_BLOB, &challenge);
        body.put_bytes(0, 16); // server MAC, unchecked
        let mut pdu = BytesMut::new();
        put_preamble(&mut pdu, SERVER_PLATFORM_CHALLENGE, body.len());
        pdu.put_slice(&body);

        let event = layer.handle(pdu.freeze()).unwrap();
        let response = match event {
            LicenseEvent::Respond(r) => r,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(response[0], CLIENT_PLATFORM_CHALLENGE_RESPONSE);

        // The first blob decrypts back to the plaintext challenge.
        let mut buf = response;
        take_bytes(&mut buf, 4, "preamble").unwrap();
        let (_, encrypted) = read_blob(&mut buf).unwrap();
        let mut decrypted = encrypted.to_vec();
        sec::rc4_apply(&license_key, &mut decrypted);
        assert_eq!(&decrypted[..], b"TEST_CHALLENGE\0");
    }
}
