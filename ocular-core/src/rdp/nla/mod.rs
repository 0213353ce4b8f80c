//! CredSSP — network-level authentication (the hybrid security path).
//!
//! Runs immediately after the TLS wrap and before any RDP-layer
//! traffic: DER `TSRequest` messages carry an NTLMv2 exchange, then a
//! sealed proof binding the TLS server certificate's public key (the
//! server must echo it with its first byte incremented), and finally
//! the sealed password credentials. Only then does X.224's payload
//! continue with MCS.

pub mod ntlm;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::codec::{ber, utf16};
use crate::error::OcularError;
use crate::rdp::gcc;
use ntlm::NtlmContext;

/// Highest TSRequest version this client speaks.
const TSREQUEST_VERSION: u32 = 2;

// ── TSRequest ────────────────────────────────────────────────────

/// The CredSSP envelope, DER-encoded over the TLS stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TsRequest {
    pub version: u32,
    pub nego_token: Option<Vec<u8>>,
    pub auth_info: Option<Vec<u8>>,
    pub pub_key_auth: Option<Vec<u8>>,
    pub error_code: Option<u32>,
}

/// Wrap already-encoded DER content in a context tag `[n]`.
fn context(n: u8, inner: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(inner.len() + 4);
    ber::put_context_tag(&mut buf, n, inner.len());
    buf.put_slice(inner);
    buf.to_vec()
}

/// Wrap content in a universal tag.
fn universal(tag: u8, inner: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(inner.len() + 4);
    buf.put_u8(tag);
    ber::put_length(&mut buf, inner.len());
    buf.put_slice(inner);
    buf.to_vec()
}

fn der_integer(value: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    ber::put_integer(&mut buf, value);
    buf.to_vec()
}

fn der_octet_string(data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    ber::put_octet_string(&mut buf, data);
    buf.to_vec()
}

impl TsRequest {
    pub fn with_nego_token(token: Vec<u8>) -> Self {
        Self {
            version: TSREQUEST_VERSION,
            nego_token: Some(token),
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut body = Vec::new();
        body.extend_from_slice(&context(0, &der_integer(self.version)));
        if let Some(token) = &self.nego_token {
            // negoTokens: SEQUENCE OF SEQUENCE { [0] OCTET STRING }
            let inner = context(0, &der_octet_string(token));
            let one = universal(ber::TAG_SEQUENCE, &inner);
            let seq = universal(ber::TAG_SEQUENCE, &one);
            body.extend_from_slice(&context(1, &seq));
        }
        if let Some(info) = &self.auth_info {
            body.extend_from_slice(&context(2, &der_octet_string(info)));
        }
        if let Some(proof) = &self.pub_key_auth {
            body.extend_from_slice(&context(3, &der_octet_string(proof)));
        }
        Bytes::from(universal(ber::TAG_SEQUENCE, &body))
    }

    pub fn decode(data: &[u8]) -> Result<Self, OcularError> {
        let mut buf = Bytes::copy_from_slice(data);
        ber::read_tag(&mut buf, ber::TAG_SEQUENCE, "ts request")?;

        let mut request = Self::default();
        ber::read_context_tag(&mut buf, 0, "ts request version")?;
        request.version = ber::read_integer(&mut buf, "ts request version")?;

        if ber::peek_context_tag(&buf, 1) {
            ber::read_context_tag(&mut buf, 1, "ts request nego tokens")?;
            ber::read_tag(&mut buf, ber::TAG_SEQUENCE, "ts request nego tokens")?;
            ber::read_tag(&mut buf, ber::TAG_SEQUENCE, "ts request nego tokens")?;
            ber::read_context_tag(&mut buf, 0, "ts request nego token")?;
            let token = ber::read_octet_string(&mut buf, "ts request nego token")?;
            request.nego_token = Some(token.to_vec());
        }
        if ber::peek_context_tag(&buf, 2) {
            ber::read_context_tag(&mut buf, 2, "ts request auth info")?;
            let info = ber::read_octet_string(&mut buf, "ts request auth info")?;
            request.auth_info = Some(info.to_vec());
        }
        if ber::peek_context_tag(&buf, 3) {
            ber::read_context_tag(&mut buf, 3, "ts request pub key auth")?;
            let proof = ber::read_octet_string(&mut buf, "ts request pub key auth")?;
            request.pub_key_auth = Some(proof.to_vec());
        }
        if ber::peek_context_tag(&buf, 4) {
            ber::read_context_tag(&mut buf, 4, "ts request error code")?;
            request.error_code = Some(ber::read_integer(&mut buf, "ts request error code")?);
        }
        Ok(request)
    }
}

/// DER `TSCredentials` wrapping `TSPasswordCreds`.
fn ts_password_credentials(domain: &str, user: &str, password: &str) -> Vec<u8> {
    let mut creds = Vec::new();
    creds.extend_from_slice(&context(0, &der_octet_string(&utf16(domain))));
    creds.extend_from_slice(&context(1, &der_octet_string(&utf16(user))));
    creds.extend_from_slice(&context(2, &der_octet_string(&utf16(password))));
    let password_creds = universal(ber::TAG_SEQUENCE, &creds);

    let mut outer = Vec::new();
    outer.extend_from_slice(&context(0, &der_integer(1))); // credType: password
    outer.extend_from_slice(&context(1, &der_octet_string(&password_creds)));
    universal(ber::TAG_SEQUENCE, &outer)
}

// ── CredsspClient ────────────────────────────────────────────────

/// What to do after feeding a server TSRequest into the automaton.
#[derive(Debug)]
pub enum CredsspStep {
    /// Send this and wait for another server message.
    Reply(Bytes),
    /// Send this; authentication is complete.
    Final(Bytes),
}

/// Client-side CredSSP automaton over an established NTLM context.
pub struct CredsspClient {
    ntlm: NtlmContext,
    credentials: (String, String, String),
    /// The server certificate's public key (RSAPublicKey DER).
    public_key: Vec<u8>,
}

impl CredsspClient {
    /// `peer_cert_der` is the TLS leaf certificate the stream presented.
    pub fn new(
        domain: &str,
        user: &str,
        password: &str,
        peer_cert_der: &[u8],
    ) -> Result<Self, OcularError> {
        Ok(Self {
            ntlm: NtlmContext::new(domain, user, password),
            credentials: (domain.to_owned(), user.to_owned(), password.to_owned()),
            public_key: gcc::subject_public_key_der(peer_cert_der)?,
        })
    }

    /// First message: the NTLM NEGOTIATE token.
    pub fn start(&mut self) -> Bytes {
        TsRequest::with_nego_token(self.ntlm.negotiate()).encode()
    }

    /// Feed one server TSRequest.
    pub fn step(&mut self, incoming: &[u8]) -> Result<CredsspStep, OcularError> {
        let request = TsRequest::decode(incoming)?;
        if let Some(code) = request.error_code {
            return Err(OcularError::AuthenticationFailed(format!(
                "credssp error code {code:#x}"
            )));
        }

        if let Some(token) = &request.nego_token
            && !self.ntlm.is_established()
        {
            // CHALLENGE → AUTHENTICATE plus our public-key proof.
            let authenticate = self.ntlm.authenticate(token)?;
            let proof = self.ntlm.seal(&self.public_key)?;
            let reply = TsRequest {
                version: TSREQUEST_VERSION,
                nego_token: Some(authenticate),
                pub_key_auth: Some(proof),
                ..TsRequest::default()
            };
            return Ok(CredsspStep::Reply(reply.encode()));
        }

        if let Some(proof) = &request.pub_key_auth {
            let echoed = self.ntlm.unseal(proof)?;
            if !self.verify_echoed_key(&echoed) {
                return Err(OcularError::Security(
                    "credssp public key proof mismatch",
                ));
            }
            let (domain, user, password) = &self.credentials;
            let creds = ts_password_credentials(domain, user, password);
            let sealed = self.ntlm.seal(&creds)?;
            let finish = TsRequest {
                version: TSREQUEST_VERSION,
                auth_info: Some(sealed),
                ..TsRequest::default()
            };
            debug!("credssp authentication complete");
            return Ok(CredsspStep::Final(finish.encode()));
        }

        Err(OcularError::ProtocolViolation(
            "credssp message carried nothing actionable",
        ))
    }

    /// The server echoes the public key with its first byte + 1.
    fn verify_echoed_key(&self, echoed: &[u8]) -> bool {
        if echoed.len() != self.public_key.len() || echoed.is_empty() {
            return false;
        }
        echoed[0] == self.public_key[0].wrapping_add(1) && echoed[1..] == self.public_key[1..]
    }
}

// ── Stream driver ────────────────────────────────────────────────

/// Read one complete DER message (a TSRequest) from the stream.
pub async fn read_der_message<S>(stream: &mut S) -> Result<Vec<u8>, OcularError>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let (content_len, extra_len_octets) = match head[1] {
        n if n & 0x80 == 0 => (n as usize, 0usize),
        0x81 => (0, 1),
        0x82 => (0, 2),
        _ => {
            return Err(OcularError::Malformed {
                context: "credssp der message",
                reason: "unsupported length form",
            });
        }
    };
    let mut message = head.to_vec();
    let content_len = if extra_len_octets > 0 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext[..extra_len_octets]).await?;
        message.extend_from_slice(&ext[..extra_len_octets]);
        if extra_len_octets == 1 {
            ext[0] as usize
        } else {
            u16::from_be_bytes(ext) as usize
        }
    } else {
        content_len
    };
    let start = message.len();
    message.resize(start + content_len, 0);
    stream.read_exact(&mut message[start..]).await?;
    Ok(message)
}

/// Run the whole CredSSP exchange over an established TLS stream.
pub async fn authenticate<S>(
    stream: &mut S,
    domain: &str,
    user: &str,
    password: &str,
    peer_cert_der: &[u8],
) -> Result<(), OcularError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut client = CredsspClient::new(domain, user, password, peer_cert_der)?;
    stream.write_all(&client.start()).await?;
    stream.flush().await?;

    loop {
        let incoming = read_der_message(stream).await?;
        match client.step(&incoming) {
            Ok(CredsspStep::Reply(message)) => {
                stream.write_all(&message).await?;
                stream.flush().await?;
            }
            Ok(CredsspStep::Final(message)) => {
                stream.write_all(&message).await?;
                stream.flush().await?;
                return Ok(());
            }
            Err(err) => {
                warn!(%err, "credssp exchange failed");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ts_request_round_trip() {
        let cases = [
            TsRequest::with_nego_token(b"NTLMSSP-token".to_vec()),
            TsRequest {
                version: 2,
                pub_key_auth: Some(vec![1, 2, 3, 4]),
                ..TsRequest::default()
            },
            TsRequest {
                version: 2,
                auth_info: Some(vec![9; 300]), // long-form length
                ..TsRequest::default()
            },
            TsRequest {
                version: 2,
                nego_token: Some(Vec::new()), // zero-length ≠ absent
                ..TsRequest::default()
            },
        ];
        for case in cases {
            let encoded = case.encode();
            let decoded = TsRequest::decode(&encoded).unwrap();
            assert_eq!(decoded, case);
        }
    }

    #[test]
    fn ts_request_error_code_parses() {
        // Hand-build a version-3 response carrying [4] errorCode.
        let mut body = Vec::new();
        body.extend_from_slice(&context(0, &der_integer(3)));
        body.extend_from_slice(&context(4, &der_integer(0x6D)));
        let message = universal(ber::TAG_SEQUENCE, &body);
        let decoded = TsRequest::decode(&message).unwrap();
        assert_eq!(decoded.error_code, Some(0x6D));
    }

    #[test]
    fn password_credentials_are_der_sequence() {
        let creds = ts_password_credentials("dom", "user", "pw");
        assert_eq!(creds[0], ber::TAG_SEQUENCE);
        // Outer sequence length must cover the full body.
        let mut buf = Bytes::copy_from_slice(&creds);
        let len = ber::read_tag(&mut buf, ber::TAG_SEQUENCE, "t").unwrap();
        assert_eq!(len, buf.len());
    }

    #[test]
    fn echoed_key_verification() {
        let client = CredsspClient {
            ntlm: NtlmContext::new("", "", ""),
            credentials: Default::default(),
            public_key: vec![0x30, 0x0A, 0xFF],
        };
        assert!(client.verify_echoed_key(&[0x31, 0x0A, 0xFF]));
        assert!(!client.verify_echoed_key(&[0x30, 0x0A, 0xFF]));
        assert!(!client.verify_echoed_key(&[0x31, 0x0A]));
        assert!(!client.verify_echoed_key(&[0x31, 0x0B, 0xFF]));
    }

    #[tokio::test]
    async fn der_message_reader_handles_length_forms() {
        for payload_len in [3usize, 0x90, 0x300] {
            let request = TsRequest {
                version: 2,
                auth_info: Some(vec![7; payload_len]),
                ..TsRequest::default()
            };
            let encoded = request.encode();
            let mut stream = std::io::Cursor::new(encoded.to_vec());
            let message = read_der_message(&mut stream).await.unwrap();
            assert_eq!(message, encoded.to_vec());
        }
    }
}
