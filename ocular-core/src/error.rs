//! Domain-specific error types for the ocular protocol engine.
//!
//! All fallible operations return `Result<T, OcularError>`.
//! No panics on peer-controlled input — every error is typed, and the
//! taxonomy mirrors how far up the stack a failure is allowed to travel:
//! framing and security errors kill the connection, channel errors are
//! contained to one channel, negotiation failures carry a code the caller
//! can use to retry with a narrower security set.

use thiserror::Error;

/// The canonical error type for the ocular protocol engine.
#[derive(Debug, Error)]
pub enum OcularError {
    // ── Framing errors ───────────────────────────────────────────
    /// The outermost framer saw a malformed header or length. Fatal.
    #[error("framing error: {0}")]
    Framing(&'static str),

    /// A frame exceeded the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // ── Negotiation errors ───────────────────────────────────────
    /// The server rejected the offered security protocols.
    ///
    /// Carries the machine-checkable failure code so callers can
    /// implement the documented retry-with-reduced-security policy.
    #[error("security negotiation failed: {0}")]
    Negotiation(NegotiationFailureCode),

    /// The server granted a protocol we never offered, or the
    /// handshake violated the expected sequence.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Decode errors ────────────────────────────────────────────
    /// A structure could not be parsed from the available bytes.
    #[error("decode error in {context}: need {needed} bytes, got {available}")]
    Decode {
        context: &'static str,
        needed: usize,
        available: usize,
    },

    /// A field held a value the structure does not allow.
    #[error("malformed {context}: {reason}")]
    Malformed {
        context: &'static str,
        reason: &'static str,
    },

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    // ── Security errors ──────────────────────────────────────────
    /// MAC/signature mismatch or key-exchange failure. Always fatal,
    /// never silently retried.
    #[error("security error: {0}")]
    Security(&'static str),

    /// The remote credentials were rejected during NLA.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// TLS handshake or record-layer failure.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    // ── Channel errors ───────────────────────────────────────────
    /// A non-essential virtual channel failed to join or misbehaved.
    /// Contained: the connection continues without that channel.
    #[error("channel {name:?} error: {reason}")]
    Channel {
        name: String,
        reason: &'static str,
    },

    // ── Connection errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before the operation completed.
    #[error("connection closed")]
    Closed,
}

impl OcularError {
    /// Whether the documented fallback policy applies: retry the whole
    /// connection once with Standard RDP security.
    pub fn is_negotiation_failure(&self) -> bool {
        matches!(
            self,
            OcularError::Negotiation(_) | OcularError::AuthenticationFailed(_)
        )
    }
}

// ── NegotiationFailureCode ───────────────────────────────────────

/// Failure codes carried by an RDP Negotiation Failure response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NegotiationFailureCode {
    /// The server requires TLS and the client did not offer it.
    SslRequiredByServer = 0x01,
    /// The server is configured to refuse TLS.
    SslNotAllowedByServer = 0x02,
    /// The server has no certificate installed for TLS.
    SslCertNotOnServer = 0x03,
    /// The negotiation flags were inconsistent.
    InconsistentFlags = 0x04,
    /// The server requires network-level authentication.
    HybridRequiredByServer = 0x05,
    /// The server requires TLS with user authentication.
    SslWithUserAuthRequiredByServer = 0x06,
}

impl TryFrom<u32> for NegotiationFailureCode {
    type Error = OcularError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::SslRequiredByServer),
            0x02 => Ok(Self::SslNotAllowedByServer),
            0x03 => Ok(Self::SslCertNotOnServer),
            0x04 => Ok(Self::InconsistentFlags),
            0x05 => Ok(Self::HybridRequiredByServer),
            0x06 => Ok(Self::SslWithUserAuthRequiredByServer),
            _ => Err(OcularError::UnknownVariant {
                type_name: "NegotiationFailureCode",
                value: value as u64,
            }),
        }
    }
}

impl std::fmt::Display for NegotiationFailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::SslRequiredByServer => "server requires TLS",
            Self::SslNotAllowedByServer => "server refuses TLS",
            Self::SslCertNotOnServer => "server has no TLS certificate",
            Self::InconsistentFlags => "inconsistent negotiation flags",
            Self::HybridRequiredByServer => "server requires network-level authentication",
            Self::SslWithUserAuthRequiredByServer => "server requires TLS with user authentication",
        };
        write!(f, "{} (code {:#04x})", text, *self as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = OcularError::Decode {
            context: "tpkt header",
            needed: 4,
            available: 2,
        };
        assert!(e.to_string().contains("tpkt header"));
        assert!(e.to_string().contains('4'));

        let e = OcularError::Negotiation(NegotiationFailureCode::HybridRequiredByServer);
        assert!(e.to_string().contains("network-level"));
    }

    #[test]
    fn negotiation_code_round_trip() {
        for raw in 1u32..=6 {
            let code = NegotiationFailureCode::try_from(raw).unwrap();
            assert_eq!(code as u32, raw);
        }
        assert!(NegotiationFailureCode::try_from(0xAA).is_err());
    }

    #[test]
    fn fallback_classification() {
        assert!(
            OcularError::Negotiation(NegotiationFailureCode::SslNotAllowedByServer)
                .is_negotiation_failure()
        );
        assert!(!OcularError::Closed.is_negotiation_failure());
    }
}
