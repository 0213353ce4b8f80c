//! # ocular-core
//!
//! Client-side protocol engine for the RDP and RFB (VNC) remote-display
//! protocols: connection negotiation, authentication, multiplexed
//! transport, and decoding of server-pushed framebuffer updates for a
//! presentation layer to consume.
//!
//! This crate contains:
//! - **Codec**: the `Wire` trait plus the BER/PER encodings the
//!   connect sequence needs
//! - **Layer**: the transport-automata state machine every protocol
//!   layer embeds
//! - **RDP engine**: TPKT framing, X.224 negotiation, GCC/MCS connect,
//!   the three security paths (Standard RDP, TLS, NLA), licensing,
//!   virtual channels, and the share PDU layer
//! - **RFB engine**: version/security handshake and framebuffer-update
//!   decoding
//! - **Observer/Controller**: the contract with the presentation layer
//! - **Record**: the replayable session-event log
//! - **Error**: `OcularError` — typed, `thiserror`-based error taxonomy

pub mod codec;
pub mod error;
pub mod layer;
pub mod observer;
pub mod rdp;
pub mod record;
pub mod rfb;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use error::{NegotiationFailureCode, OcularError};
pub use layer::{CloseGuard, LayerState};
pub use observer::{
    CompletionCounter, Controller, PerformanceFlags, RdpObserver, RfbObserver,
    SecurityPreference, UpdateRect,
};
pub use rdp::{
    ChannelDef, ChannelOptions, InputEvent, Protocols, RdpConnection, RdpConnector,
    SelectedProtocol,
};
pub use record::{RecordedEvent, SessionEvent, SessionReader, SessionRecorder};
pub use rfb::{RfbConnection, RfbConnector, RfbPixelFormat, RfbVersion};
