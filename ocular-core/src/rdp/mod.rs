//! The RDP client engine.
//!
//! ## Layer chain
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │ pdu / channels      share PDUs, virtual channel mux  │
//! │ sec / lic / nla     three security paths + licensing │
//! │ mcs  (T.125)        multiplexed channel domain       │
//! │ gcc  (T.124)        capability negotiation payloads  │
//! │ x224                connection + security negotiation│
//! │ tpkt                fast-path/slow-path framing      │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Bytes from the socket enter `tpkt` and climb only as far as a
//! complete, validated unit exists; `client` owns the whole chain and
//! drives it from a single task.
//!
//! | Module     | Purpose                                            |
//! |------------|----------------------------------------------------|
//! | `tpkt`     | Outermost framer (TPKT + fast path)                |
//! | `x224`     | X.224 connect + RDP security negotiation           |
//! | `gcc`      | Conference-create data blocks                      |
//! | `mcs`      | T.125 connect, domain PDUs, channel joins          |
//! | `sec`      | Key schedule, RC4 + MAC, client info               |
//! | `lic`      | Minimal licensing handshake                        |
//! | `nla`      | CredSSP / NTLMv2 network-level authentication      |
//! | `caps`     | Capability sets                                    |
//! | `pdu`      | Share PDUs, update stream, input events            |
//! | `channels` | Virtual-channel fragmentation/reassembly           |
//! | `client`   | Stack assembly, connector, pump task               |

pub mod caps;
pub mod channels;
pub mod client;
pub mod gcc;
pub mod lic;
pub mod mcs;
pub mod nla;
pub mod pdu;
pub mod sec;
pub mod tpkt;
pub mod x224;

// ── Re-exports ───────────────────────────────────────────────────

pub use channels::{CHANNEL_CHUNK_LENGTH, ChannelFlags, ChannelMux};
pub use client::{ClientCommand, RdpConnection, RdpConnector};
pub use gcc::{ChannelDef, ChannelOptions};
pub use mcs::GLOBAL_CHANNEL;
pub use pdu::InputEvent;
pub use tpkt::{FastPathFlags, TpktCodec, TpktFrame};
pub use x224::{Protocols, SelectedProtocol};
