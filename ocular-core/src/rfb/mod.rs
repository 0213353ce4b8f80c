//! RFB (VNC) client engine.
//!
//! The simpler sibling of the RDP path: a two-message version/security
//! negotiation, one authentication round (None, or the VNC DES
//! challenge), ServerInit, then a continuous framebuffer-update
//! request/response loop. Shares the codec helpers and the observer
//! contract with the RDP engine; there is no channel multiplexing and
//! no capability negotiation.

use bytes::Bytes;
use des::Des;
use des::cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::OcularError;
use crate::layer::CloseGuard;
use crate::observer::{CompletionCounter, Controller, RfbObserver, UpdateRect};

// Client → server message types.
const MSG_SET_PIXEL_FORMAT: u8 = 0;
const MSG_SET_ENCODINGS: u8 = 2;
const MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
const MSG_KEY_EVENT: u8 = 4;
const MSG_POINTER_EVENT: u8 = 5;
const MSG_CLIENT_CUT_TEXT: u8 = 6;

// Server → client message types.
const MSG_FRAMEBUFFER_UPDATE: u8 = 0;
const MSG_SET_COLOUR_MAP: u8 = 1;
const MSG_BELL: u8 = 2;
const MSG_SERVER_CUT_TEXT: u8 = 3;

const ENCODING_RAW: i32 = 0;

// ── Protocol version ─────────────────────────────────────────────

/// RFB protocol versions this client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RfbVersion {
    V33,
    V37,
    V38,
}

impl RfbVersion {
    pub fn as_bytes(self) -> &'static [u8; 12] {
        match self {
            Self::V33 => b"RFB 003.003\n",
            Self::V37 => b"RFB 003.007\n",
            Self::V38 => b"RFB 003.008\n",
        }
    }

    pub fn from_bytes(bytes: &[u8; 12]) -> Option<Self> {
        match bytes {
            b"RFB 003.003\n" => Some(Self::V33),
            b"RFB 003.007\n" => Some(Self::V37),
            b"RFB 003.008\n" => Some(Self::V38),
            _ => None,
        }
    }
}

// ── Security ─────────────────────────────────────────────────────

/// RFB security types this client understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RfbSecurityType {
    None = 1,
    VncAuth = 2,
}

impl RfbSecurityType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::None),
            2 => Some(Self::VncAuth),
            _ => None,
        }
    }
}

/// Answer a VNC authentication challenge.
///
/// The password's first eight bytes form a DES key with every byte's
/// bits mirrored; the 16-byte challenge is encrypted in two ECB blocks.
pub fn vnc_auth_response(password: &str, challenge: &[u8; 16]) -> [u8; 16] {
    let mut key = [0u8; 8];
    for (slot, byte) in key.iter_mut().zip(password.bytes()) {
        *slot = byte.reverse_bits();
    }
    let cipher = Des::new_from_slice(&key).expect("des key is always 8 bytes");
    let mut response = *challenge;
    for block in response.chunks_mut(8) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    response
}

// ── PixelFormat ──────────────────────────────────────────────────

/// The 16-byte RFB pixel format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RfbPixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_color: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl Default for RfbPixelFormat {
    fn default() -> Self {
        // 32-bit true color, the format every modern server honors.
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian: false,
            true_color: true,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }
}

impl RfbPixelFormat {
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0] = self.bits_per_pixel;
        bytes[1] = self.depth;
        bytes[2] = self.big_endian as u8;
        bytes[3] = self.true_color as u8;
        bytes[4..6].copy_from_slice(&self.red_max.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.green_max.to_be_bytes());
        bytes[8..10].copy_from_slice(&self.blue_max.to_be_bytes());
        bytes[10] = self.red_shift;
        bytes[11] = self.green_shift;
        bytes[12] = self.blue_shift;
        bytes
    }

    pub fn from_bytes(bytes: &[u8; 16]) -> Self {
        Self {
            bits_per_pixel: bytes[0],
            depth: bytes[1],
            big_endian: bytes[2] != 0,
            true_color: bytes[3] != 0,
            red_max: u16::from_be_bytes([bytes[4], bytes[5]]),
            green_max: u16::from_be_bytes([bytes[6], bytes[7]]),
            blue_max: u16::from_be_bytes([bytes[8], bytes[9]]),
            red_shift: bytes[10],
            green_shift: bytes[11],
            blue_shift: bytes[12],
        }
    }
}

// ── Connection handle ────────────────────────────────────────────

/// Handle to a live RFB connection.
pub struct RfbConnection {
    writer: mpsc::UnboundedSender<Vec<u8>>,
    close: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl RfbConnection {
    /// Key press/release by X keysym.
    pub fn send_key(&self, keysym: u32, down: bool) -> Result<(), OcularError> {
        let mut message = vec![MSG_KEY_EVENT, down as u8, 0, 0];
        message.extend_from_slice(&keysym.to_be_bytes());
        self.send(message)
    }

    /// Pointer position plus a button mask.
    pub fn send_pointer(&self, x: u16, y: u16, buttons: u8) -> Result<(), OcularError> {
        let mut message = vec![MSG_POINTER_EVENT, buttons];
        message.extend_from_slice(&x.to_be_bytes());
        message.extend_from_slice(&y.to_be_bytes());
        self.send(message)
    }

    /// Client clipboard content (latin-1 per the protocol).
    pub fn send_cut_text(&self, text: &str) -> Result<(), OcularError> {
        let body: Vec<u8> = text.chars().map(|c| c as u8).collect();
        let mut message = vec![MSG_CLIENT_CUT_TEXT, 0, 0, 0];
        message.extend_from_slice(&(body.len() as u32).to_be_bytes());
        message.extend_from_slice(&body);
        self.send(message)
    }

    fn send(&self, message: Vec<u8>) -> Result<(), OcularError> {
        self.writer.send(message).map_err(|_| OcularError::Closed)
    }

    pub fn close(&self) {
        let _ = self.close.send(());
    }

    pub async fn wait(self) {
        let _ = self.task.await;
    }
}

// ── RfbConnector ─────────────────────────────────────────────────

/// Factory for RFB connections against one target.
#[derive(Debug, Clone)]
pub struct RfbConnector {
    host: String,
    port: u16,
    controller: Controller,
    completions: Option<CompletionCounter>,
}

impl RfbConnector {
    pub fn new(host: &str, port: u16, controller: Controller) -> Self {
        Self {
            host: host.to_owned(),
            port,
            controller,
            completions: None,
        }
    }

    pub fn with_completion_counter(mut self, counter: CompletionCounter) -> Self {
        self.completions = Some(counter);
        self
    }

    /// Connect, authenticate, and hand the session to a spawned pump.
    /// `on_close` fires exactly once on every path.
    pub async fn connect(
        &self,
        mut observer: Box<dyn RfbObserver>,
    ) -> Result<RfbConnection, OcularError> {
        match self.establish().await {
            Ok((stream, width, height, format)) => {
                observer.on_ready(width, height);
                let (read_half, write_half) = tokio::io::split(stream);
                let (writer_tx, writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
                let (close_tx, close_rx) = mpsc::unbounded_channel::<()>();

                tokio::spawn(writer_loop(write_half, writer_rx));
                let reader = ReaderLoop {
                    read_half,
                    observer,
                    writer: writer_tx.clone(),
                    close: close_rx,
                    width,
                    height,
                    format,
                    completions: self.completions.clone(),
                };
                let task = tokio::spawn(reader.run());
                Ok(RfbConnection {
                    writer: writer_tx,
                    close: close_tx,
                    task,
                })
            }
            Err(err) => {
                observer.on_close(&err.to_string());
                if let Some(counter) = &self.completions {
                    counter.complete();
                }
                Err(err)
            }
        }
    }

    async fn establish(
        &self,
    ) -> Result<(TcpStream, u16, u16, RfbPixelFormat), OcularError> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;

        // Version exchange: answer with the lower of the two.
        let mut version_bytes = [0u8; 12];
        stream.read_exact(&mut version_bytes).await?;
        let server_version =
            RfbVersion::from_bytes(&version_bytes).ok_or(OcularError::ProtocolViolation(
                "server announced an unknown RFB version",
            ))?;
        let version = server_version.min(RfbVersion::V38);
        stream.write_all(version.as_bytes()).await?;
        debug!(?version, "rfb version agreed");

        // Security negotiation.
        let security = match version {
            RfbVersion::V33 => {
                let raw = stream.read_u32().await?;
                if raw == 0 {
                    return Err(self.read_failure_reason(&mut stream).await);
                }
                RfbSecurityType::from_u8(raw as u8).ok_or(OcularError::ProtocolViolation(
                    "server dictated an unsupported security type",
                ))?
            }
            _ => {
                let count = stream.read_u8().await?;
                if count == 0 {
                    return Err(self.read_failure_reason(&mut stream).await);
                }
                let mut offered = vec![0u8; count as usize];
                stream.read_exact(&mut offered).await?;
                let choice = offered
                    .iter()
                    .filter_map(|&t| RfbSecurityType::from_u8(t))
                    .min_by_key(|t| match t {
                        RfbSecurityType::None => 0,
                        RfbSecurityType::VncAuth => 1,
                    })
                    .ok_or(OcularError::Negotiation(
                        crate::error::NegotiationFailureCode::InconsistentFlags,
                    ))?;
                stream.write_all(&[choice as u8]).await?;
                choice
            }
        };

        // Authentication round.
        if security == RfbSecurityType::VncAuth {
            let mut challenge = [0u8; 16];
            stream.read_exact(&mut challenge).await?;
            let response = vnc_auth_response(&self.controller.password, &challenge);
            stream.write_all(&response).await?;
        }

        // SecurityResult: 3.8 always, earlier versions only after auth.
        if version == RfbVersion::V38 || security == RfbSecurityType::VncAuth {
            let result = stream.read_u32().await?;
            if result != 0 {
                let reason = if version == RfbVersion::V38 {
                    self.read_failure_reason(&mut stream).await.to_string()
                } else {
                    String::from("authentication failed")
                };
                return Err(OcularError::AuthenticationFailed(reason));
            }
        }

        // ClientInit (shared) / ServerInit.
        stream.write_all(&[1]).await?;
        let width = stream.read_u16().await?;
        let height = stream.read_u16().await?;
        let mut format_bytes = [0u8; 16];
        stream.read_exact(&mut format_bytes).await?;
        let name_len = stream.read_u32().await? as usize;
        if name_len > 4096 {
            return Err(OcularError::Malformed {
                context: "rfb server init",
                reason: "desktop name unreasonably long",
            });
        }
        let mut name = vec![0u8; name_len];
        stream.read_exact(&mut name).await?;
        info!(
            width,
            height,
            name = %String::from_utf8_lossy(&name),
            "rfb session established"
        );

        // Pin our own pixel format and the encodings we can decode.
        let format = RfbPixelFormat::default();
        let mut set_format = vec![MSG_SET_PIXEL_FORMAT, 0, 0, 0];
        set_format.extend_from_slice(&format.to_bytes());
        stream.write_all(&set_format).await?;

        let mut set_encodings = vec![MSG_SET_ENCODINGS, 0, 0, 1];
        set_encodings.extend_from_slice(&ENCODING_RAW.to_be_bytes());
        stream.write_all(&set_encodings).await?;

        // First full-screen update request.
        stream
            .write_all(&update_request(false, 0, 0, width, height))
            .await?;

        Ok((stream, width, height, format))
    }

    async fn read_failure_reason(&self, stream: &mut TcpStream) -> OcularError {
        let mut reason = String::from("server refused the connection");
        if let Ok(len) = stream.read_u32().await
            && len <= 4096
        {
            let mut text = vec![0u8; len as usize];
            if stream.read_exact(&mut text).await.is_ok() {
                reason = String::from_utf8_lossy(&text).into_owned();
            }
        }
        OcularError::AuthenticationFailed(reason)
    }
}

fn update_request(incremental: bool, x: u16, y: u16, width: u16, height: u16) -> Vec<u8> {
    let mut message = vec![MSG_FRAMEBUFFER_UPDATE_REQUEST, incremental as u8];
    message.extend_from_slice(&x.to_be_bytes());
    message.extend_from_slice(&y.to_be_bytes());
    message.extend_from_slice(&width.to_be_bytes());
    message.extend_from_slice(&height.to_be_bytes());
    message
}

async fn writer_loop(
    mut write_half: WriteHalf<TcpStream>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(message) = rx.recv().await {
        if write_half.write_all(&message).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

// ── Reader loop ──────────────────────────────────────────────────

struct ReaderLoop {
    read_half: ReadHalf<TcpStream>,
    observer: Box<dyn RfbObserver>,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    close: mpsc::UnboundedReceiver<()>,
    width: u16,
    height: u16,
    format: RfbPixelFormat,
    completions: Option<CompletionCounter>,
}

impl ReaderLoop {
    async fn run(mut self) {
        let mut close_guard = CloseGuard::new();
        let mut reason = String::from("connection closed");

        loop {
            // Only the first byte of a message is awaited cancellably;
            // once a message type is known its fields are read whole.
            let message_type = tokio::select! {
                byte = self.read_half.read_u8() => match byte {
                    Ok(byte) => byte,
                    Err(err) => {
                        reason = err.to_string();
                        break;
                    }
                },
                _ = self.close.recv() => {
                    reason = String::from("closed by consumer");
                    break;
                }
            };
            if let Err(err) = self.handle_message(message_type).await {
                reason = err.to_string();
                break;
            }
        }

        if close_guard.enter() {
            self.observer.on_close(&reason);
        }
        if let Some(counter) = &self.completions {
            let finished = counter.complete();
            debug!(finished, "rfb connection finished");
        }
    }

    async fn handle_message(&mut self, message_type: u8) -> Result<(), OcularError> {
        match message_type {
            MSG_FRAMEBUFFER_UPDATE => {
                self.read_half.read_u8().await?; // pad
                let count = self.read_half.read_u16().await?;
                for _ in 0..count {
                    self.read_rectangle().await?;
                }
                // Keep the update stream flowing.
                let request = update_request(true, 0, 0, self.width, self.height);
                self.writer.send(request).map_err(|_| OcularError::Closed)?;
                Ok(())
            }
            MSG_SET_COLOUR_MAP => {
                self.read_half.read_u8().await?; // pad
                self.read_half.read_u16().await?; // first color
                let count = self.read_half.read_u16().await? as usize;
                let mut colors = vec![0u8; count * 6];
                self.read_half.read_exact(&mut colors).await?;
                Ok(())
            }
            MSG_BELL => {
                self.observer.on_bell();
                Ok(())
            }
            MSG_SERVER_CUT_TEXT => {
                let mut pad = [0u8; 3];
                self.read_half.read_exact(&mut pad).await?;
                let len = self.read_half.read_u32().await? as usize;
                if len > 1 << 20 {
                    return Err(OcularError::Malformed {
                        context: "rfb cut text",
                        reason: "cut text unreasonably long",
                    });
                }
                let mut text = vec![0u8; len];
                self.read_half.read_exact(&mut text).await?;
                let text: String = text.iter().map(|&b| b as char).collect();
                self.observer.on_cut_text(&text);
                Ok(())
            }
            other => Err(OcularError::UnknownVariant {
                type_name: "RfbServerMessage",
                value: other as u64,
            }),
        }
    }

    async fn read_rectangle(&mut self) -> Result<(), OcularError> {
        let x = self.read_half.read_u16().await?;
        let y = self.read_half.read_u16().await?;
        let width = self.read_half.read_u16().await?;
        let height = self.read_half.read_u16().await?;
        let encoding = self.read_half.read_i32().await?;
        if encoding != ENCODING_RAW {
            // We never advertised anything else.
            warn!(encoding, "server sent an unrequested encoding");
            return Err(OcularError::ProtocolViolation(
                "unsupported framebuffer encoding",
            ));
        }
        let bytes_per_pixel = usize::from(self.format.bits_per_pixel / 8);
        let len = width as usize * height as usize * bytes_per_pixel;
        let mut data = vec![0u8; len];
        self.read_half.read_exact(&mut data).await?;

        self.observer.on_update(UpdateRect {
            left: x,
            top: y,
            right: x + width.saturating_sub(1),
            bottom: y + height.saturating_sub(1),
            width,
            height,
            bits_per_pixel: self.format.bits_per_pixel as u16,
            is_compressed: false,
            data: Bytes::from(data),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_negotiation_picks_lower() {
        assert_eq!(RfbVersion::V33.min(RfbVersion::V38), RfbVersion::V33);
        assert_eq!(RfbVersion::V38.min(RfbVersion::V38), RfbVersion::V38);
        assert_eq!(RfbVersion::from_bytes(b"RFB 003.008\n"), Some(RfbVersion::V38));
        assert_eq!(RfbVersion::from_bytes(b"RFB 009.999\n"), None);
    }

    #[test]
    fn pixel_format_round_trip() {
        let format = RfbPixelFormat::default();
        assert_eq!(RfbPixelFormat::from_bytes(&format.to_bytes()), format);

        let odd = RfbPixelFormat {
            bits_per_pixel: 16,
            depth: 15,
            big_endian: true,
            true_color: true,
            red_max: 31,
            green_max: 31,
            blue_max: 31,
            red_shift: 10,
            green_shift: 5,
            blue_shift: 0,
        };
        assert_eq!(RfbPixelFormat::from_bytes(&odd.to_bytes()), odd);
    }

    #[test]
    fn auth_response_is_deterministic_and_password_sensitive() {
        let challenge = [0x5Au8; 16];
        let a = vnc_auth_response("secret", &challenge);
        assert_eq!(a, vnc_auth_response("secret", &challenge));
        assert_ne!(a, vnc_auth_response("other", &challenge));
        assert_ne!(a, challenge);

        // Long passwords truncate to eight bytes.
        assert_eq!(
            vnc_auth_response("12345678rest-ignored", &challenge),
            vnc_auth_response("12345678", &challenge)
        );
    }

    #[test]
    fn update_request_shape() {
        let message = update_request(true, 1, 2, 800, 600);
        assert_eq!(message.len(), 10);
        assert_eq!(message[0], MSG_FRAMEBUFFER_UPDATE_REQUEST);
        assert_eq!(message[1], 1);
        assert_eq!(&message[6..8], &800u16.to_be_bytes());
    }
}
