//! RDP connection driver: stack assembly, handshake sequencing, and the
//! per-connection pump task.
//!
//! One [`RdpConnector`] builds one connection at a time: dial, X.224
//! negotiation, optional TLS/CredSSP, MCS + GCC, security exchange,
//! licensing, then a spawned task that pumps frames through the layer
//! chain and drives the observer. All state for a connection lives in
//! that task; closing releases every layer exactly once.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::error::OcularError;
use crate::layer::CloseGuard;
use crate::observer::{CompletionCounter, Controller, RdpObserver, SecurityPreference};
use crate::rdp::caps::{self, CapabilitySet};
use crate::rdp::channels::{CHANNEL_CHUNK_LENGTH, ChannelMux};
use crate::rdp::gcc::{self, ChannelDef, ClientGccBlocks, ServerGccBlocks};
use crate::rdp::lic::{LicenseEvent, LicenseLayer};
use crate::rdp::mcs::{McsEvent, McsLayer};
use crate::rdp::nla;
use crate::rdp::pdu::{
    self, FastPathUpdateDecoder, InputEvent, SharePdu, UpdateEvent,
};
use crate::rdp::sec::{SecEvent, SecurityFlags, SecurityLayer};
use crate::rdp::tpkt::{FastPathFlags, TpktCodec, TpktFrame};
use crate::rdp::x224::{Protocols, SelectedProtocol, X224Layer};

// ── MaybeTls ─────────────────────────────────────────────────────

/// The socket, before or after the TLS wrap. Upper layers never see
/// the difference.
pub enum MaybeTls {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTls {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTls {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

// ── TLS setup ────────────────────────────────────────────────────

/// Accept-any certificate verification.
///
/// Remote-desktop deployments overwhelmingly run self-signed
/// certificates confirmed out of band; embedders wanting strict
/// verification swap this one type for a WebPKI verifier.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme::*;
        vec![
            RSA_PKCS1_SHA1,
            RSA_PKCS1_SHA256,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA512,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            ED25519,
        ]
    }
}

fn tls_connector() -> TlsConnector {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

// ── Commands and handles ─────────────────────────────────────────

/// Requests from the consumer into the connection task.
#[derive(Debug)]
pub enum ClientCommand {
    /// Inject user input events.
    Input(Vec<InputEvent>),
    /// Send a payload on a named virtual channel.
    ChannelData {
        name: String,
        payload: Bytes,
        compressed: bool,
    },
    /// Orderly close.
    Close,
}

/// Handle to a live RDP connection.
pub struct RdpConnection {
    commands: mpsc::UnboundedSender<ClientCommand>,
    task: JoinHandle<()>,
}

impl RdpConnection {
    /// Queue input events for the session.
    pub fn send_input(&self, events: Vec<InputEvent>) -> Result<(), OcularError> {
        self.commands
            .send(ClientCommand::Input(events))
            .map_err(|_| OcularError::Closed)
    }

    /// Queue a virtual-channel payload.
    pub fn send_channel_data(
        &self,
        name: &str,
        payload: Bytes,
        compressed: bool,
    ) -> Result<(), OcularError> {
        self.commands
            .send(ClientCommand::ChannelData {
                name: name.to_owned(),
                payload,
                compressed,
            })
            .map_err(|_| OcularError::Closed)
    }

    /// Ask the connection to close; `wait` for the task to finish.
    pub fn close(&self) {
        let _ = self.commands.send(ClientCommand::Close);
    }

    /// Await the connection task's termination.
    pub async fn wait(self) {
        let _ = self.task.await;
    }
}

// ── RdpConnector ─────────────────────────────────────────────────

/// Factory for RDP connections against one target.
#[derive(Debug, Clone)]
pub struct RdpConnector {
    host: String,
    port: u16,
    controller: Controller,
    channels: Vec<ChannelDef>,
    completions: Option<CompletionCounter>,
}

impl RdpConnector {
    pub fn new(host: &str, port: u16, controller: Controller) -> Self {
        Self {
            host: host.to_owned(),
            port,
            controller,
            channels: Vec::new(),
            completions: None,
        }
    }

    /// Request a static virtual channel during connect.
    pub fn with_channel(mut self, def: ChannelDef) -> Self {
        self.channels.push(def);
        self
    }

    /// Count finished connections into `counter` (owned by whatever
    /// orchestrates a batch of connections).
    pub fn with_completion_counter(mut self, counter: CompletionCounter) -> Self {
        self.completions = Some(counter);
        self
    }

    /// The protocols this controller allows the negotiator to offer.
    /// Hybrid security is never offered without credentials.
    fn requested_protocols(&self) -> Protocols {
        match self.controller.security {
            SecurityPreference::Rdp => Protocols::empty(),
            SecurityPreference::Tls => Protocols::SSL,
            SecurityPreference::Negotiate => {
                let mut protocols = Protocols::SSL;
                if self.controller.has_credentials() {
                    protocols |= Protocols::HYBRID;
                }
                protocols
            }
        }
    }

    /// Connect and hand the established session to a spawned pump task.
    ///
    /// On failure before the pump starts, the observer's `on_close`
    /// fires (exactly once) and the error is returned; negotiation
    /// failures keep their machine-checkable code for the fallback
    /// policy.
    pub async fn connect(
        &self,
        mut observer: Box<dyn RdpObserver>,
    ) -> Result<RdpConnection, OcularError> {
        match self.establish().await {
            Ok(session) => {
                let (command_tx, command_rx) = mpsc::unbounded_channel();
                let completions = self.completions.clone();
                let task = tokio::spawn(async move {
                    session.pump(observer, command_rx, completions).await;
                });
                Ok(RdpConnection {
                    commands: command_tx,
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

    /// The documented fallback policy: if the preferred security set is
    /// rejected at negotiation (or NLA fails), tear everything down and
    /// retry exactly once over Standard RDP security — a fresh socket
    /// and a fresh stack, never a reused transport.
    pub async fn connect_with_fallback(
        &self,
        mut build_observer: impl FnMut() -> Box<dyn RdpObserver>,
    ) -> Result<RdpConnection, OcularError> {
        match self.connect(build_observer()).await {
            Ok(connection) => Ok(connection),
            Err(err) if err.is_negotiation_failure() => {
                warn!(%err, "negotiation failed; retrying once over standard rdp security");
                let mut fallback = self.clone();
                fallback.controller.security = SecurityPreference::Rdp;
                fallback.connect(build_observer()).await
            }
            Err(err) => Err(err),
        }
    }

    // ── Handshake ────────────────────────────────────────────────

    async fn establish(&self) -> Result<EstablishedSession, OcularError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(MaybeTls::Plain(stream), TpktCodec);

        // X.224 negotiation.
        let mut x224 = X224Layer::new();
        let request = x224.connection_request(self.requested_protocols())?;
        framed.send(TpktFrame::SlowPath(request)).await?;
        let confirm = next_slow_path(&mut framed).await?;
        let selected = x224.handle_connection_confirm(confirm)?;
        info!(?selected, "security protocol negotiated");

        // TLS wrap (and CredSSP for the hybrid path).
        if selected.uses_tls() {
            framed = self.upgrade_to_tls(framed, selected).await?;
        }

        // GCC conference create inside MCS connect.
        let mut mux = ChannelMux::new(CHANNEL_CHUNK_LENGTH);
        for def in &self.channels {
            mux.register(def.clone());
        }
        let gcc_blocks =
            ClientGccBlocks::from_controller(&self.controller, selected, mux.definitions());
        let conference = gcc::conference_create_request(&gcc_blocks.encode());

        let mut mcs = McsLayer::new();
        let connect_initial = mcs.connect_initial(&conference)?;
        framed
            .send(TpktFrame::SlowPath(x224.wrap_data(&connect_initial)?))
            .await?;
        let response = x224.unwrap_data(next_slow_path(&mut framed).await?)?;
        let server_gcc = mcs.handle_connect_response(response)?;
        let server_blocks =
            ServerGccBlocks::decode(gcc::conference_create_response(server_gcc)?)?;

        // MCS domain establishment.
        framed
            .send(TpktFrame::SlowPath(
                x224.wrap_data(&mcs.erect_domain_request())?,
            ))
            .await?;
        framed
            .send(TpktFrame::SlowPath(
                x224.wrap_data(&mcs.attach_user_request())?,
            ))
            .await?;
        let confirm = x224.unwrap_data(next_slow_path(&mut framed).await?)?;
        mcs.handle_attach_user_confirm(confirm)?;

        // Channel joins: user channel, I/O channel, then the granted
        // virtual channels. Only the I/O channel is essential.
        let io_channel = server_blocks.network.io_channel;
        mux.assign_ids(&server_blocks.network.channel_ids)?;
        let mut joins = vec![mcs.user_channel(), io_channel];
        joins.extend(mux.ids());
        for channel in joins {
            framed
                .send(TpktFrame::SlowPath(
                    x224.wrap_data(&mcs.channel_join_request(channel))?,
                ))
                .await?;
            let confirm = x224.unwrap_data(next_slow_path(&mut framed).await?)?;
            let outcome = mcs.handle_channel_join_confirm(confirm)?;
            if outcome.channel == io_channel && !outcome.joined {
                return Err(OcularError::ProtocolViolation(
                    "server refused the i/o channel join",
                ));
            }
            mux.set_joined(outcome.channel, outcome.joined);
        }
        mcs.joins_complete()?;

        // Security: exchange + licensing under Standard RDP, licensing
        // only under enhanced security.
        let mut sec = SecurityLayer::new(server_blocks.security.method, server_blocks.security.level);
        if sec.state() == crate::rdp::sec::SecurityState::Negotiating {
            let public_key =
                server_blocks
                    .security
                    .public_key
                    .as_ref()
                    .ok_or(OcularError::Security(
                        "standard rdp security granted without a server certificate",
                    ))?;
            let exchange =
                sec.security_exchange(&server_blocks.security.server_random, public_key)?;
            framed
                .send(TpktFrame::SlowPath(
                    x224.wrap_data(&mcs.send_data_request(io_channel, &exchange)?)?,
                ))
                .await?;
        }

        // Client info, then the license exchange.
        let info = SecurityLayer::client_info(&self.controller);
        let wrapped = sec.wrap_flagged(SecurityFlags::INFO_PKT, &info)?;
        framed
            .send(TpktFrame::SlowPath(
                x224.wrap_data(&mcs.send_data_request(io_channel, &wrapped)?)?,
            ))
            .await?;

        let mut license = LicenseLayer::new(&self.controller.username, &self.controller.hostname);
        while !license.is_completed() {
            let frame = x224.unwrap_data(next_slow_path(&mut framed).await?)?;
            let event = match mcs.handle_data(frame)? {
                McsEvent::Data { channel, payload } if channel == io_channel => {
                    sec.recv(payload)?
                }
                McsEvent::Data { channel, .. } => {
                    warn!(channel, "ignoring channel data during licensing");
                    continue;
                }
                McsEvent::Disconnected { reason } => {
                    return Err(OcularError::ProtocolViolation(
                        "server disconnected during licensing",
                    ))
                    .inspect_err(|_| debug!(reason, "mcs ultimatum"));
                }
            };
            match event {
                SecEvent::Licensing(body) => match license.handle(body)? {
                    LicenseEvent::Completed => break,
                    LicenseEvent::Respond(response) => {
                        let wrapped =
                            sec.wrap_flagged(SecurityFlags::LICENSE_PKT, &response)?;
                        framed
                            .send(TpktFrame::SlowPath(
                                x224.wrap_data(&mcs.send_data_request(io_channel, &wrapped)?)?,
                            ))
                            .await?;
                    }
                },
                SecEvent::Ignored => continue,
                SecEvent::Data(_) => {
                    return Err(OcularError::ProtocolViolation(
                        "session data before the license exchange finished",
                    ));
                }
            }
        }
        sec.activate()?;
        debug!("transport stack established");

        Ok(EstablishedSession {
            framed,
            x224,
            mcs,
            sec,
            mux,
            io_channel,
            controller: self.controller.clone(),
        })
    }

    async fn upgrade_to_tls(
        &self,
        framed: Framed<MaybeTls, TpktCodec>,
        selected: SelectedProtocol,
    ) -> Result<Framed<MaybeTls, TpktCodec>, OcularError> {
        let parts = framed.into_parts();
        if !parts.read_buf.is_empty() {
            return Err(OcularError::ProtocolViolation(
                "server sent data before the tls handshake",
            ));
        }
        let MaybeTls::Plain(stream) = parts.io else {
            return Err(OcularError::ProtocolViolation("stream already wrapped"));
        };
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|_| OcularError::ProtocolViolation("target host is not a valid server name"))?;
        let mut tls_stream = tls_connector().connect(server_name, stream).await?;
        debug!("tls established");

        if selected.uses_nla() {
            let peer_cert = tls_stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| cert.as_ref().to_vec())
                .ok_or(OcularError::Security("tls peer presented no certificate"))?;
            nla::authenticate(
                &mut tls_stream,
                &self.controller.domain,
                &self.controller.username,
                &self.controller.password,
                &peer_cert,
            )
            .await?;
            info!("network-level authentication complete");
        }

        Ok(Framed::new(MaybeTls::Tls(Box::new(tls_stream)), TpktCodec))
    }
}

/// Await the next slow-path frame; fast path before the session is
/// established is a protocol violation.
async fn next_slow_path(
    framed: &mut Framed<MaybeTls, TpktCodec>,
) -> Result<Bytes, OcularError> {
    match framed.next().await {
        Some(Ok(TpktFrame::SlowPath(payload))) => Ok(payload),
        Some(Ok(TpktFrame::FastPath { .. })) => Err(OcularError::ProtocolViolation(
            "fast-path frame during the handshake",
        )),
        Some(Err(err)) => Err(err),
        None => Err(OcularError::Closed),
    }
}

// ── EstablishedSession ───────────────────────────────────────────

/// Session activation phase within the pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    /// Waiting for (another) Demand Active.
    AwaitDemandActive,
    /// Confirm Active sent, waiting for the server finalization.
    Finalizing,
    /// Font Map seen; updates flow.
    Running,
}

struct EstablishedSession {
    framed: Framed<MaybeTls, TpktCodec>,
    x224: X224Layer,
    mcs: McsLayer,
    sec: SecurityLayer,
    mux: ChannelMux,
    io_channel: u16,
    controller: Controller,
}

impl EstablishedSession {
    async fn pump(
        mut self,
        mut observer: Box<dyn RdpObserver>,
        mut commands: mpsc::UnboundedReceiver<ClientCommand>,
        completions: Option<CompletionCounter>,
    ) {
        let mut close_guard = CloseGuard::new();
        let mut phase = SessionPhase::AwaitDemandActive;
        let mut share_id = 0u32;
        let mut ready_fired = false;
        let mut fast_path = FastPathUpdateDecoder::new();
        let mut close_reason = String::from("connection closed");

        loop {
            tokio::select! {
                frame = self.framed.next() => {
                    let outcome = match frame {
                        None => Err(OcularError::Closed),
                        Some(Err(err)) => Err(err),
                        Some(Ok(frame)) => {
                            self.handle_frame(
                                frame,
                                &mut observer,
                                &mut phase,
                                &mut share_id,
                                &mut ready_fired,
                                &mut fast_path,
                            )
                            .await
                        }
                    };
                    match outcome {
                        Ok(FrameOutcome::Continue) => {}
                        Ok(FrameOutcome::Closed(reason)) => {
                            close_reason = reason;
                            break;
                        }
                        Err(err) => {
                            close_reason = err.to_string();
                            break;
                        }
                    }
                }
                command = commands.recv() => {
                    match command {
                        None | Some(ClientCommand::Close) => {
                            close_reason = String::from("closed by consumer");
                            break;
                        }
                        Some(command) => {
                            if let Err(err) = self.handle_command(command, phase, share_id).await {
                                close_reason = err.to_string();
                                break;
                            }
                        }
                    }
                }
            }
        }

        // Close propagates through every layer exactly once, then the
        // observer hears about it exactly once.
        self.sec.close();
        self.mcs.close();
        self.x224.close();
        if close_guard.enter() {
            observer.on_close(&close_reason);
        }
        if let Some(counter) = completions {
            let finished = counter.complete();
            debug!(finished, "connection finished");
        }
    }

    async fn handle_frame(
        &mut self,
        frame: TpktFrame,
        observer: &mut Box<dyn RdpObserver>,
        phase: &mut SessionPhase,
        share_id: &mut u32,
        ready_fired: &mut bool,
        fast_path: &mut FastPathUpdateDecoder,
    ) -> Result<FrameOutcome, OcularError> {
        match frame {
            TpktFrame::FastPath { flags, payload } => {
                let body = if flags.contains(FastPathFlags::ENCRYPTED) {
                    self.sec.decrypt_fast_path(payload)?
                } else {
                    payload
                };
                for event in fast_path.decode(body)? {
                    if let UpdateEvent::Bitmap(rects) = event {
                        for rect in rects {
                            observer.on_update(rect);
                        }
                    }
                }
                Ok(FrameOutcome::Continue)
            }
            TpktFrame::SlowPath(payload) => {
                let frame = self.x224.unwrap_data(payload)?;
                match self.mcs.handle_data(frame)? {
                    McsEvent::Disconnected { reason } => Ok(FrameOutcome::Closed(format!(
                        "server disconnected (mcs reason {reason})"
                    ))),
                    McsEvent::Data { channel, payload } if channel != self.io_channel => {
                        // Channel errors are contained; the session
                        // continues without that channel.
                        if let Err(err) = self.mux.receive(channel, payload) {
                            warn!(%err, "virtual channel error");
                        }
                        Ok(FrameOutcome::Continue)
                    }
                    McsEvent::Data { payload, .. } => match self.sec.recv(payload)? {
                        SecEvent::Ignored => Ok(FrameOutcome::Continue),
                        SecEvent::Licensing(_) => {
                            // Licensing already finished; servers may
                            // re-announce validity, which is harmless.
                            Ok(FrameOutcome::Continue)
                        }
                        SecEvent::Data(body) => {
                            self.handle_share_pdu(body, observer, phase, share_id, ready_fired)
                                .await
                        }
                    },
                }
            }
        }
    }

    async fn handle_share_pdu(
        &mut self,
        body: Bytes,
        observer: &mut Box<dyn RdpObserver>,
        phase: &mut SessionPhase,
        share_id: &mut u32,
        ready_fired: &mut bool,
    ) -> Result<FrameOutcome, OcularError> {
        match pdu::decode_share_control(body)? {
            SharePdu::DemandActive(demand) => {
                *share_id = demand.share_id;
                for set in &demand.capabilities {
                    if let CapabilitySet::VirtualChannel(vc) = set {
                        self.mux.set_chunk_size(vc.chunk_size as usize);
                    }
                }
                if !*ready_fired {
                    *ready_fired = true;
                    observer.on_ready();
                }

                // Confirm with our capabilities, then finalize.
                let capabilities = caps::client_capabilities(&self.controller);
                let source = self.mcs.user_channel();
                self.send_share(pdu::confirm_active(*share_id, source, &capabilities))
                    .await?;
                self.send_share(pdu::share_data(
                    *share_id,
                    source,
                    pdu::PDUTYPE2_SYNCHRONIZE,
                    &pdu::synchronize_body(0x03EA),
                ))
                .await?;
                self.send_share(pdu::share_data(
                    *share_id,
                    source,
                    pdu::PDUTYPE2_CONTROL,
                    &pdu::control_body(pdu::CTRLACTION_COOPERATE),
                ))
                .await?;
                self.send_share(pdu::share_data(
                    *share_id,
                    source,
                    pdu::PDUTYPE2_CONTROL,
                    &pdu::control_body(pdu::CTRLACTION_REQUEST_CONTROL),
                ))
                .await?;
                self.send_share(pdu::share_data(
                    *share_id,
                    source,
                    pdu::PDUTYPE2_FONTLIST,
                    &pdu::font_list_body(),
                ))
                .await?;
                *phase = SessionPhase::Finalizing;
                Ok(FrameOutcome::Continue)
            }
            SharePdu::DeactivateAll => {
                debug!("deactivate all; awaiting reactivation");
                *phase = SessionPhase::AwaitDemandActive;
                Ok(FrameOutcome::Continue)
            }
            SharePdu::Data(data) => match data.pdu_type2 {
                pdu::PDUTYPE2_FONTMAP => {
                    if *phase == SessionPhase::Finalizing {
                        *phase = SessionPhase::Running;
                        observer.on_session_ready();
                    }
                    Ok(FrameOutcome::Continue)
                }
                pdu::PDUTYPE2_UPDATE => {
                    if let UpdateEvent::Bitmap(rects) = pdu::decode_slow_path_update(data.body)? {
                        for rect in rects {
                            observer.on_update(rect);
                        }
                    }
                    Ok(FrameOutcome::Continue)
                }
                pdu::PDUTYPE2_SET_ERROR_INFO => {
                    let code = crate::codec::read_u32_le(&mut data.body.clone(), "error info")?;
                    if code == 0 {
                        return Ok(FrameOutcome::Continue);
                    }
                    Ok(FrameOutcome::Closed(pdu::error_info_reason(code)))
                }
                pdu::PDUTYPE2_SYNCHRONIZE
                | pdu::PDUTYPE2_CONTROL
                | pdu::PDUTYPE2_POINTER
                | pdu::PDUTYPE2_SHUTDOWN_DENIED => Ok(FrameOutcome::Continue),
                other => {
                    debug!(pdu_type2 = other, "ignoring share data pdu");
                    Ok(FrameOutcome::Continue)
                }
            },
        }
    }

    async fn handle_command(
        &mut self,
        command: ClientCommand,
        phase: SessionPhase,
        share_id: u32,
    ) -> Result<(), OcularError> {
        match command {
            ClientCommand::Input(events) => {
                if phase == SessionPhase::Running && !self.sec.is_encrypted() {
                    // In-session input rides the fast path once the
                    // session is live (and needs no RDP-layer crypto).
                    let payload = pdu::fast_path_input(&events);
                    self.framed
                        .send(TpktFrame::fast_path(FastPathFlags::empty(), payload))
                        .await?;
                } else {
                    let body = pdu::input_event_body(&events);
                    let pdu = pdu::share_data(
                        share_id,
                        self.mcs.user_channel(),
                        pdu::PDUTYPE2_INPUT,
                        &body,
                    );
                    self.send_share(pdu).await?;
                }
                Ok(())
            }
            ClientCommand::ChannelData {
                name,
                payload,
                compressed,
            } => {
                let Some(channel_id) = self.mux.channel_id(&name) else {
                    warn!(channel = %name, "dropping payload for unavailable channel");
                    return Ok(());
                };
                for chunk in self.mux.fragment(channel_id, &payload, compressed)? {
                    let wrapped = self.sec.wrap_data(&chunk)?;
                    let mcs_pdu = self.mcs.send_data_request(channel_id, &wrapped)?;
                    self.framed
                        .send(TpktFrame::SlowPath(self.x224.wrap_data(&mcs_pdu)?))
                        .await?;
                }
                Ok(())
            }
            ClientCommand::Close => Ok(()),
        }
    }

    /// Wrap a share PDU in security, MCS, and X.224 framing on the I/O
    /// channel and send it slow-path.
    async fn send_share(&mut self, share_pdu: Bytes) -> Result<(), OcularError> {
        let wrapped = self.sec.wrap_data(&share_pdu)?;
        let mcs_pdu = self.mcs.send_data_request(self.io_channel, &wrapped)?;
        self.framed
            .send(TpktFrame::SlowPath(self.x224.wrap_data(&mcs_pdu)?))
            .await?;
        Ok(())
    }
}

enum FrameOutcome {
    Continue,
    Closed(String),
}
