//! Controller/Observer contract between the protocol engine and the
//! presentation layer.
//!
//! The `Controller` carries session parameters set once before connect;
//! the observers are implemented by the consumer and invoked by the
//! engine from the connection task. Neither outlives the connection.

use bitflags::bitflags;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

// ── SecurityPreference ───────────────────────────────────────────

/// Caller preference for the RDP security negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityPreference {
    /// Offer every protocol the credentials allow, let the server pick.
    #[default]
    Negotiate,
    /// Offer TLS and Standard RDP, never NLA.
    Tls,
    /// Offer Standard RDP only (the documented fallback target).
    Rdp,
}

bitflags! {
    /// RDP performance flags requested in the client info PDU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PerformanceFlags: u32 {
        const DISABLE_WALLPAPER     = 0x0000_0001;
        const DISABLE_FULL_WINDOW_DRAG = 0x0000_0002;
        const DISABLE_MENU_ANIMATIONS  = 0x0000_0004;
        const DISABLE_THEMING       = 0x0000_0008;
        const DISABLE_CURSOR_SHADOW = 0x0000_0020;
        const DISABLE_CURSOR_SETTINGS = 0x0000_0040;
        const ENABLE_FONT_SMOOTHING = 0x0000_0080;
    }
}

impl PerformanceFlags {
    /// The flag set requested for a "performance session" — everything
    /// costly turned off.
    pub fn performance_session() -> Self {
        Self::DISABLE_WALLPAPER
            | Self::DISABLE_FULL_WINDOW_DRAG
            | Self::DISABLE_MENU_ANIMATIONS
            | Self::DISABLE_THEMING
            | Self::DISABLE_CURSOR_SHADOW
            | Self::DISABLE_CURSOR_SETTINGS
    }
}

// ── Controller ───────────────────────────────────────────────────

/// Session parameters, set before connect and read-only afterwards.
#[derive(Debug, Clone)]
pub struct Controller {
    pub username: String,
    pub password: String,
    pub domain: String,
    /// Client machine name presented to the server (≤15 characters used).
    pub hostname: String,
    /// Requested desktop width in pixels.
    pub width: u16,
    /// Requested desktop height in pixels.
    pub height: u16,
    /// Requested color depth in bits per pixel (15, 16, 24 or 32).
    pub color_depth: u16,
    /// Keyboard layout code (e.g. 0x409 US, 0x40C French).
    pub keyboard_layout: u32,
    pub security: SecurityPreference,
    /// Request a session with costly visual effects disabled.
    pub performance_session: bool,
}

impl Default for Controller {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            domain: String::new(),
            hostname: String::from("ocular"),
            width: 1024,
            height: 768,
            color_depth: 16,
            keyboard_layout: 0x409,
            security: SecurityPreference::Negotiate,
            performance_session: false,
        }
    }
}

impl Controller {
    /// Whether credentials usable for network-level authentication are
    /// present. NLA is never offered without them.
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    pub fn performance_flags(&self) -> PerformanceFlags {
        if self.performance_session {
            PerformanceFlags::performance_session()
        } else {
            PerformanceFlags::empty()
        }
    }
}

// ── UpdateRect ───────────────────────────────────────────────────

/// One decoded display-update rectangle.
///
/// Coordinates are inclusive; `width`/`height` may exceed the
/// rectangle's span because servers pad bitmaps to even dimensions.
#[derive(Debug, Clone)]
pub struct UpdateRect {
    pub left: u16,
    pub top: u16,
    pub right: u16,
    pub bottom: u16,
    pub width: u16,
    pub height: u16,
    pub bits_per_pixel: u16,
    /// The payload is still RLE-compressed; decompression is the
    /// consumer's concern.
    pub is_compressed: bool,
    pub data: Bytes,
}

// ── Observers ────────────────────────────────────────────────────

/// Events delivered by an RDP connection.
///
/// `on_close` fires exactly once per connection, on every success and
/// failure path.
pub trait RdpObserver: Send {
    /// Transport stack ready: screen parameters are final.
    fn on_ready(&mut self) {}

    /// The remote session itself is usable (activation finished).
    fn on_session_ready(&mut self) {}

    /// One display-update rectangle.
    fn on_update(&mut self, _update: UpdateRect) {}

    /// Terminal. `reason` is human-readable.
    fn on_close(&mut self, _reason: &str) {}
}

/// Events delivered by an RFB connection.
pub trait RfbObserver: Send {
    /// Handshake complete: framebuffer dimensions and format are known.
    fn on_ready(&mut self, _width: u16, _height: u16) {}

    /// One framebuffer rectangle.
    fn on_update(&mut self, _update: UpdateRect) {}

    /// Server cut-text (clipboard) content.
    fn on_cut_text(&mut self, _text: &str) {}

    /// Server rang the bell.
    fn on_bell(&mut self) {}

    /// Terminal, exactly once.
    fn on_close(&mut self, _reason: &str) {}
}

// ── CompletionCounter ────────────────────────────────────────────

/// Tally of finished connections, owned by whatever orchestrates a
/// batch of them. Replaces process-global counters: clone the handle
/// into each connection, poll it from the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct CompletionCounter {
    inner: Arc<AtomicUsize>,
}

impl CompletionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished connection, returning the new total.
    pub fn complete(&self) -> usize {
        self.inner.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn finished(&self) -> usize {
        self.inner.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_detection() {
        let mut controller = Controller::default();
        assert!(!controller.has_credentials());
        controller.username = "user".into();
        assert!(!controller.has_credentials());
        controller.password = "pass".into();
        assert!(controller.has_credentials());
    }

    #[test]
    fn performance_flags_follow_controller() {
        let mut controller = Controller::default();
        assert!(controller.performance_flags().is_empty());
        controller.performance_session = true;
        assert!(
            controller
                .performance_flags()
                .contains(PerformanceFlags::DISABLE_WALLPAPER)
        );
    }

    #[test]
    fn completion_counter_tallies() {
        let counter = CompletionCounter::new();
        let clone = counter.clone();
        assert_eq!(counter.complete(), 1);
        assert_eq!(clone.complete(), 2);
        assert_eq!(counter.finished(), 2);
    }
}
