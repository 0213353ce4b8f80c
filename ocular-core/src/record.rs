//! Replayable session-event log.
//!
//! A recording collaborator feeds observer events into a
//! [`SessionRecorder`]; the resulting file holds the screen parameters
//! and every update rectangle with its (possibly still-compressed)
//! payload, timestamped relative to the start — enough to replay a
//! session without a live connection.
//!
//! Framing: a 6-byte header (`OCRS` magic + format version), then one
//! length-prefixed bincode record per event.

use std::io::{Read, Write};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::OcularError;
use crate::observer::UpdateRect;

const MAGIC: &[u8; 4] = b"OCRS";
const FORMAT_VERSION: u16 = 1;

/// Cap on a single serialized record, to bound replay allocations.
const MAX_RECORD: u32 = 64 * 1024 * 1024;

// ── Events ───────────────────────────────────────────────────────

/// One recorded session event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Screen parameters, recorded once the session is ready (and
    /// again if they change).
    Screen {
        width: u16,
        height: u16,
        color_depth: u16,
    },
    /// One display-update rectangle.
    Update {
        left: u16,
        top: u16,
        right: u16,
        bottom: u16,
        width: u16,
        height: u16,
        bits_per_pixel: u16,
        /// Payload is RLE-compressed as received.
        compressed: bool,
        data: Vec<u8>,
    },
    /// Terminal event.
    Close,
}

impl SessionEvent {
    pub fn from_update(update: &UpdateRect) -> Self {
        Self::Update {
            left: update.left,
            top: update.top,
            right: update.right,
            bottom: update.bottom,
            width: update.width,
            height: update.height,
            bits_per_pixel: update.bits_per_pixel,
            compressed: update.is_compressed,
            data: update.data.to_vec(),
        }
    }
}

/// An event plus its offset from the start of the recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub delta_ms: u64,
    pub event: SessionEvent,
}

// ── SessionRecorder ──────────────────────────────────────────────

/// Ordered event-log writer.
pub struct SessionRecorder<W: Write> {
    writer: W,
    started: Instant,
}

impl<W: Write> SessionRecorder<W> {
    pub fn new(mut writer: W) -> Result<Self, OcularError> {
        writer.write_all(MAGIC)?;
        writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
        Ok(Self {
            writer,
            started: Instant::now(),
        })
    }

    pub fn screen(&mut self, width: u16, height: u16, color_depth: u16) -> Result<(), OcularError> {
        self.record(SessionEvent::Screen {
            width,
            height,
            color_depth,
        })
    }

    pub fn update(&mut self, update: &UpdateRect) -> Result<(), OcularError> {
        self.record(SessionEvent::from_update(update))
    }

    pub fn close(&mut self) -> Result<(), OcularError> {
        self.record(SessionEvent::Close)
    }

    /// Append one event with the current timestamp.
    pub fn record(&mut self, event: SessionEvent) -> Result<(), OcularError> {
        let record = RecordedEvent {
            delta_ms: self.started.elapsed().as_millis() as u64,
            event,
        };
        let encoded = bincode::serialize(&record).map_err(|_| OcularError::Malformed {
            context: "session record",
            reason: "event does not serialize",
        })?;
        self.writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        self.writer.write_all(&encoded)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OcularError> {
        self.writer.flush()?;
        Ok(())
    }
}

// ── SessionReader ────────────────────────────────────────────────

/// Event-log reader; iterate to replay.
pub struct SessionReader<R: Read> {
    reader: R,
}

impl<R: Read> SessionReader<R> {
    pub fn new(mut reader: R) -> Result<Self, OcularError> {
        let mut header = [0u8; 6];
        reader.read_exact(&mut header)?;
        if &header[..4] != MAGIC {
            return Err(OcularError::Malformed {
                context: "session recording",
                reason: "bad magic",
            });
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != FORMAT_VERSION {
            return Err(OcularError::Malformed {
                context: "session recording",
                reason: "unsupported format version",
            });
        }
        Ok(Self { reader })
    }

    /// Read the next event; `None` at a clean end of file.
    pub fn next_event(&mut self) -> Result<Option<RecordedEvent>, OcularError> {
        let mut len_bytes = [0u8; 4];
        match self.reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_le_bytes(len_bytes);
        if len > MAX_RECORD {
            return Err(OcularError::Malformed {
                context: "session recording",
                reason: "record length exceeds the replay cap",
            });
        }
        let mut body = vec![0u8; len as usize];
        self.reader.read_exact(&mut body)?;
        let record = bincode::deserialize(&body).map_err(|_| OcularError::Malformed {
            context: "session recording",
            reason: "record does not deserialize",
        })?;
        Ok(Some(record))
    }
}

impl<R: Read> Iterator for SessionReader<R> {
    type Item = Result<RecordedEvent, OcularError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}
