//! Session telemetry
//!
//! A [`Session`](super::Session) reports lifecycle and error events to the
//! observer it was constructed with instead of a process-wide logger. The
//! default [`TracingObserver`] forwards everything to `tracing`.

use std::time::Duration;
use tracing::{info, warn};

/// Discrete events emitted by a session and its loops
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Discovery is trying a port
    PortProbe {
        /// Candidate port
        port: String,
    },
    /// A port opened but failed to identify as a controller, or did not open
    HandshakeFailed {
        /// Candidate port
        port: String,
        /// Open or handshake error
        reason: String,
    },
    /// Handshake succeeded and the receive loops are running
    Connected {
        /// Port the controller answered on
        port: String,
    },
    /// No controller found; commands go to the offline transport
    Degraded,
    /// A frame could neither be parsed nor salvaged
    FrameDiscarded {
        /// Text between the markers
        body: String,
    },
    /// A chunk contained bytes that are not valid UTF-8
    DecodeError {
        /// Replaced byte sequences in the chunk
        invalid_sequences: usize,
    },
    /// The pending-frame buffer outgrew its limit and was dropped
    RemainderOverflow {
        /// Size of the dropped buffer in bytes
        len: usize,
    },
    /// A message without `qid` was dropped
    UntaggedMessage,
    /// A blocking send gave up waiting
    QueryTimeout {
        /// Query that timed out
        qid: i64,
        /// Wait that was exceeded
        timeout: Duration,
    },
    /// The device rejected a request
    WrongCommand {
        /// Query the device rejected
        qid: i64,
    },
    /// The device printed its reboot marker
    DeviceRebooted,
    /// A registered callback returned an error or panicked
    CallbackFailed {
        /// Matcher description of the failing subscription
        key: String,
        /// Error or panic message
        error: String,
    },
    /// Writing to the transport failed
    WriteFailed {
        /// Transport error
        error: String,
    },
    /// Loops stopped and transport closed
    Closed,
}

/// Telemetry sink handed to a session at construction
pub trait SessionObserver: Send + Sync {
    /// Record one event; called from the caller's thread or from the loops
    fn record_event(&self, event: &SessionEvent);

    /// Backend name, for diagnostics
    fn name(&self) -> &str;
}

/// Observer that logs every event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn record_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::PortProbe { port } => {
                info!(port = %port, "session.probe");
            }
            SessionEvent::HandshakeFailed { port, reason } => {
                info!(port = %port, reason = %reason, "session.handshake_failed");
            }
            SessionEvent::Connected { port } => {
                info!(port = %port, "session.connected");
            }
            SessionEvent::Degraded => {
                warn!("session.degraded: no USB device connected, using offline transport");
            }
            SessionEvent::FrameDiscarded { body } => {
                warn!(body = %body, "frame.discarded");
            }
            SessionEvent::DecodeError { invalid_sequences } => {
                warn!(invalid_sequences, "chunk.decode_error");
            }
            SessionEvent::RemainderOverflow { len } => {
                warn!(len, "frame.remainder_overflow");
            }
            SessionEvent::UntaggedMessage => {
                tracing::debug!("message.untagged");
            }
            SessionEvent::QueryTimeout { qid, timeout } => {
                let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                info!(qid, timeout_ms = ms, "query.timeout");
            }
            SessionEvent::WrongCommand { qid } => {
                warn!(qid, "query.wrong_command");
            }
            SessionEvent::DeviceRebooted => {
                warn!("device.rebooted");
            }
            SessionEvent::CallbackFailed { key, error } => {
                warn!(key = %key, error = %error, "callback.failed");
            }
            SessionEvent::WriteFailed { error } => {
                warn!(error = %error, "transport.write_failed");
            }
            SessionEvent::Closed => {
                info!("session.closed");
            }
        }
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

/// Observer that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {
    fn record_event(&self, _event: &SessionEvent) {}

    fn name(&self) -> &str {
        "noop"
    }
}
