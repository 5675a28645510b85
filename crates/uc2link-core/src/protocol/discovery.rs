//! Port discovery and firmware handshake
//!
//! A port is accepted once it either prints a boot-completion marker while
//! its boot output is drained, or answers the `/state_get` identity probe
//! with the acknowledgement line. A named port is tried first; when it fails
//! (or none is named) every port passing the [`PortFilter`] is tried in
//! order. When nothing answers the session falls back to the offline
//! transport instead of failing.

use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{
    configure_port, list_ports, open_port, PortFilter, PortInfo, ProtocolError, SerialChannel,
    SessionEvent, SessionObserver, Transport, STATE_PROBE_TASK, TASK_KEY,
};

/// Connection lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected, discovery not started
    Disconnected,
    /// A candidate port is being opened
    ProbingPort,
    /// Boot output of the candidate is being drained
    DrainingBoot,
    /// Identity probe sent, waiting for the acknowledgement
    VerifyingFirmware,
    /// Handshake succeeded, receive loops running
    Connected,
    /// No controller found; running against the offline transport
    Unavailable,
}

/// Timing and matching parameters of the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Pause after opening a port before reading from it
    pub warmup_ms: u64,
    /// Upper bound on time spent draining boot output
    pub drain_timeout_ms: u64,
    /// Upper bound on polls while draining
    pub drain_max_reads: usize,
    /// Consecutive polls without data after which the port counts as quiet
    pub drain_max_empty_reads: usize,
    /// Sleep between drain polls
    pub drain_poll_ms: u64,
    /// Lines inspected for the acknowledgement before giving up
    pub probe_max_lines: usize,
    /// Upper bound on time spent waiting for the acknowledgement
    pub probe_timeout_ms: u64,
    /// Sleep between probe polls
    pub probe_poll_ms: u64,
    /// Boot output fragments meaning the firmware finished starting
    pub ready_markers: Vec<String>,
    /// Line the firmware prints in answer to the probe
    pub ack_token: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            warmup_ms: 500,
            drain_timeout_ms: 4000,
            drain_max_reads: 1000,
            drain_max_empty_reads: 10,
            drain_poll_ms: 20,
            probe_max_lines: 500,
            probe_timeout_ms: 2000,
            probe_poll_ms: 5,
            ready_markers: vec!["on port 80".to_string(), "setup':'done".to_string()],
            ack_token: "++".to_string(),
        }
    }
}

/// Why draining boot output stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// A ready marker was seen; no probe needed
    FirmwareReady,
    /// Drain time ran out while data kept arriving
    TimedOut,
    /// Too many consecutive polls returned nothing
    Quiet,
    /// Poll budget used up
    ReadLimit,
}

/// Source of candidate ports and opened transports
pub trait PortOpener: Send + Sync {
    /// Ports that may host a controller, in preferred order
    fn candidates(&self) -> Vec<PortInfo>;

    /// Open and configure `port`
    fn open(&self, port: &PortInfo, baud_rate: u32) -> Result<Box<dyn Transport>, ProtocolError>;
}

/// [`PortOpener`] backed by the operating system's serial ports
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    fn candidates(&self) -> Vec<PortInfo> {
        list_ports()
    }

    fn open(&self, port: &PortInfo, baud_rate: u32) -> Result<Box<dyn Transport>, ProtocolError> {
        let mut serial = open_port(&port.name, Some(baud_rate))?;
        configure_port(serial.as_mut())?;
        Ok(Box::new(SerialChannel::new(port.name.clone(), serial)))
    }
}

/// Result of [`discover`]
pub enum Discovery {
    /// A controller answered on `port`
    Connected {
        /// Handshaken transport, ready for the receive loops
        transport: Box<dyn Transport>,
        /// Port the controller answered on
        port: PortInfo,
    },
    /// No controller found
    Unavailable,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Discovery::Connected { port, .. } => {
                f.debug_struct("Connected").field("port", port).finish()
            }
            Discovery::Unavailable => f.write_str("Unavailable"),
        }
    }
}

/// Parameters of one discovery run
pub struct DiscoveryRequest<'a> {
    /// Port to try before scanning
    pub preferred: Option<&'a str>,
    /// Baud rate for every candidate
    pub baud_rate: u32,
    /// Handshake timing
    pub handshake: &'a HandshakeConfig,
    /// Allow-list applied while scanning
    pub filter: &'a PortFilter,
}

/// Read and discard boot output until it settles or announces readiness
pub fn drain_boot(
    transport: &mut dyn Transport,
    config: &HandshakeConfig,
) -> Result<DrainOutcome, ProtocolError> {
    let started = Instant::now();
    let timeout = Duration::from_millis(config.drain_timeout_ms);
    let poll = Duration::from_millis(config.drain_poll_ms);
    let keep = config
        .ready_markers
        .iter()
        .map(String::len)
        .max()
        .unwrap_or(0);

    let mut seen = String::new();
    let mut empty_reads = 0;

    for _ in 0..config.drain_max_reads {
        let chunk = transport.read_available()?;
        if chunk.is_empty() {
            empty_reads += 1;
            if empty_reads >= config.drain_max_empty_reads {
                return Ok(DrainOutcome::Quiet);
            }
        } else {
            empty_reads = 0;
            debug!(port = transport.name(), bytes = chunk.len(), "drain: boot output");
            seen.push_str(&String::from_utf8_lossy(&chunk));
            if config
                .ready_markers
                .iter()
                .any(|marker| seen.contains(marker.as_str()))
            {
                return Ok(DrainOutcome::FirmwareReady);
            }
            // Only a marker split across reads needs older text
            keep_tail(&mut seen, keep);
        }

        if started.elapsed() >= timeout {
            return Ok(DrainOutcome::TimedOut);
        }
        thread::sleep(poll);
    }

    Ok(DrainOutcome::ReadLimit)
}

fn keep_tail(text: &mut String, keep: usize) {
    if text.len() <= keep {
        return;
    }
    let mut cut = text.len() - keep;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text.drain(..cut);
}

/// Send the identity probe and wait for the acknowledgement line
///
/// Input still buffered from the boot drain is dropped first, so a stale
/// `++` line cannot pass for the acknowledgement. The probe goes out as
/// `{"task": "/state_get"}` plus a newline, spaced the way the firmware's
/// own host tools send it. On success the residual probe answer is drained
/// so the receive loops start on a clean stream.
pub fn verify_firmware(
    transport: &mut dyn Transport,
    config: &HandshakeConfig,
) -> Result<bool, ProtocolError> {
    transport.clear_input_buffer()?;
    let probe = format!("{{\"{TASK_KEY}\": \"{STATE_PROBE_TASK}\"}}\n");
    transport.write_all(probe.as_bytes())?;
    transport.flush()?;

    let started = Instant::now();
    let timeout = Duration::from_millis(config.probe_timeout_ms);
    let poll = Duration::from_millis(config.probe_poll_ms);
    let ack = config.ack_token.as_str();

    let mut partial = String::new();
    let mut lines = 0;

    while lines < config.probe_max_lines && started.elapsed() < timeout {
        let chunk = transport.read_available()?;
        if chunk.is_empty() {
            thread::sleep(poll);
            continue;
        }
        partial.push_str(&String::from_utf8_lossy(&chunk));

        let mut acknowledged = false;
        while let Some(newline) = partial.find('\n') {
            let line: String = partial.drain(..=newline).collect();
            lines += 1;
            if line.trim() == ack {
                acknowledged = true;
                break;
            }
            if lines >= config.probe_max_lines {
                break;
            }
        }
        if !acknowledged && partial.trim() == ack {
            acknowledged = true;
        }

        if acknowledged {
            let residual = drain_boot(transport, config)?;
            debug!(port = transport.name(), ?residual, "probe acknowledged");
            return Ok(true);
        }
    }

    Ok(false)
}

/// Open `port` and run the handshake on it
pub fn try_port(
    opener: &dyn PortOpener,
    port: &PortInfo,
    baud_rate: u32,
    config: &HandshakeConfig,
    on_state: &mut dyn FnMut(ConnectionState),
) -> Result<Box<dyn Transport>, ProtocolError> {
    on_state(ConnectionState::ProbingPort);
    let mut transport = opener.open(port, baud_rate)?;
    thread::sleep(Duration::from_millis(config.warmup_ms));

    on_state(ConnectionState::DrainingBoot);
    if drain_boot(transport.as_mut(), config)? == DrainOutcome::FirmwareReady {
        return Ok(transport);
    }

    on_state(ConnectionState::VerifyingFirmware);
    if verify_firmware(transport.as_mut(), config)? {
        return Ok(transport);
    }

    transport.close();
    Err(ProtocolError::HandshakeFailed {
        port: port.name.clone(),
        reason: "no acknowledgement to identity probe".to_string(),
    })
}

/// Find a port with a controller on it
///
/// Never fails: every open or handshake error is reported to `observer` and
/// the next candidate is tried. [`Discovery::Unavailable`] means the caller
/// should continue in degraded mode.
pub fn discover(
    opener: &dyn PortOpener,
    request: &DiscoveryRequest<'_>,
    observer: &dyn SessionObserver,
    on_state: &mut dyn FnMut(ConnectionState),
) -> Discovery {
    let candidates = opener.candidates();

    if let Some(name) = request.preferred {
        let port = candidates
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .unwrap_or_else(|| PortInfo::named(name));
        if let Some(transport) = attempt(opener, &port, request, observer, on_state) {
            return Discovery::Connected { transport, port };
        }
    }

    for port in candidates.iter().filter(|p| request.filter.matches(p)) {
        if request.preferred == Some(port.name.as_str()) {
            continue;
        }
        if let Some(transport) = attempt(opener, port, request, observer, on_state) {
            return Discovery::Connected {
                transport,
                port: port.clone(),
            };
        }
    }

    observer.record_event(&SessionEvent::Degraded);
    on_state(ConnectionState::Unavailable);
    Discovery::Unavailable
}

fn attempt(
    opener: &dyn PortOpener,
    port: &PortInfo,
    request: &DiscoveryRequest<'_>,
    observer: &dyn SessionObserver,
    on_state: &mut dyn FnMut(ConnectionState),
) -> Option<Box<dyn Transport>> {
    observer.record_event(&SessionEvent::PortProbe {
        port: port.name.clone(),
    });
    match try_port(opener, port, request.baud_rate, request.handshake, on_state) {
        Ok(transport) => Some(transport),
        Err(e) => {
            observer.record_event(&SessionEvent::HandshakeFailed {
                port: port.name.clone(),
                reason: e.to_string(),
            });
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MockTransport, NoopObserver};

    fn fast() -> HandshakeConfig {
        HandshakeConfig {
            warmup_ms: 0,
            drain_timeout_ms: 200,
            drain_max_empty_reads: 3,
            drain_poll_ms: 1,
            probe_timeout_ms: 200,
            probe_poll_ms: 1,
            ..HandshakeConfig::default()
        }
    }

    #[test]
    fn test_drain_quiet_port() {
        let mut mock = MockTransport::new("mock0");
        assert_eq!(drain_boot(&mut mock, &fast()).unwrap(), DrainOutcome::Quiet);
    }

    #[test]
    fn test_drain_ready_marker() {
        let mut mock = MockTransport::new("mock0");
        mock.handle()
            .push_str("ets Jun  8 2016\nI (512) wifi: started\nHTTP server on port 80\n");
        assert_eq!(
            drain_boot(&mut mock, &fast()).unwrap(),
            DrainOutcome::FirmwareReady
        );
    }

    #[test]
    fn test_drain_consumes_output() {
        let mut mock = MockTransport::new("mock0");
        let handle = mock.handle();
        handle.push_str("rst:0x1 (POWERON_RESET)\n");
        drain_boot(&mut mock, &fast()).unwrap();
        assert_eq!(handle.pending_inbound(), 0);
    }

    #[test]
    fn test_keep_tail_respects_char_boundary() {
        let mut text = "aé€b".to_string();
        keep_tail(&mut text, 2);
        assert_eq!(text, "b");
        let mut short = "ab".to_string();
        keep_tail(&mut short, 4);
        assert_eq!(short, "ab");
    }

    #[test]
    fn test_verify_with_simulated_firmware() {
        let mut mock = MockTransport::with_firmware("mock0");
        let handle = mock.handle();
        assert!(verify_firmware(&mut mock, &fast()).unwrap());
        assert_eq!(handle.written_text(), "{\"task\": \"/state_get\"}\n");
        assert_eq!(handle.pending_inbound(), 0);
    }

    #[test]
    fn test_verify_ignores_stale_ack() {
        let mut mock = MockTransport::new("mock0");
        let handle = mock.handle();
        handle.push_str("I (700) boot: leftover\n++\n");
        assert!(!verify_firmware(&mut mock, &fast()).unwrap());
        assert_eq!(handle.pending_inbound(), 0);
    }

    #[test]
    fn test_verify_rejects_silent_port() {
        let mut mock = MockTransport::new("mock0");
        assert!(!verify_firmware(&mut mock, &fast()).unwrap());
    }

    #[test]
    fn test_verify_ack_split_across_reads() {
        let mut mock = MockTransport::new("mock0");
        let handle = mock.handle();
        let mut first = true;
        handle.set_responder(move |_| {
            if first {
                first = false;
                b"I (900) debug line\n+".to_vec()
            } else {
                Vec::new()
            }
        });
        // Second half of the ack arrives after the probe was written
        let pusher = handle.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            pusher.push_str("+\n{\"state\":{}}\n--\n");
        });
        assert!(verify_firmware(&mut mock, &fast()).unwrap());
        t.join().unwrap();
    }

    #[test]
    fn test_discover_without_candidates_degrades() {
        struct NoPorts;
        impl PortOpener for NoPorts {
            fn candidates(&self) -> Vec<PortInfo> {
                Vec::new()
            }
            fn open(&self, port: &PortInfo, _: u32) -> Result<Box<dyn Transport>, ProtocolError> {
                Err(ProtocolError::PortNotFound(port.name.clone()))
            }
        }

        let config = fast();
        let filter = PortFilter::default();
        let request = DiscoveryRequest {
            preferred: None,
            baud_rate: 115200,
            handshake: &config,
            filter: &filter,
        };
        let mut states = Vec::new();
        let found = discover(&NoPorts, &request, &NoopObserver, &mut |s| states.push(s));
        assert!(matches!(found, Discovery::Unavailable));
        assert_eq!(states, vec![ConnectionState::Unavailable]);
    }
}
