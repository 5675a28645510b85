//! Shared helpers for the integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use uc2link_core::protocol::{
    HandshakeConfig, MockHandle, MockTransport, PortInfo, PortOpener, ProtocolError, SessionConfig,
    SessionEvent, SessionObserver, Transport,
};

/// Builds a fresh device each time its port is opened
pub type Device = Box<dyn Fn() -> MockTransport + Send + Sync>;

/// Port opener serving mock devices by port name
#[derive(Default)]
pub struct ScriptedPorts {
    candidates: Vec<PortInfo>,
    devices: HashMap<String, Device>,
    opened: Arc<Mutex<Vec<String>>>,
    handles: Arc<Mutex<Vec<MockHandle>>>,
}

/// Test-side view of a [`ScriptedPorts`] after it moved into a session
#[derive(Clone)]
pub struct PortLog {
    opened: Arc<Mutex<Vec<String>>>,
    handles: Arc<Mutex<Vec<MockHandle>>>,
}

impl PortLog {
    /// Port names in the order they were opened
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    /// Handle of the most recently opened device
    pub fn last_handle(&self) -> MockHandle {
        self.handles
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no device opened")
    }

    pub fn open_count(&self) -> usize {
        self.handles.lock().unwrap().len()
    }
}

impl ScriptedPorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listed port that refuses to open
    pub fn absent(mut self, name: &str) -> Self {
        self.candidates.push(PortInfo::named(name));
        self
    }

    /// Listed port with a device behind it
    pub fn device<F>(mut self, port: PortInfo, make: F) -> Self
    where
        F: Fn() -> MockTransport + Send + Sync + 'static,
    {
        self.devices.insert(port.name.clone(), Box::new(make));
        self.candidates.push(port);
        self
    }

    /// Listed port running the simulated firmware
    pub fn uc2(self, name: &str) -> Self {
        let owned = name.to_string();
        self.device(cp2102(name), move || MockTransport::with_firmware(owned.clone()))
    }

    /// Listed port whose device never answers the probe
    pub fn silent(self, name: &str) -> Self {
        let owned = name.to_string();
        self.device(PortInfo::named(name), move || MockTransport::new(owned.clone()))
    }

    pub fn log(&self) -> PortLog {
        PortLog {
            opened: Arc::clone(&self.opened),
            handles: Arc::clone(&self.handles),
        }
    }
}

impl PortOpener for ScriptedPorts {
    fn candidates(&self) -> Vec<PortInfo> {
        self.candidates.clone()
    }

    fn open(&self, port: &PortInfo, _baud_rate: u32) -> Result<Box<dyn Transport>, ProtocolError> {
        self.opened.lock().unwrap().push(port.name.clone());
        let make = self
            .devices
            .get(&port.name)
            .ok_or_else(|| ProtocolError::PortNotFound(port.name.clone()))?;
        let mock = make();
        self.handles.lock().unwrap().push(mock.handle());
        Ok(Box::new(mock))
    }
}

/// USB port as reported for a CP2102 bridge
pub fn cp2102(name: &str) -> PortInfo {
    PortInfo {
        name: name.to_string(),
        vid: Some(0x10c4),
        pid: Some(0xea60),
        manufacturer: Some("Silicon Labs".to_string()),
        product: Some("CP2102 USB to UART Bridge Controller".to_string()),
        serial_number: Some("0001".to_string()),
    }
}

/// Observer that keeps every event
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count<F: Fn(&SessionEvent) -> bool>(&self, pred: F) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl SessionObserver for RecordingObserver {
    fn record_event(&self, event: &SessionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Handshake timings short enough for tests
pub fn fast_handshake() -> HandshakeConfig {
    HandshakeConfig {
        warmup_ms: 0,
        drain_timeout_ms: 200,
        drain_max_empty_reads: 3,
        drain_poll_ms: 1,
        probe_timeout_ms: 150,
        probe_poll_ms: 1,
        ..HandshakeConfig::default()
    }
}

/// Session settings short enough for tests
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        timeout_ms: 1000,
        read_poll_ms: 2,
        response_poll_ms: 5,
        fire_and_forget_pause_ms: 1,
        handshake: fast_handshake(),
        ..SessionConfig::default()
    }
}

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Surface library logs when RUST_LOG is set
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
