//! Offline transport
//!
//! Stands in for the serial port when no device is found (degraded mode) and
//! drives the handshake and pipeline in tests. A [`MockHandle`] shares the
//! transport's state so a test can inject device output and inspect what the
//! host wrote while the session loops are running.

use serde_json::Value;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use super::{Transport, END_MARKER, QID_KEY, START_MARKER, TASK_KEY};

/// Produces device output in reaction to bytes written by the host
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

struct MockState {
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    record_writes: bool,
    /// Upper bound on bytes accepted per write call
    write_chunk: Option<usize>,
    open: bool,
    fail_writes: bool,
    responder: Option<Responder>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory [`Transport`]
pub struct MockTransport {
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Open mock with no scripted behaviour; writes are recorded
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), true)
    }

    /// Transport used when no real device could be reached
    ///
    /// Writes are accepted and discarded so a long-running degraded session
    /// does not accumulate them.
    pub fn offline() -> Self {
        Self::build("mock".to_string(), false)
    }

    fn build(name: String, record_writes: bool) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(MockState {
                inbound: VecDeque::new(),
                written: Vec::new(),
                record_writes,
                write_chunk: None,
                open: true,
                fail_writes: false,
                responder: None,
            })),
        }
    }

    /// Mock that answers like UC2 firmware (see [`simulated_firmware`])
    pub fn with_firmware(name: impl Into<String>) -> Self {
        let mock = Self::new(name);
        mock.handle().set_responder(simulated_firmware());
        mock
    }

    /// Shared handle for injecting output and inspecting writes
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "mock closed"));
        }
        if state.inbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "mock closed"));
        }
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
        }
        let chunk = state.write_chunk;
        let accepted = chunk.map_or(buf.len(), |n| buf.len().min(n.max(1)));
        let buf = &buf[..accepted];
        if state.record_writes {
            state.written.extend_from_slice(buf);
        }
        if let Some(responder) = state.responder.as_mut() {
            let reply = responder(buf);
            state.inbound.extend(reply);
        }
        drop(guard);
        if chunk.is_some() {
            thread::yield_now();
        }
        Ok(accepted)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        let state = lock(&self.state);
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "mock closed"));
        }
        Ok(u32::try_from(state.inbound.len()).unwrap_or(u32::MAX))
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        lock(&self.state).inbound.clear();
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(MockTransport {
            name: self.name.clone(),
            state: Arc::clone(&self.state),
        }))
    }

    fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    fn close(&mut self) {
        lock(&self.state).open = false;
    }
}

/// Test-side view of a [`MockTransport`]
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Queue raw device output
    pub fn push_bytes(&self, bytes: &[u8]) {
        lock(&self.state).inbound.extend(bytes.iter().copied());
    }

    /// Queue device output text
    pub fn push_str(&self, text: &str) {
        self.push_bytes(text.as_bytes());
    }

    /// Queue a JSON value wrapped in frame markers, as the firmware prints it
    pub fn push_frame(&self, value: &Value) {
        self.push_str(&frame(value));
    }

    /// Everything the host has written so far
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    /// Everything the host has written so far, as text
    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }

    /// Forget recorded writes
    pub fn clear_written(&self) {
        lock(&self.state).written.clear();
    }

    /// Install a responder invoked on every host write
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        lock(&self.state).responder = Some(Box::new(responder));
    }

    /// Accept at most `bytes` per write call, yielding after each
    pub fn set_write_chunk(&self, bytes: Option<usize>) {
        lock(&self.state).write_chunk = bytes;
    }

    /// Make subsequent writes fail
    pub fn set_fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }

    /// Bytes queued but not yet read by the host
    pub fn pending_inbound(&self) -> usize {
        lock(&self.state).inbound.len()
    }

    /// False once any clone of the transport has been closed
    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }
}

/// Wrap a JSON value in frame markers the way the firmware prints it
pub fn frame(value: &Value) -> String {
    format!("{START_MARKER}\n{value}\n{END_MARKER}\n")
}

/// Responder imitating UC2 firmware
///
/// The identity probe (`/state_get` without a `qid`) is acknowledged with a
/// framed state object; any request carrying a `qid` is answered with
/// `{"qid": <qid>, "success": 1}`. Anything else produces debug noise only.
pub fn simulated_firmware() -> Responder {
    Box::new(|written: &[u8]| {
        let text = String::from_utf8_lossy(written);
        let Ok(Value::Object(request)) = serde_json::from_str::<Value>(text.trim()) else {
            return b"E (0) cmd: could not parse request\n".to_vec();
        };
        let reply = match request.get(QID_KEY).and_then(Value::as_i64) {
            Some(qid) => serde_json::json!({ QID_KEY: qid, "success": 1 }),
            None if request.get(TASK_KEY).and_then(Value::as_str) == Some("/state_get") => {
                serde_json::json!({ "state": { "identifier_name": "UC2_Feather" } })
            }
            None => return Vec::new(),
        };
        frame(&reply).into_bytes()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_and_read_available() {
        let mut mock = MockTransport::new("mock0");
        let handle = mock.handle();
        handle.push_str("hello");
        assert_eq!(mock.bytes_to_read().unwrap(), 5);
        assert_eq!(mock.read_available().unwrap(), b"hello".to_vec());
        assert!(mock.read_available().unwrap().is_empty());
    }

    #[test]
    fn test_writes_recorded() {
        let mut mock = MockTransport::new("mock0");
        mock.write_all(b"{\"task\":\"/state_get\"}").unwrap();
        assert_eq!(mock.handle().written_text(), "{\"task\":\"/state_get\"}");
    }

    #[test]
    fn test_offline_discards_writes() {
        let mut mock = MockTransport::offline();
        let handle = mock.handle();
        for _ in 0..1000 {
            mock.write_all(br#"{"qid":1,"task":"/led_act"}"#).unwrap();
        }
        assert!(handle.written().is_empty());
    }

    #[test]
    fn test_write_chunk_limits_each_call() {
        let mut mock = MockTransport::new("mock0");
        let handle = mock.handle();
        handle.set_write_chunk(Some(2));
        assert_eq!(mock.write(b"abcde").unwrap(), 2);
        mock.write_all(b"cde").unwrap();
        assert_eq!(handle.written_text(), "abcde");
    }

    #[test]
    fn test_write_failure() {
        let mut mock = MockTransport::offline();
        mock.handle().set_fail_writes(true);
        assert!(mock.write_all(b"x").is_err());
    }

    #[test]
    fn test_close_shared_between_clones() {
        let mut mock = MockTransport::new("mock0");
        let clone = mock.try_clone().unwrap();
        mock.close();
        assert!(!clone.is_open());
        assert!(mock.write_all(b"x").is_err());
    }

    #[test]
    fn test_simulated_firmware_echoes_qid() {
        let mut mock = MockTransport::with_firmware("mock0");
        mock.write_all(br#"{"task":"/motor_act","qid":7}"#).unwrap();
        let reply = String::from_utf8(mock.read_available().unwrap()).unwrap();
        assert_eq!(reply, frame(&json!({"qid": 7, "success": 1})));
    }

    #[test]
    fn test_simulated_firmware_acknowledges_probe() {
        let mut mock = MockTransport::with_firmware("mock0");
        mock.write_all(b"{\"task\": \"/state_get\"}\n").unwrap();
        let reply = String::from_utf8(mock.read_available().unwrap()).unwrap();
        assert!(reply.lines().any(|line| line.trim() == "++"));
    }
}
