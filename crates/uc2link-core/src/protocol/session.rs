//! Device session
//!
//! A [`Session`] owns one physical connection: discovery and handshake, the
//! receive loops, the correlation state and the single write path. All
//! methods take `&self` so a session can be shared between threads (and
//! wrapped in an `Arc` for [`Session::send_async`]).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::Duration;
use tracing::debug;

use super::correlation::{await_responses, tag_payload, Wait};
use super::discovery::{discover, DiscoveryRequest};
use super::pipeline::{Pipeline, PipelineSettings, Shared};
use super::{
    ConnectionState, Discovery, HandshakeConfig, HasKey, Message, MessageMatcher, MockTransport,
    PortFilter, PortInfo, PortOpener, ProtocolError, QidAllocator, SendOutcome, SessionEvent,
    SessionObserver, SubscriptionId, SystemPorts, TracingObserver, TrackerSnapshot, Transport,
    DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS, DEFAULT_TRACKER_CAPACITY, REBOOT_MARKER, TASK_KEY,
};

/// Manufacturer reported while running on the offline transport
pub const OFFLINE_MANUFACTURER: &str = "UC2Mock";

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Port to try before scanning (e.g. "/dev/ttyUSB0")
    pub port_name: Option<String>,
    /// Baud rate
    pub baud_rate: u32,
    /// Default wait for blocking sends in milliseconds
    pub timeout_ms: u64,
    /// Size of the finalized-id window
    pub tracker_capacity: usize,
    /// Reader sleep when no bytes are available
    pub read_poll_ms: u64,
    /// Sleep between tracker polls of a blocking send
    pub response_poll_ms: u64,
    /// Pause after a fire-and-forget write
    pub fire_and_forget_pause_ms: u64,
    /// Device output that signals a firmware restart
    pub reboot_marker: String,
    /// Handshake timing
    pub handshake: HandshakeConfig,
    /// Allow-list for port scanning
    pub port_filter: PortFilter,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port_name: None,
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            tracker_capacity: DEFAULT_TRACKER_CAPACITY,
            read_poll_ms: 50,
            response_poll_ms: 50,
            fire_and_forget_pause_ms: 100,
            reboot_marker: REBOOT_MARKER.to_string(),
            handshake: HandshakeConfig::default(),
            port_filter: PortFilter::default(),
        }
    }
}

impl SessionConfig {
    /// Default configuration targeting `port_name` first
    pub fn for_port(port_name: impl Into<String>) -> Self {
        Self {
            port_name: Some(port_name.into()),
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file; missing fields take defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ProtocolError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| ProtocolError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Save the configuration as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ProtocolError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Default wait for blocking sends
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Options for [`Session::post_json_with`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostOptions {
    /// Wait for responses; `false` sends fire-and-forget
    pub wait: bool,
    /// Responses required before returning
    pub expected_responses: usize,
    /// Overrides [`SessionConfig::timeout_ms`]
    pub timeout: Option<Duration>,
}

impl Default for PostOptions {
    fn default() -> Self {
        Self {
            wait: true,
            expected_responses: 1,
            timeout: None,
        }
    }
}

/// Receives POST payloads instead of the transport while installed
pub type DispatchHook = Box<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct Link {
    port: Option<PortInfo>,
    pipeline: Option<Pipeline>,
}

/// Connection to one UC2 controller
pub struct Session {
    config: SessionConfig,
    opener: Box<dyn PortOpener>,
    shared: Arc<Shared>,
    state: RwLock<ConnectionState>,
    link: Mutex<Link>,
    /// Single write path to the device
    writer: Mutex<Option<Box<dyn Transport>>>,
    qids: QidAllocator,
    dispatch_hook: RwLock<Option<DispatchHook>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    /// Session using the system's serial ports and `tracing` telemetry
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }

    /// Session reporting to `observer`
    pub fn with_observer(config: SessionConfig, observer: Arc<dyn SessionObserver>) -> Self {
        Self::with_opener(config, SystemPorts, observer)
    }

    /// Session discovering ports through `opener`
    pub fn with_opener<O>(config: SessionConfig, opener: O, observer: Arc<dyn SessionObserver>) -> Self
    where
        O: PortOpener + 'static,
    {
        let shared = Arc::new(Shared::new(config.tracker_capacity, observer));
        Self {
            config,
            opener: Box::new(opener),
            shared,
            state: RwLock::new(ConnectionState::Disconnected),
            link: Mutex::new(Link::default()),
            writer: Mutex::new(None),
            qids: QidAllocator::new(),
            dispatch_hook: RwLock::new(None),
        }
    }

    /// Discover a controller and start the receive loops
    ///
    /// Never fails because no controller was found: the session then runs in
    /// degraded mode against the offline transport and reports
    /// [`ConnectionState::Unavailable`].
    pub fn connect(&self) -> Result<ConnectionState, ProtocolError> {
        let mut link = lock(&self.link);
        if link.pipeline.as_ref().is_some_and(Pipeline::is_running) {
            return Err(ProtocolError::AlreadyConnected);
        }
        self.shared.closed.store(false, Ordering::SeqCst);

        let request = DiscoveryRequest {
            preferred: self.config.port_name.as_deref(),
            baud_rate: self.config.baud_rate,
            handshake: &self.config.handshake,
            filter: &self.config.port_filter,
        };
        let found = discover(
            self.opener.as_ref(),
            &request,
            self.shared.observer.as_ref(),
            &mut |state| self.set_state(state),
        );

        match found {
            Discovery::Connected {
                mut transport,
                port,
            } => {
                let started = transport.try_clone().map_err(ProtocolError::from).and_then(|reader| {
                    Pipeline::start(reader, Arc::clone(&self.shared), self.pipeline_settings())
                        .map_err(ProtocolError::from)
                });
                let pipeline = match started {
                    Ok(pipeline) => pipeline,
                    Err(e) => {
                        transport.close();
                        self.set_state(ConnectionState::Disconnected);
                        return Err(ProtocolError::ConnectionFailed(format!(
                            "{}: {}",
                            port.name, e
                        )));
                    }
                };

                *lock(&self.writer) = Some(transport);
                self.shared.observer.record_event(&SessionEvent::Connected {
                    port: port.name.clone(),
                });
                link.port = Some(port);
                link.pipeline = Some(pipeline);
                self.set_state(ConnectionState::Connected);
            }
            Discovery::Unavailable => {
                *lock(&self.writer) = Some(Box::new(MockTransport::offline()));
                link.port = None;
                self.set_state(ConnectionState::Unavailable);
            }
        }

        Ok(self.state())
    }

    /// Stop the loops, close the transport and run discovery again
    pub fn reconnect(&self) -> Result<ConnectionState, ProtocolError> {
        self.close();
        self.connect()
    }

    /// Stop and join both loops, then close the transport
    ///
    /// Blocking sends still waiting return [`SendOutcome::TimedOut`].
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let pipeline = lock(&self.link).pipeline.take();
        // Callbacks run on the processor thread and may query the link
        let had_pipeline = match pipeline {
            Some(mut pipeline) => {
                pipeline.stop();
                true
            }
            None => false,
        };
        let had_transport = match lock(&self.writer).take() {
            Some(mut transport) => {
                transport.close();
                true
            }
            None => false,
        };
        lock(&self.link).port = None;
        self.set_state(ConnectionState::Disconnected);
        if had_pipeline || had_transport {
            self.shared.observer.record_event(&SessionEvent::Closed);
        }
    }

    /// Send `payload` and optionally wait for `expected_responses` answers
    ///
    /// The payload must be a JSON object. Without a `qid` one is allocated
    /// and inserted into the bytes written, unlike drivers that send the
    /// payload verbatim and only track the id host-side. An explicit integer
    /// `qid` is sent as is and resets the id counter. With `expected_responses == 0`, a zero `timeout` or
    /// `blocking == false` the call returns [`SendOutcome::Sent`] after a
    /// short pause.
    pub fn send(
        &self,
        payload: Value,
        expected_responses: usize,
        timeout: Duration,
        blocking: bool,
    ) -> Result<SendOutcome, ProtocolError> {
        let epoch = self.shared.epoch();
        let (qid, fields) = tag_payload(payload, &self.qids)?;
        let bytes = serde_json::to_vec(&Value::Object(fields))?;
        self.write(&bytes)?;
        debug!(qid, bytes = bytes.len(), blocking, "send");

        if expected_responses == 0 || timeout.is_zero() || !blocking {
            thread::sleep(Duration::from_millis(self.config.fire_and_forget_pause_ms));
            return Ok(SendOutcome::Sent { qid });
        }

        Ok(await_responses(
            &self.shared,
            Wait {
                qid,
                expected: expected_responses,
                timeout,
                poll: Duration::from_millis(self.config.response_poll_ms),
                epoch,
            },
        ))
    }

    /// Send and wait for one response with the configured timeout
    pub fn request(&self, payload: Value) -> Result<SendOutcome, ProtocolError> {
        self.send(payload, 1, self.config.timeout(), true)
    }

    /// [`send`](Session::send) on the tokio blocking pool
    pub async fn send_async(
        self: Arc<Self>,
        payload: Value,
        expected_responses: usize,
        timeout: Duration,
        blocking: bool,
    ) -> Result<SendOutcome, ProtocolError> {
        tokio::task::spawn_blocking(move || {
            self.send(payload, expected_responses, timeout, blocking)
        })
        .await
        .map_err(|e| ProtocolError::TaskFailed(e.to_string()))?
    }

    /// Fire-and-forget `{"task": path}`
    pub fn get_json(&self, path: &str) -> Result<SendOutcome, ProtocolError> {
        let mut payload = Map::new();
        payload.insert(TASK_KEY.to_string(), Value::from(path));
        self.send(Value::Object(payload), 0, Duration::ZERO, false)
    }

    /// Send `payload` to `path`, waiting for one response
    pub fn post_json(&self, path: &str, payload: Value) -> Result<SendOutcome, ProtocolError> {
        self.post_json_with(path, payload, PostOptions::default())
    }

    /// Send `payload` to `path`
    ///
    /// `task` is set to `path` unless the payload already names one. While a
    /// dispatch hook is installed the payload goes to the hook instead and
    /// the result is [`SendOutcome::Forwarded`].
    pub fn post_json_with(
        &self,
        path: &str,
        payload: Value,
        options: PostOptions,
    ) -> Result<SendOutcome, ProtocolError> {
        let mut fields = match payload {
            Value::Object(fields) => fields,
            Value::Null => Map::new(),
            other => {
                return Err(ProtocolError::InvalidPayload(format!(
                    "expected a JSON object, got {}",
                    other
                )))
            }
        };
        fields
            .entry(TASK_KEY)
            .or_insert_with(|| Value::from(path));
        let payload = Value::Object(fields);

        if let Some(hook) = self
            .dispatch_hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            hook(&payload);
            return Ok(SendOutcome::Forwarded);
        }

        let timeout = options.timeout.unwrap_or_else(|| self.config.timeout());
        self.send(payload, options.expected_responses, timeout, options.wait)
    }

    /// Route POST payloads to `hook` instead of the device
    pub fn set_dispatch_hook<F>(&self, hook: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        *self
            .dispatch_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    /// Send POST payloads to the device again
    pub fn clear_dispatch_hook(&self) {
        *self
            .dispatch_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Run `callback` for every tagged message containing `key`
    pub fn register_callback<F>(&self, key: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.dispatcher.register(HasKey::new(key), callback)
    }

    /// Run `callback` for every tagged message accepted by `matcher`
    pub fn register_matcher<M, F>(&self, matcher: M, callback: F) -> SubscriptionId
    where
        M: MessageMatcher + 'static,
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.dispatcher.register(matcher, callback)
    }

    /// Remove a callback; false if it was not registered
    pub fn unregister_callback(&self, id: SubscriptionId) -> bool {
        self.shared.dispatcher.unregister(id)
    }

    /// True after the device rebooted or communication was broken off
    pub fn reset_requested(&self) -> bool {
        self.shared.reset_requested.load(Ordering::SeqCst)
    }

    /// Acknowledge the reset flag
    pub fn clear_reset(&self) {
        self.shared.reset_requested.store(false, Ordering::SeqCst);
    }

    /// Raise the reset flag and abandon blocking sends in progress
    pub fn break_current_communication(&self) {
        self.shared.request_reset();
    }

    /// Responses stored for `qid`, in arrival order
    pub fn responses(&self, qid: i64) -> Vec<Message> {
        self.shared
            .correlation()
            .responses
            .get(&qid)
            .cloned()
            .unwrap_or_default()
    }

    /// Current contents of the finalized-id window
    pub fn tracker_snapshot(&self) -> TrackerSnapshot {
        self.shared.correlation().tracker.snapshot()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// True when a controller answered the handshake
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Port of the connected controller
    pub fn port_name(&self) -> Option<String> {
        lock(&self.link).port.as_ref().map(|p| p.name.clone())
    }

    /// USB manufacturer of the connected controller
    ///
    /// Reports [`OFFLINE_MANUFACTURER`] in degraded mode.
    pub fn manufacturer(&self) -> Option<String> {
        if self.state() == ConnectionState::Unavailable {
            return Some(OFFLINE_MANUFACTURER.to_string());
        }
        lock(&self.link)
            .port
            .as_ref()
            .and_then(|p| p.manufacturer.clone())
    }

    /// Most recently issued or adopted query id
    pub fn last_qid(&self) -> i64 {
        self.qids.current()
    }

    /// Configuration the session was created with
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Name of the telemetry backend
    pub fn observer_name(&self) -> &str {
        self.shared.observer.name()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            read_poll: Duration::from_millis(self.config.read_poll_ms),
            reboot_marker: self.config.reboot_marker.clone(),
        }
    }

    fn write(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let mut writer = lock(&self.writer);
        let transport = writer.as_mut().ok_or(ProtocolError::NotConnected)?;
        let result = transport.write_all(bytes).and_then(|()| transport.flush());
        if let Err(e) = result {
            self.shared.observer.record_event(&SessionEvent::WriteFailed {
                error: e.to_string(),
            });
            return Err(e.into());
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
