//! UC2 Serial Protocol
//!
//! Implements the host side of the UC2 (ESP32) serial protocol: JSON objects
//! framed between `++` and `--` lines, mixed with free-form firmware debug
//! output, correlated to requests through an integer `qid`.
//!
//! Layering, leaves first: [`IdTracker`], the frame extractor in [`frame`],
//! discovery and handshake, the receive pipeline, the correlation engine and
//! finally [`Session`], which owns all of them.

pub mod callbacks;
mod correlation;
pub mod discovery;
mod error;
pub mod frame;
mod message;
pub mod mock;
mod observer;
mod pipeline;
pub mod serial;
mod session;
mod stream;
mod tracker;

pub use callbacks::{Dispatcher, HasKey, MessageMatcher, Predicate, SubscriptionId};
pub use correlation::{QidAllocator, SendOutcome};
pub use discovery::{ConnectionState, Discovery, HandshakeConfig, PortOpener, SystemPorts};
pub use error::ProtocolError;
pub use frame::{extract_frames, Extraction, TextDecoder};
pub use message::{Message, Origin, QID_KEY, TASK_KEY};
pub use mock::{MockHandle, MockTransport};
pub use observer::{NoopObserver, SessionEvent, SessionObserver, TracingObserver};
pub use serial::{configure_port, list_ports, open_port, PortFilter, PortInfo};
pub use session::{DispatchHook, PostOptions, Session, SessionConfig, OFFLINE_MANUFACTURER};
pub use stream::{SerialChannel, Transport};
pub use tracker::{IdTracker, TrackerSnapshot};

/// Default baud rate of the UC2 firmware
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default wait for blocking sends in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 20000;

/// Default number of finalized ids kept by the tracker
pub const DEFAULT_TRACKER_CAPACITY: usize = 100;

/// Line that opens a framed message
pub const START_MARKER: &str = "++";

/// Line that closes a framed message
pub const END_MARKER: &str = "--";

/// Upper bound on carried, still unterminated frame text
pub const MAX_PENDING_FRAME_LEN: usize = 64 * 1024;

/// Substring the firmware prints when it restarts
pub const REBOOT_MARKER: &str = "reboot";

/// Identity probe sent during the handshake
pub const STATE_PROBE_TASK: &str = "/state_get";
