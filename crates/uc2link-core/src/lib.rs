//! # uc2link Core Library
//!
//! Host-side driver for UC2 microscope controllers (ESP32 firmware) that
//! speak framed JSON over a USB serial link.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Port discovery with firmware identification
//! - Frame extraction from noisy, partially read serial output
//! - Query correlation with blocking and fire-and-forget sends
//! - Callbacks for unsolicited device messages
//! - An offline transport for running without hardware
//!
//! ## Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use uc2link_core::prelude::*;
//!
//! let session = Session::new(SessionConfig::for_port("/dev/ttyUSB0"));
//! session.connect()?;
//!
//! let outcome = session.post_json(
//!     "/motor_act",
//!     json!({"motor": {"steppers": [{"stepperid": 1, "position": 1000, "speed": 5000}]}}),
//! )?;
//! for response in outcome.into_result()? {
//!     println!("{:?}", response.fields());
//! }
//! # Ok::<(), uc2link_core::protocol::ProtocolError>(())
//! ```

pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{
        ConnectionState, HandshakeConfig, Message, MockTransport, PortFilter, PortInfo,
        ProtocolError, SendOutcome, Session, SessionConfig, SessionEvent, SessionObserver,
        SubscriptionId, TracingObserver, Transport,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
