//! Protocol types: errors, tracker window, outcomes, offline transport

use std::io::Write;
use uc2link_core::protocol::{
    IdTracker, MockTransport, ProtocolError, SendOutcome, Transport, DEFAULT_TRACKER_CAPACITY,
};

#[test]
fn test_protocol_error_display() {
    let err = ProtocolError::HandshakeFailed {
        port: "/dev/ttyUSB0".to_string(),
        reason: "no acknowledgement".to_string(),
    };
    assert_eq!(
        err.to_string(),
        "Handshake failed on /dev/ttyUSB0: no acknowledgement"
    );
    assert_eq!(
        ProtocolError::WrongCommand(4).to_string(),
        "Device rejected command with qid 4"
    );
}

#[test]
fn test_io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged");
    let err: ProtocolError = io.into();
    assert!(matches!(err, ProtocolError::IoError(_)));
}

#[test]
fn test_tracker_evicts_at_capacity_plus_one() {
    let mut tracker = IdTracker::default();
    assert_eq!(tracker.capacity(), DEFAULT_TRACKER_CAPACITY);

    for id in 0..DEFAULT_TRACKER_CAPACITY as i64 {
        assert_eq!(tracker.record(id), None);
    }
    assert_eq!(tracker.len(), DEFAULT_TRACKER_CAPACITY);

    assert_eq!(tracker.record(1000), Some(0));
    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.len(), DEFAULT_TRACKER_CAPACITY);
    assert!(!snapshot.contains(0));
    assert_eq!(snapshot.as_slice().first(), Some(&1));
    assert_eq!(snapshot.as_slice().last(), Some(&1000));
}

#[test]
fn test_outcome_accessors() {
    let sent = SendOutcome::Sent { qid: 3 };
    assert_eq!(sent.qid(), Some(3));
    assert_eq!(sent.responses(), None);
    assert!(sent.clone().into_result().unwrap().is_empty());

    assert_eq!(SendOutcome::Forwarded.qid(), None);
    assert!(matches!(
        SendOutcome::TimedOut { qid: 3 }.into_result(),
        Err(ProtocolError::Timeout)
    ));
}

#[test]
fn test_offline_transport_accepts_writes() {
    let mut mock = MockTransport::offline();
    let handle = mock.handle();
    assert_eq!(mock.name(), "mock");
    mock.write_all(br#"{"task":"/state_get","qid":1}"#).unwrap();
    mock.flush().unwrap();
    assert!(mock.read_available().unwrap().is_empty());
    assert!(handle.written().is_empty());

    mock.close();
    assert!(!mock.is_open());
    assert!(mock.write_all(b"x").is_err());
}
