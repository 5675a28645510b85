//! Query correlation
//!
//! Every request carries an integer `qid`. The device echoes it in each
//! response, or answers with the negated id when it rejects the command.
//! A blocking send polls the tracker window until the id has been seen often
//! enough, the rejection shows up, or the timeout passes.

use serde_json::{Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use super::pipeline::Shared;
use super::{Message, ProtocolError, SessionEvent, QID_KEY};

/// Source of query identifiers
///
/// Ids increase by one per request. A caller-supplied `qid` is adopted as
/// the new counter value, so later automatic ids continue after it and may
/// collide with ids handed out earlier.
///
/// Allocated ids are written into the outgoing payload. Older host drivers
/// sent the caller's payload untouched, leaving the device unable to echo an
/// id it never saw; inserting it is a deliberate departure from them.
#[derive(Debug, Default)]
pub struct QidAllocator {
    last: AtomicI64,
}

impl QidAllocator {
    /// Allocator whose first id is 1
    pub fn new() -> Self {
        Self::default()
    }

    /// Next identifier
    pub fn next(&self) -> i64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Reset the counter to a caller-supplied identifier
    pub fn adopt(&self, qid: i64) {
        self.last.store(qid, Ordering::SeqCst);
    }

    /// Most recently issued or adopted identifier
    pub fn current(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }
}

/// Result of a send
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Written without waiting for an answer
    Sent {
        /// Identifier the request carried
        qid: i64,
    },
    /// Enough responses arrived; all responses stored for the id so far
    Responses {
        /// Identifier the request carried
        qid: i64,
        /// Responses in arrival order
        messages: Vec<Message>,
    },
    /// The device answered with the negated id
    WrongCommand {
        /// Identifier the device rejected
        qid: i64,
    },
    /// Nothing (or not enough) arrived in time
    TimedOut {
        /// Identifier that went unanswered
        qid: i64,
    },
    /// The wait was interrupted by a reboot or an explicit break
    Abandoned {
        /// Identifier whose wait was interrupted
        qid: i64,
    },
    /// Handed to the dispatch hook instead of the transport
    Forwarded,
}

impl SendOutcome {
    /// Identifier the request was sent with
    pub fn qid(&self) -> Option<i64> {
        match self {
            SendOutcome::Sent { qid }
            | SendOutcome::Responses { qid, .. }
            | SendOutcome::WrongCommand { qid }
            | SendOutcome::TimedOut { qid }
            | SendOutcome::Abandoned { qid } => Some(*qid),
            SendOutcome::Forwarded => None,
        }
    }

    /// Responses collected by a blocking send
    pub fn responses(&self) -> Option<&[Message]> {
        match self {
            SendOutcome::Responses { messages, .. } => Some(messages),
            _ => None,
        }
    }

    /// Consume the outcome, keeping only collected responses
    pub fn into_responses(self) -> Vec<Message> {
        match self {
            SendOutcome::Responses { messages, .. } => messages,
            _ => Vec::new(),
        }
    }

    /// True for [`SendOutcome::TimedOut`]
    pub fn is_timeout(&self) -> bool {
        matches!(self, SendOutcome::TimedOut { .. })
    }

    /// Treat timeouts, rejections and interruptions as errors
    ///
    /// Fire-and-forget and forwarded sends yield an empty list.
    pub fn into_result(self) -> Result<Vec<Message>, ProtocolError> {
        match self {
            SendOutcome::Responses { messages, .. } => Ok(messages),
            SendOutcome::Sent { .. } | SendOutcome::Forwarded => Ok(Vec::new()),
            SendOutcome::WrongCommand { qid } => Err(ProtocolError::WrongCommand(qid)),
            SendOutcome::TimedOut { .. } => Err(ProtocolError::Timeout),
            SendOutcome::Abandoned { qid } => Err(ProtocolError::Interrupted(qid)),
        }
    }
}

/// Validate a payload and make sure it carries a `qid`
///
/// A missing `qid` is allocated and inserted into the payload itself.
pub(crate) fn tag_payload(
    payload: Value,
    qids: &QidAllocator,
) -> Result<(i64, Map<String, Value>), ProtocolError> {
    let Value::Object(mut fields) = payload else {
        return Err(ProtocolError::InvalidPayload(
            "payload must be a JSON object".to_string(),
        ));
    };

    let qid = match fields.get(QID_KEY) {
        Some(value) => {
            let qid = value.as_i64().ok_or_else(|| {
                ProtocolError::InvalidPayload(format!("qid must be an integer, got {}", value))
            })?;
            qids.adopt(qid);
            qid
        }
        None => {
            let qid = qids.next();
            fields.insert(QID_KEY.to_string(), Value::from(qid));
            qid
        }
    };

    Ok((qid, fields))
}

/// Parameters of one blocking wait
#[derive(Debug, Clone, Copy)]
pub(crate) struct Wait {
    pub qid: i64,
    pub expected: usize,
    pub timeout: Duration,
    pub poll: Duration,
    /// Interruption epoch observed before the request was written
    pub epoch: u64,
}

/// Poll the tracker window until `wait` is satisfied or gives up
pub(crate) fn await_responses(shared: &Shared, wait: Wait) -> SendOutcome {
    let Wait {
        qid,
        expected,
        timeout,
        poll,
        epoch,
    } = wait;
    let started = Instant::now();

    loop {
        {
            let state = shared.correlation();
            let seen = state.tracker.snapshot();
            if seen.count(qid) >= expected {
                let messages = state.responses.get(&qid).cloned().unwrap_or_default();
                return SendOutcome::Responses { qid, messages };
            }
            if qid != 0 && seen.contains(-qid) {
                drop(state);
                shared
                    .observer
                    .record_event(&SessionEvent::WrongCommand { qid });
                return SendOutcome::WrongCommand { qid };
            }
        }

        if shared.epoch() != epoch {
            return SendOutcome::Abandoned { qid };
        }

        let elapsed = started.elapsed();
        if elapsed >= timeout || shared.closed.load(Ordering::SeqCst) {
            shared
                .observer
                .record_event(&SessionEvent::QueryTimeout { qid, timeout });
            return SendOutcome::TimedOut { qid };
        }
        thread::sleep(poll.min(timeout - elapsed));
    }
}
