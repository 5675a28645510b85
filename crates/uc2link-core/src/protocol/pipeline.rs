//! Receive pipeline
//!
//! Two threads per connection: the reader moves raw chunks from the
//! transport onto a channel, the processor decodes them, extracts frames and
//! records responses. The processor is the only writer of the correlation
//! state; everybody else reads it through short read-lock snapshots.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

use super::frame::{extract_frames, strip_control, TextDecoder};
use super::{
    Dispatcher, IdTracker, Message, SessionEvent, SessionObserver, Transport,
    MAX_PENDING_FRAME_LEN,
};

/// Tracker window plus the responses collected per `qid`
#[derive(Debug, Default)]
pub(crate) struct CorrelationState {
    pub tracker: IdTracker,
    pub responses: HashMap<i64, Vec<Message>>,
}

impl CorrelationState {
    pub fn new(tracker_capacity: usize) -> Self {
        Self {
            tracker: IdTracker::new(tracker_capacity),
            responses: HashMap::new(),
        }
    }

    /// Record one response; drops stored responses whose id left the window
    pub fn record(&mut self, qid: i64, message: Message) {
        let evicted = self.tracker.record(qid);
        self.responses.entry(qid).or_default().push(message);
        if let Some(old) = evicted {
            if !self.tracker.contains(old) {
                self.responses.remove(&old);
            }
        }
    }
}

/// State shared by a session, its loops and its callers
pub(crate) struct Shared {
    pub correlation: RwLock<CorrelationState>,
    pub dispatcher: Dispatcher,
    pub observer: Arc<dyn SessionObserver>,
    pub reset_requested: AtomicBool,
    /// Bumped whenever the reset flag is raised
    pub epoch: AtomicU64,
    pub closed: AtomicBool,
}

impl Shared {
    pub fn new(tracker_capacity: usize, observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            correlation: RwLock::new(CorrelationState::new(tracker_capacity)),
            dispatcher: Dispatcher::new(),
            observer,
            reset_requested: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn correlation(&self) -> RwLockReadGuard<'_, CorrelationState> {
        self.correlation
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_response(&self, qid: i64, message: Message) {
        self.correlation
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .record(qid, message);
    }

    /// Raise the reset flag and interrupt blocking sends
    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

/// Loop timing and markers
#[derive(Debug, Clone)]
pub(crate) struct PipelineSettings {
    pub read_poll: Duration,
    pub reboot_marker: String,
}

/// Running reader and processor threads of one connection
pub(crate) struct Pipeline {
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    processor: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawn both loops; `transport` becomes the reader's handle
    pub fn start(
        transport: Box<dyn Transport>,
        shared: Arc<Shared>,
        settings: PipelineSettings,
    ) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();

        let reader = {
            let running = Arc::clone(&running);
            let poll = settings.read_poll;
            thread::Builder::new()
                .name("uc2-reader".to_string())
                .spawn(move || reader_loop(transport, tx, &running, poll))?
        };

        let processor = {
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("uc2-processor".to_string())
                .spawn(move || processor_loop(rx, &shared, &settings, &running))
        };
        let processor = match processor {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                let _ = reader.join();
                return Err(e);
            }
        };

        Ok(Self {
            running,
            reader: Some(reader),
            processor: Some(processor),
        })
    }

    /// True while both loops are meant to run
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop and join both loops
    ///
    /// Called from a callback, the processor thread is not joined; it exits
    /// on its own once the callback returns.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let current = thread::current().id();
        for handle in [self.reader.take(), self.processor.take()].into_iter().flatten() {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                debug!("pipeline: loop thread panicked");
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reader_loop(
    mut transport: Box<dyn Transport>,
    tx: Sender<Vec<u8>>,
    running: &AtomicBool,
    poll: Duration,
) {
    while running.load(Ordering::SeqCst) {
        match transport.read_available() {
            Ok(chunk) if !chunk.is_empty() => {
                if tx.send(chunk).is_err() {
                    break;
                }
            }
            Ok(_) => thread::sleep(poll),
            Err(e) => {
                debug!(port = transport.name(), error = %e, "reader: read failed");
                thread::sleep(poll);
            }
        }
    }
    debug!(port = transport.name(), "reader: stopped");
}

fn processor_loop(
    rx: Receiver<Vec<u8>>,
    shared: &Shared,
    settings: &PipelineSettings,
    running: &AtomicBool,
) {
    let mut processor = ChunkProcessor::new(settings.reboot_marker.clone());
    loop {
        match rx.recv_timeout(settings.read_poll) {
            Ok(chunk) => processor.process(&chunk, shared),
            Err(RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(
        pending = processor.remainder().len(),
        "processor: stopped"
    );
}

/// Per-connection decoding state of the processor loop
pub(crate) struct ChunkProcessor {
    decoder: TextDecoder,
    remainder: String,
    reboot_marker: String,
}

impl ChunkProcessor {
    pub fn new(reboot_marker: String) -> Self {
        Self {
            decoder: TextDecoder::new(),
            remainder: String::new(),
            reboot_marker,
        }
    }

    /// Unresolved frame text carried to the next chunk
    pub fn remainder(&self) -> &str {
        &self.remainder
    }

    /// Decode one chunk, record its responses and run callbacks
    pub fn process(&mut self, chunk: &[u8], shared: &Shared) {
        let observer = shared.observer.as_ref();

        let decoded = self.decoder.decode(chunk);
        if decoded.invalid_sequences > 0 {
            observer.record_event(&SessionEvent::DecodeError {
                invalid_sequences: decoded.invalid_sequences,
            });
        }
        let text = strip_control(&decoded.text);

        if !self.reboot_marker.is_empty() && text.contains(self.reboot_marker.as_str()) {
            shared.request_reset();
            // Frame text from before the restart will never be terminated
            self.remainder.clear();
            observer.record_event(&SessionEvent::DeviceRebooted);
            return;
        }

        let extraction = extract_frames(&self.remainder, &text);
        self.remainder = extraction.remainder;
        if self.remainder.len() > MAX_PENDING_FRAME_LEN {
            observer.record_event(&SessionEvent::RemainderOverflow {
                len: self.remainder.len(),
            });
            self.remainder.clear();
        }

        for body in extraction.discarded {
            observer.record_event(&SessionEvent::FrameDiscarded { body });
        }

        for message in extraction.messages {
            let Some(qid) = message.qid() else {
                debug!(fields = ?message.fields(), "processor: message without qid");
                observer.record_event(&SessionEvent::UntaggedMessage);
                continue;
            };
            shared.record_response(qid, message.clone());
            shared.dispatcher.dispatch(&message, observer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HasKey, MockTransport, NoopObserver};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Instant;

    fn shared(capacity: usize) -> Shared {
        Shared::new(capacity, Arc::new(NoopObserver))
    }

    #[test]
    fn test_record_prunes_evicted_responses() {
        let mut state = CorrelationState::new(2);
        state.record(1, Message::salvaged(1));
        state.record(2, Message::salvaged(2));
        state.record(3, Message::salvaged(3));
        assert!(!state.responses.contains_key(&1));
        assert_eq!(state.responses.len(), 2);
    }

    #[test]
    fn test_record_keeps_id_still_in_window() {
        let mut state = CorrelationState::new(2);
        state.record(1, Message::salvaged(1));
        state.record(1, Message::salvaged(1));
        state.record(1, Message::salvaged(1));
        assert_eq!(state.tracker.snapshot().count(1), 2);
        assert_eq!(state.responses[&1].len(), 3);
    }

    #[test]
    fn test_process_split_frame() {
        let shared = shared(10);
        let mut processor = ChunkProcessor::new("reboot".to_string());
        processor.process(b"I (10) boot\r\n++\r\n{\"qid\": 4, \"sta", &shared);
        assert!(shared.correlation().responses.is_empty());
        processor.process(b"te\": 1}\r\n--\r\n", &shared);

        let state = shared.correlation();
        assert_eq!(state.tracker.snapshot().as_slice(), &[4]);
        assert_eq!(
            state.responses[&4][0].get("state"),
            Some(&json!(1))
        );
        assert_eq!(processor.remainder(), "");
    }

    #[test]
    fn test_reboot_marker_sets_reset_flag() {
        let shared = shared(10);
        let mut processor = ChunkProcessor::new("reboot".to_string());
        processor.process(b"++{\"qid\":", &shared);
        processor.process(b"rst:0x1 reboot\r\n", &shared);
        assert!(shared.reset_requested.load(Ordering::SeqCst));
        assert_eq!(shared.epoch(), 1);
        assert_eq!(processor.remainder(), "");
        assert!(shared.correlation().tracker.is_empty());
    }

    #[test]
    fn test_untagged_message_is_not_recorded() {
        let shared = shared(10);
        let mut processor = ChunkProcessor::new("reboot".to_string());
        processor.process(b"++\n{\"state\": {}}\n--\n", &shared);
        assert!(shared.correlation().tracker.is_empty());
    }

    #[test]
    fn test_callbacks_run_for_tagged_messages() {
        let shared = shared(10);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        shared.dispatcher.register(HasKey::new("motor"), move |m| {
            sink.lock().unwrap().push(m.qid());
            Ok(())
        });
        let mut processor = ChunkProcessor::new("reboot".to_string());
        processor.process(
            b"++\n{\"qid\":1,\"motor\":{}}\n--\n++\n{\"motor\":{}}\n--\n",
            &shared,
        );
        assert_eq!(*seen.lock().unwrap(), vec![Some(1)]);
    }

    #[test]
    fn test_pipeline_start_and_stop() {
        let mock = MockTransport::new("mock0");
        let handle = mock.handle();
        let shared = Arc::new(shared(10));
        let mut pipeline = Pipeline::start(
            Box::new(mock),
            Arc::clone(&shared),
            PipelineSettings {
                read_poll: Duration::from_millis(5),
                reboot_marker: "reboot".to_string(),
            },
        )
        .unwrap();

        handle.push_frame(&json!({"qid": 9, "success": 1}));
        let deadline = Instant::now() + Duration::from_secs(2);
        while !shared.correlation().tracker.contains(9) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(shared.correlation().tracker.contains(9));

        pipeline.stop();
        assert!(!pipeline.is_running());
    }
}
