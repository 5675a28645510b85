//! Frame extraction
//!
//! The firmware interleaves free-form debug output with JSON objects wrapped
//! between a start marker and an end marker:
//!
//! ```text
//! I (1234) wifi: started
//! ++
//! {"qid": 3, "state": {"identifier_name": "UC2_Feather"}}
//! --
//! ```
//!
//! Markers may be split across serial reads, so extraction is restartable:
//! whatever cannot be resolved yet is handed back as a remainder and must be
//! prepended to the next batch of text.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use tracing::debug;

use super::{Message, END_MARKER, START_MARKER};

/// Field-name pattern used to recover a `qid` from a malformed frame body.
static QID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""qid"\s*:\s*(-?\d+)"#).expect("Invalid qid pattern"));

/// Result of one extraction pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    /// Messages in stream order
    pub messages: Vec<Message>,
    /// Unresolved tail to prepend to the next batch of text
    pub remainder: String,
    /// Bodies of frames that could neither be parsed nor salvaged
    pub discarded: Vec<String>,
}

/// Split `remainder + text` into decoded messages and a new remainder.
///
/// Rules:
/// - text ahead of the first start marker is debug output and ignored
/// - a segment is cut at its first end marker; anything after it is ignored
/// - the last segment, while it has no end marker, is carried verbatim
///   (start marker included) without being decoded
/// - every other non-empty body is parsed as a JSON object, salvaged down to
///   its `qid`, or discarded
/// - a lone trailing `+` is carried so a split start marker is reassembled
pub fn extract_frames(remainder: &str, text: &str) -> Extraction {
    let mut input = String::with_capacity(remainder.len() + text.len());
    input.push_str(remainder);
    input.push_str(text);

    let mut out = Extraction::default();
    let segments: Vec<&str> = input.split(START_MARKER).collect();
    let last = segments.len() - 1;
    let mut content_start = 0;

    for (i, segment) in segments.iter().enumerate() {
        let start = content_start;
        content_start += segment.len() + START_MARKER.len();

        if i == 0 {
            continue;
        }

        let body = match segment.find(END_MARKER) {
            Some(end) => &segment[..end],
            None if i == last => {
                out.remainder.push_str(&input[start - START_MARKER.len()..]);
                continue;
            }
            None => segment,
        };

        let body = body.trim();
        if body.is_empty() {
            continue;
        }

        match decode_frame(body) {
            Some(message) => out.messages.push(message),
            None => {
                debug!(body, "discarding unsalvageable frame");
                out.discarded.push(body.to_string());
            }
        }
    }

    if out.remainder.is_empty() && input.ends_with('+') {
        out.remainder.push('+');
    }

    out
}

/// Parse a frame body, falling back to `qid` salvage
pub fn decode_frame(body: &str) -> Option<Message> {
    match serde_json::from_str::<Map<String, Value>>(body) {
        Ok(fields) => Some(Message::new(fields)),
        Err(e) => {
            let qid = salvage_qid(body)?;
            debug!(qid, error = %e, "salvaged qid from malformed frame");
            Some(Message::salvaged(qid))
        }
    }
}

/// Recover the `qid` value from text that is not valid JSON
pub fn salvage_qid(body: &str) -> Option<i64> {
    QID_PATTERN
        .captures(body)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// Remove control characters (CR, LF, TAB, NUL, ...) from decoded text
pub fn strip_control(text: &str) -> String {
    text.chars().filter(|c| !c.is_control()).collect()
}

/// Text decoded from one chunk of bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    /// Decoded text, invalid sequences replaced by U+FFFD
    pub text: String,
    /// Number of invalid byte sequences that were replaced
    pub invalid_sequences: usize,
}

/// Incremental UTF-8 decoder
///
/// A multi-byte character split across two reads is held back until the
/// rest of it arrives instead of being mangled.
#[derive(Debug, Default)]
pub struct TextDecoder {
    pending: Vec<u8>,
}

impl TextDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `chunk`, prefixed by any incomplete sequence from the last call
    pub fn decode(&mut self, chunk: &[u8]) -> Decoded {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut decoded = Decoded {
            text: String::with_capacity(bytes.len()),
            invalid_sequences: 0,
        };
        let mut rest = bytes.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    decoded.text.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    decoded.text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            decoded.text.push(char::REPLACEMENT_CHARACTER);
                            decoded.invalid_sequences += 1;
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        decoded
    }

    /// Bytes held back waiting for the rest of a character
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}
