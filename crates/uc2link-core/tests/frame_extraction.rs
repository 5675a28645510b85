//! Frame extraction over realistic firmware output

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use uc2link_core::protocol::frame::{extract_frames, strip_control, TextDecoder};
use uc2link_core::protocol::Message;

fn values(messages: &[Message]) -> Vec<Value> {
    messages.iter().map(|m| m.clone().into_value()).collect()
}

/// Feed `pieces` through the extractor the way the processor loop does
fn run(pieces: &[&str]) -> (Vec<Value>, String) {
    let mut remainder = String::new();
    let mut out = Vec::new();
    for piece in pieces {
        let extraction = extract_frames(&remainder, piece);
        out.extend(values(&extraction.messages));
        remainder = extraction.remainder;
    }
    (out, remainder)
}

#[test]
fn test_split_at_every_offset() {
    let text = "++{\"qid\":5,\"state\":{\"identifier_name\":\"UC2_Feather\",\"pindef\":\"UC2\"}}--";
    let expected = vec![json!({"qid": 5, "state": {"identifier_name": "UC2_Feather", "pindef": "UC2"}})];

    for offset in 1..text.len() {
        let (head, tail) = text.split_at(offset);
        let (messages, remainder) = run(&[head, tail]);
        assert_eq!(messages, expected, "split at {}", offset);
        assert_eq!(remainder, "", "split at {}", offset);
    }
}

#[test]
fn test_two_splits_with_debug_noise() {
    let text = "I (310) cpu_start: Starting scheduler.++{\"qid\":1,\"success\":1}--[I][motor] idle++{\"qid\":2,\"success\":1}--";
    let expected = vec![json!({"qid": 1, "success": 1}), json!({"qid": 2, "success": 1})];

    for first in 1..text.len() - 1 {
        for second in first + 1..text.len() {
            let pieces = [&text[..first], &text[first..second], &text[second..]];
            let (messages, remainder) = run(&pieces);
            assert_eq!(messages, expected, "split at {} and {}", first, second);
            assert_eq!(remainder, "");
        }
    }
}

#[test]
fn test_salvage_yields_only_qid() {
    let (messages, remainder) = run(&["++{\"qid\": 9, \"motor\": {\"steppers\": [{\"stepperid\": 1,--"]);
    assert_eq!(messages, vec![json!({"qid": 9})]);
    assert_eq!(remainder, "");
}

#[test]
fn test_byte_chunks_through_decoder() {
    // Multi-byte characters inside a frame must survive any chunking
    let device = "++\r\n{\"qid\": 3, \"msg\": \"Grüße µm\"}\r\n--\r\n";
    let bytes = device.as_bytes();

    for size in 1..bytes.len() {
        let mut decoder = TextDecoder::new();
        let mut remainder = String::new();
        let mut messages = Vec::new();
        for chunk in bytes.chunks(size) {
            let decoded = decoder.decode(chunk);
            assert_eq!(decoded.invalid_sequences, 0, "chunk size {}", size);
            let extraction = extract_frames(&remainder, &strip_control(&decoded.text));
            messages.extend(values(&extraction.messages));
            remainder = extraction.remainder;
        }
        assert_eq!(
            messages,
            vec![json!({"qid": 3, "msg": "Grüße µm"})],
            "chunk size {}",
            size
        );
        assert_eq!(remainder, "");
    }
}

#[test]
fn test_open_frame_remainder_is_verbatim() {
    let extraction = extract_frames("", "ok++{\"qid\":4,\"sta");
    assert!(extraction.messages.is_empty());
    assert_eq!(extraction.remainder, "++{\"qid\":4,\"sta");

    let extraction = extract_frames(&extraction.remainder, "te\":1}--I (5) done");
    assert_eq!(values(&extraction.messages), vec![json!({"qid": 4, "state": 1})]);
    assert_eq!(extraction.remainder, "");
}

#[test]
fn test_discarded_frame_reported() {
    let extraction = extract_frames("", "++{not json at all}--++{\"qid\":6}--");
    assert_eq!(extraction.discarded, vec!["{not json at all}".to_string()]);
    assert_eq!(values(&extraction.messages), vec![json!({"qid": 6})]);
}
