//! Integration tests for the controller link: trigger parsing, the message
//! queue and the wire format of outbound results.

mod common;

use pillvision::error::Error;
use pillvision::link::{Poll, detection_results_line, is_trigger, summary_line};
use std::collections::VecDeque;
use std::io::{self, BufReader, Cursor, Read};
use time::macros::datetime;

use common::*;

struct FailingReader(io::ErrorKind);

impl Read for FailingReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(self.0, "link failure"))
    }
}

/// Reader replaying chunks and errors in order, then end of input
struct Chunked(VecDeque<io::Result<&'static [u8]>>);

impl Read for Chunked {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.pop_front() {
            Some(Ok(chunk)) => {
                buf[..chunk.len()].copy_from_slice(chunk);
                Ok(chunk.len())
            }
            Some(Err(e)) => Err(e),
            None => Ok(0),
        }
    }
}

fn fused(label: &str, confidence: f32, support: usize) -> FusedDetection {
    FusedDetection {
        bbox: BoundingBox::new(11, 10, 51, 49),
        confidence,
        class_id: 2,
        class_label: label.to_string(),
        support_count: support,
        timestamp: datetime!(2026-01-01 12:00:00 UTC),
    }
}

#[test]
fn test_trigger_tokens() {
    assert!(is_trigger("TRIGGER_DETECTION"));
    assert!(is_trigger("cmd: DETECT_PILLS now"));
    assert!(!is_trigger("trigger_detection"));
    assert!(!is_trigger("STATUS:OK"));
}

#[test]
fn test_listener_queues_non_trigger_lines() {
    let input = "HELLO\nTRIGGER_DETECTION\n\n  status ok  \nx DETECT_PILLS y\n";
    let mut listener = TriggerListener::new(Cursor::new(input));

    assert_eq!(listener.poll(), Poll::Message);
    assert_eq!(listener.poll(), Poll::Trigger);
    assert_eq!(listener.poll(), Poll::Idle);
    assert_eq!(listener.poll(), Poll::Message);
    assert_eq!(listener.poll(), Poll::Trigger);
    // End of input reads as idle
    assert_eq!(listener.poll(), Poll::Idle);

    let messages: Vec<String> = listener.drain_messages().into_iter().map(|m| m.message).collect();
    assert_eq!(messages, vec!["HELLO", "status ok"]);
    assert!(listener.drain_messages().is_empty());
    assert!(listener.is_connected());
}

#[test]
fn test_read_timeout_is_idle() {
    let mut listener = TriggerListener::new(BufReader::new(FailingReader(io::ErrorKind::TimedOut)));
    assert_eq!(listener.poll(), Poll::Idle);
    assert!(listener.is_connected());
}

#[test]
fn test_read_error_closes_listener() {
    let mut listener = TriggerListener::new(BufReader::new(FailingReader(io::ErrorKind::BrokenPipe)));
    assert_eq!(listener.poll(), Poll::Closed);
    assert!(!listener.is_connected());
    assert_eq!(listener.poll(), Poll::Closed);
}

#[test]
fn test_invalid_utf8_is_not_fatal() {
    let mut listener = TriggerListener::new(Cursor::new(&b"\xff\xfe\x00boot\nTRIGGER_DETECTION\n"[..]));

    assert_eq!(listener.poll(), Poll::Message);
    assert_eq!(listener.poll(), Poll::Trigger);
    assert!(listener.is_connected());

    let messages = listener.drain_messages();
    assert!(messages[0].message.ends_with("boot"));
}

#[test]
fn test_line_split_by_timeout_is_kept() {
    let chunks = Chunked(VecDeque::from([
        Ok(&b"TRIGGER_"[..]),
        Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
        Ok(&b"DETECTION\n"[..]),
    ]));
    let mut listener = TriggerListener::new(BufReader::new(chunks));

    assert_eq!(listener.poll(), Poll::Idle);
    assert_eq!(listener.poll(), Poll::Trigger);
    assert_eq!(listener.poll(), Poll::Idle);
    assert!(listener.is_connected());
}

#[test]
fn test_summary_line_format() {
    assert_eq!(summary_line(2, "capsule"), "PILLS_DETECTED:2:capsule\n");
    assert_eq!(summary_line(0, "none"), "PILLS_DETECTED:0:none\n");
}

#[test]
fn test_detection_results_wire_format() -> anyhow::Result<()> {
    let line = detection_results_line(&[fused("capsule", 0.5, 3)])?;
    assert!(line.ends_with('\n'));

    let json = line.trim_end().strip_prefix("DETECTION_RESULTS:").expect("prefix");
    let payload: serde_json::Value = serde_json::from_str(json)?;
    assert_eq!(payload["detection_count"], 1);
    assert!(payload["timestamp"].is_string());

    let detection = &payload["detections"][0];
    assert_eq!(detection["bbox"], serde_json::json!([11, 10, 51, 49]));
    assert_eq!(detection["confidence"], 0.5);
    assert_eq!(detection["class_id"], 2);
    assert_eq!(detection["class_name"], "capsule");
    assert_eq!(detection["detection_count"], 3);
    assert_eq!(detection["timestamp"], "2026-01-01T12:00:00Z");

    Ok(())
}

#[test]
fn test_dispatcher_writes_lines() -> anyhow::Result<()> {
    let buffer = SharedBuffer::default();
    let mut dispatcher = ResultDispatcher::new(buffer.clone());
    assert!(dispatcher.is_available());

    dispatcher.send_detection_results(&[fused("tablet", 0.9, 2)])?;
    dispatcher.send_summary(1, "tablet")?;

    let lines = buffer.lines();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("DETECTION_RESULTS:{"));
    assert_eq!(lines[1], "PILLS_DETECTED:1:tablet");

    Ok(())
}

#[test]
fn test_disconnected_dispatcher_reports_unavailable() {
    let mut dispatcher = ResultDispatcher::<SharedBuffer>::disconnected();
    assert!(!dispatcher.is_available());
    assert!(matches!(
        dispatcher.send_summary(0, "none"),
        Err(Error::LinkUnavailable(_))
    ));
}

#[test]
fn test_send_command_reads_one_reply() -> anyhow::Result<()> {
    let buffer = SharedBuffer::default();
    let mut dispatcher = ResultDispatcher::new(buffer.clone());
    let mut reader = Cursor::new("STATUS:READY\nnext\n");

    let response = dispatcher.send_command("status", &mut reader)?;

    assert_eq!(response, "STATUS:READY");
    assert_eq!(buffer.lines(), vec!["status"]);

    Ok(())
}
