//! Integration tests for triggered mode.

mod common;

use pillvision::detection::CircleDetector;
use pillvision::service::run_triggered;
use std::collections::VecDeque;
use std::io::{self, BufReader, Cursor, Read};
use std::time::Duration;

use common::*;

struct BrokenLink;

impl Read for BrokenLink {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
    }
}

/// Controller that sends one line at a time, `gap` apart
struct PacedLink {
    lines: VecDeque<&'static [u8]>,
    gap: Duration,
    sent_any: bool,
}

impl PacedLink {
    fn new(lines: &[&'static [u8]], gap: Duration) -> Self {
        Self {
            lines: lines.iter().copied().collect(),
            gap,
            sent_any: false,
        }
    }
}

impl Read for PacedLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(line) = self.lines.pop_front() else {
            return Ok(0);
        };
        if self.sent_any {
            std::thread::sleep(self.gap);
        }
        self.sent_any = true;
        buf[..line.len()].copy_from_slice(line);
        Ok(line.len())
    }
}

fn fallback() -> Detector {
    Detector::Fallback(CircleDetector::new())
}

#[tokio::test]
async fn test_trigger_runs_one_session() -> anyhow::Result<()> {
    let (mut pipeline, illumination, link, history) = make_pipeline(&[true, true, true], fallback());
    let listener = TriggerListener::new(Cursor::new("READY\nTRIGGER_DETECTION\n"));

    let watched = history.clone();
    let shutdown = async move {
        while watched.sessions().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    let sessions = run_triggered(&mut pipeline, listener, shutdown).await;

    assert_eq!(sessions, 1);
    assert_eq!(history.sessions()[0].trigger_source, TriggerSource::Esp32);
    assert_eq!(link.lines(), vec!["PILLS_DETECTED:0:none"]);
    // Batch on/off, then the release on exit
    assert_eq!(*illumination.lock().unwrap(), vec![true, false, false]);

    Ok(())
}

#[tokio::test]
async fn test_messages_alone_start_nothing() -> anyhow::Result<()> {
    let (mut pipeline, illumination, _link, history) = make_pipeline(&[true], fallback());
    let listener = TriggerListener::new(Cursor::new("READY\nSTATUS:OK\n"));

    let sessions = run_triggered(&mut pipeline, listener, tokio::time::sleep(Duration::from_millis(200))).await;

    assert_eq!(sessions, 0);
    assert!(history.sessions().is_empty());
    assert_eq!(*illumination.lock().unwrap(), vec![false]);

    Ok(())
}

#[tokio::test]
async fn test_closed_link_stops_service() -> anyhow::Result<()> {
    let (mut pipeline, illumination, ..) = make_pipeline(&[true], fallback());
    let listener = TriggerListener::new(BufReader::new(BrokenLink));

    let sessions = run_triggered(&mut pipeline, listener, std::future::pending::<()>()).await;

    assert_eq!(sessions, 0);
    assert_eq!(*illumination.lock().unwrap(), vec![false]);

    Ok(())
}

#[tokio::test]
async fn test_garbage_bytes_do_not_stop_service() -> anyhow::Result<()> {
    let (mut pipeline, _illumination, _link, history) = make_pipeline(&[true], fallback());
    let listener = TriggerListener::new(Cursor::new(&b"\xff\xfe\x00boot\nTRIGGER_DETECTION\n"[..]));

    let watched = history.clone();
    let shutdown = async move {
        while watched.sessions().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    let sessions = run_triggered(&mut pipeline, listener, shutdown).await;

    assert_eq!(sessions, 1);
    assert_eq!(history.sessions().len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_one_session_in_flight() -> anyhow::Result<()> {
    // 1. Each session takes about 300 ms: three frames of 100 ms
    let (source, illumination) = ScriptedSource::new(&[true; 9]);
    let source = source.with_frame_time(Duration::from_millis(100));
    let history = MemoryHistory::default();
    let mut pipeline = SessionPipeline::new(
        CaptureOrchestrator::new(source).with_flash_delay(Duration::ZERO),
        DetectionAdapter::new(fallback(), 0.6),
        EnsembleAggregator::new(),
        ResultDispatcher::new(SharedBuffer::default()),
        history.clone(),
    )
    .with_capture_plan(3, Duration::ZERO);

    // 2. Four triggers 50 ms apart: the first runs, the second waits, the rest are dropped
    let link = PacedLink::new(
        &[
            &b"TRIGGER_DETECTION\n"[..],
            &b"TRIGGER_DETECTION\n"[..],
            &b"DETECT_PILLS\n"[..],
            &b"TRIGGER_DETECTION\n"[..],
        ],
        Duration::from_millis(50),
    );
    let listener = TriggerListener::new(BufReader::new(link));

    let sessions = run_triggered(&mut pipeline, listener, tokio::time::sleep(Duration::from_millis(1500))).await;

    // 3. Two sessions, run back to back
    assert_eq!(sessions, 2);
    let ids: Vec<String> = history.sessions().into_iter().map(|s| s.session_id).collect();
    assert_eq!(ids, vec!["session_000000", "session_000001"]);
    assert!(history.sessions().iter().all(|s| s.images_captured == 3));

    // 4. Illumination never overlaps: on/off per batch, then the release on exit
    assert_eq!(*illumination.lock().unwrap(), vec![true, false, true, false, false]);

    Ok(())
}
