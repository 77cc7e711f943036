use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::draw_filled_circle_mut;
use pillvision::capture::{CaptureOrchestrator, ImageSource};
use pillvision::detection::{Detect, DetectionAdapter, Detector};
use pillvision::ensemble::EnsembleAggregator;
use pillvision::error::{Error, Result};
use pillvision::history::{HistorySink, SqliteHistory};
use pillvision::link::ResultDispatcher;
use pillvision::models::{BoundingBox, RawDetection, Session};
use pillvision::session::SessionPipeline;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Blank 64x64 frame
pub fn blank_frame() -> DynamicImage {
    DynamicImage::new_rgb8(64, 64)
}

/// 200x200 dark frame with one white disc of radius 30 centred at (100, 100)
pub fn pill_frame() -> DynamicImage {
    let mut img = RgbImage::from_pixel(200, 200, Rgb([20u8, 20u8, 20u8]));
    draw_filled_circle_mut(&mut img, (100, 100), 30, Rgb([240u8, 240u8, 240u8]));
    DynamicImage::ImageRgb8(img)
}

/// Every illumination request, in order
pub type IlluminationLog = Arc<Mutex<Vec<bool>>>;

/// Image source that plays back a script; `false` entries fail
pub struct ScriptedSource {
    script: VecDeque<bool>,
    illumination: IlluminationLog,
    frame_time: Duration,
}

impl ScriptedSource {
    pub fn new(script: &[bool]) -> (Self, IlluminationLog) {
        let log = IlluminationLog::default();
        let source = Self {
            script: script.iter().copied().collect(),
            illumination: log.clone(),
            frame_time: Duration::ZERO,
        };
        (source, log)
    }

    /// Make every acquisition take `frame_time`
    pub fn with_frame_time(mut self, frame_time: Duration) -> Self {
        self.frame_time = frame_time;
        self
    }
}

impl ImageSource for ScriptedSource {
    fn acquire_image(&mut self) -> Result<DynamicImage> {
        std::thread::sleep(self.frame_time);
        match self.script.pop_front() {
            Some(true) => Ok(blank_frame()),
            Some(false) => Err(Error::Acquisition("scripted failure".to_string())),
            None => Err(Error::Acquisition("script exhausted".to_string())),
        }
    }

    fn set_illumination(&mut self, on: bool) -> bool {
        self.illumination.lock().unwrap().push(on);
        true
    }
}

/// Primary detector answering from a queue, one entry per call
pub struct ScriptedDetector {
    answers: Mutex<VecDeque<Vec<RawDetection>>>,
}

impl ScriptedDetector {
    pub fn new(answers: Vec<Vec<RawDetection>>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
        }
    }
}

impl Detect for ScriptedDetector {
    fn detect(&self, _img: &DynamicImage) -> Result<Vec<RawDetection>> {
        Ok(self.answers.lock().unwrap().pop_front().unwrap_or_default())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub fn raw(bbox: (i32, i32, i32, i32), confidence: f32, label: &str) -> RawDetection {
    RawDetection {
        bbox: BoundingBox::new(bbox.0, bbox.1, bbox.2, bbox.3),
        confidence,
        class_id: 1,
        class_label: label.to_string(),
        source_image_index: 0,
    }
}

/// Write end of an in-memory link; clones share the buffer
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8(self.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// History sink keeping sessions in memory
#[derive(Clone, Default)]
pub struct MemoryHistory(Arc<Mutex<Vec<Session>>>);

impl MemoryHistory {
    pub fn sessions(&self) -> Vec<Session> {
        self.0.lock().unwrap().clone()
    }
}

impl HistorySink for MemoryHistory {
    async fn record_session(&self, session: &Session) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(session.clone());
        Ok(())
    }
}

/// Creates a SqliteHistory in a temporary directory.
/// Returns both the history and the directory (which must be kept alive).
pub async fn create_test_history() -> (SqliteHistory, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().expect("Failed to create temp directory");
    let history = SqliteHistory::open(dir.path().join("history.db"))
        .await
        .expect("Failed to open test history");
    (history, dir)
}

pub type TestPipeline = SessionPipeline<ScriptedSource, ResultDispatcher<SharedBuffer>, MemoryHistory>;

/// Pipeline over a scripted source with no waits, an in-memory link and history
pub fn make_pipeline(
    script: &[bool],
    detector: Detector,
) -> (TestPipeline, IlluminationLog, SharedBuffer, MemoryHistory) {
    let (source, log) = ScriptedSource::new(script);
    let capture = CaptureOrchestrator::new(source).with_flash_delay(Duration::ZERO);
    let link = SharedBuffer::default();
    let history = MemoryHistory::default();
    let pipeline = SessionPipeline::new(
        capture,
        DetectionAdapter::new(detector, 0.6),
        EnsembleAggregator::new(),
        ResultDispatcher::new(link.clone()),
        history.clone(),
    )
    .with_capture_plan(script.len(), Duration::ZERO);
    (pipeline, log, link, history)
}
