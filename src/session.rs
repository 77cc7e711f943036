//! One trigger, one session: capture, detect, aggregate, report, persist.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureOrchestrator, ImageSource};
use crate::detection::DetectionAdapter;
use crate::ensemble::EnsembleAggregator;
use crate::history::HistorySink;
use crate::link::ResultLink;
use crate::models::{CaptureBatch, FusedDetection, RawDetection, Session, SessionOutcome, TriggerSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingImages,
    Detecting,
    Aggregating,
    Reporting,
    Persisted,
}

/// Process-wide session numbering
#[derive(Debug, Default)]
pub struct SessionCounter(AtomicU64);

impl SessionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let n = self.0.fetch_add(1, Ordering::SeqCst);
        format!("session_{:06}", n)
    }

    pub fn issued(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Capture orchestrator shared with blocking workers; only one session
/// holds it at a time.
pub type SharedCapture<S> = Arc<Mutex<CaptureOrchestrator<S>>>;

fn lock_capture<S: ImageSource>(capture: &Mutex<CaptureOrchestrator<S>>) -> MutexGuard<'_, CaptureOrchestrator<S>> {
    // A panic mid-batch still released the flash through its guard
    capture.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SessionPipeline<S: ImageSource + 'static, L: ResultLink, H: HistorySink> {
    capture: SharedCapture<S>,
    adapter: Arc<DetectionAdapter>,
    aggregator: EnsembleAggregator,
    link: L,
    history: H,
    counter: Arc<SessionCounter>,
    num_images: usize,
    capture_delay: Duration,
    state: SessionState,
    transitions: Vec<SessionState>,
}

impl<S: ImageSource + 'static, L: ResultLink, H: HistorySink> SessionPipeline<S, L, H> {
    pub fn new(
        capture: CaptureOrchestrator<S>,
        adapter: DetectionAdapter,
        aggregator: EnsembleAggregator,
        link: L,
        history: H,
    ) -> Self {
        Self {
            capture: Arc::new(Mutex::new(capture)),
            adapter: Arc::new(adapter),
            aggregator,
            link,
            history,
            counter: Arc::new(SessionCounter::new()),
            num_images: 3,
            capture_delay: Duration::from_millis(300),
            state: SessionState::Idle,
            transitions: Vec::new(),
        }
    }

    /// Images requested per session and the pause between them
    pub fn with_capture_plan(mut self, num_images: usize, capture_delay: Duration) -> Self {
        self.num_images = num_images;
        self.capture_delay = capture_delay;
        self
    }

    pub fn with_counter(mut self, counter: Arc<SessionCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// States visited by the most recent session, in order
    pub fn last_transitions(&self) -> &[SessionState] {
        &self.transitions
    }

    fn enter(&mut self, state: SessionState) {
        debug!(from = ?self.state, to = ?state, "Session state");
        self.state = state;
        self.transitions.push(state);
    }

    /// Run a full session. Never fails: every problem short of a crash ends
    /// up in the returned session's outcome.
    pub async fn run_session(&mut self, trigger_source: TriggerSource) -> Session {
        self.transitions.clear();
        self.enter(SessionState::AwaitingImages);

        let session_id = self.counter.next_id();
        let created_at = OffsetDateTime::now_utc();
        let started = Instant::now();
        info!(session = %session_id, source = trigger_source.as_str(), "Starting detection session");

        let batch = capture_images(self.capture.clone(), self.num_images, self.capture_delay).await;
        let images_captured = batch.len();

        let final_detections = if batch.is_empty() {
            error!(session = %session_id, "No images captured, skipping detection");
            Vec::new()
        } else {
            self.enter(SessionState::Detecting);
            let per_image = detect_all(self.adapter.clone(), batch).await;

            self.enter(SessionState::Aggregating);
            let fused = self.aggregator.aggregate(&per_image);
            info!(
                session = %session_id,
                images = images_captured,
                detections = fused.len(),
                "Ensemble detection complete"
            );
            fused
        };

        self.enter(SessionState::Reporting);
        let mut outcome = SessionOutcome::from_results(images_captured, &final_detections);
        self.report(&final_detections);
        if !self.link.is_available() && outcome != SessionOutcome::CaptureFailed {
            outcome = SessionOutcome::LinkFailed;
        }

        let session = Session {
            session_id,
            created_at,
            trigger_source,
            images_captured,
            final_detections,
            processing_duration: started.elapsed(),
            outcome,
        };

        if let Err(e) = self.history.record_session(&session).await {
            error!(session = %session.session_id, error = %e, "Failed to persist session");
        }
        self.enter(SessionState::Persisted);

        info!(
            session = %session.session_id,
            outcome = ?session.outcome,
            detections = session.final_detections.len(),
            seconds = session.processing_duration.as_secs_f64(),
            "Detection session complete"
        );
        self.enter(SessionState::Idle);
        session
    }

    fn report(&mut self, detections: &[FusedDetection]) {
        if !self.link.is_available() {
            warn!("No controller link, results not sent");
            return;
        }

        if detections.is_empty() {
            if let Err(e) = self.link.send_summary(0, "none") {
                error!(error = %e, "Error sending summary result");
            }
            return;
        }

        if let Err(e) = self.link.send_detection_results(detections) {
            error!(error = %e, "Error sending detection results");
        }
        let dominant = dominant_class(detections);
        if let Err(e) = self.link.send_summary(detections.len(), dominant) {
            error!(error = %e, "Error sending summary result");
        }
    }

    /// Switch the flash off; waits for any running capture to finish first
    pub fn shutdown(&self) -> impl Future<Output = ()> + Send + use<S, L, H> {
        let capture = self.capture.clone();
        async move {
            if let Err(e) = tokio::task::spawn_blocking(move || lock_capture(&capture).release()).await {
                error!(error = %e, "Illumination release failed");
            }
        }
    }
}

async fn capture_images<S: ImageSource + 'static>(
    capture: SharedCapture<S>,
    count: usize,
    delay: Duration,
) -> CaptureBatch {
    let result = tokio::task::spawn_blocking(move || lock_capture(&capture).capture_batch(count, delay)).await;
    result.unwrap_or_else(|e| {
        error!(error = %e, "Capture worker failed");
        CaptureBatch::default()
    })
}

/// Run the adapter over every image on a blocking worker
async fn detect_all(adapter: Arc<DetectionAdapter>, batch: CaptureBatch) -> Vec<Vec<RawDetection>> {
    let images = batch.images;
    let count = images.len();
    let result = tokio::task::spawn_blocking(move || {
        images
            .iter()
            .enumerate()
            .map(|(i, image)| {
                let detections = adapter.detect(image, i);
                info!(image = i + 1, detections = detections.len(), "Image detections");
                detections
            })
            .collect::<Vec<_>>()
    })
    .await;
    result.unwrap_or_else(|e| {
        error!(error = %e, "Detection worker failed");
        vec![Vec::new(); count]
    })
}

/// Label of the highest-confidence detection, `"none"` when empty
pub fn dominant_class(detections: &[FusedDetection]) -> &str {
    let mut best: Option<&FusedDetection> = None;
    for detection in detections {
        match best {
            Some(b) if b.confidence >= detection.confidence => {}
            _ => best = Some(detection),
        }
    }
    best.map(|d| d.class_label.as_str()).unwrap_or("none")
}
