//! Multi-image capture for one detection event.
//!
//! The orchestrator asks an [`ImageSource`] for frames one at a time with the
//! illumination held on for the whole batch. Single failed frames are skipped;
//! the batch holds whatever succeeded.

use image::DynamicImage;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::time::Duration;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{debug, error, info, warn};

use crate::config::{CameraConfig, CaptureConfig};
use crate::error::{Error, Result};
use crate::models::CaptureBatch;

/// Acquisition collaborator: a camera plus its flash
pub trait ImageSource: Send {
    fn acquire_image(&mut self) -> Result<DynamicImage>;

    /// Switch the flash; returns whether the camera acknowledged
    fn set_illumination(&mut self, on: bool) -> bool;
}

/// Keeps the illumination on while alive and switches it off on drop,
/// whichever way the batch ends.
pub struct Illuminated<'a, S: ImageSource> {
    source: &'a mut S,
}

impl<'a, S: ImageSource> Illuminated<'a, S> {
    pub fn on(source: &'a mut S) -> Self {
        if !source.set_illumination(true) {
            warn!("Illumination on was not acknowledged");
        }
        Self { source }
    }
}

impl<S: ImageSource> Deref for Illuminated<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        &*self.source
    }
}

impl<S: ImageSource> DerefMut for Illuminated<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut *self.source
    }
}

impl<S: ImageSource> Drop for Illuminated<'_, S> {
    fn drop(&mut self) {
        if !self.source.set_illumination(false) {
            warn!("Illumination off was not acknowledged");
        }
    }
}

pub struct CaptureOrchestrator<S: ImageSource> {
    source: S,
    flash_delay: Duration,
    archive_dir: Option<PathBuf>,
}

impl<S: ImageSource> CaptureOrchestrator<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            flash_delay: Duration::from_millis(100),
            archive_dir: None,
        }
    }

    pub fn from_config(source: S, camera: &CameraConfig, capture: &CaptureConfig) -> Self {
        Self {
            source,
            flash_delay: camera.flash_delay(),
            archive_dir: capture.save_images.then(|| capture.images_dir.clone()),
        }
    }

    /// Wait after switching the flash on before the first frame
    pub fn with_flash_delay(mut self, delay: Duration) -> Self {
        self.flash_delay = delay;
        self
    }

    /// Save every captured frame as JPEG under `dir`
    pub fn with_archive(mut self, dir: impl Into<PathBuf>) -> Self {
        self.archive_dir = Some(dir.into());
        self
    }

    /// Capture up to `requested_count` frames, pausing `inter_capture_delay`
    /// between attempts.
    pub fn capture_batch(&mut self, requested_count: usize, inter_capture_delay: Duration) -> CaptureBatch {
        info!(requested = requested_count, "Starting capture sequence");
        let mut batch = CaptureBatch::default();

        let mut source = Illuminated::on(&mut self.source);
        std::thread::sleep(self.flash_delay);

        for i in 0..requested_count {
            debug!(frame = i + 1, of = requested_count, "Capturing frame");
            match source.acquire_image() {
                Ok(frame) => {
                    if let Some(dir) = &self.archive_dir {
                        if let Err(e) = archive_frame(dir, &frame, i) {
                            error!(frame = i + 1, error = %e, "Failed to save frame");
                        }
                    }
                    debug!(frame = i + 1, width = frame.width(), height = frame.height(), "Frame captured");
                    batch.images.push(frame);
                    batch.attempts.push(true);
                }
                Err(e) => {
                    warn!(frame = i + 1, error = %e, "Failed to capture frame");
                    batch.attempts.push(false);
                }
            }

            if i + 1 < requested_count {
                std::thread::sleep(inter_capture_delay);
            }
        }
        drop(source);

        info!(
            captured = batch.len(),
            requested = requested_count,
            "Capture sequence complete"
        );
        batch
    }

    /// Make sure the flash is off, used on shutdown
    pub fn release(&mut self) {
        if !self.source.set_illumination(false) {
            warn!("Illumination release was not acknowledged");
        }
    }
}

fn archive_frame(dir: &std::path::Path, frame: &DynamicImage, index: usize) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let stamp = OffsetDateTime::now_utc()
        .format(format_description!("[year][month][day]_[hour][minute][second]"))?;
    let path = dir.join(format!("capture_{}_frame_{:02}.jpg", stamp, index));
    frame.to_rgb8().save(&path)?;
    debug!(path = %path.display(), "Frame saved");
    Ok(path)
}

/// Images read from files, in order; used for offline runs
pub struct FileSource {
    paths: std::vec::IntoIter<PathBuf>,
}

impl FileSource {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths: paths.into_iter(),
        }
    }
}

impl ImageSource for FileSource {
    fn acquire_image(&mut self) -> Result<DynamicImage> {
        let path = self
            .paths
            .next()
            .ok_or_else(|| Error::Acquisition("no more image files".to_string()))?;
        image::open(&path)
            .map_err(|e| Error::Acquisition(format!("{}: {}", path.display(), e)))
    }

    fn set_illumination(&mut self, _on: bool) -> bool {
        true
    }
}

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// First complete JPEG in an MJPEG byte stream, if any
pub fn extract_jpeg(buffer: &[u8]) -> Option<&[u8]> {
    let start = buffer.windows(2).position(|w| w == JPEG_SOI)?;
    let end = buffer[start + 2..].windows(2).position(|w| w == JPEG_EOI)?;
    Some(&buffer[start..start + 2 + end + 2])
}

/// ESP32-CAM reached over HTTP.
///
/// Blocking calls are bridged onto the async client with the runtime handle,
/// so they must run on a blocking worker, never on an async task.
pub struct Esp32Cam {
    client: reqwest::Client,
    runtime: tokio::runtime::Handle,
    base_url: String,
    connected: bool,
}

impl Esp32Cam {
    pub fn new(ip: &str, runtime: tokio::runtime::Handle) -> Self {
        Self {
            client: reqwest::Client::new(),
            runtime,
            base_url: format!("http://{}", ip),
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Probe the camera's index page
    pub async fn test_connection(&mut self) -> bool {
        let result = self
            .client
            .get(format!("{}/", self.base_url))
            .timeout(Duration::from_secs(3))
            .send()
            .await;
        self.connected = match result {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                error!(error = %e, "ESP32-CAM connection test failed");
                false
            }
        };
        info!(connected = self.connected, "ESP32-CAM connection");
        self.connected
    }

    /// Grab one frame from the MJPEG stream
    pub async fn capture_frame(&mut self) -> Result<DynamicImage> {
        if !self.connected && !self.test_connection().await {
            return Err(Error::Acquisition("camera not reachable".to_string()));
        }

        match self.read_stream_frame().await {
            Ok(frame) => Ok(frame),
            Err(e) => {
                self.connected = false;
                Err(e)
            }
        }
    }

    async fn read_stream_frame(&self) -> Result<DynamicImage> {
        let mut response = self
            .client
            .get(format!("{}/stream", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;

        let mut buffer = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            buffer.extend_from_slice(&chunk);
            if let Some(jpeg) = extract_jpeg(&buffer) {
                return Ok(image::load_from_memory(jpeg)?);
            }
        }
        Err(Error::Acquisition("stream ended before a full frame".to_string()))
    }

    pub async fn set_flash(&self, on: bool) -> bool {
        let endpoint = if on { "on" } else { "off" };
        let result = self
            .client
            .get(format!("{}/flash/{}", self.base_url, endpoint))
            .timeout(Duration::from_secs(2))
            .send()
            .await;
        match result {
            Ok(response) => {
                let ok = response.status().is_success();
                if ok {
                    debug!(flash = endpoint, "Flash switched");
                }
                ok
            }
            Err(e) => {
                error!(error = %e, "Flash control error");
                false
            }
        }
    }

    pub async fn flash_status(&self) -> bool {
        #[derive(serde::Deserialize)]
        struct FlashStatus {
            flash: String,
        }

        let result = self
            .client
            .get(format!("{}/flash/status", self.base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await;
        match result {
            Ok(response) => response
                .json::<FlashStatus>()
                .await
                .map(|s| s.flash == "on")
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

impl ImageSource for Esp32Cam {
    fn acquire_image(&mut self) -> Result<DynamicImage> {
        let runtime = self.runtime.clone();
        runtime.block_on(self.capture_frame())
    }

    fn set_illumination(&mut self, on: bool) -> bool {
        let runtime = self.runtime.clone();
        runtime.block_on(self.set_flash(on))
    }
}
