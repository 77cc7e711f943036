//! Line-oriented link to the dispenser controller.
//!
//! Inbound lines carrying `TRIGGER_DETECTION` or `DETECT_PILLS` start a
//! session, anything else is queued untouched. Outbound, a session reports a
//! `DETECTION_RESULTS:<json>` line when it found pills and always a
//! `PILLS_DETECTED:<count>:<class>` summary.

use serde::Serialize;
use std::io::{self, BufRead, BufReader, Write};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{error, info};

use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::models::FusedDetection;

pub const TRIGGER_TOKENS: [&str; 2] = ["TRIGGER_DETECTION", "DETECT_PILLS"];

pub fn is_trigger(line: &str) -> bool {
    TRIGGER_TOKENS.iter().any(|token| line.contains(token))
}

/// Non-trigger line kept for later inspection
#[derive(Debug, Clone, PartialEq)]
pub struct LinkMessage {
    pub message: String,
    pub received_at: OffsetDateTime,
}

/// What a single poll of the link produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    Trigger,
    Message,
    Idle,
    /// The link failed while reading
    Closed,
}

/// Reads controller lines and recognises triggers
pub struct TriggerListener<R: BufRead> {
    reader: R,
    /// Bytes of a line not yet terminated, kept across read timeouts
    pending: Vec<u8>,
    messages: Vec<LinkMessage>,
    connected: bool,
}

impl<R: BufRead> TriggerListener<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending: Vec::new(),
            messages: Vec::new(),
            connected: true,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Read at most one line. A read timeout counts as idle; bytes that are
    /// not UTF-8 are replaced rather than failing the link.
    pub fn poll(&mut self) -> Poll {
        if !self.connected {
            return Poll::Closed;
        }

        match self.reader.read_until(b'\n', &mut self.pending) {
            Ok(0) if self.pending.is_empty() => Poll::Idle,
            Ok(_) => {
                let raw = std::mem::take(&mut self.pending);
                let line = String::from_utf8_lossy(&raw);
                self.handle_line(line.trim())
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Poll::Idle
            }
            Err(e) => {
                error!(error = %e, "Error listening to controller");
                self.connected = false;
                Poll::Closed
            }
        }
    }

    fn handle_line(&mut self, message: &str) -> Poll {
        if message.is_empty() {
            return Poll::Idle;
        }
        info!(line = message, "Controller message");
        if is_trigger(message) {
            info!("Detection trigger received");
            return Poll::Trigger;
        }
        self.messages.push(LinkMessage {
            message: message.to_string(),
            received_at: OffsetDateTime::now_utc(),
        });
        Poll::Message
    }

    /// Inbound reader, for request/response exchanges outside the poll loop
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Take the queued non-trigger messages
    pub fn drain_messages(&mut self) -> Vec<LinkMessage> {
        std::mem::take(&mut self.messages)
    }
}

#[derive(Serialize)]
struct DetectionResults<'a> {
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    detection_count: usize,
    detections: &'a [FusedDetection],
}

/// `DETECTION_RESULTS:<json>` line, newline included
pub fn detection_results_line(detections: &[FusedDetection]) -> Result<String> {
    let payload = DetectionResults {
        timestamp: OffsetDateTime::now_utc(),
        detection_count: detections.len(),
        detections,
    };
    Ok(format!("DETECTION_RESULTS:{}\n", serde_json::to_string(&payload)?))
}

/// `PILLS_DETECTED:<count>:<class>` line, newline included
pub fn summary_line(count: usize, dominant_class: &str) -> String {
    format!("PILLS_DETECTED:{}:{}\n", count, dominant_class)
}

/// Outbound half of the controller link
pub trait ResultLink: Send {
    /// Whether a working link was ever established
    fn is_available(&self) -> bool;

    fn send_detection_results(&mut self, detections: &[FusedDetection]) -> Result<()>;

    fn send_summary(&mut self, count: usize, dominant_class: &str) -> Result<()>;
}

/// Writes results to the controller; `None` writer means no link was opened
pub struct ResultDispatcher<W: Write + Send> {
    writer: Option<W>,
}

impl<W: Write + Send> ResultDispatcher<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    pub fn disconnected() -> Self {
        Self { writer: None }
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::LinkUnavailable("no controller link".to_string()))?;
        writer.write_all(line.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Send a raw command and read back one line of reply.
    /// `reader` is the inbound half of the same link.
    pub fn send_command<R: BufRead>(&mut self, command: &str, reader: &mut R) -> Result<String> {
        self.write_line(&format!("{}\n", command))?;
        std::thread::sleep(Duration::from_millis(100));
        let mut response = String::new();
        reader.read_line(&mut response)?;
        Ok(response.trim().to_string())
    }
}

impl<W: Write + Send> ResultLink for ResultDispatcher<W> {
    fn is_available(&self) -> bool {
        self.writer.is_some()
    }

    fn send_detection_results(&mut self, detections: &[FusedDetection]) -> Result<()> {
        let line = detection_results_line(detections)?;
        self.write_line(&line)?;
        info!(count = detections.len(), "Sent detection results");
        Ok(())
    }

    fn send_summary(&mut self, count: usize, dominant_class: &str) -> Result<()> {
        self.write_line(&summary_line(count, dominant_class))?;
        info!(count, class = dominant_class, "Sent summary result");
        Ok(())
    }
}

pub type SerialPort = Box<dyn serialport::SerialPort>;

/// Open the controller's serial port and split it into listener and dispatcher
pub fn open_serial(
    config: &LinkConfig,
) -> Result<(TriggerListener<BufReader<SerialPort>>, ResultDispatcher<SerialPort>)> {
    let port = serialport::new(&config.port, config.baud_rate)
        .timeout(Duration::from_millis(config.timeout_ms))
        .open()
        .map_err(|e| Error::Configuration(format!("cannot open {}: {}", config.port, e)))?;
    // The controller resets when the port opens
    std::thread::sleep(Duration::from_millis(config.settle_ms));

    let reader = port.try_clone()?;
    info!(port = %config.port, baud = config.baud_rate, "Connected to controller");
    Ok((
        TriggerListener::new(BufReader::new(reader)),
        ResultDispatcher::new(port),
    ))
}
