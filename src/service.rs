//! Triggered mode: wait for controller triggers and run one session each.

use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::capture::ImageSource;
use crate::history::HistorySink;
use crate::link::{Poll, ResultLink, TriggerListener};
use crate::models::TriggerSource;
use crate::session::SessionPipeline;

const IDLE_POLL: Duration = Duration::from_millis(100);

/// Run sessions for incoming triggers until `shutdown` resolves or the link
/// closes. Returns the number of sessions run.
///
/// A running session is never interrupted; shutdown is only observed between
/// sessions. Illumination is released before returning.
pub async fn run_triggered<S, L, H, R, F>(
    pipeline: &mut SessionPipeline<S, L, H>,
    listener: TriggerListener<R>,
    shutdown: F,
) -> usize
where
    S: ImageSource + 'static,
    L: ResultLink,
    H: HistorySink,
    R: BufRead + Send + 'static,
    F: Future<Output = ()>,
{
    // One pending trigger at most; the consumer owns the pipeline
    let (tx, mut rx) = mpsc::channel::<()>(1);
    let stop = Arc::new(AtomicBool::new(false));
    let poller = spawn_poller(listener, tx, stop.clone());

    info!("Waiting for detection triggers");
    tokio::pin!(shutdown);
    let mut sessions = 0;
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            trigger = rx.recv() => match trigger {
                Some(()) => {
                    pipeline.run_session(TriggerSource::Esp32).await;
                    sessions += 1;
                }
                None => {
                    warn!("Trigger listener stopped");
                    break;
                }
            },
        }
    }

    stop.store(true, Ordering::SeqCst);
    drop(rx);
    pipeline.shutdown().await;
    if poller.is_err() {
        error!("Trigger listener thread could not be started");
    }
    info!(sessions, "Triggered mode stopped");
    sessions
}

fn spawn_poller<R: BufRead + Send + 'static>(
    mut listener: TriggerListener<R>,
    tx: mpsc::Sender<()>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("trigger-listener".to_string())
        .spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match listener.poll() {
                    Poll::Trigger => match tx.try_send(()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(())) => {
                            warn!("Session already queued, trigger ignored");
                        }
                        Err(TrySendError::Closed(())) => break,
                    },
                    Poll::Message => {}
                    Poll::Idle => std::thread::sleep(IDLE_POLL),
                    Poll::Closed => break,
                }
            }
            debug!("Trigger listener exiting");
        })
}
