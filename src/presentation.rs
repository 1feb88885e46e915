use crate::config::{SingleImageConfig, StreamingConfig};
use crate::detection::{summarize, Detection, DetectionSet};
use crate::dispatcher::{RateLimiter, RequestDispatcher};
use crate::render::{RenderError, Renderer};
use crate::slot::LatestResponseSlot;
use crate::source::{Frame, FrameSource};
use crate::transport::Transport;
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::broadcast::{self, error::TryRecvError},
    time::{sleep, Duration, Instant},
};
use tracing::instrument;

#[derive(Error, Debug)]
pub enum PresentationError {
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
    #[error("Render error: {0}")]
    Render(#[from] RenderError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleImageOutcome {
    Delivered,
    TimedOut,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub frames: u64,
    pub submitted: u64,
    pub responses: u64,
}

/// Writes detection summaries to the log, at most once per interval when throttled.
#[derive(Debug)]
pub struct DetectionReporter {
    interval: Option<Duration>,
    last: Option<Instant>,
}

impl DetectionReporter {
    pub fn unthrottled() -> Self {
        Self {
            interval: None,
            last: None,
        }
    }

    pub fn throttled(interval: Duration) -> Self {
        Self {
            interval: Some(interval),
            last: None,
        }
    }

    /// Returns the emitted summary, or `None` if throttled.
    pub fn report(&mut self, detections: &[Detection], now: Instant) -> Option<String> {
        if let (Some(interval), Some(last)) = (self.interval, self.last) {
            if now.saturating_duration_since(last) < interval {
                return None;
            }
        }
        self.last = Some(now);

        let summary = summarize(detections);
        tracing::info!("{}", summary);
        Some(summary)
    }
}

/// Drives capture, submission and rendering for both run modes.
pub struct PresentationLoop<T: Transport, R: Renderer> {
    dispatcher: RequestDispatcher<T>,
    slot: Arc<LatestResponseSlot>,
    renderer: R,
    single_image: SingleImageConfig,
    streaming: StreamingConfig,
}

impl<T: Transport, R: Renderer> PresentationLoop<T, R> {
    pub fn new(
        dispatcher: RequestDispatcher<T>,
        slot: Arc<LatestResponseSlot>,
        renderer: R,
        single_image: SingleImageConfig,
        streaming: StreamingConfig,
    ) -> Self {
        Self {
            dispatcher,
            slot,
            renderer,
            single_image,
            streaming,
        }
    }

    /// Submits one image and waits a bounded time for the reply.
    ///
    /// The slot is only read, never cleared, in this mode.
    #[instrument(skip(self, frame))]
    pub async fn run_single_image(
        &mut self,
        frame: &Frame,
    ) -> Result<SingleImageOutcome, PresentationError> {
        let payload = frame.payload(self.streaming.jpeg_quality)?;
        tracing::info!("Submitting image ({} bytes)", payload.len());
        if let Err(e) = self.dispatcher.submit(&payload).await {
            tracing::warn!("Request was not published: {}", e);
        }

        let response_timeout = self.single_image.response_timeout();
        let poll_interval = self.single_image.poll_interval();
        let deadline = Instant::now() + response_timeout;

        let detections = loop {
            if let Some(detections) = self.slot.peek() {
                break Some(detections);
            }
            if Instant::now() >= deadline {
                break None;
            }
            sleep(poll_interval).await;
        };

        match detections {
            Some(detections) => {
                DetectionReporter::unthrottled().report(&detections, Instant::now());
                self.renderer.render(frame, Some(detections.as_slice()))?;
                Ok(SingleImageOutcome::Delivered)
            }
            None => {
                tracing::warn!(
                    "No response from the detection service within {:?}",
                    response_timeout
                );
                Ok(SingleImageOutcome::TimedOut)
            }
        }
    }

    /// Renders every captured frame with the last known detections until the
    /// source is exhausted or a shutdown signal is received.
    ///
    /// The source is released exactly once on every exit path.
    pub async fn run_streaming<S: FrameSource + ?Sized>(
        &mut self,
        source: &mut S,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> StreamSummary {
        let mut limiter = RateLimiter::new(self.streaming.get_submit_interval());
        let mut reporter = DetectionReporter::throttled(self.streaming.report_interval());
        let capture_delay = self.streaming.get_capture_delay();
        let mut last_known: Option<DetectionSet> = None;
        let mut summary = StreamSummary::default();

        tracing::info!("Starting video stream");
        loop {
            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!("Frame source exhausted");
                    break;
                }
                Err(e) => {
                    tracing::error!("Failed to capture frame: {}", e);
                    break;
                }
            };
            summary.frames += 1;

            let now = Instant::now();
            if limiter.try_acquire(now) && self.submit_frame(&frame).await {
                summary.submitted += 1;
            }

            if let Some(detections) = self.slot.take() {
                summary.responses += 1;
                last_known = Some(detections);
            }

            if let Some(detections) = &last_known {
                reporter.report(detections, now);
            }
            if let Err(e) = self.renderer.render(&frame, last_known.as_deref()) {
                tracing::warn!("Failed to render frame {}: {}", summary.frames, e);
            }

            if cancel_requested(shutdown_rx) {
                tracing::info!("Stream received shutdown signal");
                break;
            }

            sleep(capture_delay).await;
        }

        source.release();
        tracing::info!(
            "Stream stopped after {} frames ({} submitted, {} responses)",
            summary.frames,
            summary.submitted,
            summary.responses
        );
        summary
    }

    async fn submit_frame(&self, frame: &Frame) -> bool {
        let payload = match frame.payload(self.streaming.jpeg_quality) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Failed to encode frame: {}", e);
                return false;
            }
        };
        match self.dispatcher.submit(&payload).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Request was not published: {}", e);
                false
            }
        }
    }
}

fn cancel_requested(shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
    match shutdown_rx.try_recv() {
        Ok(()) | Err(TryRecvError::Lagged(_)) => true,
        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => false,
    }
}
