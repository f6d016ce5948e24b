//! Sample buffer router
//!
//! Entry point for every capture callback. Decides whether a sample is
//! written, asks the tracker for its adjusted time and forwards it to the
//! matching writer.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::capture::traits::{DeviceId, SampleBuffer, SampleHandler, StreamEvent, StreamId, StreamKind, VideoFrame};
use crate::recorder::session::SessionShared;
use crate::recorder::state::RecordingState;
use crate::recorder::timing::TimingDecision;
use crate::recorder::writer::{DeviceWriter, SamplePayload};

/// Why a sample was not written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Session is not Recording or PseudoPaused
    Inactive,
    /// No writer exists for the sample's stream
    UnknownStream,
    NotReady,
    Disconnected,
    ClockRegression,
    AudioMuted,
}

/// Result of routing one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Written { adjusted: Duration },
    Dropped(DropReason),
    /// The writer rejected the sample
    Failed,
}

#[derive(Debug, Default)]
pub(crate) struct RouterCounterCells {
    written: AtomicU64,
    dropped_inactive: AtomicU64,
    dropped_unknown: AtomicU64,
    dropped_not_ready: AtomicU64,
    dropped_disconnected: AtomicU64,
    dropped_regression: AtomicU64,
    dropped_muted: AtomicU64,
    write_failures: AtomicU64,
    frozen_frames: AtomicU64,
}

/// Router counters since the session was created
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterCounters {
    pub written: u64,
    pub dropped_inactive: u64,
    pub dropped_unknown: u64,
    pub dropped_not_ready: u64,
    pub dropped_disconnected: u64,
    pub dropped_regression: u64,
    pub dropped_muted: u64,
    pub write_failures: u64,
    pub frozen_frames: u64,
}

impl RouterCounterCells {
    fn record_drop(&self, reason: DropReason) {
        let cell = match reason {
            DropReason::Inactive => &self.dropped_inactive,
            DropReason::UnknownStream => &self.dropped_unknown,
            DropReason::NotReady => &self.dropped_not_ready,
            DropReason::Disconnected => &self.dropped_disconnected,
            DropReason::ClockRegression => &self.dropped_regression,
            DropReason::AudioMuted => &self.dropped_muted,
        };
        cell.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RouterCounters {
        RouterCounters {
            written: self.written.load(Ordering::Relaxed),
            dropped_inactive: self.dropped_inactive.load(Ordering::Relaxed),
            dropped_unknown: self.dropped_unknown.load(Ordering::Relaxed),
            dropped_not_ready: self.dropped_not_ready.load(Ordering::Relaxed),
            dropped_disconnected: self.dropped_disconnected.load(Ordering::Relaxed),
            dropped_regression: self.dropped_regression.load(Ordering::Relaxed),
            dropped_muted: self.dropped_muted.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            frozen_frames: self.frozen_frames.load(Ordering::Relaxed),
        }
    }
}

/// Routes capture callbacks into a session's writers.
///
/// Cheap to clone; every clone feeds the same session.
#[derive(Clone)]
pub struct SampleBufferRouter {
    shared: Arc<SessionShared>,
}

impl SampleBufferRouter {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub fn route(&self, sample: SampleBuffer) -> RouteOutcome {
        let outcome = self.route_inner(&sample);
        let counters = &self.shared.counters;
        match outcome {
            RouteOutcome::Written { .. } => {
                counters.written.fetch_add(1, Ordering::Relaxed);
            }
            RouteOutcome::Dropped(reason) => {
                tracing::trace!("Dropped {} sample at {:?}: {:?}", sample.stream(), sample.pts(), reason);
                counters.record_drop(reason);
            }
            RouteOutcome::Failed => {
                counters.write_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    fn route_inner(&self, sample: &SampleBuffer) -> RouteOutcome {
        if !self.shared.state.read().accepts_samples() {
            return RouteOutcome::Dropped(DropReason::Inactive);
        }

        let stream = sample.stream();
        let Some(pool) = self.shared.pool.read().clone() else {
            return RouteOutcome::Dropped(DropReason::Inactive);
        };
        let Some(writer) = pool.writer(&stream).cloned() else {
            return RouteOutcome::Dropped(DropReason::UnknownStream);
        };
        if stream.kind() == StreamKind::Audio && !self.shared.audio_enabled() {
            return RouteOutcome::Dropped(DropReason::AudioMuted);
        }
        if !writer.is_ready() {
            return RouteOutcome::Dropped(DropReason::NotReady);
        }

        let (raw, duration) = match sample {
            SampleBuffer::Video(video) => (video.pts, video.duration),
            SampleBuffer::Audio(audio) => (audio.pts, audio.duration()),
        };

        // State is re-read under the tracker lock so a pause or stop issued
        // by the control context is observed before any timestamp math.
        let (decision, state) = {
            let mut tracker = self.shared.tracker.lock();
            let state = *self.shared.state.read();
            if !state.accepts_samples() {
                return RouteOutcome::Dropped(DropReason::Inactive);
            }
            (tracker.adjust(&stream, raw, duration), state)
        };

        let (adjusted, duration) = match decision {
            TimingDecision::Accept { adjusted, duration } => (adjusted, duration),
            TimingDecision::Regression => return RouteOutcome::Dropped(DropReason::ClockRegression),
            TimingDecision::Disconnected => return RouteOutcome::Dropped(DropReason::Disconnected),
            TimingDecision::Unknown => return RouteOutcome::Dropped(DropReason::UnknownStream),
        };

        let result = match sample {
            SampleBuffer::Video(video) if state == RecordingState::PseudoPaused => {
                match self.frozen_frame(&video.device, &video.frame, &writer) {
                    Some(frame) => {
                        self.shared.counters.frozen_frames.fetch_add(1, Ordering::Relaxed);
                        writer.write(adjusted, Some(duration), SamplePayload::Video(&frame))
                    }
                    None => writer.write(adjusted, Some(duration), SamplePayload::Video(&video.frame)),
                }
            }
            SampleBuffer::Video(video) => writer.write(adjusted, Some(duration), SamplePayload::Video(&video.frame)),
            SampleBuffer::Audio(audio) => writer.write(adjusted, Some(duration), SamplePayload::Audio(audio)),
        };

        match result {
            Ok(()) => RouteOutcome::Written { adjusted },
            Err(e) => {
                tracing::warn!("Write to {} failed: {}", stream, e);
                RouteOutcome::Failed
            }
        }
    }

    /// Frame to write in place of `live` while pseudo-paused.
    ///
    /// The result always has the live frame's geometry and pixel format, so
    /// the encoder never sees a size change across the pause.
    fn frozen_frame(&self, device: &DeviceId, live: &VideoFrame, writer: &DeviceWriter) -> Option<VideoFrame> {
        let matches = |frame: &VideoFrame| {
            frame.width == live.width && frame.height == live.height && frame.pixel_format == live.pixel_format
        };

        let cached = self.shared.freeze_frames.read().get(device).filter(|f| matches(f)).cloned();
        if cached.is_some() {
            return cached;
        }

        let fitted = self
            .shared
            .freeze_image
            .read()
            .as_ref()
            .and_then(|image| image.fit(live.width, live.height, live.pixel_format));
        let frame = fitted.or_else(|| writer.last_frame().filter(|f| matches(f)))?;
        self.shared.freeze_frames.write().insert(device.clone(), frame.clone());
        Some(frame)
    }

    /// Apply a disconnect or reconnect reported by a capture pipeline
    pub fn handle_stream_event(&self, event: StreamEvent) {
        let mut tracker = self.shared.tracker.lock();
        match event {
            StreamEvent::Disconnected(stream) => {
                if tracker.mark_disconnected(&stream) {
                    tracing::warn!("{} disconnected", stream);
                }
            }
            StreamEvent::Reconnected(stream) => {
                if tracker.mark_reconnected(&stream) {
                    tracing::info!("{} reconnected", stream);
                }
            }
        }
    }

    pub fn counters(&self) -> RouterCounters {
        self.shared.counters.snapshot()
    }

    /// Current offset of a stream's timeline
    pub fn offset(&self, stream: &StreamId) -> Duration {
        self.shared.tracker.lock().offset(stream)
    }
}

impl SampleHandler for SampleBufferRouter {
    fn on_sample(&self, sample: SampleBuffer) {
        self.route(sample);
    }

    fn on_stream_event(&self, event: StreamEvent) {
        self.handle_stream_event(event);
    }
}
