//! Timestamp offset tracking
//!
//! Maps raw capture timestamps onto continuous per-file timelines. Every
//! device's video stream and the shared audio stream keep their own offset,
//! because each is driven by its own clock.
//!
//! Pauses and disconnects never touch an offset directly. They mark the
//! timeline as gap-pending, and the first sample accepted afterwards folds the
//! dead time (`raw - end of last sample`) into the offset. The adjusted time
//! is `raw - offset`, so output continues one sample after the last one
//! written.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::capture::traits::{DeviceId, Resolution, StreamId};

/// Timing record for one stream
#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    /// Raw time of the last accepted sample
    pub last_sample_time: Option<Duration>,

    /// Duration of the last accepted sample, reported or inferred
    pub last_sample_duration: Option<Duration>,

    /// Accumulated dead time subtracted from raw timestamps
    pub offset: Duration,

    pub disconnected: bool,

    /// A pause or reconnect happened; the next sample folds the gap
    pub gap_pending: bool,

    /// Used as the sample duration until one is observed
    pub nominal_interval: Duration,

    pub dropped_regressions: u64,

    pub gaps_folded: u32,
}

impl Timeline {
    pub fn new(nominal_interval: Duration) -> Self {
        Self {
            last_sample_time: None,
            last_sample_duration: None,
            offset: Duration::ZERO,
            disconnected: false,
            gap_pending: false,
            nominal_interval,
            dropped_regressions: 0,
            gaps_folded: 0,
        }
    }

    /// Raw time at which the last accepted sample ends
    pub fn last_sample_end(&self) -> Option<Duration> {
        let duration = self.last_sample_duration.unwrap_or(self.nominal_interval);
        self.last_sample_time.map(|t| t + duration)
    }

    /// Adjusted time of the last accepted sample
    pub fn last_adjusted_time(&self) -> Option<Duration> {
        self.last_sample_time.map(|t| t.saturating_sub(self.offset))
    }
}

/// All timing state for one recording session
#[derive(Debug, Clone)]
pub struct TimingState {
    pub video: BTreeMap<DeviceId, Timeline>,
    pub audio: Timeline,
    pub preview_size: Option<Resolution>,
    video_interval: Duration,
}

impl TimingState {
    fn new(video_interval: Duration, audio_interval: Duration) -> Self {
        Self {
            video: BTreeMap::new(),
            audio: Timeline::new(audio_interval),
            preview_size: None,
            video_interval,
        }
    }

    pub fn timeline(&self, stream: &StreamId) -> Option<&Timeline> {
        match stream {
            StreamId::Video(device) => self.video.get(device),
            StreamId::Audio => Some(&self.audio),
        }
    }

    /// Video timelines exist only for devices registered by
    /// [`TimingOffsetTracker::reset`]
    fn timeline_mut(&mut self, stream: &StreamId) -> Option<&mut Timeline> {
        match stream {
            StreamId::Video(device) => self.video.get_mut(device),
            StreamId::Audio => Some(&mut self.audio),
        }
    }

    fn timelines_mut(&mut self) -> impl Iterator<Item = &mut Timeline> {
        self.video.values_mut().chain(std::iter::once(&mut self.audio))
    }
}

/// Result of asking the tracker for a sample's adjusted time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingDecision {
    /// Write the sample at this adjusted time. `duration` is the reported
    /// or inferred sample duration.
    Accept { adjusted: Duration, duration: Duration },
    /// Raw time did not advance past the last accepted sample
    Regression,
    /// The stream is flagged disconnected and no reconnect was observed
    Disconnected,
    /// No timeline is registered for the stream
    Unknown,
}

/// Per-timeline diagnostics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineDiagnostics {
    pub stream: String,
    pub offset_ms: f64,
    pub last_sample_ms: Option<f64>,
    pub disconnected: bool,
    pub dropped_regressions: u64,
    pub gaps_folded: u32,
}

/// Sole mutation path for [`TimingState`].
///
/// The tracker itself is not synchronized; the session keeps it behind a
/// single lock shared by the control context and every capture callback.
#[derive(Debug, Clone)]
pub struct TimingOffsetTracker {
    state: TimingState,
}

/// Audio chunks report their own duration; this only covers empty chunks.
const DEFAULT_AUDIO_INTERVAL: Duration = Duration::from_millis(10);

impl TimingOffsetTracker {
    pub fn new(video_interval: Duration) -> Self {
        Self {
            state: TimingState::new(video_interval, DEFAULT_AUDIO_INTERVAL),
        }
    }

    /// Start fresh timelines for a new recording. The preview size survives.
    pub fn reset(&mut self, devices: &[DeviceId], video_interval: Duration) {
        let preview_size = self.state.preview_size;
        self.state = TimingState::new(video_interval, DEFAULT_AUDIO_INTERVAL);
        self.state.preview_size = preview_size;
        for device in devices {
            self.state
                .video
                .insert(device.clone(), Timeline::new(video_interval));
        }
    }

    pub fn state(&self) -> &TimingState {
        &self.state
    }

    pub fn set_preview_size(&mut self, size: Resolution) {
        self.state.preview_size = Some(size);
    }

    /// Mark every timeline so the next accepted sample folds the pause gap
    pub fn mark_paused(&mut self) {
        for timeline in self.state.timelines_mut() {
            timeline.gap_pending = true;
        }
    }

    /// Mark one timeline so its next accepted sample folds the gap
    pub fn mark_gap(&mut self, stream: &StreamId) {
        if let Some(timeline) = self.state.timeline_mut(stream) {
            timeline.gap_pending = true;
        }
    }

    /// Returns false when the stream was already disconnected or is not
    /// part of the recording
    pub fn mark_disconnected(&mut self, stream: &StreamId) -> bool {
        let Some(timeline) = self.state.timeline_mut(stream) else {
            return false;
        };
        if timeline.disconnected {
            return false;
        }
        timeline.disconnected = true;
        true
    }

    /// Returns false when the stream was not disconnected
    pub fn mark_reconnected(&mut self, stream: &StreamId) -> bool {
        let Some(timeline) = self.state.timeline_mut(stream) else {
            return false;
        };
        if !timeline.disconnected {
            return false;
        }
        timeline.disconnected = false;
        timeline.gap_pending = true;
        true
    }

    pub fn is_disconnected(&self, stream: &StreamId) -> bool {
        self.state
            .timeline(stream)
            .map(|t| t.disconnected)
            .unwrap_or(false)
    }

    pub fn offset(&self, stream: &StreamId) -> Duration {
        self.state
            .timeline(stream)
            .map(|t| t.offset)
            .unwrap_or_default()
    }

    /// Compute the adjusted time for a sample and advance the timeline
    pub fn adjust(&mut self, stream: &StreamId, raw: Duration, duration: Option<Duration>) -> TimingDecision {
        let Some(timeline) = self.state.timeline_mut(stream) else {
            return TimingDecision::Unknown;
        };

        if timeline.disconnected {
            return TimingDecision::Disconnected;
        }

        if let Some(last) = timeline.last_sample_time {
            if raw <= last {
                timeline.dropped_regressions += 1;
                tracing::trace!("Dropping {} sample at {:?}: not after {:?}", stream, raw, last);
                return TimingDecision::Regression;
            }
        }

        let duration = duration.filter(|d| !d.is_zero());
        let mut folded = false;

        if timeline.gap_pending {
            timeline.gap_pending = false;
            if let Some(end) = timeline.last_sample_end() {
                let gap = raw.saturating_sub(end);
                timeline.offset += gap;
                timeline.gaps_folded += 1;
                folded = true;
                tracing::debug!(
                    "Folded {:.1}ms gap into {} offset (now {:.1}ms)",
                    gap.as_secs_f64() * 1000.0,
                    stream,
                    timeline.offset.as_secs_f64() * 1000.0
                );
            }
        }

        // The interval across a folded gap says nothing about the cadence
        let inferred = match (duration, timeline.last_sample_time) {
            (Some(d), _) => Some(d),
            (None, _) if folded => timeline.last_sample_duration,
            (None, Some(last)) => Some(raw - last),
            (None, None) => None,
        };

        timeline.last_sample_duration = inferred;
        timeline.last_sample_time = Some(raw);

        TimingDecision::Accept {
            adjusted: raw.saturating_sub(timeline.offset),
            duration: inferred.unwrap_or(timeline.nominal_interval),
        }
    }

    pub fn diagnostics(&self) -> Vec<TimelineDiagnostics> {
        let video = self
            .state
            .video
            .iter()
            .map(|(device, timeline)| (StreamId::Video(device.clone()), timeline));
        video
            .chain(std::iter::once((StreamId::Audio, &self.state.audio)))
            .map(|(stream, timeline)| TimelineDiagnostics {
                stream: stream.to_string(),
                offset_ms: timeline.offset.as_secs_f64() * 1000.0,
                last_sample_ms: timeline
                    .last_sample_time
                    .map(|t| t.as_secs_f64() * 1000.0),
                disconnected: timeline.disconnected,
                dropped_regressions: timeline.dropped_regressions,
                gaps_folded: timeline.gaps_folded,
            })
            .collect()
    }
}
