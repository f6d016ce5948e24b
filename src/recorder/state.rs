//! Recording state management
//!
//! Defines the recording state machine, recording options and the segment
//! ledger kept across pause/resume cycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::traits::Resolution;
use crate::recorder::pool::FinalizeReport;
use crate::recorder::router::RouterCounters;
use crate::recorder::timing::TimelineDiagnostics;
use crate::recorder::writer::WriterDiagnostics;
use crate::utils::error::{RecorderError, RecorderResult};

/// Current state of the recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordingState {
    /// No recording in progress
    #[default]
    Idle,
    /// Writers are being provisioned
    Starting,
    /// Currently recording
    Recording,
    /// Recording is paused; no samples are written
    Paused,
    /// Video keeps advancing with a frozen frame, audio stays live
    PseudoPaused,
    /// Writers are being finalized
    Stopping,
}

impl RecordingState {
    /// Returns true for every state except Idle
    pub fn is_active(&self) -> bool {
        !matches!(self, RecordingState::Idle)
    }

    /// States in which capture samples are written
    pub fn accepts_samples(&self) -> bool {
        matches!(self, RecordingState::Recording | RecordingState::PseudoPaused)
    }

    /// States from which `stop()` is allowed
    pub fn can_stop(&self) -> bool {
        matches!(
            self,
            RecordingState::Recording | RecordingState::Paused | RecordingState::PseudoPaused
        )
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordingState::Idle => "idle",
            RecordingState::Starting => "starting",
            RecordingState::Recording => "recording",
            RecordingState::Paused => "paused",
            RecordingState::PseudoPaused => "pseudo-paused",
            RecordingState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Output container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFileType {
    #[default]
    Mp4,
    Mov,
}

impl VideoFileType {
    pub fn extension(&self) -> &'static str {
        match self {
            VideoFileType::Mp4 => "mp4",
            VideoFileType::Mov => "mov",
        }
    }
}

/// Video codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    Hevc,
}

impl VideoCodec {
    /// FFmpeg encoder name
    pub fn ffmpeg_encoder(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "libx264",
            VideoCodec::Hevc => "libx265",
        }
    }
}

/// Per-file video options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoOptions {
    #[serde(default)]
    pub file_type: VideoFileType,

    #[serde(default)]
    pub codec: VideoCodec,

    /// Native capture cadence in frames per second
    #[serde(default = "default_fps")]
    pub fps: u32,
}

fn default_fps() -> u32 {
    30
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            file_type: VideoFileType::default(),
            codec: VideoCodec::default(),
            fps: default_fps(),
        }
    }
}

impl VideoOptions {
    /// Duration of one frame at the configured cadence
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}

/// Recording quality presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    Lowest,
    Sd,
    #[default]
    Hd,
    Fhd,
    Uhd,
    Highest,
}

impl VideoQuality {
    /// Target output resolution. `None` keeps the device's native size.
    pub fn resolution(&self) -> Option<Resolution> {
        match self {
            VideoQuality::Lowest | VideoQuality::Highest => None,
            VideoQuality::Sd => Some(Resolution::new(640, 480)),
            VideoQuality::Hd => Some(Resolution::new(1280, 720)),
            VideoQuality::Fhd => Some(Resolution::new(1920, 1080)),
            VideoQuality::Uhd => Some(Resolution::new(3840, 2160)),
        }
    }

    /// Constant rate factor for H.264/HEVC. Lower is better.
    pub fn crf(&self) -> u8 {
        match self {
            VideoQuality::Lowest => 32,
            VideoQuality::Sd => 26,
            VideoQuality::Hd => 23,
            VideoQuality::Fhd => 20,
            VideoQuality::Uhd => 18,
            VideoQuality::Highest => 16,
        }
    }
}

/// Orientation the recording should be played back in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Orientation {
    #[default]
    Portrait,
    PortraitUpsideDown,
    LandscapeLeft,
    LandscapeRight,
}

impl Orientation {
    /// Rotation stored as container metadata, in degrees clockwise
    pub fn rotation_degrees(&self) -> u16 {
        match self {
            Orientation::Portrait => 90,
            Orientation::PortraitUpsideDown => 270,
            Orientation::LandscapeLeft => 0,
            Orientation::LandscapeRight => 180,
        }
    }
}

/// Shared audio track options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioOptions {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_channels")]
    pub channels: u16,
}

fn default_sample_rate() -> u32 {
    48_000
}

fn default_channels() -> u16 {
    1
}

impl Default for AudioOptions {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
        }
    }
}

/// Options for starting a recording
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingOptions {
    #[serde(default)]
    pub video: VideoOptions,

    #[serde(default)]
    pub quality: VideoQuality,

    #[serde(default)]
    pub orientation: Orientation,

    #[serde(default)]
    pub audio: AudioOptions,

    /// Audio file path. Derived from the first video path when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<PathBuf>,
}

impl RecordingOptions {
    pub fn from_json_str(json: &str) -> RecorderResult<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_json_file(path: &Path) -> RecorderResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> RecorderResult<()> {
        if self.video.fps == 0 || self.video.fps > 240 {
            return Err(RecorderError::Configuration(format!(
                "Unsupported frame rate: {}",
                self.video.fps
            )));
        }
        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            return Err(RecorderError::Configuration(
                "Audio sample rate and channel count must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Where the shared audio track goes for a recording whose first video
    /// file is `first_video`
    pub fn resolve_audio_path(&self, first_video: &Path) -> PathBuf {
        if let Some(path) = &self.audio_path {
            return path.clone();
        }
        let stem = first_video
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "recording".to_string());
        first_video.with_file_name(format!("{stem}-audio.m4a"))
    }
}

/// One uninterrupted stretch of recording.
///
/// A new segment is opened at start and at every resume, and closed at every
/// pause and at stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSegment {
    /// Segment index (0, 1, 2, ...)
    pub index: usize,

    /// Offset from recording start when the segment opened, in milliseconds
    pub start_ms: f64,

    /// Offset from recording start when the segment closed
    pub end_ms: Option<f64>,

    pub started_at: DateTime<Utc>,

    pub ended_at: Option<DateTime<Utc>>,
}

impl RecordingSegment {
    pub fn open(index: usize, offset: Duration) -> Self {
        Self {
            index,
            start_ms: offset.as_secs_f64() * 1000.0,
            end_ms: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn close(&mut self, offset: Duration) {
        if self.end_ms.is_none() {
            self.end_ms = Some(offset.as_secs_f64() * 1000.0);
            self.ended_at = Some(Utc::now());
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_ms.is_none()
    }

    /// Segment length; an open segment is measured up to `now`
    pub fn duration_ms(&self, now: Duration) -> f64 {
        let end = self.end_ms.unwrap_or(now.as_secs_f64() * 1000.0);
        (end - self.start_ms).max(0.0)
    }
}

/// Snapshot of the session for a control layer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStatus {
    pub state: RecordingState,
    pub recording_id: Option<String>,
    pub devices: Vec<String>,
    pub audio_enabled: bool,
    /// Wall-clock recording time minus paused time
    pub active_duration_ms: f64,
    pub segment_count: usize,
    pub preview_size: Option<Resolution>,
    pub writers: Vec<WriterDiagnostics>,
    pub timelines: Vec<TimelineDiagnostics>,
    pub router: RouterCounters,
}

/// Result of a completed recording
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingOutput {
    pub recording_id: String,

    /// Longest file duration across all writers, in milliseconds
    pub duration_ms: f64,

    pub segment_count: usize,

    pub output_files: Vec<String>,

    pub reports: Vec<FinalizeReport>,
}

impl RecordingOutput {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_ms / 1000.0)
    }
}
