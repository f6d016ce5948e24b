//! Capture trait definitions
//!
//! Platform-agnostic types for the samples a capture pipeline delivers and the
//! trait a pipeline implements to feed a recording session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::utils::error::RecorderResult;

/// Stable identifier of a capture device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Where a camera sits on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraPosition {
    Front,
    Back,
    External,
    #[default]
    Unknown,
}

/// A capture device taking part in a recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    /// Unique device ID
    pub id: DeviceId,

    /// Human readable device name
    pub name: String,

    /// Camera position
    #[serde(default)]
    pub position: CameraPosition,

    /// Native capture resolution, if known
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<DeviceId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            position: CameraPosition::Unknown,
            resolution: None,
        }
    }

    pub fn with_position(mut self, position: CameraPosition) -> Self {
        self.position = position;
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some(Resolution::new(width, height));
        self
    }
}

/// Kind of stream a sample belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Video => write!(f, "video"),
            StreamKind::Audio => write!(f, "audio"),
        }
    }
}

/// Identifies one timeline: a device's video stream or the shared audio stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamId {
    Video(DeviceId),
    Audio,
}

impl StreamId {
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamId::Video(_) => StreamKind::Video,
            StreamId::Audio => StreamKind::Audio,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamId::Video(device) => write!(f, "video:{}", device),
            StreamId::Audio => write!(f, "audio"),
        }
    }
}

/// Pixel layout of a raw video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgba,
    Bgra,
    Nv12,
    Yuyv422,
}

impl PixelFormat {
    /// FFmpeg `-pixel_format` name
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            PixelFormat::Rgba => "rgba",
            PixelFormat::Bgra => "bgra",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Yuyv422 => "yuyv422",
        }
    }

    /// Size of one tightly packed frame in bytes
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgba | PixelFormat::Bgra => pixels * 4,
            PixelFormat::Nv12 => pixels * 3 / 2,
            PixelFormat::Yuyv422 => pixels * 2,
        }
    }

    /// Whether each pixel is a packed 4-byte value
    pub fn is_packed_32(&self) -> bool {
        matches!(self, PixelFormat::Rgba | PixelFormat::Bgra)
    }
}

/// Raw video frame. The pixel data is shared so a frame can be repeated cheaply.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl VideoFrame {
    pub fn new(data: impl Into<Arc<[u8]>>, width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            pixel_format,
        }
    }

    /// Whether the buffer length matches the declared geometry
    pub fn is_well_formed(&self) -> bool {
        self.data.len() == self.pixel_format.frame_size(self.width, self.height)
    }
}

/// A video sample from one device
#[derive(Debug, Clone)]
pub struct VideoSample {
    pub device: DeviceId,
    /// Presentation time on the device's raw clock
    pub pts: Duration,
    /// Sample duration, when the pipeline reports one
    pub duration: Option<Duration>,
    pub frame: VideoFrame,
}

/// A chunk of interleaved signed 16-bit PCM audio
#[derive(Debug, Clone)]
pub struct AudioSample {
    /// Presentation time on the audio clock
    pub pts: Duration,
    pub data: Arc<[u8]>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioSample {
    pub fn new(pts: Duration, data: impl Into<Arc<[u8]>>, sample_rate: u32, channels: u16) -> Self {
        Self {
            pts,
            data: data.into(),
            sample_rate,
            channels,
        }
    }

    /// Number of frames (one sample per channel) in this chunk
    pub fn frame_count(&self) -> usize {
        let frame_bytes = 2 * self.channels.max(1) as usize;
        self.data.len() / frame_bytes
    }

    /// Playback duration derived from the PCM length
    pub fn duration(&self) -> Option<Duration> {
        if self.sample_rate == 0 || self.frame_count() == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(
            self.frame_count() as f64 / self.sample_rate as f64,
        ))
    }
}

/// One capture callback: a video or an audio sample
#[derive(Debug, Clone)]
pub enum SampleBuffer {
    Video(VideoSample),
    Audio(AudioSample),
}

impl SampleBuffer {
    pub fn kind(&self) -> StreamKind {
        match self {
            SampleBuffer::Video(_) => StreamKind::Video,
            SampleBuffer::Audio(_) => StreamKind::Audio,
        }
    }

    pub fn stream(&self) -> StreamId {
        match self {
            SampleBuffer::Video(sample) => StreamId::Video(sample.device.clone()),
            SampleBuffer::Audio(_) => StreamId::Audio,
        }
    }

    pub fn pts(&self) -> Duration {
        match self {
            SampleBuffer::Video(sample) => sample.pts,
            SampleBuffer::Audio(sample) => sample.pts,
        }
    }
}

/// Connectivity change reported by a capture pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The stream stopped delivering samples
    Disconnected(StreamId),
    /// The stream is delivering again
    Reconnected(StreamId),
}

/// Receiver of capture callbacks.
///
/// Implementations must be callable from any capture thread.
pub trait SampleHandler: Send + Sync {
    fn on_sample(&self, sample: SampleBuffer);

    fn on_stream_event(&self, event: StreamEvent);
}

/// Trait for capture pipelines
///
/// A pipeline delivers samples from its own background context into the
/// handler it was attached to. Pipelines are attached by the RecordingSession
/// once every writer is ready and detached before the writers are finalized.
#[async_trait]
pub trait CapturePipeline: Send + Sync {
    /// Pipeline identifier (e.g., "multi-cam", "microphone")
    fn id(&self) -> &str;

    /// Start delivering samples into the handler
    async fn attach(&mut self, handler: Arc<dyn SampleHandler>) -> RecorderResult<()>;

    /// Stop delivering samples. No callback may run after this returns.
    async fn detach(&mut self) -> RecorderResult<()>;

    /// Check if the pipeline is currently delivering
    fn is_attached(&self) -> bool;
}
