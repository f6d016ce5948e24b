//! FFmpeg-backed sinks
//!
//! Each sink pipes raw samples into an `ffmpeg` child process. `prepare`
//! checks that the binary runs; the process itself is spawned on the first
//! write, once the frame geometry is known. Video is kept
//! at a constant frame rate by repeating the previous frame across gaps; audio
//! gaps are filled with silence.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::Duration;

use crate::capture::traits::{DeviceDescriptor, PixelFormat, Resolution, VideoFrame};
use crate::recorder::state::{RecordingOptions, VideoCodec, VideoFileType};
use crate::recorder::writer::{SampleSink, SamplePayload, SinkFactory};
use crate::utils::error::SinkError;

/// Check that the ffmpeg binary can be executed
pub fn check_ffmpeg(binary: &str) -> Result<(), SinkError> {
    let output = Command::new(binary)
        .arg("-version")
        .output()
        .map_err(|e| SinkError::Encoder(format!("FFmpeg not found ({}): {}", binary, e)))?;

    if !output.status.success() {
        return Err(SinkError::Encoder(format!(
            "FFmpeg exited with status {}",
            output.status
        )));
    }
    Ok(())
}

/// Running encoder process.
///
/// Kills the process and deletes the partial output on drop unless
/// [`EncoderProcess::finish`] completed.
struct EncoderProcess {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    output_path: PathBuf,
    completed: bool,
}

impl EncoderProcess {
    fn spawn(binary: &str, args: &[String], output_path: &Path) -> Result<Self, SinkError> {
        tracing::debug!("Starting FFmpeg encoder: {:?}", args);

        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SinkError::Encoder(format!("Failed to start FFmpeg encoder: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SinkError::Encoder("Failed to capture FFmpeg stdin".to_string()))?;

        Ok(Self {
            child: Some(child),
            stdin: Some(stdin),
            output_path: output_path.to_path_buf(),
            completed: false,
        })
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), SinkError> {
        let stdin = self.stdin.as_mut().ok_or(SinkError::NotPrepared)?;
        stdin.write_all(data)?;
        Ok(())
    }

    /// Close stdin and wait for the encoder to exit
    fn finish(&mut self) -> Result<(), SinkError> {
        drop(self.stdin.take());

        let child = self.child.take().ok_or(SinkError::NotPrepared)?;
        let output = child
            .wait_with_output()
            .map_err(|e| SinkError::Encoder(format!("Failed to wait for FFmpeg: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SinkError::Encoder(format!(
                "FFmpeg exited with error: {}",
                stderr.trim()
            )));
        }

        self.completed = true;
        Ok(())
    }
}

impl Drop for EncoderProcess {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            tracing::debug!("Killing FFmpeg process for {:?}", self.output_path);
            if let Err(e) = child.kill() {
                tracing::warn!("Failed to kill FFmpeg: {}", e);
            }
            let _ = child.wait();
        }

        if self.output_path.exists() {
            tracing::info!("Deleting partial file: {:?}", self.output_path);
            if let Err(e) = std::fs::remove_file(&self.output_path) {
                tracing::warn!("Failed to delete partial file: {}", e);
            }
        }
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), SinkError> {
    if path.is_dir() {
        return Err(SinkError::InvalidPayload(format!(
            "Output path {:?} is a directory",
            path
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Encoder settings derived from [`RecordingOptions`]
#[derive(Debug, Clone, PartialEq)]
pub struct VideoEncodeConfig {
    pub codec: VideoCodec,
    pub file_type: VideoFileType,
    pub crf: u8,
    pub fps: u32,
    pub target: Option<Resolution>,
    pub rotation: u16,
}

impl VideoEncodeConfig {
    pub fn from_options(options: &RecordingOptions) -> Self {
        Self {
            codec: options.video.codec,
            file_type: options.video.file_type,
            crf: options.quality.crf(),
            fps: options.video.fps.max(1),
            target: options.quality.resolution(),
            rotation: options.orientation.rotation_degrees(),
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps as f64)
    }
}

/// Output size for a source frame, matching the source's orientation.
/// `None` when no scaling is needed.
fn output_size(width: u32, height: u32, target: Option<Resolution>) -> Option<Resolution> {
    let target = target?;
    let target = if height > width {
        Resolution::new(target.height, target.width)
    } else {
        target
    };
    if target.width == width && target.height == height {
        None
    } else {
        Some(target)
    }
}

/// Arguments for encoding raw frames of the given geometry from stdin
pub fn video_args(
    config: &VideoEncodeConfig,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    output_path: &Path,
) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pixel_format".to_string(),
        pixel_format.ffmpeg_name().to_string(),
        "-video_size".to_string(),
        format!("{}x{}", width, height),
        "-framerate".to_string(),
        config.fps.to_string(),
        "-i".to_string(),
        "-".to_string(),
    ];

    if let Some(size) = output_size(width, height, config.target) {
        args.extend([
            "-vf".to_string(),
            format!(
                "scale={}:{}:force_original_aspect_ratio=decrease,pad={}:{}:(ow-iw)/2:(oh-ih)/2:black",
                size.width, size.height, size.width, size.height
            ),
        ]);
    }

    args.extend([
        "-c:v".to_string(),
        config.codec.ffmpeg_encoder().to_string(),
        "-preset".to_string(),
        "veryfast".to_string(),
        "-crf".to_string(),
        config.crf.to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-g".to_string(),
        (config.fps * 2).to_string(),
    ]);

    if config.codec == VideoCodec::Hevc {
        args.extend(["-tag:v".to_string(), "hvc1".to_string()]);
    }
    if config.rotation != 0 {
        args.extend([
            "-metadata:s:v:0".to_string(),
            format!("rotate={}", config.rotation),
        ]);
    }

    args.extend([
        "-movflags".to_string(),
        "+faststart".to_string(),
        "-f".to_string(),
        config.file_type.extension().to_string(),
        output_path.to_string_lossy().to_string(),
    ]);
    args
}

/// How to bring a constant-rate stream up to a sample's file time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePlan {
    /// The slot for this time is already filled
    Skip,
    /// Repeat the previous frame `fill` times, then write the new one
    Write { fill: u64 },
}

/// Plan the write of a frame at `file_time` when `frames_written` frames
/// of `interval` each are already in the stream
pub fn cfr_plan(file_time: Duration, interval: Duration, frames_written: u64) -> FramePlan {
    if interval.is_zero() {
        return FramePlan::Write { fill: 0 };
    }
    let slot = (file_time.as_secs_f64() / interval.as_secs_f64()).round() as u64;
    if frames_written > 0 && slot < frames_written {
        FramePlan::Skip
    } else {
        FramePlan::Write {
            fill: slot.saturating_sub(frames_written),
        }
    }
}

/// Frames needed so that a stream of `frames_written` frames lasts `end`
pub fn trailing_frames(end: Duration, interval: Duration, frames_written: u64) -> u64 {
    if interval.is_zero() {
        return 0;
    }
    let total = (end.as_secs_f64() / interval.as_secs_f64()).round() as u64;
    total.saturating_sub(frames_written)
}

/// Constant-frame-rate video file written through ffmpeg
pub struct FfmpegVideoSink {
    binary: String,
    output_path: PathBuf,
    config: VideoEncodeConfig,
    process: Option<EncoderProcess>,
    geometry: Option<(u32, u32, PixelFormat)>,
    last_frame: Option<VideoFrame>,
    frames_written: u64,
    prepared: bool,
}

impl FfmpegVideoSink {
    pub fn new(binary: impl Into<String>, output_path: &Path, config: VideoEncodeConfig) -> Self {
        Self {
            binary: binary.into(),
            output_path: output_path.to_path_buf(),
            config,
            process: None,
            geometry: None,
            last_frame: None,
            frames_written: 0,
            prepared: false,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn write_frame(&mut self, frame: &VideoFrame) -> Result<(), SinkError> {
        let process = self.process.as_mut().ok_or(SinkError::NotPrepared)?;
        process.write_all(&frame.data)?;
        self.frames_written += 1;
        Ok(())
    }

    fn repeat_last(&mut self, count: u64) -> Result<(), SinkError> {
        if count == 0 {
            return Ok(());
        }
        let Some(last) = self.last_frame.clone() else {
            return Ok(());
        };
        for _ in 0..count {
            self.write_frame(&last)?;
        }
        Ok(())
    }
}

impl SampleSink for FfmpegVideoSink {
    fn output_path(&self) -> &Path {
        &self.output_path
    }

    fn prepare(&mut self) -> Result<(), SinkError> {
        ensure_parent_dir(&self.output_path)?;
        check_ffmpeg(&self.binary)?;
        self.prepared = true;
        Ok(())
    }

    fn write(&mut self, file_time: Duration, payload: &SamplePayload<'_>) -> Result<(), SinkError> {
        if !self.prepared {
            return Err(SinkError::NotPrepared);
        }
        let SamplePayload::Video(frame) = payload else {
            return Err(SinkError::InvalidPayload("Audio sent to a video sink".to_string()));
        };
        if !frame.is_well_formed() {
            return Err(SinkError::InvalidPayload(format!(
                "{} bytes for a {}x{} {:?} frame",
                frame.data.len(),
                frame.width,
                frame.height,
                frame.pixel_format
            )));
        }

        let geometry = (frame.width, frame.height, frame.pixel_format);
        match self.geometry {
            None => {
                let args = video_args(&self.config, frame.width, frame.height, frame.pixel_format, &self.output_path);
                self.process = Some(EncoderProcess::spawn(&self.binary, &args, &self.output_path)?);
                self.geometry = Some(geometry);
                tracing::info!(
                    "Started FFmpeg video encoder: {}x{} {:?} @ {}fps, output: {:?}",
                    frame.width,
                    frame.height,
                    frame.pixel_format,
                    self.config.fps,
                    self.output_path
                );
            }
            Some(expected) if expected != geometry => {
                return Err(SinkError::InvalidPayload(format!(
                    "Frame geometry changed from {:?} to {:?}",
                    expected, geometry
                )));
            }
            Some(_) => {}
        }

        match cfr_plan(file_time, self.config.frame_interval(), self.frames_written) {
            FramePlan::Skip => {
                tracing::trace!("Skipping frame at {:?}: slot already filled", file_time);
                Ok(())
            }
            FramePlan::Write { fill } => {
                self.repeat_last(fill)?;
                self.write_frame(frame)?;
                self.last_frame = Some((*frame).clone());
                Ok(())
            }
        }
    }

    fn finalize(&mut self, end: Duration) -> Result<(), SinkError> {
        if self.process.is_none() {
            tracing::warn!("No frames written to {:?}, nothing to finalize", self.output_path);
            return Ok(());
        }

        let trailing = trailing_frames(end, self.config.frame_interval(), self.frames_written);
        self.repeat_last(trailing)?;

        if let Some(mut process) = self.process.take() {
            process.finish()?;
        }
        tracing::info!(
            "FFmpeg video encoder finished: {} frames, output: {:?}",
            self.frames_written,
            self.output_path
        );
        Ok(())
    }

    fn abort(&mut self) {
        self.process.take();
    }
}

/// Arguments for encoding interleaved s16le PCM from stdin to AAC
pub fn audio_args(sample_rate: u32, channels: u16, output_path: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-f".to_string(),
        "s16le".to_string(),
        "-ar".to_string(),
        sample_rate.to_string(),
        "-ac".to_string(),
        channels.to_string(),
        "-i".to_string(),
        "-".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "128k".to_string(),
        output_path.to_string_lossy().to_string(),
    ]
}

/// Silent frames to insert before a chunk at `file_time`.
///
/// Gaps shorter than `tolerance_frames` are ignored to absorb clock jitter.
pub fn silence_frames(file_time: Duration, sample_rate: u32, frames_written: u64, tolerance_frames: u64) -> u64 {
    let expected = (file_time.as_secs_f64() * sample_rate as f64).round() as u64;
    let gap = expected.saturating_sub(frames_written);
    if gap > tolerance_frames {
        gap
    } else {
        0
    }
}

/// AAC audio file written through ffmpeg
pub struct FfmpegAudioSink {
    binary: String,
    output_path: PathBuf,
    sample_rate: u32,
    channels: u16,
    process: Option<EncoderProcess>,
    frames_written: u64,
    prepared: bool,
}

impl FfmpegAudioSink {
    pub fn new(binary: impl Into<String>, output_path: &Path, sample_rate: u32, channels: u16) -> Self {
        Self {
            binary: binary.into(),
            output_path: output_path.to_path_buf(),
            sample_rate,
            channels: channels.max(1),
            process: None,
            frames_written: 0,
            prepared: false,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn frame_bytes(&self) -> usize {
        2 * self.channels as usize
    }
}

impl SampleSink for FfmpegAudioSink {
    fn output_path(&self) -> &Path {
        &self.output_path
    }

    fn prepare(&mut self) -> Result<(), SinkError> {
        ensure_parent_dir(&self.output_path)?;
        check_ffmpeg(&self.binary)?;
        self.prepared = true;
        Ok(())
    }

    fn write(&mut self, file_time: Duration, payload: &SamplePayload<'_>) -> Result<(), SinkError> {
        if !self.prepared {
            return Err(SinkError::NotPrepared);
        }
        let SamplePayload::Audio(sample) = payload else {
            return Err(SinkError::InvalidPayload("Video sent to an audio sink".to_string()));
        };
        if sample.sample_rate != self.sample_rate || sample.channels != self.channels {
            return Err(SinkError::FormatMismatch {
                expected: format!("{}Hz x{}", self.sample_rate, self.channels),
                actual: format!("{}Hz x{}", sample.sample_rate, sample.channels),
            });
        }
        let data = &sample.data[..];
        if data.len() % self.frame_bytes() != 0 {
            return Err(SinkError::InvalidPayload(format!(
                "{} bytes is not a whole number of {}-channel frames",
                data.len(),
                self.channels
            )));
        }

        if self.process.is_none() {
            let args = audio_args(self.sample_rate, self.channels, &self.output_path);
            self.process = Some(EncoderProcess::spawn(&self.binary, &args, &self.output_path)?);
            tracing::info!(
                "Started FFmpeg audio encoder: {}Hz x{}, output: {:?}",
                self.sample_rate,
                self.channels,
                self.output_path
            );
        }

        // 20ms of jitter is tolerated before padding with silence
        let tolerance = self.sample_rate as u64 / 50;
        let silence = silence_frames(file_time, self.sample_rate, self.frames_written, tolerance);
        let frame_bytes = self.frame_bytes();
        let process = self.process.as_mut().ok_or(SinkError::NotPrepared)?;

        if silence > 0 {
            tracing::debug!("Padding {} silent frames before {:?}", silence, file_time);
            process.write_all(&vec![0u8; silence as usize * frame_bytes])?;
        }
        process.write_all(data)?;

        self.frames_written += silence + (data.len() / frame_bytes) as u64;
        Ok(())
    }

    fn finalize(&mut self, _end: Duration) -> Result<(), SinkError> {
        match self.process.take() {
            Some(mut process) => {
                process.finish()?;
                tracing::info!(
                    "FFmpeg audio encoder finished: {} frames, output: {:?}",
                    self.frames_written,
                    self.output_path
                );
            }
            None => tracing::warn!("No audio written to {:?}, nothing to finalize", self.output_path),
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.process.take();
    }
}

/// Creates ffmpeg sinks
#[derive(Debug, Clone)]
pub struct FfmpegSinkFactory {
    binary: String,
}

impl FfmpegSinkFactory {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Default for FfmpegSinkFactory {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl SinkFactory for FfmpegSinkFactory {
    fn create_video_sink(
        &self,
        device: &DeviceDescriptor,
        path: &Path,
        options: &RecordingOptions,
    ) -> Result<Box<dyn SampleSink>, SinkError> {
        tracing::debug!("Creating video sink for {} ({}) at {:?}", device.name, device.id, path);
        Ok(Box::new(FfmpegVideoSink::new(
            self.binary.clone(),
            path,
            VideoEncodeConfig::from_options(options),
        )))
    }

    fn create_audio_sink(&self, path: &Path, options: &RecordingOptions) -> Result<Box<dyn SampleSink>, SinkError> {
        Ok(Box::new(FfmpegAudioSink::new(
            self.binary.clone(),
            path,
            options.audio.sample_rate,
            options.audio.channels,
        )))
    }
}
