//! In-memory sinks and sample builders shared by the recorder tests

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::capture::traits::{
    AudioSample, DeviceDescriptor, DeviceId, PixelFormat, SampleBuffer, VideoFrame, VideoSample,
};
use crate::recorder::state::RecordingOptions;
use crate::recorder::writer::{SampleSink, SamplePayload, SinkFactory};
use crate::utils::error::SinkError;

/// What a [`MemorySink`] observed
#[derive(Debug, Clone, Default)]
pub struct SinkRecord {
    pub path: PathBuf,
    pub prepared: bool,
    pub anchor: Option<Duration>,
    /// File time and first payload byte of every write
    pub writes: Vec<(Duration, u8)>,
    pub finalized: Option<Duration>,
    /// Writes that reached the sink after it was finalized
    pub writes_after_finalize: usize,
    pub aborted: bool,
}

/// In-memory sink. Like an encoder, it locks the frame geometry on the first
/// video write and rejects any other size or format afterwards.
pub struct MemorySink {
    label: String,
    path: PathBuf,
    record: Arc<Mutex<SinkRecord>>,
    fail_finalize: bool,
    geometry: Option<(u32, u32, PixelFormat)>,
}

impl SampleSink for MemorySink {
    fn output_path(&self) -> &Path {
        &self.path
    }

    fn prepare(&mut self) -> Result<(), SinkError> {
        self.record.lock().prepared = true;
        Ok(())
    }

    fn start_session(&mut self, anchor: Duration) -> Result<(), SinkError> {
        self.record.lock().anchor = Some(anchor);
        Ok(())
    }

    fn write(&mut self, file_time: Duration, payload: &SamplePayload<'_>) -> Result<(), SinkError> {
        let first = match payload {
            SamplePayload::Video(frame) => {
                let geometry = (frame.width, frame.height, frame.pixel_format);
                match self.geometry {
                    Some(expected) if expected != geometry => {
                        return Err(SinkError::InvalidPayload(format!(
                            "Frame geometry changed from {:?} to {:?}",
                            expected, geometry
                        )));
                    }
                    _ => self.geometry = Some(geometry),
                }
                frame.data.first().copied()
            }
            SamplePayload::Audio(sample) => sample.data.first().copied(),
        };
        let mut record = self.record.lock();
        if record.finalized.is_some() {
            record.writes_after_finalize += 1;
        }
        record.writes.push((file_time, first.unwrap_or(0)));
        Ok(())
    }

    fn finalize(&mut self, end: Duration) -> Result<(), SinkError> {
        if self.fail_finalize {
            return Err(SinkError::Encoder(format!("{} refused to finalize", self.label)));
        }
        self.record.lock().finalized = Some(end);
        Ok(())
    }

    fn abort(&mut self) {
        self.record.lock().aborted = true;
    }
}

/// Factory handing out [`MemorySink`]s keyed by stream label
/// (`video:<device>` or `audio`)
#[derive(Default)]
pub struct MemorySinkFactory {
    records: Mutex<BTreeMap<String, Arc<Mutex<SinkRecord>>>>,
    fail_create: Mutex<HashSet<String>>,
    fail_finalize: Mutex<HashSet<String>>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, label: &str) {
        self.fail_create.lock().insert(label.to_string());
    }

    pub fn fail_finalize(&self, label: &str) {
        self.fail_finalize.lock().insert(label.to_string());
    }

    pub fn record(&self, label: &str) -> Option<SinkRecord> {
        self.records.lock().get(label).map(|r| r.lock().clone())
    }

    pub fn sink_count(&self) -> usize {
        self.records.lock().len()
    }

    fn create(&self, label: String, path: &Path) -> Result<Box<dyn SampleSink>, SinkError> {
        if self.fail_create.lock().contains(&label) {
            return Err(SinkError::Encoder(format!("cannot open {}", path.display())));
        }

        let record = Arc::new(Mutex::new(SinkRecord {
            path: path.to_path_buf(),
            ..Default::default()
        }));
        self.records.lock().insert(label.clone(), record.clone());

        Ok(Box::new(MemorySink {
            fail_finalize: self.fail_finalize.lock().contains(&label),
            label,
            path: path.to_path_buf(),
            record,
            geometry: None,
        }))
    }
}

impl SinkFactory for MemorySinkFactory {
    fn create_video_sink(
        &self,
        device: &DeviceDescriptor,
        path: &Path,
        _options: &RecordingOptions,
    ) -> Result<Box<dyn SampleSink>, SinkError> {
        self.create(format!("video:{}", device.id), path)
    }

    fn create_audio_sink(&self, path: &Path, _options: &RecordingOptions) -> Result<Box<dyn SampleSink>, SinkError> {
        self.create("audio".to_string(), path)
    }
}

/// 2x2 RGBA frame filled with `fill`
pub fn frame(fill: u8) -> VideoFrame {
    VideoFrame::new(vec![fill; 16], 2, 2, PixelFormat::Rgba)
}

/// 4x2 NV12 frame with every byte set to `fill`
pub fn nv12_frame(fill: u8) -> VideoFrame {
    VideoFrame::new(vec![fill; 12], 4, 2, PixelFormat::Nv12)
}

pub fn video_sample(device: &str, pts_ms: u64, fill: u8) -> SampleBuffer {
    SampleBuffer::Video(VideoSample {
        device: DeviceId::new(device),
        pts: Duration::from_millis(pts_ms),
        duration: None,
        frame: frame(fill),
    })
}

/// 10ms of mono 48kHz PCM filled with `fill`
pub fn audio_sample(pts_ms: u64, fill: u8) -> SampleBuffer {
    SampleBuffer::Audio(AudioSample::new(
        Duration::from_millis(pts_ms),
        vec![fill; 960],
        48_000,
        1,
    ))
}

pub fn devices(ids: &[&str]) -> Vec<DeviceDescriptor> {
    ids.iter().map(|id| DeviceDescriptor::new(*id, *id)).collect()
}

pub fn paths(dir: &Path, ids: &[&str]) -> Vec<PathBuf> {
    ids.iter().map(|id| dir.join(format!("{id}.mp4"))).collect()
}
