//! Per-stream file writers
//!
//! A [`DeviceWriter`] wraps one concrete [`SampleSink`] (encoder plus output
//! file) and enforces the rules every sink relies on: the session is anchored
//! at the first written sample, times strictly increase, and nothing is
//! written after close. The writer's lock doubles as the barrier that lets
//! finalize wait for an in-flight write.

use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::capture::traits::{AudioSample, DeviceDescriptor, StreamId, VideoFrame};
use crate::recorder::state::RecordingOptions;
use crate::utils::error::{FinalizeError, SinkError, WriteError};

/// Sample data handed to a sink
#[derive(Debug, Clone, Copy)]
pub enum SamplePayload<'a> {
    Video(&'a VideoFrame),
    /// Interleaved s16le PCM with its rate and channel count
    Audio(&'a AudioSample),
}

/// A concrete encoder/output file pair
pub trait SampleSink: Send {
    fn output_path(&self) -> &Path;

    /// Create the output file and get ready to accept samples
    fn prepare(&mut self) -> Result<(), SinkError>;

    /// Called once, before the first write, with the adjusted time of the
    /// first sample. File times passed to `write` are relative to it.
    fn start_session(&mut self, _anchor: Duration) -> Result<(), SinkError> {
        Ok(())
    }

    fn write(&mut self, file_time: Duration, payload: &SamplePayload<'_>) -> Result<(), SinkError>;

    /// Flush and close the file. `end` is the file time at which the last
    /// sample ends.
    fn finalize(&mut self, end: Duration) -> Result<(), SinkError>;

    /// Drop the output without finishing it
    fn abort(&mut self);
}

/// Creates sinks for a recording
pub trait SinkFactory: Send + Sync {
    fn create_video_sink(
        &self,
        device: &DeviceDescriptor,
        path: &Path,
        options: &RecordingOptions,
    ) -> Result<Box<dyn SampleSink>, SinkError>;

    fn create_audio_sink(&self, path: &Path, options: &RecordingOptions) -> Result<Box<dyn SampleSink>, SinkError>;
}

struct WriterInner {
    sink: Option<Box<dyn SampleSink>>,
    anchor: Option<Duration>,
    last_time: Option<Duration>,
    last_duration: Option<Duration>,
    last_frame: Option<VideoFrame>,
    finalized: Option<Result<Duration, FinalizeError>>,
}

/// Writer for one stream of one recording
pub struct DeviceWriter {
    stream: StreamId,
    output_path: PathBuf,
    inner: Mutex<WriterInner>,
    ready: AtomicBool,
    closed: AtomicBool,
    samples_written: AtomicU64,
    write_failures: AtomicU64,
}

/// Per-writer diagnostics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriterDiagnostics {
    pub stream: String,
    pub path: String,
    pub ready: bool,
    pub closed: bool,
    pub session_started: bool,
    pub samples_written: u64,
    pub write_failures: u64,
    pub last_time_ms: Option<f64>,
}

impl DeviceWriter {
    /// Prepare the sink and wrap it in a ready writer
    pub fn prepare(stream: StreamId, mut sink: Box<dyn SampleSink>) -> Result<Self, SinkError> {
        sink.prepare()?;
        let output_path = sink.output_path().to_path_buf();

        tracing::debug!("Prepared {} writer at {:?}", stream, output_path);

        Ok(Self {
            stream,
            output_path,
            inner: Mutex::new(WriterInner {
                sink: Some(sink),
                anchor: None,
                last_time: None,
                last_duration: None,
                last_frame: None,
                finalized: None,
            }),
            ready: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            samples_written: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        })
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn session_started(&self) -> bool {
        self.inner.lock().anchor.is_some()
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    /// Last video frame successfully written
    pub fn last_frame(&self) -> Option<VideoFrame> {
        self.inner.lock().last_frame.clone()
    }

    /// Adjusted time of the last written sample
    pub fn last_time(&self) -> Option<Duration> {
        self.inner.lock().last_time
    }

    /// Write a sample at its adjusted time
    pub fn write(
        &self,
        adjusted: Duration,
        duration: Option<Duration>,
        payload: SamplePayload<'_>,
    ) -> Result<(), WriteError> {
        let result = self.write_locked(adjusted, duration, payload);
        match &result {
            Ok(()) => {
                self.samples_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    fn write_locked(
        &self,
        adjusted: Duration,
        duration: Option<Duration>,
        payload: SamplePayload<'_>,
    ) -> Result<(), WriteError> {
        let mut inner = self.inner.lock();

        if self.closed.load(Ordering::SeqCst) {
            return Err(WriteError::Closed(self.stream.to_string()));
        }
        if !self.ready.load(Ordering::SeqCst) {
            return Err(WriteError::NotReady(self.stream.to_string()));
        }
        if let Some(last) = inner.last_time {
            if adjusted <= last {
                return Err(WriteError::NonMonotonic {
                    writer: self.stream.to_string(),
                    time_ms: adjusted.as_secs_f64() * 1000.0,
                    last_ms: last.as_secs_f64() * 1000.0,
                });
            }
        }

        let WriterInner { sink, anchor, .. } = &mut *inner;
        let sink = sink
            .as_mut()
            .ok_or_else(|| WriteError::Closed(self.stream.to_string()))?;

        let anchor = match *anchor {
            Some(anchor) => anchor,
            None => {
                sink.start_session(adjusted)?;
                *anchor = Some(adjusted);
                tracing::debug!("{} session anchored at {:?}", self.stream, adjusted);
                adjusted
            }
        };

        sink.write(adjusted - anchor, &payload)?;

        inner.last_time = Some(adjusted);
        inner.last_duration = duration.filter(|d| !d.is_zero()).or(inner.last_duration);
        if let SamplePayload::Video(frame) = payload {
            inner.last_frame = Some(frame.clone());
        }
        Ok(())
    }

    /// Stop accepting writes. Pending and future writes fail with `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Finalize the output file and return the file's duration.
    ///
    /// Blocks until any in-flight write has completed. A writer that never
    /// received a sample produces an empty file of zero duration.
    pub fn finalize(&self) -> Result<Duration, FinalizeError> {
        let mut inner = self.inner.lock();
        self.closed.store(true, Ordering::SeqCst);

        if let Some(result) = &inner.finalized {
            return result.clone();
        }

        let duration = match (inner.anchor, inner.last_time) {
            (Some(anchor), Some(last)) => (last - anchor) + inner.last_duration.unwrap_or_default(),
            _ => Duration::ZERO,
        };

        let mut sink = inner
            .sink
            .take()
            .ok_or_else(|| FinalizeError::new(self.stream.to_string(), "writer was aborted"))?;

        let result = match sink.finalize(duration) {
            Ok(()) => {
                tracing::info!(
                    "Finalized {} ({:.1}ms) at {:?}",
                    self.stream,
                    duration.as_secs_f64() * 1000.0,
                    self.output_path
                );
                Ok(duration)
            }
            Err(e) => {
                tracing::error!("Failed to finalize {}: {}", self.stream, e);
                Err(FinalizeError::new(self.stream.to_string(), e.to_string()))
            }
        };
        inner.finalized = Some(result.clone());
        result
    }

    /// Discard the output without finalizing it
    pub fn abort(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        if let Some(mut sink) = inner.sink.take() {
            tracing::debug!("Aborting {} writer", self.stream);
            sink.abort();
        }
    }

    pub fn diagnostics(&self) -> WriterDiagnostics {
        let inner = self.inner.lock();
        WriterDiagnostics {
            stream: self.stream.to_string(),
            path: self.output_path.to_string_lossy().to_string(),
            ready: self.ready.load(Ordering::SeqCst),
            closed: self.closed.load(Ordering::SeqCst),
            session_started: inner.anchor.is_some(),
            samples_written: self.samples_written(),
            write_failures: self.write_failures(),
            last_time_ms: inner.last_time.map(|t| t.as_secs_f64() * 1000.0),
        }
    }
}

impl Drop for DeviceWriter {
    fn drop(&mut self) {
        if let Some(mut sink) = self.inner.get_mut().sink.take() {
            tracing::warn!("{} writer dropped before finalize, discarding output", self.stream);
            sink.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::traits::{DeviceId, PixelFormat};
    use crate::recorder::test_support::{frame, MemorySinkFactory};

    fn writer(factory: &MemorySinkFactory, id: &str) -> DeviceWriter {
        let device = DeviceDescriptor::new(id, id);
        let sink = factory
            .create_video_sink(&device, Path::new("/tmp/out.mp4"), &RecordingOptions::default())
            .unwrap();
        DeviceWriter::prepare(StreamId::Video(DeviceId::new(id)), sink).unwrap()
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_anchor_at_first_sample() {
        let factory = MemorySinkFactory::new();
        let writer = writer(&factory, "cam");

        writer.write(ms(500), None, SamplePayload::Video(&frame(1))).unwrap();
        writer.write(ms(533), None, SamplePayload::Video(&frame(2))).unwrap();

        let record = factory.record("video:cam").unwrap();
        assert!(record.prepared);
        assert_eq!(record.anchor, Some(ms(500)));
        assert_eq!(record.writes, vec![(ms(0), 1), (ms(33), 2)]);
        assert_eq!(writer.last_frame().unwrap().data[0], 2);
    }

    #[test]
    fn test_non_monotonic_write_rejected_and_counted() {
        let factory = MemorySinkFactory::new();
        let writer = writer(&factory, "cam");

        writer.write(ms(100), None, SamplePayload::Video(&frame(1))).unwrap();
        let result = writer.write(ms(100), None, SamplePayload::Video(&frame(2)));

        assert!(matches!(result, Err(WriteError::NonMonotonic { .. })));
        assert_eq!(writer.samples_written(), 1);
        assert_eq!(writer.write_failures(), 1);
        assert_eq!(factory.record("video:cam").unwrap().writes.len(), 1);
    }

    #[test]
    fn test_write_after_close_fails() {
        let factory = MemorySinkFactory::new();
        let writer = writer(&factory, "cam");

        writer.close();
        let result = writer.write(ms(0), None, SamplePayload::Video(&frame(1)));

        assert!(matches!(result, Err(WriteError::Closed(_))));
        assert!(!writer.is_ready());
    }

    #[test]
    fn test_finalize_reports_duration_and_is_idempotent() {
        let factory = MemorySinkFactory::new();
        let writer = writer(&factory, "cam");

        for (i, t) in [200u64, 233, 266].iter().enumerate() {
            writer
                .write(ms(*t), Some(ms(33)), SamplePayload::Video(&frame(i as u8)))
                .unwrap();
        }

        assert_eq!(writer.finalize().unwrap(), ms(99));
        assert_eq!(writer.finalize().unwrap(), ms(99));
        assert_eq!(factory.record("video:cam").unwrap().finalized, Some(ms(99)));
    }

    #[test]
    fn test_empty_writer_finalizes_to_zero() {
        let factory = MemorySinkFactory::new();
        let writer = writer(&factory, "cam");

        assert_eq!(writer.finalize().unwrap(), Duration::ZERO);
        assert!(!writer.session_started());
    }

    #[test]
    fn test_drop_without_finalize_aborts_sink() {
        let factory = MemorySinkFactory::new();
        {
            let writer = writer(&factory, "cam");
            let frame = VideoFrame::new(vec![0u8; 16], 2, 2, PixelFormat::Rgba);
            writer.write(ms(0), None, SamplePayload::Video(&frame)).unwrap();
        }

        let record = factory.record("video:cam").unwrap();
        assert!(record.aborted);
        assert!(record.finalized.is_none());
    }
}
