//! Writer pool
//!
//! Owns one [`DeviceWriter`] per video device plus the optional shared audio
//! writer for a single recording. Provisioning is all-or-nothing and
//! finalization runs every writer concurrently.

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::capture::traits::{DeviceDescriptor, DeviceId, StreamId};
use crate::recorder::state::RecordingOptions;
use crate::recorder::writer::{DeviceWriter, SinkFactory, WriterDiagnostics};
use crate::utils::error::{FinalizeError, RecorderError, RecorderResult};

/// Outcome of finalizing one writer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeReport {
    pub sink: String,
    pub path: String,
    pub duration_ms: Option<f64>,
    pub error: Option<String>,
}

impl FinalizeReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Combined result of [`WriterPool::finalize_all`]
#[derive(Debug, Clone)]
pub struct PoolSummary {
    /// Longest duration among the writers that finalized
    pub duration: Duration,
    /// One report per writer, in pool order
    pub reports: Vec<FinalizeReport>,
    /// First failure in pool order (video writers in device order, then
    /// audio), not the earliest failure in time
    pub first_error: Option<FinalizeError>,
}

pub struct WriterPool {
    video: Vec<Arc<DeviceWriter>>,
    by_device: HashMap<DeviceId, usize>,
    audio: Option<Arc<DeviceWriter>>,
}

impl WriterPool {
    /// Create and prepare every writer.
    ///
    /// If any sink cannot be created or prepared, the writers that were
    /// prepared are aborted and no pool is returned.
    pub fn provision(
        factory: &dyn SinkFactory,
        devices: &[DeviceDescriptor],
        paths: &[PathBuf],
        audio_path: Option<&Path>,
        options: &RecordingOptions,
    ) -> RecorderResult<Self> {
        if devices.len() != paths.len() {
            return Err(RecorderError::Configuration(format!(
                "Got {} output paths for {} devices",
                paths.len(),
                devices.len()
            )));
        }

        let mut video = Vec::with_capacity(devices.len());
        let mut failures = Vec::new();

        for (device, path) in devices.iter().zip(paths) {
            let stream = StreamId::Video(device.id.clone());
            let result = factory
                .create_video_sink(device, path, options)
                .and_then(|sink| DeviceWriter::prepare(stream.clone(), sink));

            match result {
                Ok(writer) => video.push(Arc::new(writer)),
                Err(e) => {
                    tracing::error!("Failed to prepare {} writer at {:?}: {}", stream, path, e);
                    failures.push(format!("{}: {}", stream, e));
                }
            }
        }

        let mut audio = None;
        if let Some(path) = audio_path {
            let result = factory
                .create_audio_sink(path, options)
                .and_then(|sink| DeviceWriter::prepare(StreamId::Audio, sink));

            match result {
                Ok(writer) => audio = Some(Arc::new(writer)),
                Err(e) => {
                    tracing::error!("Failed to prepare audio writer at {:?}: {}", path, e);
                    failures.push(format!("audio: {}", e));
                }
            }
        }

        if !failures.is_empty() {
            for writer in video.iter().chain(audio.iter()) {
                writer.abort();
            }
            return Err(RecorderError::Configuration(format!(
                "Failed to prepare writers: {}",
                failures.join("; ")
            )));
        }

        let by_device = devices
            .iter()
            .enumerate()
            .map(|(i, device)| (device.id.clone(), i))
            .collect();

        tracing::info!(
            "Provisioned {} video writer(s){}",
            video.len(),
            if audio.is_some() { " and audio" } else { "" }
        );

        Ok(Self {
            video,
            by_device,
            audio,
        })
    }

    pub fn video_writer(&self, device: &DeviceId) -> Option<&Arc<DeviceWriter>> {
        self.by_device.get(device).and_then(|i| self.video.get(*i))
    }

    pub fn audio_writer(&self) -> Option<&Arc<DeviceWriter>> {
        self.audio.as_ref()
    }

    pub fn writer(&self, stream: &StreamId) -> Option<&Arc<DeviceWriter>> {
        match stream {
            StreamId::Video(device) => self.video_writer(device),
            StreamId::Audio => self.audio_writer(),
        }
    }

    /// Video writers in device order, then audio
    pub fn writers(&self) -> impl Iterator<Item = &Arc<DeviceWriter>> {
        self.video.iter().chain(self.audio.iter())
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.video
            .iter()
            .filter_map(|w| match w.stream() {
                StreamId::Video(device) => Some(device.clone()),
                StreamId::Audio => None,
            })
            .collect()
    }

    pub fn output_files(&self) -> Vec<String> {
        self.writers()
            .map(|w| w.output_path().to_string_lossy().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.video.len() + usize::from(self.audio.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close_all(&self) {
        for writer in self.writers() {
            writer.close();
        }
    }

    pub fn abort_all(&self) {
        for writer in self.writers() {
            writer.abort();
        }
    }

    pub fn diagnostics(&self) -> Vec<WriterDiagnostics> {
        self.writers().map(|w| w.diagnostics()).collect()
    }

    /// Finalize every writer concurrently and wait for all of them.
    ///
    /// A failing writer never prevents the others from finalizing.
    pub async fn finalize_all(&self) -> PoolSummary {
        self.close_all();

        let handles: Vec<_> = self
            .writers()
            .map(|writer| {
                let writer = writer.clone();
                let label = writer.stream().to_string();
                let path = writer.output_path().to_string_lossy().to_string();
                let handle = tokio::task::spawn_blocking(move || writer.finalize());
                (label, path, handle)
            })
            .collect();

        let mut summary = PoolSummary {
            duration: Duration::ZERO,
            reports: Vec::with_capacity(handles.len()),
            first_error: None,
        };

        for (label, path, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(FinalizeError::new(label.clone(), format!("finalize task failed: {e}"))),
            };

            match result {
                Ok(duration) => {
                    summary.duration = summary.duration.max(duration);
                    summary.reports.push(FinalizeReport {
                        sink: label,
                        path,
                        duration_ms: Some(duration.as_secs_f64() * 1000.0),
                        error: None,
                    });
                }
                Err(e) => {
                    summary.reports.push(FinalizeReport {
                        sink: label,
                        path,
                        duration_ms: None,
                        error: Some(e.message.clone()),
                    });
                    if summary.first_error.is_none() {
                        summary.first_error = Some(e);
                    }
                }
            }
        }

        summary
    }
}
