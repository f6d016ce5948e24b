//! Recording session
//!
//! Owns the state machine, the writer pool and the timing tracker for one
//! multi-camera recording. Control operations are async and serialize among
//! themselves; capture callbacks reach the session through its
//! [`SampleBufferRouter`] and never wait on a control operation.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::capture::traits::{CapturePipeline, DeviceDescriptor, DeviceId, Resolution, StreamId, VideoFrame};
use crate::recorder::freeze::FreezeFrame;
use crate::recorder::pool::{FinalizeReport, WriterPool};
use crate::recorder::router::{RouterCounterCells, SampleBufferRouter};
use crate::recorder::state::{RecordingOptions, RecordingOutput, RecordingSegment, RecordingState, RecordingStatus};
use crate::recorder::timing::TimingOffsetTracker;
use crate::recorder::writer::SinkFactory;
use crate::utils::error::{RecorderError, RecorderResult};

/// Events emitted during recording
#[derive(Debug, Clone, PartialEq)]
pub enum RecordingEvent {
    /// All writers are ready and samples are being written
    Started,
    /// Every writer finalized
    Stopped { duration_ms: f64 },
    Paused,
    Resumed,
    /// Video switched to the freeze frame
    PseudoPaused,
    PseudoResumed,
    /// Forced teardown
    Disposed,
    /// Error occurred
    Error(String),
}

/// State shared between the control context and capture callbacks.
///
/// Lock order is tracker, then state, then pool. Transitions that change
/// which samples are admitted happen while holding the tracker lock.
pub(crate) struct SessionShared {
    pub(crate) state: RwLock<RecordingState>,
    pub(crate) tracker: Mutex<TimingOffsetTracker>,
    pub(crate) pool: RwLock<Option<Arc<WriterPool>>>,
    /// Frames substituted per device while pseudo-paused
    pub(crate) freeze_frames: RwLock<HashMap<DeviceId, VideoFrame>>,
    /// Image given to the current pseudo-pause, fitted lazily for devices
    /// that had no frame yet
    pub(crate) freeze_image: RwLock<Option<FreezeFrame>>,
    pub(crate) counters: RouterCounterCells,
    audio_enabled: AtomicBool,
}

impl SessionShared {
    pub(crate) fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    fn clear_freeze(&self) {
        self.freeze_frames.write().clear();
        *self.freeze_image.write() = None;
    }
}

/// Control-side bookkeeping for the current recording
#[derive(Default)]
struct SessionInner {
    recording_id: Option<Uuid>,
    devices: Vec<DeviceDescriptor>,
    segments: Vec<RecordingSegment>,
    start_time: Option<Instant>,
    last_reports: Vec<FinalizeReport>,
}

impl SessionInner {
    fn elapsed(&self) -> Duration {
        self.start_time.map(|t| t.elapsed()).unwrap_or_default()
    }

    fn close_segment(&mut self) {
        let now = self.elapsed();
        if let Some(segment) = self.segments.last_mut() {
            segment.close(now);
        }
    }

    fn open_segment(&mut self) {
        let now = self.elapsed();
        let index = self.segments.len();
        self.segments.push(RecordingSegment::open(index, now));
    }

    fn active_duration(&self) -> Duration {
        let now = self.elapsed();
        let ms: f64 = self.segments.iter().map(|s| s.duration_ms(now)).sum();
        Duration::from_secs_f64(ms / 1000.0)
    }
}

type Pipelines = Arc<tokio::sync::Mutex<Vec<Box<dyn CapturePipeline>>>>;

/// A multi-camera recording session
pub struct RecordingSession {
    shared: Arc<SessionShared>,
    factory: Arc<dyn SinkFactory>,
    inner: Mutex<SessionInner>,
    pipelines: Pipelines,

    /// Serializes control operations
    op_lock: tokio::sync::Mutex<()>,

    /// Bumped by dispose to cancel an in-flight start or stop
    generation: AtomicU64,

    event_tx: broadcast::Sender<RecordingEvent>,
}

impl RecordingSession {
    pub fn new(factory: Arc<dyn SinkFactory>) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let video_interval = RecordingOptions::default().video.frame_interval();
        Self {
            shared: Arc::new(SessionShared {
                state: RwLock::new(RecordingState::Idle),
                tracker: Mutex::new(TimingOffsetTracker::new(video_interval)),
                pool: RwLock::new(None),
                freeze_frames: RwLock::new(HashMap::new()),
                freeze_image: RwLock::new(None),
                counters: RouterCounterCells::default(),
                audio_enabled: AtomicBool::new(false),
            }),
            factory,
            inner: Mutex::new(SessionInner::default()),
            pipelines: Arc::new(tokio::sync::Mutex::new(Vec::new())),
            op_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            event_tx,
        }
    }

    /// Handler to pass to capture pipelines
    pub fn router(&self) -> SampleBufferRouter {
        SampleBufferRouter::new(self.shared.clone())
    }

    /// Subscribe to recording events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.event_tx.subscribe()
    }

    /// Get the current recording state
    pub fn state(&self) -> RecordingState {
        *self.shared.state.read()
    }

    pub fn audio_enabled(&self) -> bool {
        self.shared.audio_enabled()
    }

    fn emit(&self, event: RecordingEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Set the state under the tracker lock
    fn transition(&self, to: RecordingState) {
        let _tracker = self.shared.tracker.lock();
        *self.shared.state.write() = to;
    }

    fn require(&self, operation: &'static str, allowed: &[RecordingState]) -> RecorderResult<RecordingState> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(RecorderError::invalid_state(operation, state))
        }
    }

    fn validate_devices(devices: &[DeviceDescriptor]) -> RecorderResult<()> {
        if devices.is_empty() {
            return Err(RecorderError::Configuration("At least one device is required".to_string()));
        }
        let mut seen = HashSet::new();
        for device in devices {
            if !seen.insert(&device.id) {
                return Err(RecorderError::Configuration(format!("Duplicate device id: {}", device.id)));
            }
        }
        Ok(())
    }

    /// Start recording one file per device.
    ///
    /// Resolves once every writer is prepared. Fails without creating any
    /// writer when the inputs are malformed.
    pub async fn start(
        &self,
        paths: Vec<PathBuf>,
        devices: Vec<DeviceDescriptor>,
        options: RecordingOptions,
    ) -> RecorderResult<()> {
        let _op = self.op_lock.lock().await;
        self.require("start", &[RecordingState::Idle])?;

        if paths.len() != devices.len() {
            return Err(RecorderError::Configuration(format!(
                "Got {} output paths for {} devices",
                paths.len(),
                devices.len()
            )));
        }
        Self::validate_devices(&devices)?;
        options.validate()?;

        let generation = self.generation.load(Ordering::SeqCst);
        self.transition(RecordingState::Starting);

        let audio_path = if self.audio_enabled() {
            paths.first().map(|first| options.resolve_audio_path(first))
        } else {
            None
        };

        tracing::info!(
            "Starting recording with {} device(s){}",
            devices.len(),
            if audio_path.is_some() { " and audio" } else { "" }
        );

        let factory = self.factory.clone();
        let provision_devices = devices.clone();
        let provision_options = options.clone();
        let provisioned = tokio::task::spawn_blocking(move || {
            WriterPool::provision(
                factory.as_ref(),
                &provision_devices,
                &paths,
                audio_path.as_deref(),
                &provision_options,
            )
        })
        .await;

        let pool = match provisioned {
            Ok(Ok(pool)) => Arc::new(pool),
            Ok(Err(e)) => return Err(self.fail_start(generation, e)),
            Err(e) => {
                let error = RecorderError::Configuration(format!("Provisioning task failed: {}", e));
                return Err(self.fail_start(generation, error));
            }
        };

        let ids: Vec<DeviceId> = devices.iter().map(|d| d.id.clone()).collect();
        {
            let mut tracker = self.shared.tracker.lock();
            if self.generation.load(Ordering::SeqCst) != generation {
                drop(tracker);
                tracing::warn!("Session disposed while starting, discarding writers");
                pool.abort_all();
                return Err(RecorderError::Disposed);
            }

            {
                let mut inner = self.inner.lock();
                *inner = SessionInner {
                    recording_id: Some(Uuid::new_v4()),
                    devices,
                    segments: Vec::new(),
                    start_time: Some(Instant::now()),
                    last_reports: Vec::new(),
                };
                inner.open_segment();
            }

            tracker.reset(&ids, options.video.frame_interval());
            self.shared.clear_freeze();
            *self.shared.pool.write() = Some(pool.clone());
            *self.shared.state.write() = RecordingState::Recording;
        }

        if let Err(e) = self.attach_pipelines().await {
            tracing::error!("Failed to attach capture pipeline: {}", e);
            self.detach_pipelines().await;
            {
                let _tracker = self.shared.tracker.lock();
                if self.generation.load(Ordering::SeqCst) == generation {
                    *self.shared.pool.write() = None;
                    *self.shared.state.write() = RecordingState::Idle;
                }
            }
            pool.abort_all();
            self.emit(RecordingEvent::Error(e.to_string()));
            return Err(e);
        }

        self.emit(RecordingEvent::Started);
        tracing::info!("Recording started");
        Ok(())
    }

    fn fail_start(&self, generation: u64, error: RecorderError) -> RecorderError {
        tracing::error!("Failed to start recording: {}", error);
        {
            let _tracker = self.shared.tracker.lock();
            if self.generation.load(Ordering::SeqCst) == generation {
                *self.shared.state.write() = RecordingState::Idle;
            }
        }
        self.emit(RecordingEvent::Error(error.to_string()));
        error
    }

    /// Pause recording. Gaps are folded when samples arrive after resume.
    pub async fn pause(&self) -> RecorderResult<()> {
        let _op = self.op_lock.lock().await;
        {
            let mut tracker = self.shared.tracker.lock();
            let state = *self.shared.state.read();
            if state != RecordingState::Recording {
                return Err(RecorderError::invalid_state("pause", state));
            }
            tracker.mark_paused();
            *self.shared.state.write() = RecordingState::Paused;
        }

        self.inner.lock().close_segment();
        self.emit(RecordingEvent::Paused);
        tracing::info!("Recording paused");
        Ok(())
    }

    /// Resume recording
    pub async fn resume(&self) -> RecorderResult<()> {
        let _op = self.op_lock.lock().await;
        {
            let _tracker = self.shared.tracker.lock();
            let state = *self.shared.state.read();
            if state != RecordingState::Paused {
                return Err(RecorderError::invalid_state("resume", state));
            }
            *self.shared.state.write() = RecordingState::Recording;
        }

        self.inner.lock().open_segment();
        self.emit(RecordingEvent::Resumed);
        tracing::info!("Recording resumed");
        Ok(())
    }

    /// Keep video running at its native cadence but write `freeze` (or each
    /// writer's last frame) instead of live frames. Audio stays live.
    pub async fn sudo_pause(&self, freeze: Option<FreezeFrame>) -> RecorderResult<()> {
        let _op = self.op_lock.lock().await;
        self.require("pseudo-pause", &[RecordingState::Recording])?;

        let pool = self.shared.pool.read().clone();
        let mut frames = HashMap::new();
        if let Some(pool) = pool {
            for device in pool.device_ids() {
                let Some(writer) = pool.video_writer(&device) else {
                    continue;
                };
                let last = writer.last_frame();
                let frame = match (&freeze, last) {
                    (Some(image), Some(last)) => image
                        .fit(last.width, last.height, last.pixel_format)
                        .or_else(|| {
                            tracing::warn!(
                                "Freeze image cannot be converted to {:?}, repeating last frame of {}",
                                last.pixel_format,
                                device
                            );
                            Some(last)
                        }),
                    // Fitted to the first live frame by the router
                    (Some(_), None) => None,
                    (None, last) => last,
                };
                if let Some(frame) = frame {
                    frames.insert(device, frame);
                }
            }
        }

        {
            let _tracker = self.shared.tracker.lock();
            let state = *self.shared.state.read();
            if state != RecordingState::Recording {
                return Err(RecorderError::invalid_state("pseudo-pause", state));
            }
            *self.shared.freeze_frames.write() = frames;
            *self.shared.freeze_image.write() = freeze;
            *self.shared.state.write() = RecordingState::PseudoPaused;
        }

        self.emit(RecordingEvent::PseudoPaused);
        tracing::info!("Recording pseudo-paused");
        Ok(())
    }

    /// Switch back to live video. No offset correction is applied.
    pub async fn resume_from_pseudo_pause(&self) -> RecorderResult<()> {
        let _op = self.op_lock.lock().await;
        {
            let _tracker = self.shared.tracker.lock();
            let state = *self.shared.state.read();
            if state != RecordingState::PseudoPaused {
                return Err(RecorderError::invalid_state("resume from pseudo-pause", state));
            }
            *self.shared.state.write() = RecordingState::Recording;
            self.shared.clear_freeze();
        }

        self.emit(RecordingEvent::PseudoResumed);
        tracing::info!("Recording resumed from pseudo-pause");
        Ok(())
    }

    /// Stop recording and finalize every file.
    ///
    /// Every writer is finalized even when one fails; the first failure is
    /// returned and all per-writer reports stay available through
    /// [`RecordingSession::last_finalize_reports`].
    pub async fn stop(&self) -> RecorderResult<RecordingOutput> {
        let _op = self.op_lock.lock().await;
        let generation = self.generation.load(Ordering::SeqCst);

        let pool = {
            let _tracker = self.shared.tracker.lock();
            let state = *self.shared.state.read();
            if !state.can_stop() {
                return Err(RecorderError::invalid_state("stop", state));
            }
            *self.shared.state.write() = RecordingState::Stopping;
            self.shared.pool.read().clone()
        };

        tracing::info!("Stopping recording");

        self.detach_pipelines().await;
        self.inner.lock().close_segment();

        let Some(pool) = pool else {
            self.transition(RecordingState::Idle);
            return Err(RecorderError::Disposed);
        };

        let summary = pool.finalize_all().await;

        {
            let _tracker = self.shared.tracker.lock();
            if self.generation.load(Ordering::SeqCst) != generation {
                return Err(RecorderError::Disposed);
            }
            *self.shared.pool.write() = None;
            self.shared.clear_freeze();
            *self.shared.state.write() = RecordingState::Idle;
        }

        let (recording_id, segment_count) = {
            let mut inner = self.inner.lock();
            inner.last_reports = summary.reports.clone();
            (
                inner.recording_id.map(|id| id.to_string()).unwrap_or_default(),
                inner.segments.len(),
            )
        };

        if let Some(error) = summary.first_error {
            tracing::error!("Recording stopped with finalize failure: {}", error);
            self.emit(RecordingEvent::Error(error.to_string()));
            return Err(error.into());
        }

        let duration_ms = summary.duration.as_secs_f64() * 1000.0;
        let output = RecordingOutput {
            recording_id,
            duration_ms,
            segment_count,
            output_files: pool.output_files(),
            reports: summary.reports,
        };

        self.emit(RecordingEvent::Stopped { duration_ms });
        tracing::info!("Recording stopped. Duration: {:.1}ms", duration_ms);
        Ok(output)
    }

    /// Tear everything down without finalizing. Valid in any state.
    ///
    /// Output files left behind may be unplayable.
    pub fn dispose(&self) {
        let (previous, pool) = {
            let _tracker = self.shared.tracker.lock();
            self.generation.fetch_add(1, Ordering::SeqCst);
            let previous = std::mem::replace(&mut *self.shared.state.write(), RecordingState::Idle);
            self.shared.clear_freeze();
            (previous, self.shared.pool.write().take())
        };

        tracing::info!("Disposing recording session (was {})", previous);

        if let Some(pool) = pool {
            pool.close_all();
            let spawned = std::thread::Builder::new()
                .name("recorder-dispose".to_string())
                .spawn(move || pool.abort_all());
            if let Err(e) = spawned {
                tracing::error!("Failed to spawn dispose thread: {}", e);
            }
        }

        match self.pipelines.clone().try_lock_owned() {
            Ok(mut pipelines) => {
                if pipelines.iter().any(|p| p.is_attached()) {
                    match tokio::runtime::Handle::try_current() {
                        Ok(handle) => {
                            handle.spawn(async move {
                                for pipeline in pipelines.iter_mut() {
                                    if let Err(e) = pipeline.detach().await {
                                        tracing::warn!("Failed to detach {}: {}", pipeline.id(), e);
                                    }
                                }
                            });
                        }
                        Err(_) => tracing::warn!("No runtime available, capture pipelines left attached"),
                    }
                }
            }
            Err(_) => tracing::debug!("Pipelines busy, the running operation will detach them"),
        }

        self.inner.lock().close_segment();
        self.emit(RecordingEvent::Disposed);
    }

    /// Turn the shared audio track on or off
    pub async fn set_audio_enabled(&self, enabled: bool) -> RecorderResult<()> {
        let _op = self.op_lock.lock().await;
        let mut tracker = self.shared.tracker.lock();
        let state = *self.shared.state.read();

        match state {
            RecordingState::Idle => {
                self.shared.audio_enabled.store(enabled, Ordering::SeqCst);
            }
            RecordingState::Starting | RecordingState::Stopping => {
                return Err(RecorderError::Configuration(format!(
                    "Cannot change audio mode while {}",
                    state
                )));
            }
            RecordingState::Recording | RecordingState::Paused | RecordingState::PseudoPaused => {
                if enabled {
                    let has_audio = self
                        .shared
                        .pool
                        .read()
                        .as_ref()
                        .map(|pool| pool.audio_writer().is_some())
                        .unwrap_or(false);
                    if !has_audio {
                        return Err(RecorderError::Configuration(
                            "Audio was not enabled when the recording started".to_string(),
                        ));
                    }
                    if !self.shared.audio_enabled.swap(true, Ordering::SeqCst) {
                        tracker.mark_gap(&StreamId::Audio);
                    }
                } else {
                    self.shared.audio_enabled.store(false, Ordering::SeqCst);
                }
            }
        }

        tracing::info!("Audio {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Replace the configured device list. Only allowed while idle.
    pub async fn update_devices(&self, devices: Vec<DeviceDescriptor>) -> RecorderResult<()> {
        let _op = self.op_lock.lock().await;
        self.require("update devices", &[RecordingState::Idle])?;
        Self::validate_devices(&devices)?;

        tracing::debug!("Device list updated: {} device(s)", devices.len());
        self.inner.lock().devices = devices;
        Ok(())
    }

    /// Configured devices
    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.inner.lock().devices.clone()
    }

    pub fn set_preview_size(&self, width: u32, height: u32) {
        self.shared
            .tracker
            .lock()
            .set_preview_size(Resolution::new(width, height));
    }

    /// Register a capture pipeline. It is attached right away when a
    /// recording is running, otherwise at the next start.
    pub async fn attach_pipeline(&self, mut pipeline: Box<dyn CapturePipeline>) -> RecorderResult<()> {
        let _op = self.op_lock.lock().await;
        if self.state().is_active() && !pipeline.is_attached() {
            pipeline.attach(Arc::new(self.router())).await?;
        }
        tracing::info!("Adding pipeline: {}", pipeline.id());
        self.pipelines.lock().await.push(pipeline);
        Ok(())
    }

    async fn attach_pipelines(&self) -> RecorderResult<()> {
        let mut pipelines = self.pipelines.lock().await;
        for pipeline in pipelines.iter_mut() {
            if !pipeline.is_attached() {
                tracing::debug!("Attaching pipeline {}", pipeline.id());
                pipeline.attach(Arc::new(self.router())).await?;
            }
        }
        Ok(())
    }

    async fn detach_pipelines(&self) {
        let mut pipelines = self.pipelines.lock().await;
        for pipeline in pipelines.iter_mut() {
            if pipeline.is_attached() {
                if let Err(e) = pipeline.detach().await {
                    tracing::warn!("Failed to detach {}: {}", pipeline.id(), e);
                }
            }
        }
    }

    /// Per-writer outcome of the last stop
    pub fn last_finalize_reports(&self) -> Vec<FinalizeReport> {
        self.inner.lock().last_reports.clone()
    }

    /// Recording time excluding pauses
    pub fn active_duration(&self) -> Duration {
        self.inner.lock().active_duration()
    }

    pub fn status(&self) -> RecordingStatus {
        let (timelines, preview_size) = {
            let tracker = self.shared.tracker.lock();
            (tracker.diagnostics(), tracker.state().preview_size)
        };
        let writers = self
            .shared
            .pool
            .read()
            .as_ref()
            .map(|pool| pool.diagnostics())
            .unwrap_or_default();
        let inner = self.inner.lock();

        RecordingStatus {
            state: self.state(),
            recording_id: inner.recording_id.map(|id| id.to_string()),
            devices: inner.devices.iter().map(|d| d.id.to_string()).collect(),
            audio_enabled: self.audio_enabled(),
            active_duration_ms: inner.active_duration().as_secs_f64() * 1000.0,
            segment_count: inner.segments.len(),
            preview_size,
            writers,
            timelines,
            router: self.shared.counters.snapshot(),
        }
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if self.state().is_active() {
            tracing::warn!("Recording session dropped while {}", self.state());
            self.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::traits::{SampleBuffer, SampleHandler, StreamEvent, VideoSample};
    use crate::recorder::router::{DropReason, RouteOutcome};
    use crate::recorder::test_support::{
        audio_sample, devices, nv12_frame, paths, video_sample, MemorySinkFactory,
    };
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn video(id: &str) -> StreamId {
        StreamId::Video(DeviceId::new(id))
    }

    fn setup() -> (RecordingSession, Arc<MemorySinkFactory>, TempDir) {
        let factory = Arc::new(MemorySinkFactory::new());
        let session = RecordingSession::new(factory.clone());
        (session, factory, tempdir().unwrap())
    }

    async fn start(session: &RecordingSession, dir: &Path, ids: &[&str]) {
        session
            .start(paths(dir, ids), devices(ids), RecordingOptions::default())
            .await
            .unwrap();
    }

    fn written(outcome: RouteOutcome) -> Duration {
        match outcome {
            RouteOutcome::Written { adjusted } => adjusted,
            other => panic!("Expected Written, got {:?}", other),
        }
    }

    fn assert_invalid_state(result: RecorderResult<impl std::fmt::Debug>) {
        assert!(
            matches!(result, Err(RecorderError::InvalidState { .. })),
            "Expected InvalidState, got {:?}",
            result
        );
    }

    #[tokio::test]
    async fn test_two_device_pause_resume() {
        let (session, factory, dir) = setup();
        start(&session, dir.path(), &["a", "b"]).await;
        let router = session.router();

        for t in [0, 33, 66] {
            written(router.route(video_sample("a", t, 1)));
        }
        for t in [0, 33] {
            written(router.route(video_sample("b", t, 1)));
        }

        session.pause().await.unwrap();
        assert_eq!(
            router.route(video_sample("a", 300, 1)),
            RouteOutcome::Dropped(DropReason::Inactive)
        );
        session.resume().await.unwrap();

        assert_eq!(written(router.route(video_sample("a", 533, 1))), ms(99));
        assert_eq!(router.offset(&video("a")), ms(434));

        let output = session.stop().await.unwrap();

        let times: Vec<Duration> = factory
            .record("video:a")
            .unwrap()
            .writes
            .iter()
            .map(|(t, _)| *t)
            .collect();
        assert_eq!(times, vec![ms(0), ms(33), ms(66), ms(99)]);
        assert_eq!(output.segment_count, 2);
        assert!((output.duration_ms - 132.0).abs() < 1e-6);
        assert_eq!(output.output_files.len(), 2);
        assert_eq!(session.state(), RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_pseudo_pause_repeats_last_frame() {
        let (session, factory, dir) = setup();
        start(&session, dir.path(), &["a"]).await;
        let router = session.router();

        for (t, fill) in [(0, 1), (33, 2), (66, 3)] {
            router.route(video_sample("a", t, fill));
        }

        session.sudo_pause(None).await.unwrap();
        assert_eq!(session.state(), RecordingState::PseudoPaused);

        for t in [99, 132, 165, 198, 231] {
            written(router.route(video_sample("a", t, 9)));
        }

        session.resume_from_pseudo_pause().await.unwrap();
        assert_eq!(router.offset(&video("a")), Duration::ZERO);

        let output = session.stop().await.unwrap();

        let writes = factory.record("video:a").unwrap().writes;
        assert_eq!(writes.len(), 8);
        assert!(writes[3..].iter().all(|(_, fill)| *fill == 3));
        // 3 live frames plus exactly 5 frozen intervals
        assert!((output.duration_ms - 264.0).abs() < 1e-6);
        assert_eq!(router.counters().frozen_frames, 5);
    }

    #[tokio::test]
    async fn test_pseudo_pause_with_freeze_image() {
        let (session, factory, dir) = setup();
        start(&session, dir.path(), &["a"]).await;
        let router = session.router();

        router.route(video_sample("a", 0, 1));
        let image = FreezeFrame::from_rgba(vec![7, 7, 7, 255], 1, 1).unwrap();
        session.sudo_pause(Some(image)).await.unwrap();
        router.route(video_sample("a", 33, 1));
        session.resume_from_pseudo_pause().await.unwrap();
        router.route(video_sample("a", 66, 2));

        let fills: Vec<u8> = factory
            .record("video:a")
            .unwrap()
            .writes
            .iter()
            .map(|(_, fill)| *fill)
            .collect();
        assert_eq!(fills, vec![1, 7, 2]);
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pseudo_pause_before_first_frame() {
        let (session, factory, dir) = setup();
        start(&session, dir.path(), &["a"]).await;
        let router = session.router();

        let image = FreezeFrame::from_rgba(vec![7, 7, 7, 255], 1, 1).unwrap();
        session.sudo_pause(Some(image)).await.unwrap();
        written(router.route(video_sample("a", 0, 1)));
        session.resume_from_pseudo_pause().await.unwrap();

        for t in [33, 66, 99, 132] {
            assert_eq!(written(router.route(video_sample("a", t, 2))), ms(t));
        }

        let fills: Vec<u8> = factory
            .record("video:a")
            .unwrap()
            .writes
            .iter()
            .map(|(_, fill)| *fill)
            .collect();
        assert_eq!(fills, vec![7, 2, 2, 2, 2]);
        assert_eq!(router.counters().write_failures, 0);
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pseudo_pause_converts_image_for_nv12_camera() {
        let (session, factory, dir) = setup();
        start(&session, dir.path(), &["a"]).await;
        let router = session.router();
        let nv12 = |pts: u64, fill: u8| {
            SampleBuffer::Video(VideoSample {
                device: DeviceId::new("a"),
                pts: ms(pts),
                duration: None,
                frame: nv12_frame(fill),
            })
        };

        written(router.route(nv12(0, 50)));
        let white = FreezeFrame::from_rgba(vec![255; 4], 1, 1).unwrap();
        session.sudo_pause(Some(white)).await.unwrap();
        written(router.route(nv12(33, 50)));
        session.resume_from_pseudo_pause().await.unwrap();
        written(router.route(nv12(66, 50)));

        let fills: Vec<u8> = factory
            .record("video:a")
            .unwrap()
            .writes
            .iter()
            .map(|(_, fill)| *fill)
            .collect();
        // Y of white in limited range
        assert_eq!(fills, vec![50, 235, 50]);
        session.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_waits_for_concurrent_writes() {
        let (session, factory, dir) = setup();
        start(&session, dir.path(), &["a", "b"]).await;

        let feeders: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|id| {
                let router = session.router();
                std::thread::spawn(move || {
                    let mut accepted = 0usize;
                    for i in 0..200_000u64 {
                        match router.route(video_sample(id, i * 33, 1)) {
                            RouteOutcome::Written { .. } => accepted += 1,
                            RouteOutcome::Dropped(DropReason::Inactive) if accepted > 0 => break,
                            _ => {}
                        }
                    }
                    accepted
                })
            })
            .collect();

        let count = |label: &str| factory.record(label).map_or(0, |r| r.writes.len());
        while count("video:a") < 20 || count("video:b") < 20 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        session.stop().await.unwrap();
        let accepted: Vec<usize> = feeders.into_iter().map(|h| h.join().unwrap()).collect();

        for (label, accepted) in ["video:a", "video:b"].into_iter().zip(accepted) {
            let record = factory.record(label).unwrap();
            assert!(record.finalized.is_some());
            assert_eq!(record.writes_after_finalize, 0);
            assert_eq!(record.writes.len(), accepted);
            assert!(record.writes.windows(2).all(|w| w[0].0 < w[1].0));
        }
    }

    #[tokio::test]
    async fn test_disconnect_leaves_no_gap() {
        let (session, factory, dir) = setup();
        start(&session, dir.path(), &["a", "b"]).await;
        let router = session.router();

        for t in [0, 33, 66] {
            router.route(video_sample("a", t, 1));
            router.route(video_sample("b", t, 1));
        }

        router.on_stream_event(StreamEvent::Disconnected(video("b")));
        assert_eq!(
            router.route(video_sample("b", 99, 1)),
            RouteOutcome::Dropped(DropReason::Disconnected)
        );
        for t in [99, 132, 165, 198, 231, 264] {
            assert_eq!(written(router.route(video_sample("a", t, 1))), ms(t));
        }

        router.on_stream_event(StreamEvent::Reconnected(video("b")));
        assert_eq!(written(router.route(video_sample("b", 299, 1))), ms(99));

        assert_eq!(router.offset(&video("a")), Duration::ZERO);
        assert_eq!(router.offset(&video("b")), ms(200));
        assert_eq!(router.counters().dropped_disconnected, 1);

        session.stop().await.unwrap();
        assert_eq!(factory.record("video:b").unwrap().finalized, Some(ms(132)));
    }

    #[tokio::test]
    async fn test_start_rejects_bad_inputs_without_writers() {
        let (session, factory, dir) = setup();

        let mismatch = session
            .start(paths(dir.path(), &["a"]), devices(&["a", "b"]), RecordingOptions::default())
            .await;
        assert!(matches!(mismatch, Err(RecorderError::Configuration(_))));

        let empty = session.start(Vec::new(), Vec::new(), RecordingOptions::default()).await;
        assert!(matches!(empty, Err(RecorderError::Configuration(_))));

        let duplicate = session
            .start(paths(dir.path(), &["a", "b"]), devices(&["a", "a"]), RecordingOptions::default())
            .await;
        assert!(matches!(duplicate, Err(RecorderError::Configuration(_))));

        assert_eq!(factory.sink_count(), 0);
        assert_eq!(session.state(), RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_provision_failure_returns_to_idle() {
        let (session, factory, dir) = setup();
        factory.fail_create("video:b");

        let result = session
            .start(paths(dir.path(), &["a", "b"]), devices(&["a", "b"]), RecordingOptions::default())
            .await;

        assert!(matches!(result, Err(RecorderError::Configuration(_))));
        assert_eq!(session.state(), RecordingState::Idle);
        assert!(factory.record("video:a").unwrap().aborted);
        assert_eq!(
            session.router().route(video_sample("a", 0, 1)),
            RouteOutcome::Dropped(DropReason::Inactive)
        );
    }

    #[tokio::test]
    async fn test_stop_finalizes_all_and_reports_first_error() {
        let (session, factory, dir) = setup();
        factory.fail_finalize("video:b");
        start(&session, dir.path(), &["a", "b", "c"]).await;
        let router = session.router();

        for id in ["a", "b", "c"] {
            router.route(video_sample(id, 0, 1));
            router.route(video_sample(id, 33, 1));
        }

        match session.stop().await {
            Err(RecorderError::Finalize(e)) => assert_eq!(e.sink, "video:b"),
            other => panic!("Expected finalize error, got {:?}", other),
        }

        let reports = session.last_finalize_reports();
        assert_eq!(reports.len(), 3);
        assert!(reports[0].is_ok());
        assert!(!reports[1].is_ok());
        assert!(reports[2].is_ok());
        assert_eq!(factory.record("video:c").unwrap().finalized, Some(ms(66)));
        assert_eq!(session.state(), RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_operations_rejected_in_wrong_state() {
        let (session, _factory, dir) = setup();

        assert_invalid_state(session.pause().await);
        assert_invalid_state(session.resume().await);
        assert_invalid_state(session.sudo_pause(None).await);
        assert_invalid_state(session.resume_from_pseudo_pause().await);
        assert_invalid_state(session.stop().await);

        start(&session, dir.path(), &["a"]).await;
        assert_invalid_state(
            session
                .start(paths(dir.path(), &["a"]), devices(&["a"]), RecordingOptions::default())
                .await,
        );
        assert_invalid_state(session.resume().await);
        assert_invalid_state(session.update_devices(devices(&["b"])).await);

        session.pause().await.unwrap();
        assert_invalid_state(session.sudo_pause(None).await);
        assert_invalid_state(session.pause().await);
        assert_eq!(session.state(), RecordingState::Paused);
        assert_eq!(session.status().segment_count, 1);

        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_audio_toggle_mid_recording() {
        let (session, factory, dir) = setup();
        session.set_audio_enabled(true).await.unwrap();
        start(&session, dir.path(), &["a"]).await;
        let router = session.router();

        assert_eq!(
            factory.record("audio").unwrap().path,
            dir.path().join("a-audio.m4a")
        );
        assert_eq!(written(router.route(audio_sample(0, 5))), Duration::ZERO);

        session.set_audio_enabled(false).await.unwrap();
        assert_eq!(
            router.route(audio_sample(10, 5)),
            RouteOutcome::Dropped(DropReason::AudioMuted)
        );

        session.set_audio_enabled(true).await.unwrap();
        assert_eq!(written(router.route(audio_sample(500, 5))), ms(10));

        let output = session.stop().await.unwrap();
        assert_eq!(output.output_files.len(), 2);
    }

    #[tokio::test]
    async fn test_audio_cannot_be_enabled_without_sink() {
        let (session, factory, dir) = setup();
        start(&session, dir.path(), &["a"]).await;

        let result = session.set_audio_enabled(true).await;

        assert!(matches!(result, Err(RecorderError::Configuration(_))));
        assert!(factory.record("audio").is_none());
        assert!(!session.audio_enabled());
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispose_tears_down() {
        let (session, factory, dir) = setup();
        start(&session, dir.path(), &["a"]).await;
        let router = session.router();
        router.route(video_sample("a", 0, 1));
        let mut events = session.subscribe();

        session.dispose();

        assert_eq!(session.state(), RecordingState::Idle);
        assert_eq!(events.try_recv().unwrap(), RecordingEvent::Disposed);
        assert_eq!(
            router.route(video_sample("a", 33, 1)),
            RouteOutcome::Dropped(DropReason::Inactive)
        );
        assert_invalid_state(session.stop().await);

        let mut aborted = false;
        for _ in 0..100 {
            if factory.record("video:a").unwrap().aborted {
                aborted = true;
                break;
            }
            tokio::time::sleep(ms(10)).await;
        }
        assert!(aborted);
        assert!(factory.record("video:a").unwrap().finalized.is_none());
    }

    #[tokio::test]
    async fn test_events_follow_lifecycle() {
        let (session, _factory, dir) = setup();
        let mut events = session.subscribe();

        start(&session, dir.path(), &["a"]).await;
        session.pause().await.unwrap();
        session.resume().await.unwrap();
        session.stop().await.unwrap();

        assert_eq!(events.recv().await.unwrap(), RecordingEvent::Started);
        assert_eq!(events.recv().await.unwrap(), RecordingEvent::Paused);
        assert_eq!(events.recv().await.unwrap(), RecordingEvent::Resumed);
        assert!(matches!(events.recv().await.unwrap(), RecordingEvent::Stopped { .. }));
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let (session, _factory, dir) = setup();
        session.set_preview_size(1080, 1920);
        start(&session, dir.path(), &["front", "back"]).await;
        session.pause().await.unwrap();
        session.resume().await.unwrap();

        let status = session.status();

        assert_eq!(status.state, RecordingState::Recording);
        assert!(status.recording_id.is_some());
        assert_eq!(status.devices, vec!["front", "back"]);
        assert_eq!(status.segment_count, 2);
        assert_eq!(status.preview_size, Some(Resolution::new(1080, 1920)));
        assert_eq!(status.writers.len(), 2);
        assert_eq!(status.timelines.len(), 3);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "recording");
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_devices_while_idle() {
        let (session, _factory, _dir) = setup();

        session.update_devices(devices(&["x", "y"])).await.unwrap();
        assert_eq!(session.devices().len(), 2);

        let duplicate = session.update_devices(devices(&["x", "x"])).await;
        assert!(matches!(duplicate, Err(RecorderError::Configuration(_))));
    }

    #[derive(Default)]
    struct FakePipeline {
        handler: Arc<Mutex<Option<Arc<dyn SampleHandler>>>>,
    }

    #[async_trait]
    impl CapturePipeline for FakePipeline {
        fn id(&self) -> &str {
            "fake"
        }

        async fn attach(&mut self, handler: Arc<dyn SampleHandler>) -> RecorderResult<()> {
            *self.handler.lock() = Some(handler);
            Ok(())
        }

        async fn detach(&mut self) -> RecorderResult<()> {
            *self.handler.lock() = None;
            Ok(())
        }

        fn is_attached(&self) -> bool {
            self.handler.lock().is_some()
        }
    }

    #[tokio::test]
    async fn test_pipeline_attached_for_recording_only() {
        let (session, factory, dir) = setup();
        let pipeline = FakePipeline::default();
        let handler = pipeline.handler.clone();
        session.attach_pipeline(Box::new(pipeline)).await.unwrap();
        assert!(handler.lock().is_none());

        start(&session, dir.path(), &["a"]).await;
        let attached = handler.lock().clone().unwrap();
        attached.on_sample(video_sample("a", 0, 4));
        assert_eq!(factory.record("video:a").unwrap().writes, vec![(Duration::ZERO, 4)]);

        session.stop().await.unwrap();
        assert!(handler.lock().is_none());
    }
}
