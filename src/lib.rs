//! Multicam Recorder - synchronized multi-camera recording.
//!
//! Records one file per camera plus an optional shared audio track, keeping
//! every file's timeline continuous across pauses, pseudo-pauses and device
//! disconnects.

pub mod capture;
pub mod encoder;
pub mod recorder;
pub mod utils;

pub use capture::{CapturePipeline, DeviceDescriptor, DeviceId, SampleBuffer, SampleHandler, StreamEvent, StreamId};
pub use encoder::FfmpegSinkFactory;
pub use recorder::{
    FreezeFrame, RecordingEvent, RecordingOptions, RecordingOutput, RecordingSession, RecordingState,
    RecordingStatus, SampleBufferRouter,
};
pub use utils::error::{ErrorResponse, RecorderError, RecorderResult};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the default filter. Does nothing if a
/// subscriber is already installed.
pub fn init_tracing() {
    let result = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "multicam_recorder=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if result.is_ok() {
        tracing::info!("Starting Multicam Recorder v{}", env!("CARGO_PKG_VERSION"));
    }
}
