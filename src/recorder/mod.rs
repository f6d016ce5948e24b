//! Recording system module
//!
//! This module implements the multi-camera recording engine:
//! - RecordingSession state machine and control operations
//! - TimingOffsetTracker keeping each stream's file timeline continuous
//! - WriterPool of per-device writers over pluggable sinks
//! - SampleBufferRouter as the entry point for capture callbacks

pub mod freeze;
pub mod pool;
pub mod router;
pub mod session;
pub mod state;
pub mod timing;
pub mod writer;

#[cfg(test)]
pub(crate) mod test_support;

pub use freeze::FreezeFrame;
pub use pool::{FinalizeReport, WriterPool};
pub use router::{DropReason, RouteOutcome, RouterCounters, SampleBufferRouter};
pub use session::{RecordingEvent, RecordingSession};
pub use state::{
    AudioOptions, Orientation, RecordingOptions, RecordingOutput, RecordingSegment, RecordingState,
    RecordingStatus, VideoCodec, VideoFileType, VideoOptions, VideoQuality,
};
pub use timing::{TimingDecision, TimingOffsetTracker, TimingState};
pub use writer::{DeviceWriter, SampleSink, SamplePayload, SinkFactory};
