//! Capture-side collaborator interfaces
//!
//! Capture pipelines live outside this crate; this module defines the sample
//! types they deliver and the trait they implement.

pub mod traits;

pub use traits::{
    AudioSample, CameraPosition, CapturePipeline, DeviceDescriptor, DeviceId, PixelFormat, Resolution,
    SampleBuffer, SampleHandler, StreamEvent, StreamId, StreamKind, VideoFrame, VideoSample,
};
